use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// One color as `[r, g, b]`.
pub type Rgb = [u8; 3];

/// Number of colors derived from album art for `gradients.spotify_palette`.
pub const PALETTE_SIZE: usize = 3;

/// Lifecycle of the account session as observed by the daemon.
///
/// Transitions:
///   Disabled                                   (feature flag off)
///   Connecting -> Connected -> Closed          (dealer socket ended)
///   Connecting -> Failed(reason)               (login or profile lookup failed)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Disabled,
    Connecting,
    Connected,
    Failed(String),
    Closed,
}

/// A palette update that was written to the config and announced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedUpdate {
    pub track_uri: String,
    pub track_name: String,
    pub palette: Vec<Rgb>,
    pub color: Rgb,
    /// 1-based attempt number that succeeded.
    pub attempts: u32,
    pub applied_at: DateTime<Local>,
}

/// Snapshot served by the status API.  `rev` is a monotonically increasing
/// counter incremented on every change.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonStatus {
    #[serde(default)]
    pub rev: u64,
    pub session: SessionState,
    pub username: Option<String>,
    #[serde(default)]
    pub has_premium: bool,
    /// Last track uri seen on the event feed, whether or not enrichment succeeded.
    pub current_track: Option<String>,
    pub last_update: Option<AppliedUpdate>,
    #[serde(default)]
    pub updates_applied: u64,
    #[serde(default)]
    pub updates_abandoned: u64,
    #[serde(default)]
    pub notifications_dispatched: u64,
}
