//! Track update handler: turns a `DEVICE_STATE_CHANGED` event into a new
//! Spotify palette in the shared config.
//!
//! Per distinct track:
//!
//! ```text
//!   claim track uri (dedup) ─▶ attempt 1..=max_attempts
//!                                 ├── enrich (under attempt_timeout)
//!                                 │     ├── getTrack(bare id)
//!                                 │     ├── largest cover image ─▶ fetch bytes
//!                                 │     └── palette (blocking thread) + extracted color
//!                                 └── publish (no deadline)
//!                                       ├── reserve queue slot (waits on backpressure)
//!                                       ├── lock config: reload ─▶ apply both fields ─▶ commit
//!                                       └── put ConfigRefresh → device_0
//! ```
//!
//! The commit is the last step that can fail, so an attempt that fails has
//! saved nothing and an attempt that saved is always announced.
//!
//! Nothing escapes to the event worker: every outcome ends in a log line and
//! a status counter.
use chrono::Local;
use futures_util::future::BoxFuture;
use palette_proto::config::{ConfigError, ConfigStore, SpotifyConfig};
use palette_proto::notification::{NotificationItem, NotificationQueue, NotifyError};
use palette_proto::protocol::{AppliedUpdate, Rgb};
use palette_proto::state::StatusManager;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::events::EventHandler;
use crate::palette::{parse_extracted_color, PaletteError, PaletteExtractor};
use crate::spotify::{bare_track_id, largest_image, ImageFetcher, LookupError, TrackLookup};

/// Device slot that receives the refresh notification.
pub const REFRESH_TARGET: &str = "device_0";

const TRACK_URI_POINTER: &str = "/cluster/player_state/track/uri";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("track lookup failed: {0}")]
    Lookup(#[from] LookupError),
    #[error("track has no cover art")]
    NoCoverArt,
    #[error("cover art fetch failed: {0}")]
    ImageFetch(#[source] LookupError),
    #[error("track has no extracted color")]
    NoExtractedColor,
    #[error(transparent)]
    Palette(#[from] PaletteError),
    #[error("palette task failed: {0}")]
    PaletteTask(#[from] tokio::task::JoinError),
    #[error("config update failed: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl UpdateError {
    /// Whether another attempt could succeed.  A closed notification queue
    /// means the daemon is shutting down.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UpdateError::Notify(NotifyError::Closed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(spotify: &SpotifyConfig) -> Self {
        Self {
            max_attempts: spotify.max_attempts.max(1),
            attempt_timeout: Duration::from_secs(spotify.attempt_timeout_secs.max(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SpotifyConfig::default())
    }
}

/// Result of the enrichment phase.
struct Derived {
    track_name: String,
    palette: Vec<Rgb>,
    color: Rgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Payload carried no track uri.
    NoTrack,
    /// Same track as the last event.
    Duplicate,
    Applied { attempts: u32 },
    Abandoned { attempts: u32 },
}

pub struct TrackUpdateHandler<L, F, P> {
    lookup: L,
    images: F,
    extractor: Arc<P>,
    store: Arc<ConfigStore>,
    notifications: NotificationQueue,
    status: Arc<StatusManager>,
    policy: RetryPolicy,
    current_track: Mutex<Option<String>>,
}

impl<L, F, P> TrackUpdateHandler<L, F, P>
where
    L: TrackLookup,
    F: ImageFetcher,
    P: PaletteExtractor,
{
    pub fn new(
        lookup: L,
        images: F,
        extractor: Arc<P>,
        store: Arc<ConfigStore>,
        notifications: NotificationQueue,
        status: Arc<StatusManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            lookup,
            images,
            extractor,
            store,
            notifications,
            status,
            policy,
            current_track: Mutex::new(None),
        }
    }

    pub async fn on_device_state_changed(&self, payload: &Value) -> UpdateOutcome {
        let Some(uri) = payload.pointer(TRACK_URI_POINTER).and_then(Value::as_str) else {
            debug!("handler: event without a track uri");
            return UpdateOutcome::NoTrack;
        };

        if !self.claim_track(uri) {
            return UpdateOutcome::Duplicate;
        }
        self.status.set_current_track(uri.to_string()).await;

        let track_id = bare_track_id(uri);
        let max = self.policy.max_attempts;
        let mut attempts = 0;
        for attempt in 1..=max {
            attempts = attempt;
            let enriched =
                tokio::time::timeout(self.policy.attempt_timeout, self.enrich(track_id))
                    .await
                    .unwrap_or(Err(UpdateError::Timeout(self.policy.attempt_timeout)));
            let result = match enriched {
                Ok(derived) => self.publish(uri, derived, attempt).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(update) => {
                    self.status.record_applied(update).await;
                    return UpdateOutcome::Applied { attempts: attempt };
                }
                Err(e) => {
                    error!("handler: attempt {}/{} for {} failed: {}", attempt, max, uri, e);
                    if !e.is_retryable() {
                        break;
                    }
                    if attempt < max {
                        info!("Retrying... ({}/{})", attempt, max);
                    }
                }
            }
        }

        warn!("handler: giving up on {}", uri);
        self.status.record_abandoned().await;
        UpdateOutcome::Abandoned { attempts }
    }

    /// Record `uri` as current.  False when it already was.
    fn claim_track(&self, uri: &str) -> bool {
        let mut current = self
            .current_track
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_deref() == Some(uri) {
            return false;
        }
        debug!("handler: current {:?}, new {}", *current, uri);
        *current = Some(uri.to_string());
        true
    }

    async fn enrich(&self, track_id: &str) -> Result<Derived, UpdateError> {
        let track = self.lookup.track_info(track_id).await?;
        info!("Received new spotify track: {}", track.name);

        let cover = largest_image(&track.images).ok_or(UpdateError::NoCoverArt)?;
        let bytes = self
            .images
            .fetch_image(&cover.url)
            .await
            .map_err(UpdateError::ImageFetch)?;

        let extractor = Arc::clone(&self.extractor);
        let palette = tokio::task::spawn_blocking(move || extractor.palette(&bytes)).await??;
        debug!("handler: generated palette {:?}", palette);

        let raw_color = track
            .extracted_color
            .as_deref()
            .ok_or(UpdateError::NoExtractedColor)?;
        let color = parse_extracted_color(raw_color)?;
        debug!("handler: extracted main color {:?}", color);

        Ok(Derived {
            track_name: track.name,
            palette,
            color,
        })
    }

    async fn publish(
        &self,
        uri: &str,
        derived: Derived,
        attempt: u32,
    ) -> Result<AppliedUpdate, UpdateError> {
        let slot = self.notifications.reserve().await?;

        {
            let mut guard = self.store.lock().await;
            guard.reload().await?;
            let mut next = guard.config().clone();
            next.apply_spotify_colors(derived.palette.clone(), derived.color);
            guard.commit(next).await?;
        }

        slot.put(NotificationItem::config_refresh(REFRESH_TARGET));

        Ok(AppliedUpdate {
            track_uri: uri.to_string(),
            track_name: derived.track_name,
            palette: derived.palette,
            color: derived.color,
            attempts: attempt,
            applied_at: Local::now(),
        })
    }
}

impl<L, F, P> EventHandler for TrackUpdateHandler<L, F, P>
where
    L: TrackLookup,
    F: ImageFetcher,
    P: PaletteExtractor,
{
    fn handle<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let outcome = self.on_device_state_changed(payload).await;
            debug!("handler: outcome {:?}", outcome);
        })
    }
}
