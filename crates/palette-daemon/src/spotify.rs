//! Track metadata and album-art clients.

use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::session::{Session, SessionError};

/// Album art larger than this is refused.
pub const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned status {status}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("unexpected response: {0}")]
    Malformed(String),
    #[error("image exceeds the size limit")]
    TooLarge,
}

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CoverImage {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl CoverImage {
    /// Pixel area; unknown dimensions count as zero.
    pub fn area(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub name: String,
    pub images: Vec<CoverImage>,
    /// Representative color computed by Spotify, e.g. `#1A2B3C`.
    pub extracted_color: Option<String>,
}

/// Largest candidate by area.  On a tie the earliest candidate wins.
pub fn largest_image(images: &[CoverImage]) -> Option<&CoverImage> {
    images.iter().fold(None, |best, candidate| match best {
        Some(b) if b.area() >= candidate.area() => Some(b),
        _ => Some(candidate),
    })
}

/// `spotify:track:4uLU6hMCjMI75M1A2tKUQC` → `4uLU6hMCjMI75M1A2tKUQC`.
pub fn bare_track_id(uri: &str) -> &str {
    uri.rsplit(':').next().unwrap_or(uri)
}

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Metadata lookup keyed by bare track ID.
pub trait TrackLookup: Send + Sync {
    fn track_info(
        &self,
        track_id: &str,
    ) -> impl Future<Output = Result<TrackMetadata, LookupError>> + Send;
}

/// Raw bytes for an image URL.
pub trait ImageFetcher: Send + Sync {
    fn fetch_image(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, LookupError>> + Send;
}

// ── GraphQL response ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GetTrackResponse {
    data: Option<GetTrackData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTrackData {
    track_union: Option<TrackUnion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackUnion {
    name: Option<String>,
    album_of_track: Option<AlbumOfTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlbumOfTrack {
    cover_art: Option<CoverArt>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverArt {
    #[serde(default)]
    sources: Vec<ImageSource>,
    extracted_colors: Option<ExtractedColors>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractedColors {
    color_raw: Option<HexColor>,
}

#[derive(Debug, Deserialize)]
struct HexColor {
    hex: String,
}

#[derive(Debug, Deserialize)]
struct ImageSource {
    url: String,
    width: Option<u32>,
    height: Option<u32>,
}

fn into_metadata(resp: GetTrackResponse) -> Result<TrackMetadata, LookupError> {
    let track = resp.data.and_then(|d| d.track_union).ok_or_else(|| {
        let reason = resp
            .errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "missing trackUnion".to_string());
        LookupError::Malformed(reason)
    })?;

    let name = track
        .name
        .ok_or_else(|| LookupError::Malformed("track has no name".to_string()))?;
    let cover_art = track.album_of_track.and_then(|a| a.cover_art);

    let (images, extracted_color) = match cover_art {
        Some(art) => (
            art.sources
                .into_iter()
                .map(|s| CoverImage {
                    url: s.url,
                    width: s.width,
                    height: s.height,
                })
                .collect(),
            art.extracted_colors
                .and_then(|c| c.color_raw)
                .map(|c| c.hex),
        ),
        None => (Vec::new(), None),
    };

    Ok(TrackMetadata {
        name,
        images,
        extracted_color,
    })
}

// ── WebClient ─────────────────────────────────────────────────────────────────

/// Session-backed implementation of both ports.
#[derive(Clone)]
pub struct WebClient {
    session: Arc<Session>,
}

impl WebClient {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

impl TrackLookup for WebClient {
    async fn track_info(&self, track_id: &str) -> Result<TrackMetadata, LookupError> {
        let endpoints = self.session.endpoints();
        let variables = serde_json::json!({ "uri": format!("spotify:track:{}", track_id) });
        let extensions = serde_json::json!({
            "persistedQuery": { "version": 1, "sha256Hash": endpoints.track_query_hash }
        });

        let response = self
            .session
            .http()
            .get(&endpoints.partner_api_url)
            .query(&[
                ("operationName", "getTrack".to_string()),
                ("variables", variables.to_string()),
                ("extensions", extensions.to_string()),
            ])
            .bearer_auth(self.session.bearer().await?)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LookupError::Status {
                endpoint: "getTrack",
                status: response.status(),
            });
        }

        let body: GetTrackResponse = response.json().await?;
        into_metadata(body)
    }
}

impl ImageFetcher for WebClient {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, LookupError> {
        let mut response = self.session.http().get(url).send().await?;

        if !response.status().is_success() {
            return Err(LookupError::Status {
                endpoint: "image",
                status: response.status(),
            });
        }

        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if data.len() + chunk.len() > MAX_IMAGE_BYTES {
                return Err(LookupError::TooLarge);
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}
