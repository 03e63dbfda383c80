//! Authenticated Spotify session built from browser cookies.
//!
//! The cookie → token exchange is an opaque web endpoint; we only rely on it
//! returning `{ accessToken, accessTokenExpirationTimestampMs, isAnonymous }`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use palette_proto::config::{ConfigError, GeneralSettings, SpotifyConfig};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no spotify_cookies configured")]
    MissingCookies,
    #[error(transparent)]
    InvalidCookies(#[from] ConfigError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned status {status}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },
    #[error("session cookies were rejected (anonymous token)")]
    Rejected,
}

// ── Credentials ───────────────────────────────────────────────────────────────

pub struct Credentials {
    pub identifier: String,
    pub cookies: BTreeMap<String, String>,
}

impl Credentials {
    pub fn from_settings(settings: &GeneralSettings) -> Result<Self, SessionError> {
        let cookies = settings.spotify_cookies.parse()?;
        if cookies.is_empty() {
            return Err(SessionError::MissingCookies);
        }
        Ok(Self {
            identifier: settings.spotify_email.clone(),
            cookies,
        })
    }

    /// `Cookie:` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// Cookie values are live credentials; only their names are ever printed.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    access_token_expiration_timestamp_ms: i64,
    #[serde(default)]
    is_anonymous: bool,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn from_response(resp: TokenResponse) -> Result<Self, SessionError> {
        if resp.is_anonymous {
            return Err(SessionError::Rejected);
        }
        let expires_at = Utc
            .timestamp_millis_opt(resp.access_token_expiration_timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(Self {
            value: resp.access_token,
            expires_at,
        })
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

// ── Profile ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MeResponse {
    id: String,
    display_name: Option<String>,
    product: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub username: String,
    pub has_premium: bool,
}

impl From<MeResponse> for UserProfile {
    fn from(me: MeResponse) -> Self {
        Self {
            username: me.display_name.filter(|n| !n.is_empty()).unwrap_or(me.id),
            has_premium: me.product.as_deref() == Some("premium"),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Logged-in account.  Lives for the whole process; the access token is
/// refreshed from the cookies whenever it is about to expire.
pub struct Session {
    http: reqwest::Client,
    credentials: Credentials,
    endpoints: SpotifyConfig,
    token: RwLock<AccessToken>,
}

impl Session {
    pub async fn from_cookies(
        http: reqwest::Client,
        credentials: Credentials,
        endpoints: SpotifyConfig,
    ) -> Result<Self, SessionError> {
        let token = request_token(&http, &credentials, &endpoints.token_url).await?;
        info!(
            "Session established for {} (token valid until {})",
            credentials.identifier, token.expires_at
        );
        Ok(Self {
            http,
            credentials,
            endpoints,
            token: RwLock::new(token),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn endpoints(&self) -> &SpotifyConfig {
        &self.endpoints
    }

    /// A currently valid access token.
    pub async fn bearer(&self) -> Result<String, SessionError> {
        {
            let token = self.token.read().await;
            if !token.is_expired(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        let mut token = self.token.write().await;
        // Another caller may have refreshed while we waited for the lock
        if token.is_expired(Utc::now()) {
            debug!("Access token expired, refreshing");
            *token =
                request_token(&self.http, &self.credentials, &self.endpoints.token_url).await?;
        }
        Ok(token.value.clone())
    }

    pub async fn profile(&self) -> Result<UserProfile, SessionError> {
        let url = format!("{}/me", self.endpoints.api_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.bearer().await?)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SessionError::Status {
                endpoint: "profile",
                status: response.status(),
            });
        }

        let me: MeResponse = response.json().await?;
        Ok(me.into())
    }
}

async fn request_token(
    http: &reqwest::Client,
    credentials: &Credentials,
    token_url: &str,
) -> Result<AccessToken, SessionError> {
    let response = http
        .get(token_url)
        .header("Cookie", credentials.cookie_header())
        .header("Accept", "application/json")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(SessionError::Status {
            endpoint: "token",
            status: response.status(),
        });
    }

    let body: TokenResponse = response.json().await?;
    AccessToken::from_response(body)
}
