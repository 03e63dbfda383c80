use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::platform;
use crate::protocol::Rgb;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid spotify_cookies: {0}")]
    Cookies(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub general_settings: GeneralSettings,
    #[serde(default)]
    pub gradients: GradientsConfig,
    #[serde(default)]
    pub colors: ColorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Endpoints and retry knobs for the Spotify integration.
///
/// The endpoints are not part of any public contract; they are kept here so a
/// changed URL or persisted-query hash can be fixed without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpotifyConfig {
    /// Cookie → access-token exchange.
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Public Web API base (profile lookup).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Partner GraphQL endpoint (track metadata with extracted colors).
    #[serde(default = "default_partner_api_url")]
    pub partner_api_url: String,
    /// Persisted-query hash for the `getTrack` operation.
    #[serde(default = "default_track_query_hash")]
    pub track_query_hash: String,
    /// Dealer push websocket.
    #[serde(default = "default_dealer_url")]
    pub dealer_url: String,
    /// Connect-state API used to register the listening device.
    #[serde(default = "default_connect_state_url")]
    pub connect_state_url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

/// Settings shared with the rest of the host.  Keys this daemon does not know
/// about are kept in `extra` so a save never drops them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneralSettings {
    #[serde(default)]
    pub spotify_color_override_enabled: bool,
    #[serde(default)]
    pub spotify_email: String,
    #[serde(default)]
    pub spotify_cookies: CookieBlob,
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GradientsConfig {
    #[serde(default)]
    pub spotify_palette: Vec<Rgb>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ColorsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_color: Option<Rgb>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

/// Session cookies, either as a TOML table or as the JSON string older
/// configs carry (an object of name → value, or a browser export array of
/// `{ "name": .., "value": .. }` entries).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CookieBlob {
    Table(BTreeMap<String, String>),
    Json(String),
}

impl Default for CookieBlob {
    fn default() -> Self {
        CookieBlob::Table(BTreeMap::new())
    }
}

impl CookieBlob {
    pub fn parse(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        match self {
            CookieBlob::Table(map) => Ok(map.clone()),
            CookieBlob::Json(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            CookieBlob::Json(raw) => {
                let value: serde_json::Value = serde_json::from_str(raw)
                    .map_err(|e| ConfigError::Cookies(e.to_string()))?;
                cookies_from_json(&value)
            }
        }
    }
}

fn cookies_from_json(value: &serde_json::Value) -> Result<BTreeMap<String, String>, ConfigError> {
    use serde_json::Value;

    let as_text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    match value {
        Value::Object(map) => Ok(map
            .iter()
            .map(|(name, v)| (name.clone(), as_text(v)))
            .collect()),
        Value::Array(entries) => entries
            .iter()
            .map(|entry| {
                let name = entry.get("name").and_then(Value::as_str);
                let v = entry.get("value");
                match (name, v) {
                    (Some(name), Some(v)) => Ok((name.to_string(), as_text(v))),
                    _ => Err(ConfigError::Cookies(
                        "array entries need `name` and `value`".to_string(),
                    )),
                }
            })
            .collect(),
        _ => Err(ConfigError::Cookies(
            "expected a JSON object or array".to_string(),
        )),
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            api_url: default_api_url(),
            partner_api_url: default_partner_api_url(),
            track_query_hash: default_track_query_hash(),
            dealer_url: default_dealer_url(),
            connect_state_url: default_connect_state_url(),
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

fn default_log_file() -> PathBuf {
    platform::log_file()
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_token_url() -> String {
    "https://open.spotify.com/get_access_token?reason=transport&productType=web_player".to_string()
}

fn default_api_url() -> String {
    "https://api.spotify.com/v1".to_string()
}

fn default_partner_api_url() -> String {
    "https://api-partner.spotify.com/pathfinder/v1/query".to_string()
}

fn default_track_query_hash() -> String {
    "ae85b52abb74d20a4c331d4143d4772c95f34757bfa8c625474b912b9055b5c0".to_string()
}

fn default_dealer_url() -> String {
    "wss://dealer.spotify.com/".to_string()
}

fn default_connect_state_url() -> String {
    "https://guc-spclient.spotify.com/connect-state/v1".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_timeout_secs() -> u64 {
    20
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write both Spotify-derived fields.  They only ever change together.
    pub fn apply_spotify_colors(&mut self, palette: Vec<Rgb>, color: Rgb) {
        self.gradients.spotify_palette = palette;
        self.colors.spotify_color = Some(color);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            spotify: SpotifyConfig::default(),
            general_settings: GeneralSettings::default(),
            gradients: GradientsConfig::default(),
            colors: ColorsConfig::default(),
        }
    }
}

// ── ConfigStore ───────────────────────────────────────────────────────────────

/// The config file shared with the rest of the host.
///
/// Other processes may edit the file at any time, so writers go through
/// [`ConfigStore::lock`]: the returned guard is the only way to reload and
/// persist, and holding it keeps other in-process writers out between the
/// reload and the save.  Nothing stops an external process from writing in
/// that window.
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<Config>,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self {
            path,
            current: Mutex::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the last loaded or committed config.
    pub async fn snapshot(&self) -> Config {
        self.current.lock().await.clone()
    }

    pub async fn lock(&self) -> ConfigGuard<'_> {
        ConfigGuard {
            path: &self.path,
            config: self.current.lock().await,
        }
    }
}

/// Exclusive access to the store.  Dropping it releases the lock.
pub struct ConfigGuard<'a> {
    path: &'a Path,
    config: MutexGuard<'a, Config>,
}

impl ConfigGuard<'_> {
    /// Re-read the file, replacing the in-memory copy.
    pub async fn reload(&mut self) -> Result<(), ConfigError> {
        let content = tokio::fs::read_to_string(self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.to_path_buf(),
                source,
            })?;
        *self.config = Config::parse(self.path, &content)?;
        debug!("config: reloaded {:?}", self.path);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Persist `next` and make it the in-memory copy.  On error neither the
    /// file nor the in-memory copy changes.
    pub async fn commit(&mut self, next: Config) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&next)?;
        let write_err = |source| ConfigError::Write {
            path: self.path.to_path_buf(),
            source,
        };

        // Write beside the target and rename so readers never see a torn file
        let staging = self.path.with_extension("toml.tmp");
        let written = match tokio::fs::write(&staging, content).await {
            Ok(()) => tokio::fs::rename(&staging, self.path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(write_err(e));
        }

        *self.config = next;
        debug!("config: committed {:?}", self.path);
        Ok(())
    }
}
