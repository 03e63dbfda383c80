//! Spotify session bootstrap.
//!
//! Runs once at startup.  With the override flag set it logs in with the
//! configured cookies, wires the track update handler onto the dealer feed
//! and returns the subscription task.  Any failure here is logged and the
//! daemon carries on without a subscription.
use anyhow::Context;
use palette_proto::config::{Config, ConfigStore};
use palette_proto::notification::NotificationQueue;
use palette_proto::protocol::SessionState;
use palette_proto::state::StatusManager;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dealer::DealerSubscriber;
use crate::events::{run_delivery_worker, EventRouter, DEVICE_STATE_CHANGED, EVENT_QUEUE_CAPACITY};
use crate::handler::{RetryPolicy, TrackUpdateHandler};
use crate::palette::ColorThiefExtractor;
use crate::session::{Credentials, Session};
use crate::spotify::WebClient;

/// Everything the bootstrap borrows from the host process.
pub struct Services {
    pub store: Arc<ConfigStore>,
    pub notifications: NotificationQueue,
    pub status: Arc<StatusManager>,
    pub http: reqwest::Client,
    pub cancel: CancellationToken,
}

pub async fn start(services: &Services) -> Option<JoinHandle<()>> {
    let config = services.store.snapshot().await;
    if !config.general_settings.spotify_color_override_enabled {
        info!("Spotify color override disabled.");
        services.status.set_session(SessionState::Disabled).await;
        return None;
    }

    services.status.set_session(SessionState::Connecting).await;
    match connect(services, &config).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Failed to login: {:#}", e);
            services
                .status
                .set_session(SessionState::Failed(format!("{:#}", e)))
                .await;
            None
        }
    }
}

async fn connect(services: &Services, config: &Config) -> anyhow::Result<JoinHandle<()>> {
    let credentials = Credentials::from_settings(&config.general_settings)?;
    debug!("Spotify credentials: {:?}", credentials);

    let session = Session::from_cookies(services.http.clone(), credentials, config.spotify.clone())
        .await
        .context("could not establish a session")?;
    let session = Arc::new(session);

    let profile = session
        .profile()
        .await
        .context("could not fetch the user profile")?;
    info!(
        "Logged in as {}. has_premium={}",
        profile.username, profile.has_premium
    );
    services
        .status
        .set_profile(profile.username, profile.has_premium)
        .await;

    let client = WebClient::new(session.clone());
    let handler = TrackUpdateHandler::new(
        client.clone(),
        client,
        Arc::new(ColorThiefExtractor),
        services.store.clone(),
        services.notifications.clone(),
        services.status.clone(),
        RetryPolicy::from_config(&config.spotify),
    );
    let mut router = EventRouter::new();
    router.on(DEVICE_STATE_CHANGED, Arc::new(handler));

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let worker = tokio::spawn(run_delivery_worker(
        router,
        events_rx,
        services.cancel.clone(),
    ));

    let dealer = DealerSubscriber::new(session);
    let cancel = services.cancel.clone();
    let status = services.status.clone();

    Ok(tokio::spawn(async move {
        if let Err(e) = dealer.run(events_tx, cancel).await {
            error!("dealer: {:#}", e);
        }
        status.set_session(SessionState::Closed).await;
        // the sender went with the dealer; the worker drains what is queued
        let _ = worker.await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palette_proto::notification;
    use tempfile::TempDir;

    async fn services(enabled: bool, dir: &TempDir) -> Services {
        let store = Arc::new(ConfigStore::open(dir.path().join("config.toml")).unwrap());
        {
            let mut guard = store.lock().await;
            let mut next = guard.config().clone();
            next.general_settings.spotify_color_override_enabled = enabled;
            guard.commit(next).await.unwrap();
        }
        let (notifications, _rx) = notification::channel(1);
        Services {
            store,
            notifications,
            status: Arc::new(StatusManager::new()),
            http: reqwest::Client::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_disabled_flag_skips_login() {
        let dir = TempDir::new().unwrap();
        let services = services(false, &dir).await;

        assert!(start(&services).await.is_none());
        assert_eq!(services.status.get_status().await.session, SessionState::Disabled);
    }

    #[tokio::test]
    async fn test_missing_cookies_fail_without_subscribing() {
        let dir = TempDir::new().unwrap();
        let services = services(true, &dir).await;

        assert!(start(&services).await.is_none());
        match services.status.get_status().await.session {
            SessionState::Failed(reason) => assert!(reason.contains("spotify_cookies")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
