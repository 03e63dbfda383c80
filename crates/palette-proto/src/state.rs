use crate::protocol::{AppliedUpdate, DaemonStatus, SessionState};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, in-memory view of what the daemon is doing.  Every mutation bumps
/// `rev` so readers can tell snapshots apart.
pub struct StatusManager {
    status: Arc<RwLock<DaemonStatus>>,
}

impl StatusManager {
    pub fn new() -> Self {
        let status = DaemonStatus {
            rev: 1,
            ..DaemonStatus::default()
        };
        Self {
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub async fn get_status(&self) -> DaemonStatus {
        self.status.read().await.clone()
    }

    pub async fn set_session(&self, session: SessionState) {
        let mut status = self.status.write().await;
        status.session = session;
        status.rev += 1;
    }

    pub async fn set_profile(&self, username: String, has_premium: bool) {
        let mut status = self.status.write().await;
        status.username = Some(username);
        status.has_premium = has_premium;
        status.session = SessionState::Connected;
        status.rev += 1;
    }

    pub async fn set_current_track(&self, uri: String) {
        let mut status = self.status.write().await;
        status.current_track = Some(uri);
        status.rev += 1;
    }

    pub async fn record_applied(&self, update: AppliedUpdate) {
        let mut status = self.status.write().await;
        status.last_update = Some(update);
        status.updates_applied += 1;
        status.rev += 1;
    }

    pub async fn record_abandoned(&self) {
        let mut status = self.status.write().await;
        status.updates_abandoned += 1;
        status.rev += 1;
    }

    pub async fn record_dispatched(&self) {
        let mut status = self.status.write().await;
        status.notifications_dispatched += 1;
        status.rev += 1;
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[tokio::test]
    async fn test_every_mutation_bumps_rev() {
        let manager = StatusManager::new();
        assert_eq!(manager.get_status().await.rev, 1);

        manager.set_session(SessionState::Connecting).await;
        manager.set_profile("listener".into(), true).await;
        manager.set_current_track("spotify:track:1".into()).await;
        manager.record_abandoned().await;
        manager.record_dispatched().await;

        let status = manager.get_status().await;
        assert_eq!(status.rev, 6);
        assert_eq!(status.session, SessionState::Connected);
        assert_eq!(status.username.as_deref(), Some("listener"));
        assert!(status.has_premium);
        assert_eq!(status.updates_abandoned, 1);
        assert_eq!(status.notifications_dispatched, 1);
    }

    #[tokio::test]
    async fn test_record_applied_keeps_latest() {
        let manager = StatusManager::new();
        for name in ["first", "second"] {
            manager
                .record_applied(AppliedUpdate {
                    track_uri: format!("spotify:track:{}", name),
                    track_name: name.to_string(),
                    palette: vec![[1, 2, 3]; 3],
                    color: [4, 5, 6],
                    attempts: 1,
                    applied_at: Local::now(),
                })
                .await;
        }

        let status = manager.get_status().await;
        assert_eq!(status.updates_applied, 2);
        assert_eq!(status.last_update.unwrap().track_name, "second");
    }
}
