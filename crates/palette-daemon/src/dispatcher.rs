//! Drains the notification queue.  Consumers of config refreshes live
//! outside this process; here each item is logged and counted.
use palette_proto::notification::NotificationItem;
use palette_proto::state::StatusManager;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub fn spawn(
    mut rx: mpsc::Receiver<NotificationItem>,
    status: Arc<StatusManager>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            info!("Notification: {:?} -> {}", item.kind, item.target);
            status.record_dispatched().await;
        }
        debug!("dispatcher: queue closed");
    })
}
