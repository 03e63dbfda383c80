//! Bounded queue of notifications for the host's dispatcher.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// The config file changed; the target should re-read it.
    ConfigRefresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub kind: NotificationKind,
    /// Device slot the notification is addressed to, e.g. `device_0`.
    pub target: String,
}

impl NotificationItem {
    pub fn config_refresh(target: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::ConfigRefresh,
            target: target.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification queue is closed")]
    Closed,
}

/// Producer side of the queue.  Cheap to clone.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<NotificationItem>,
}

pub fn channel(capacity: usize) -> (NotificationQueue, mpsc::Receiver<NotificationItem>) {
    let (tx, rx) = mpsc::channel(capacity);
    (NotificationQueue { tx }, rx)
}

impl NotificationQueue {
    /// Enqueue, waiting for space if the queue is full.
    pub async fn put_blocking(&self, item: NotificationItem) -> Result<(), NotifyError> {
        self.reserve().await?.put(item);
        Ok(())
    }

    /// Wait for space and hold it.  Putting into the returned slot cannot fail.
    pub async fn reserve(&self) -> Result<NotificationSlot<'_>, NotifyError> {
        let permit = self.tx.reserve().await.map_err(|_| NotifyError::Closed)?;
        Ok(NotificationSlot { permit })
    }
}

/// One reserved place in the queue.  Dropping it unused gives the place back.
pub struct NotificationSlot<'a> {
    permit: mpsc::Permit<'a, NotificationItem>,
}

impl NotificationSlot<'_> {
    pub fn put(self, item: NotificationItem) {
        self.permit.send(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_closed_queue_rejects_puts() {
        let (queue, rx) = channel(1);
        drop(rx);
        assert_eq!(
            queue
                .put_blocking(NotificationItem::config_refresh("device_0"))
                .await,
            Err(NotifyError::Closed)
        );
        assert!(matches!(queue.reserve().await, Err(NotifyError::Closed)));
    }

    #[tokio::test]
    async fn test_reserved_slot_holds_capacity() {
        let (queue, mut rx) = channel(1);
        let slot = queue.reserve().await.unwrap();

        // the only place is taken until the slot is used or dropped
        let waiting = tokio::time::timeout(Duration::from_millis(50), queue.reserve()).await;
        assert!(waiting.is_err());

        slot.put(NotificationItem::config_refresh("device_0"));
        assert_eq!(rx.recv().await.unwrap().target, "device_0");

        drop(queue.reserve().await.unwrap());
        queue
            .put_blocking(NotificationItem::config_refresh("device_1"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().target, "device_1");
    }

    #[tokio::test]
    async fn test_put_blocking_waits_for_space() {
        let (queue, mut rx) = channel(1);
        queue
            .put_blocking(NotificationItem::config_refresh("device_0"))
            .await
            .unwrap();

        let producer = queue.clone();
        let pending = tokio::spawn(async move {
            producer
                .put_blocking(NotificationItem::config_refresh("device_1"))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await.unwrap().target, "device_0");
        pending.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().target, "device_1");
    }

    #[test]
    fn test_item_serializes_kind_in_snake_case() {
        let item = NotificationItem::config_refresh("device_0");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "config_refresh");
        assert_eq!(json["target"], "device_0");
    }
}
