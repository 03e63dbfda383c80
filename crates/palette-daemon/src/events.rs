//! Named-event routing between the dealer connection and handlers.
//!
//! ```text
//!   DealerSubscriber ──DealerEvent──▶ mpsc ──▶ delivery worker ──▶ EventRouter::dispatch
//!                                                                  └── handlers for that name, in order
//! ```
//!
//! The worker awaits each delivery before taking the next one, so a handler
//! never runs concurrently with itself.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cluster update emitted whenever playback state changes on any device.
pub const DEVICE_STATE_CHANGED: &str = "DEVICE_STATE_CHANGED";

pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// One named event with its decoded JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DealerEvent {
    pub name: String,
    pub payload: Value,
}

pub trait EventHandler: Send + Sync {
    /// Must not fail: anything that goes wrong is handled (and logged) inside.
    fn handle<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, ()>;
}

#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, event_name: &str, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
        self
    }

    /// Run every handler registered for `event_name`.  Returns how many ran.
    pub async fn dispatch(&self, event_name: &str, payload: &Value) -> usize {
        let Some(handlers) = self.handlers.get(event_name) else {
            return 0;
        };
        for handler in handlers {
            handler.handle(payload).await;
        }
        handlers.len()
    }
}

/// Serialize deliveries: take events off `rx` one at a time until the channel
/// closes or `cancel` fires.
pub async fn run_delivery_worker(
    router: EventRouter,
    mut rx: mpsc::Receiver<DealerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let ran = router.dispatch(&event.name, &event.payload).await;
        if ran == 0 {
            debug!("events: no handler for {}", event.name);
        }
    }
    info!("events: delivery worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Value>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl EventHandler for Recorder {
        fn handle<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.seen.lock().unwrap().push(payload.clone());
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let recorder = Arc::new(Recorder::default());
        let mut router = EventRouter::new();
        router
            .on(DEVICE_STATE_CHANGED, recorder.clone())
            .on(DEVICE_STATE_CHANGED, recorder.clone());

        assert_eq!(router.dispatch(DEVICE_STATE_CHANGED, &json!({"n": 1})).await, 2);
        assert_eq!(router.dispatch("PLAYER_STATE_CHANGED", &json!({})).await, 0);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_delivers_in_order_one_at_a_time() {
        let recorder = Arc::new(Recorder::default());
        let mut router = EventRouter::new();
        router.on(DEVICE_STATE_CHANGED, recorder.clone());

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let worker = tokio::spawn(run_delivery_worker(router, rx, CancellationToken::new()));

        for n in 0..5 {
            tx.send(DealerEvent {
                name: DEVICE_STATE_CHANGED.to_string(),
                payload: json!({ "n": n }),
            })
            .await
            .unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        let order: Vec<i64> = seen.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<DealerEvent>(1);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_delivery_worker(EventRouter::new(), rx, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
