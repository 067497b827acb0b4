use crate::ports::{BusMessage, BusStream, EventBus};
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use shared::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Receives every message of one bus subscription, in arrival order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: BusMessage);
}

/// Subscribe to `pattern` now, then feed `handler` from a background task
/// until `shutdown` fires.
///
/// The initial subscription error is returned to the caller. If the stream
/// ends later (lost connection), the task resubscribes with exponential
/// backoff.
pub(crate) async fn spawn_subscription(
    bus: Arc<dyn EventBus>,
    pattern: String,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let stream = bus.subscribe(&pattern).await?;
    tracing::info!(pattern = %pattern, "Subscribed to bus");
    Ok(tokio::spawn(run(bus, pattern, handler, shutdown, stream)))
}

async fn run(
    bus: Arc<dyn EventBus>,
    pattern: String,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
    mut stream: BusStream,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = stream.next() => match message {
                Some(message) => handler.on_message(message).await,
                None => {
                    tracing::warn!(pattern = %pattern, "Bus subscription closed, resubscribing");
                    match resubscribe(bus.as_ref(), &pattern, &shutdown).await {
                        Some(fresh) => stream = fresh,
                        None => break,
                    }
                }
            },
        }
    }
    tracing::info!(pattern = %pattern, "Bus subscription stopped");
}

async fn resubscribe(
    bus: &dyn EventBus,
    pattern: &str,
    shutdown: &CancellationToken,
) -> Option<BusStream> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(with_jitter(backoff)) => {}
        }

        match bus.subscribe(pattern).await {
            Ok(stream) => {
                tracing::info!(pattern = %pattern, "Resubscribed to bus");
                return Some(stream);
            }
            Err(e) => {
                tracing::error!(
                    pattern = %pattern,
                    error = %e,
                    backoff_secs = backoff.as_secs(),
                    "Bus resubscribe failed"
                );
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

// Up to 10% extra so a fleet that lost the bus together doesn't reconnect in lockstep
fn with_jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() / 10) as u64;
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Handle on a cache's running subscriptions.
///
/// Dropping it stops the subscriptions; `shutdown` also waits for them.
pub struct Listeners {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Listeners {
    pub(crate) fn new(shutdown: CancellationToken, handles: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, handles }
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Listener task ended abnormally");
            }
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("tasks", &self.handles.len())
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBus;
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<BusMessage>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, message: BusMessage) {
            self.seen.lock().unwrap().push(message);
        }
    }

    #[tokio::test]
    async fn delivers_matching_messages_in_order() {
        let bus = Arc::new(TestBus::new());
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();

        let handle = spawn_subscription(
            bus.clone(),
            "topic:*".to_string(),
            recorder.clone(),
            shutdown.clone(),
        )
        .await
        .unwrap();

        bus.publish("topic:a", Bytes::from_static(b"1")).await.unwrap();
        bus.publish("other", Bytes::from_static(b"x")).await.unwrap();
        bus.publish("topic:b", Bytes::from_static(b"2")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        let payloads: Vec<&[u8]> = seen.iter().map(|m| m.payload.as_ref()).collect();
        assert_eq!(payloads, vec![&b"1"[..], &b"2"[..]]);
        assert_eq!(seen[1].topic, "topic:b");
    }

    #[tokio::test]
    async fn listeners_shutdown_stops_tasks() {
        let bus = Arc::new(TestBus::new());
        let shutdown = CancellationToken::new();
        let handle = spawn_subscription(
            bus,
            "t".to_string(),
            Arc::new(Recorder::default()),
            shutdown.clone(),
        )
        .await
        .unwrap();

        let listeners = Listeners::new(shutdown, vec![handle]);
        assert!(listeners.is_running());
        listeners.shutdown().await;
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let delay = with_jitter(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(11));
        }
    }
}
