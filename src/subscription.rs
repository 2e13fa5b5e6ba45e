use crate::mqtt::{BusClient, BusError, InboundMessage};
use crate::pipeline::{Ingestor, MessageOutcome};
use crate::store::ReadingStore;
use rumqttc::QoS;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Owns the topic registration and fans inbound messages out to bounded
/// per-message tasks.
pub struct SubscriptionManager<S> {
    topic: String,
    qos: QoS,
    ingestor: Ingestor<S>,
    permits: Arc<Semaphore>,
    max_inflight: u32,
    active: bool,
}

impl<S: ReadingStore> SubscriptionManager<S> {
    pub fn new(topic: impl Into<String>, qos: QoS, ingestor: Ingestor<S>, max_inflight: usize) -> Self {
        let max_inflight = max_inflight.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        Self {
            topic: topic.into(),
            qos,
            ingestor,
            permits: Arc::new(Semaphore::new(max_inflight as usize)),
            max_inflight,
            active: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the topic is subscribed on the current connection.
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Subscribes once per connection. A failed subscribe leaves the manager
    /// inactive until the next connect.
    pub async fn register<B: BusClient>(&mut self, bus: &B) -> Result<(), BusError> {
        if self.active {
            tracing::debug!(topic = %self.topic, "topic already subscribed on this connection");
            return Ok(());
        }

        match bus.subscribe(&self.topic, self.qos).await {
            Ok(()) => {
                self.active = true;
                let stats = self.ingestor.stats();
                let total = stats.subscriptions.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(topic = %self.topic, qos = ?self.qos, total, "subscribed to topic");
                Ok(())
            }
            Err(err) => {
                self.ingestor.stats().record_error(err.to_string());
                tracing::warn!(
                    error = %err,
                    topic = %self.topic,
                    "failed to subscribe; ingestion paused until reconnect"
                );
                Err(err)
            }
        }
    }

    /// Forgets the registration; subscriptions do not outlive a connection.
    pub fn reset(&mut self) {
        self.active = false;
    }

    /// Hands one message to its own task once a permit is free. Returns `None`
    /// only after [`drain`](Self::drain) has closed the manager.
    pub async fn dispatch(&self, message: InboundMessage) -> Option<JoinHandle<MessageOutcome>> {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(topic = %message.topic, "message arrived after shutdown; dropping");
                return None;
            }
        };
        let ingestor = self.ingestor.clone();
        Some(tokio::spawn(async move {
            let outcome = ingestor
                .handle_message(&message.topic, &message.payload)
                .await;
            drop(permit);
            outcome
        }))
    }

    /// Waits up to `grace` for in-flight messages to finish, then refuses new
    /// ones. Returns whether everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = match tokio::time::timeout(grace, self.permits.acquire_many(self.max_inflight)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                true
            }
            _ => false,
        };
        self.permits.close();
        drained
    }
}
