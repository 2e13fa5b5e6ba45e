use crate::mqtt::{BusClient, BusEvent};
use crate::pipeline::IngestStats;
use crate::store::ReadingStore;
use crate::subscription::SubscriptionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reacts to bus lifecycle events. Reconnecting itself is left to the bus
/// client; the supervisor only tracks state and re-subscribes on every
/// (re)connect.
pub struct ConnectionSupervisor<B, S> {
    bus: B,
    subscriptions: SubscriptionManager<S>,
    events: mpsc::Receiver<BusEvent>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<IngestStats>,
    connects: u64,
}

impl<B: BusClient, S: ReadingStore> ConnectionSupervisor<B, S> {
    pub fn new(
        bus: B,
        subscriptions: SubscriptionManager<S>,
        events: mpsc::Receiver<BusEvent>,
        stats: Arc<IngestStats>,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                bus,
                subscriptions,
                events,
                state,
                stats,
                connects: 0,
            },
            state_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn subscriptions(&self) -> &SubscriptionManager<S> {
        &self.subscriptions
    }

    /// Control loop. Runs until `shutdown` flips to true (or its sender goes
    /// away) or the event stream ends, then waits up to `grace` for in-flight
    /// messages.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        self.transition(ConnectionState::Connecting);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::warn!("MQTT event stream closed");
                            break;
                        }
                    }
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        self.subscriptions.reset();
        let discarded = self.discard_queued();
        if discarded > 0 {
            tracing::warn!(discarded, "dropping queued MQTT messages at shutdown");
        }
        if self.subscriptions.drain(grace).await {
            tracing::info!("in-flight messages finished");
        } else {
            tracing::warn!(?grace, "in-flight messages still running after grace period");
        }
    }

    pub async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected { session_present } => {
                if self.state() == ConnectionState::Connected {
                    tracing::debug!("connect notification while already connected; ignoring");
                    return;
                }
                self.connects += 1;
                self.transition(ConnectionState::Connected);
                tracing::info!(
                    session_present,
                    connects = self.connects,
                    topic = %self.subscriptions.topic(),
                    "connected to MQTT broker"
                );
                // Failure is logged by the manager; the next reconnect retries.
                let _ = self.subscriptions.register(&self.bus).await;
            }
            BusEvent::ConnectionLost { reason } => {
                if self.state() == ConnectionState::Connected {
                    tracing::warn!(error = %reason, "MQTT connection lost");
                    self.transition(ConnectionState::Disconnected);
                    self.subscriptions.reset();
                } else {
                    tracing::warn!(error = %reason, "MQTT connect attempt failed");
                }
                self.transition(ConnectionState::Connecting);
            }
            BusEvent::Message(message) => {
                let _ = self.subscriptions.dispatch(message).await;
            }
        }
    }

    /// Closes the event channel and empties it, returning how many messages
    /// were left unprocessed. The broker already considers them delivered.
    fn discard_queued(&mut self) -> usize {
        self.events.close();
        let mut discarded = 0;
        while let Ok(event) = self.events.try_recv() {
            if matches!(event, BusEvent::Message(_)) {
                discarded += 1;
            }
        }
        discarded
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "connection state changed");
        }
        self.stats
            .set_bus_connected(next == ConnectionState::Connected);
    }
}

/// Waits at most `ceiling` for the first `Connected` state. Returns false on
/// timeout, or when the supervisor is gone.
pub async fn wait_for_connection(
    state: &mut watch::Receiver<ConnectionState>,
    ceiling: Duration,
) -> bool {
    tokio::time::timeout(
        ceiling,
        state.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .map(|result| result.is_ok())
    .unwrap_or(false)
}
