use crate::config::Config;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubscribeReasonCode};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const REQUEST_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Lifecycle and delivery notifications produced by the event poller.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Connected { session_present: bool },
    ConnectionLost { reason: String },
    Message(InboundMessage),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("MQTT request failed: {0}")]
    Request(String),
    #[error("MQTT request did not complete within {0:?}")]
    Timeout(Duration),
}

/// Requests the supervisor makes of the message bus. Delivery and
/// connection notifications arrive separately as [`BusEvent`]s.
pub trait BusClient: Clone + Send + Sync + 'static {
    fn subscribe(&self, topic: &str, qos: QoS) -> impl Future<Output = Result<(), BusError>> + Send;

    fn disconnect(&self, grace: Duration) -> impl Future<Output = Result<(), BusError>> + Send;
}

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    pub fn new(config: &Config) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_QUEUE);
        (Self { client }, eventloop)
    }
}

impl BusClient for MqttBus {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|err| BusError::Request(err.to_string()))
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), BusError> {
        match tokio::time::timeout(grace, self.client.disconnect()).await {
            Ok(result) => result.map_err(|err| BusError::Request(err.to_string())),
            Err(_) => Err(BusError::Timeout(grace)),
        }
    }
}

// rumqttc speaks MQTT 3.1.1 from its root module.
fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    mqttoptions.set_clean_session(false);
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

/// Drives the rumqttc event loop and forwards what the supervisor cares about.
///
/// Polling again after an error makes rumqttc reconnect, so every failure is
/// reported and followed by a fixed `retry_interval` pause; there is no retry
/// limit. The task ends once a DISCONNECT has been written or the event
/// receiver is gone.
pub fn spawn_event_poller(
    mut eventloop: EventLoop,
    events: mpsc::Sender<BusEvent>,
    retry_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => BusEvent::Connected {
                    session_present: ack.session_present,
                },
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    BusEvent::Message(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    })
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        tracing::warn!(pkid = ack.pkid, "broker rejected subscription");
                    } else {
                        tracing::debug!(pkid = ack.pkid, "subscription acknowledged");
                    }
                    continue;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("MQTT disconnect sent; event poller stopping");
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    let lost = BusEvent::ConnectionLost {
                        reason: err.to_string(),
                    };
                    if events.send(lost).await.is_err() {
                        break;
                    }
                    sleep(retry_interval).await;
                    continue;
                }
            };

            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}
