//! MQTT transport backed by `rumqttc`.
//!
//! Messages are published and subscribed with QoS 1 (at-least-once), which
//! matches what the sync engine assumes of the broker. The rumqttc event
//! loop runs on its own tokio task and forwards inbound publishes to the
//! session's [`EventStream`]. A poll error ends the session with
//! `ConnectionLost`; reconnecting means calling [`Transport::connect`] again.
//!
//! `subscribe` returns once the SUBSCRIBE is queued. The broker's SUBACK is
//! checked by the event loop task: a rejected topic filter ends the session
//! with `ConnectionLost`, so the engine never sits `Connected` without its
//! subscriptions.

use super::{EventStream, Transport, TransportError, TransportEvent};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

struct Session {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

pub struct MqttTransport {
    config: BrokerConfig,
    client_id: String,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("roadwatch-{}", uuid::Uuid::new_v4().simple()));
        Self {
            config,
            client_id,
            session: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(self.client_id.clone(), self.config.host.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(ref username) = self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options
    }

    /// Drive the event loop until the broker acknowledges the session.
    async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(TransportError::Connect(format!(
                            "broker rejected session: {:?}",
                            ack.code
                        )))
                    };
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
    }

    async fn pump(mut eventloop: EventLoop, tx: mpsc::UnboundedSender<TransportEvent>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let event = TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if tx.send(event).is_err() {
                        tracing::debug!("MQTT: event stream dropped, stopping pump");
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let rejected = rejected_filters(&ack);
                    if rejected > 0 {
                        tracing::warn!(pkid = ack.pkid, rejected, "MQTT: broker rejected subscription");
                        let _ = tx.send(TransportEvent::ConnectionLost {
                            reason: format!("broker rejected {rejected} topic filter(s)"),
                        });
                        return;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("MQTT: session closed locally");
                    return;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    let _ = tx.send(TransportEvent::ConnectionLost {
                        reason: "broker sent disconnect".into(),
                    });
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("MQTT: connection lost: {e}");
                    let _ = tx.send(TransportEvent::ConnectionLost {
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }
}

/// Number of topic filters the broker refused in a SUBACK.
fn rejected_filters(ack: &SubAck) -> usize {
    ack.return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count()
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn connect(&self) -> Result<EventStream, TransportError> {
        self.disconnect().await;

        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.client_id,
            "Connecting to MQTT broker"
        );

        let (client, mut eventloop) =
            AsyncClient::new(self.options(), self.config.channel_capacity.max(1));

        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
        match tokio::time::timeout(timeout, Self::await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "no CONNACK within {}s",
                    timeout.as_secs()
                )))
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        let pump = tokio::spawn(Self::pump(eventloop, tx));

        *self.session.lock().await = Some(Session { client, pump });
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        session
            .client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            if session.client.disconnect().await.is_ok() {
                // Let the event loop flush queued publishes and the DISCONNECT.
                let _ = tokio::time::timeout(DISCONNECT_GRACE, &mut session.pump).await;
            }
            session.pump.abort();
        }
    }
}
