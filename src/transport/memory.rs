//! In-process broker with MQTT-like fan-out.
//!
//! Every publish is delivered to every connected client subscribed to the
//! exact topic, the publisher included. Tests can refuse connects, fail
//! publishes, sever a client's link, or inject raw payloads to reproduce
//! duplicate and out-of-order delivery.

use super::{EventStream, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

struct ClientSlot {
    tx: mpsc::UnboundedSender<TransportEvent>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, ClientSlot>,
    next_client_id: u64,
    /// Every accepted publish, in order: (topic, payload).
    published: Vec<(String, Vec<u8>)>,
}

/// Shared in-memory broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client transport attached to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: Mutex::new(None),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Deliver a payload to every subscriber of `topic` without recording it
    /// as a client publish.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        let state = self.state.lock();
        fan_out(&state, topic, payload)
    }

    /// All payloads clients have published on `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn connected_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    fn register(&self) -> (u64, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        let mut state = self.state.lock();
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.insert(
            id,
            ClientSlot {
                tx,
                topics: HashSet::new(),
            },
        );
        (id, rx)
    }

    fn unregister(&self, id: u64, reason: Option<&str>) {
        let slot = self.state.lock().clients.remove(&id);
        if let (Some(slot), Some(reason)) = (slot, reason) {
            let _ = slot.tx.send(TransportEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    fn add_subscription(&self, id: u64, topic: &str) -> bool {
        match self.state.lock().clients.get_mut(&id) {
            Some(slot) => {
                slot.topics.insert(topic.to_string());
                true
            }
            None => false,
        }
    }

    fn publish_from(&self, topic: &str, payload: &[u8]) -> usize {
        let mut state = self.state.lock();
        state.published.push((topic.to_string(), payload.to_vec()));
        fan_out(&state, topic, payload)
    }
}

fn fan_out(state: &BrokerState, topic: &str, payload: &[u8]) -> usize {
    let mut delivered = 0;
    for slot in state.clients.values() {
        if !slot.topics.contains(topic) {
            continue;
        }
        let event = TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        if slot.tx.send(event).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

#[derive(Default)]
struct Faults {
    refuse_connects: u32,
    fail_publishes: u32,
}

/// One client's connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: Mutex<Option<u64>>,
    faults: Mutex<Faults>,
}

impl MemoryTransport {
    /// Refuse the next `n` connect attempts.
    pub fn refuse_next_connects(&self, n: u32) {
        self.faults.lock().refuse_connects = n;
    }

    /// Fail the next `n` publish attempts.
    pub fn fail_next_publishes(&self, n: u32) {
        self.faults.lock().fail_publishes = n;
    }

    /// Drop the link as if the network went away. The event stream receives
    /// `ConnectionLost` and then closes.
    pub fn sever(&self) {
        if let Some(id) = self.client_id.lock().take() {
            self.broker.unregister(id, Some("link severed"));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client_id.lock().is_some()
    }

    fn current_id(&self) -> Result<u64, TransportError> {
        self.client_id.lock().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<EventStream, TransportError> {
        {
            let mut faults = self.faults.lock();
            if faults.refuse_connects > 0 {
                faults.refuse_connects -= 1;
                return Err(TransportError::Connect("broker refused connection".into()));
            }
        }

        let mut client_id = self.client_id.lock();
        if let Some(old) = client_id.take() {
            self.broker.unregister(old, None);
        }
        let (id, rx) = self.broker.register();
        *client_id = Some(id);
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let id = self.current_id()?;
        if self.broker.add_subscription(id, topic) {
            Ok(())
        } else {
            Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "client not registered".into(),
            })
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.current_id()?;
        {
            let mut faults = self.faults.lock();
            if faults.fail_publishes > 0 {
                faults.fail_publishes -= 1;
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    reason: "injected publish failure".into(),
                });
            }
        }
        self.broker.publish_from(topic, &payload);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(id) = self.client_id.lock().take() {
            self.broker.unregister(id, None);
        }
    }
}
