//! In-process marker store, the single source of truth the presentation
//! layer renders from.
//!
//! All mutations go through one `parking_lot::Mutex`, so the
//! check-then-write of the reconciliation policy is atomic even when the
//! inbound pump and a user approval race on the same key. Observers get a
//! [`StoreEvent`] stream to drive re-rendering.

use crate::marker::{Marker, MarkerKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Capacity of the observer channel. Slow observers see `Lagged` and should
/// re-read [`MarkerStore::list`].
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How an incoming marker is merged with the entry already held for its key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// The most recently applied event replaces the stored entry, whatever
    /// its count. Concurrent approvals can lose an increment.
    #[default]
    LastWriteWins,
    /// Keep whichever entry carries the higher approval count.
    MaxApprovals,
}

/// Change notification for store observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Upserted(Marker),
    Removed(Marker),
}

/// Result of applying one marker under a [`ReconcilePolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// No entry existed for the key.
    Inserted,
    /// The stored entry was replaced; carries the previous value.
    Replaced(Marker),
    /// The policy kept the stored entry.
    Kept,
}

/// Authoritative mapping from identity key to marker.
pub struct MarkerStore {
    markers: Mutex<HashMap<MarkerKey, Marker>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MarkerStore {
    /// An empty store with its own observer channel.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            markers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Insert or replace the marker at its identity key. Never fails.
    pub fn upsert(&self, marker: Marker) -> Option<Marker> {
        match self.apply(marker, ReconcilePolicy::LastWriteWins) {
            ApplyOutcome::Replaced(previous) => Some(previous),
            ApplyOutcome::Inserted | ApplyOutcome::Kept => None,
        }
    }

    /// Merge `marker` into the store under `policy`, atomically.
    pub fn apply(&self, marker: Marker, policy: ReconcilePolicy) -> ApplyOutcome {
        let key = marker.key();
        let outcome = {
            let mut markers = self.markers.lock();
            match markers.get(&key) {
                Some(existing)
                    if policy == ReconcilePolicy::MaxApprovals
                        && existing.approve_count >= marker.approve_count =>
                {
                    ApplyOutcome::Kept
                }
                _ => match markers.insert(key, marker.clone()) {
                    Some(previous) => ApplyOutcome::Replaced(previous),
                    None => ApplyOutcome::Inserted,
                },
            }
        };

        if outcome != ApplyOutcome::Kept {
            // No receivers is fine; nobody is rendering yet.
            let _ = self.events.send(StoreEvent::Upserted(marker));
        }
        outcome
    }

    /// Insert `marker` only when its key is vacant. Returns whether it was
    /// inserted.
    pub fn insert_if_absent(&self, marker: Marker) -> bool {
        let inserted = {
            let mut markers = self.markers.lock();
            let key = marker.key();
            if markers.contains_key(&key) {
                false
            } else {
                markers.insert(key, marker.clone());
                true
            }
        };
        if inserted {
            let _ = self.events.send(StoreEvent::Upserted(marker));
        }
        inserted
    }

    /// Remove the entry sharing `marker`'s identity. No-op when absent.
    pub fn remove(&self, marker: &Marker) -> Option<Marker> {
        self.remove_key(&marker.key())
    }

    /// Remove by identity key, notifying observers when an entry existed.
    pub fn remove_key(&self, key: &MarkerKey) -> Option<Marker> {
        let removed = self.markers.lock().remove(key);
        if let Some(ref marker) = removed {
            let _ = self.events.send(StoreEvent::Removed(marker.clone()));
        }
        removed
    }

    /// Clone of the marker held for `key`.
    pub fn get(&self, key: &MarkerKey) -> Option<Marker> {
        self.markers.lock().get(key).cloned()
    }

    /// Whether a marker with the same identity is held, whatever its count.
    pub fn contains(&self, marker: &Marker) -> bool {
        self.markers.lock().contains_key(&marker.key())
    }

    /// Snapshot of every live marker, sorted by address then key so repeated
    /// renders are stable. Safe to iterate while the store keeps changing.
    pub fn list(&self) -> Vec<Marker> {
        let mut snapshot: Vec<(MarkerKey, Marker)> = self
            .markers
            .lock()
            .iter()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect();
        snapshot.sort_by(|(ka, a), (kb, b)| a.address.cmp(&b.address).then_with(|| ka.cmp(kb)));
        snapshot.into_iter().map(|(_, m)| m).collect()
    }

    /// Number of live markers.
    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }

    /// Drop every marker, notifying observers for each.
    pub fn clear(&self) {
        let drained: Vec<Marker> = self.markers.lock().drain().map(|(_, m)| m).collect();
        for marker in drained {
            let _ = self.events.send(StoreEvent::Removed(marker));
        }
    }
}

impl Default for MarkerStore {
    fn default() -> Self {
        Self::new()
    }
}
