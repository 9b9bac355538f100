//! Log of local approvals that were published but whose echo has not come
//! back through the broker yet.
//!
//! A transport may report a publish as accepted once it is queued locally,
//! so an approval only counts as delivered when the incremented record is
//! seen again on the approval channel. Entries that outlive the pending
//! timeout are re-published once and then rolled back.

use crate::marker::{Marker, MarkerKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// One approval in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingApproval {
    /// The marker as published (count already incremented).
    pub marker: Marker,
    /// The marker as it was before the local approval.
    pub previous: Marker,
    /// Wall-clock time of the first publish, for display.
    pub requested_at: DateTime<Utc>,
    /// Monotonic time of the latest publish; staleness is measured from here.
    pub published_at: Instant,
    /// Whether the approval was already re-published after a missing echo.
    pub republished: bool,
}

#[derive(Debug, Default)]
pub struct PendingApprovals {
    entries: HashMap<MarkerKey, PendingApproval>,
}

impl PendingApprovals {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly published approval of `previous`, replacing any
    /// earlier entry for the same marker.
    pub fn record(&mut self, previous: Marker, outgoing: Marker) {
        self.record_at(previous, outgoing, Instant::now());
    }

    /// [`record`](Self::record) with an explicit publish time.
    pub fn record_at(&mut self, previous: Marker, outgoing: Marker, published_at: Instant) {
        self.entries.insert(
            outgoing.key(),
            PendingApproval {
                marker: outgoing,
                previous,
                requested_at: Utc::now(),
                published_at,
                republished: false,
            },
        );
    }

    /// Put a drained entry back after re-publishing it. Its age restarts at
    /// `now` and it will not be re-published again. No-op when the key is
    /// already tracked.
    pub fn requeue(&mut self, mut entry: PendingApproval, now: Instant) {
        entry.published_at = now;
        entry.republished = true;
        // A newer local approval recorded meanwhile takes precedence.
        self.entries.entry(entry.marker.key()).or_insert(entry);
    }

    /// An approval event arrived. Clears the pending entry for its key when
    /// the event carries at least the count we published.
    pub fn confirm(&mut self, incoming: &Marker) -> Option<PendingApproval> {
        let key = incoming.key();
        match self.entries.get(&key) {
            Some(p) if incoming.approve_count >= p.marker.approve_count => self.entries.remove(&key),
            _ => None,
        }
    }

    /// Forget the entry for `key`, e.g. after its publish failed outright.
    pub fn cancel(&mut self, key: &MarkerKey) -> Option<PendingApproval> {
        self.entries.remove(key)
    }

    /// Remove and return entries whose latest publish is at least `max_age`
    /// old at `now`.
    pub fn drain_stale(&mut self, now: Instant, max_age: Duration) -> Vec<PendingApproval> {
        let stale: Vec<MarkerKey> = self
            .entries
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.published_at) >= max_age)
            .map(|(k, _)| k.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    /// Snapshot of every entry, oldest publish first.
    pub fn list(&self) -> Vec<PendingApproval> {
        let mut all: Vec<PendingApproval> = self.entries.values().cloned().collect();
        all.sort_by_key(|p| p.published_at);
        all
    }

    /// Number of approvals still awaiting their echo.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
