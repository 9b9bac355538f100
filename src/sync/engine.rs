//! Sync engine. Reconciles the marker store against the broker's event
//! stream and drives the approval workflow.
//!
//! ## Responsibilities
//!
//! - Connect (optionally with backoff), subscribe to both channels, and pump
//!   inbound events on a tokio task
//! - Decode inbound payloads and apply them to the store under the
//!   configured [`ReconcilePolicy`]; malformed payloads are logged and dropped
//! - Local approvals: remove the marker immediately, publish the incremented
//!   record, roll back if the broker never takes it
//! - Track approvals awaiting their echo; re-publish the ones that never
//!   come back, then roll them back if the echo is still missing
//!
//! The store is the only synchronization point; the engine never holds a
//! lock across a suspension point.

use super::{Backoff, ConnectionState, DedupWindow, PendingApproval, PendingApprovals, SyncError};
use crate::codec::{self, DecodeError};
use crate::config::{SyncConfig, TopicConfig};
use crate::marker::Marker;
use crate::metrics::SyncMetrics;
use crate::store::{ApplyOutcome, MarkerStore, ReconcilePolicy};
use crate::transport::{EventStream, Transport, TransportError, TransportEvent};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What happened to a local approval.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    /// The incremented marker was handed to the broker.
    Published(Marker),
    /// Every publish attempt failed; the original marker was put back.
    RolledBack(Marker),
}

/// Result of one pass over approvals whose echo is overdue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleApprovals {
    /// Re-published and given another pending timeout.
    pub republished: usize,
    /// Given up on; the pre-approval marker was put back if its key was free.
    pub rolled_back: usize,
}

pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    store: Arc<MarkerStore>,
    topics: TopicConfig,
    config: SyncConfig,
    state_tx: watch::Sender<ConnectionState>,
    pending: Mutex<PendingApprovals>,
    dedup: Mutex<DedupWindow>,
    pump: Mutex<Option<JoinHandle<()>>>,
    metrics: SyncMetrics,
}

impl SyncEngine {
    /// Build an engine over `transport`. Nothing is connected until
    /// [`start`](Self::start). Fails only if the metrics registry rejects a counter.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<MarkerStore>,
        topics: TopicConfig,
        config: SyncConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let dedup = DedupWindow::new(
            Duration::from_secs(config.dedup_window_secs),
            config.dedup_capacity,
        );
        Ok(Arc::new(Self {
            transport,
            store,
            topics,
            config,
            state_tx,
            pending: Mutex::new(PendingApprovals::new()),
            dedup: Mutex::new(dedup),
            pump: Mutex::new(None),
            metrics: SyncMetrics::new()?,
        }))
    }

    /// The store this engine reconciles into.
    pub fn store(&self) -> &Arc<MarkerStore> {
        &self.store
    }

    /// Channel names in use.
    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    /// Reconcile policy applied to every inbound event.
    pub fn policy(&self) -> ReconcilePolicy {
        self.config.policy
    }

    /// Counters for this engine's sync path.
    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connectivity flag for the presentation layer.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Approvals published but not yet echoed back, oldest first.
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.pending.lock().list()
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Connect and subscribe to both channels. On failure the engine stays
    /// `Disconnected` and the caller may retry.
    ///
    /// Calling `start` while connected is a no-op. While another attempt is
    /// in flight it waits for that attempt: success is shared, a failure
    /// makes this call try on its own.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        loop {
            let claimed = self.state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Disconnected {
                    *state = ConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if claimed {
                break;
            }

            let mut state = self.state_tx.subscribe();
            let settled = state
                .wait_for(|s| *s != ConnectionState::Connecting)
                .await
                .map(|s| *s);
            match settled {
                Ok(ConnectionState::Connected) => {
                    tracing::debug!("Sync engine already connected");
                    return Ok(());
                }
                Ok(_) => tracing::debug!("Concurrent connect attempt failed; retrying"),
                // The sender lives in `self`; a closed channel means no session.
                Err(_) => return Err(TransportError::NotConnected.into()),
            }
        }

        tracing::info!(transport = self.transport.name(), "Sync engine connecting");

        let events = match self.connect_and_subscribe().await {
            Ok(events) => events,
            Err(e) => {
                self.metrics.connect_failures.inc();
                self.state_tx.send_replace(ConnectionState::Disconnected);
                tracing::warn!(transport = self.transport.name(), "Sync engine connect failed: {e}");
                return Err(e);
            }
        };

        self.state_tx.send_replace(ConnectionState::Connected);
        tracing::info!(
            new_marker = %self.topics.new_marker,
            approval = %self.topics.approval,
            "Sync engine connected and subscribed"
        );

        let sweep_every = Duration::from_secs((self.config.pending_timeout_secs / 2).max(1));
        let handle = tokio::spawn(Self::pump(Arc::downgrade(self), events, sweep_every));
        if let Some(old) = self.pump.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn connect_and_subscribe(&self) -> Result<EventStream, SyncError> {
        let events = self.transport.connect().await?;
        for topic in [&self.topics.new_marker, &self.topics.approval] {
            if let Err(e) = self.transport.subscribe(topic).await {
                self.transport.disconnect().await;
                return Err(e.into());
            }
        }
        Ok(events)
    }

    /// [`start`](Self::start) with exponential backoff between attempts.
    pub async fn start_with_backoff(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut backoff = Backoff::new(&self.config.backoff);
        loop {
            let err = match self.start().await {
                Ok(()) => return Ok(()),
                Err(SyncError::Connection(e)) => e,
                Err(other) => return Err(other),
            };
            match backoff.next_delay() {
                Some(delay) => {
                    tracing::info!(
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying broker connection"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(SyncError::GaveUp {
                        attempts: backoff.failures(),
                        last: err,
                    })
                }
            }
        }
    }

    /// Stop pumping events and close the session. Markers are kept.
    pub async fn stop(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.transport.disconnect().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!(markers = self.store.len(), "Sync engine stopped");
    }

    async fn pump(engine: Weak<Self>, mut events: EventStream, sweep_every: Duration) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(engine) = engine.upgrade() else { return };
                    match event {
                        Some(TransportEvent::Message { topic, payload }) => {
                            engine.handle_message(&topic, &payload);
                        }
                        Some(TransportEvent::Connected) => {
                            tracing::debug!("Transport session acknowledged");
                        }
                        Some(TransportEvent::ConnectionLost { reason }) => {
                            engine.on_connection_lost(&reason);
                            return;
                        }
                        None => {
                            engine.on_connection_lost("event stream closed");
                            return;
                        }
                    }
                }
                _ = sweep.tick() => {
                    let Some(engine) = engine.upgrade() else { return };
                    engine.run_maintenance().await;
                }
            }
        }
    }

    fn on_connection_lost(&self, reason: &str) {
        self.pump.lock().take();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::warn!(
            reason,
            markers = self.store.len(),
            "Broker connection lost; keeping local markers"
        );
    }

    async fn run_maintenance(&self) {
        let stale = self.reconcile_stale_approvals().await;
        let expired = self.dedup.lock().sweep_expired();
        if stale != StaleApprovals::default() || expired > 0 {
            tracing::debug!(
                republished = stale.republished,
                rolled_back = stale.rolled_back,
                expired,
                "Sync maintenance pass"
            );
        }
    }

    // ── Inbound ─────────────────────────────────────────────────

    /// Route one inbound payload by topic. Failures are logged and dropped;
    /// returns the store outcome when the event was applied.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Option<ApplyOutcome> {
        if self.dedup.lock().check_and_record(topic, payload) {
            self.metrics.duplicates_dropped.inc();
            tracing::debug!(topic, "Dropped duplicate delivery");
            return None;
        }

        let result = if topic == self.topics.new_marker {
            self.on_new_marker_event(payload)
        } else if topic == self.topics.approval {
            self.on_approval_event(payload)
        } else {
            tracing::debug!(topic, "Ignoring message on unknown topic");
            return None;
        };

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.metrics.decode_failures.inc();
                tracing::warn!(topic, bytes = payload.len(), "Dropping undecodable marker event: {e}");
                None
            }
        }
    }

    /// A marker was announced. Its approval count is taken as published.
    pub fn on_new_marker_event(&self, payload: &[u8]) -> Result<ApplyOutcome, DecodeError> {
        let marker = codec::decode(payload)?;
        tracing::debug!(
            key = marker.key().short(),
            kind = %marker.kind,
            lat = marker.latitude,
            lon = marker.longitude,
            "New marker event"
        );
        let outcome = self.store.apply(marker, self.config.policy);
        self.metrics
            .events_applied
            .with_label_values(&["new_marker"])
            .inc();
        Ok(outcome)
    }

    /// A marker was approved somewhere, possibly by us.
    pub fn on_approval_event(&self, payload: &[u8]) -> Result<ApplyOutcome, DecodeError> {
        let marker = codec::decode(payload)?;
        tracing::debug!(
            key = marker.key().short(),
            kind = %marker.kind,
            lat = marker.latitude,
            lon = marker.longitude,
            count = marker.approve_count,
            "Approval event"
        );
        if let Some(confirmed) = self.pending.lock().confirm(&marker) {
            tracing::debug!(
                key = marker.key().short(),
                published = confirmed.marker.approve_count,
                "Local approval echoed back"
            );
        }
        let outcome = self.store.apply(marker, self.config.policy);
        self.metrics
            .events_applied
            .with_label_values(&["approval"])
            .inc();
        Ok(outcome)
    }

    // ── Outbound ────────────────────────────────────────────────

    /// Approve `marker` on behalf of the local user.
    ///
    /// The marker leaves the store before the first suspension point. The
    /// incremented record is published on the approval channel with
    /// `publish_retries` extra attempts; if none succeeds the removed entry
    /// is restored unless something newer took its key meanwhile. A published
    /// approval stays pending until its echo arrives, see
    /// [`reconcile_stale_approvals`](Self::reconcile_stale_approvals).
    pub async fn approve(&self, marker: &Marker) -> ApprovalOutcome {
        let removed = self.store.remove(marker);
        let outgoing = marker.approved();
        let key = outgoing.key();
        self.pending.lock().record(marker.clone(), outgoing.clone());

        if self.publish_approval(&outgoing).await.is_ok() {
            self.metrics.approvals_published.inc();
            tracing::info!(
                key = key.short(),
                count = outgoing.approve_count,
                "Approval published"
            );
            return ApprovalOutcome::Published(outgoing);
        }

        self.pending.lock().cancel(&key);
        self.metrics.approvals_rolled_back.inc();
        match removed {
            Some(original) if self.store.insert_if_absent(original.clone()) => {
                tracing::warn!(key = key.short(), "Approval rolled back; marker restored");
            }
            Some(_) => {
                tracing::warn!(key = key.short(), "Approval rolled back; newer entry already present");
            }
            None => {
                tracing::warn!(key = key.short(), "Approval rolled back; marker was not in the store");
            }
        }
        ApprovalOutcome::RolledBack(marker.clone())
    }

    /// Publish an approval record with bounded retry. Returns the last error
    /// when every attempt fails.
    async fn publish_approval(&self, outgoing: &Marker) -> Result<(), TransportError> {
        let key = outgoing.key();
        let payload = codec::encode(outgoing);
        let attempts = self.config.publish_retries.saturating_add(1);
        let retry_delay = Duration::from_millis(self.config.publish_retry_delay_ms);

        let mut attempt = 1;
        loop {
            match self
                .transport
                .publish(&self.topics.approval, payload.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    tracing::warn!(key = key.short(), attempt, attempts, "Approval publish failed: {e}");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(key = key.short(), attempt, attempts, "Approval publish failed: {e}");
                    if !retry_delay.is_zero() {
                        tokio::time::sleep(retry_delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Announce a new marker on the new-marker channel. The local store picks
    /// it up when the broker echoes it back.
    pub async fn announce(&self, marker: &Marker) -> Result<(), SyncError> {
        self.transport
            .publish(&self.topics.new_marker, codec::encode(marker))
            .await?;
        tracing::info!(
            key = marker.key().short(),
            kind = %marker.kind,
            "Marker announced"
        );
        Ok(())
    }

    /// Handle approvals whose echo has not arrived within
    /// `pending_timeout_secs`.
    ///
    /// A transport may accept a publish it never delivers, so an overdue
    /// approval is re-published once and given another timeout. When the
    /// re-publish fails, or the echo is still missing after it, the approval
    /// is abandoned and the pre-approval marker is put back if its key is
    /// still free. A late echo later overwrites it as usual.
    pub async fn reconcile_stale_approvals(&self) -> StaleApprovals {
        let max_age = Duration::from_secs(self.config.pending_timeout_secs);
        let stale = self.pending.lock().drain_stale(Instant::now(), max_age);

        let mut report = StaleApprovals::default();
        for entry in stale {
            let key = entry.marker.key();
            if !entry.republished {
                match self.publish_approval(&entry.marker).await {
                    Ok(()) => {
                        self.metrics.approvals_republished.inc();
                        tracing::info!(
                            key = key.short(),
                            count = entry.marker.approve_count,
                            "Approval echo overdue; re-published"
                        );
                        self.pending.lock().requeue(entry, Instant::now());
                        report.republished += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(key = key.short(), "Re-publishing overdue approval failed: {e}");
                    }
                }
            }

            self.metrics.approvals_rolled_back.inc();
            report.rolled_back += 1;
            if self.store.insert_if_absent(entry.previous.clone()) {
                tracing::warn!(
                    key = key.short(),
                    count = entry.previous.approve_count,
                    "Approval never confirmed; restored pre-approval marker"
                );
            } else {
                tracing::info!(key = key.short(), "Approval never confirmed; newer entry already present");
            }
        }
        report
    }
}
