//! Marker synchronization over a publish/subscribe broker.
//!
//! Every client subscribes to two topics: new-marker announcements and
//! approval announcements. Both carry a full marker record and are applied
//! to the [`MarkerStore`](crate::store::MarkerStore) by identity key, so the
//! broker's lack of ordering and deduplication only matters when two
//! approvals for the same marker race.
//!
//! - [`SyncEngine`]: connection lifecycle, inbound dispatch, approvals
//! - [`PendingApprovals`]: approvals published but not yet echoed back
//! - [`DedupWindow`]: optional duplicate-delivery filter
//! - [`Backoff`]: reconnect pacing

pub mod backoff;
pub mod dedup;
pub mod engine;
pub mod pending;

pub use backoff::Backoff;
pub use dedup::DedupWindow;
pub use engine::{ApprovalOutcome, StaleApprovals, SyncEngine};
pub use pending::{PendingApproval, PendingApprovals};

use crate::transport::TransportError;

/// Per-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] TransportError),

    #[error("gave up connecting after {attempts} attempts: {last}")]
    GaveUp {
        attempts: u32,
        #[source]
        last: TransportError,
    },
}
