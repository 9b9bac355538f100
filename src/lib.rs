//! Crowd-sourced road marker synchronization over a publish/subscribe broker.
//!
//! Clients announce markers (hazards, road works, safe spots) on one channel
//! and approvals on another. Every client applies both streams to its local
//! [`MarkerStore`] keyed by marker identity; see [`sync`] for the
//! reconciliation rules.

pub mod codec;
pub mod config;
pub mod marker;
pub mod metrics;
pub mod position;
pub mod presentation;
pub mod store;
pub mod sync;
pub mod transport;

pub use codec::DecodeError;
pub use config::Config;
pub use marker::{Marker, MarkerKey, MarkerType};
pub use store::{ApplyOutcome, MarkerStore, ReconcilePolicy, StoreEvent};
pub use sync::{ApprovalOutcome, ConnectionState, SyncEngine, SyncError};
pub use transport::{Transport, TransportError, TransportEvent};
