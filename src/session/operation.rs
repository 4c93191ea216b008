//! Handles for requests whose completion is reported as an event.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ble::types::DeviceId;
use crate::session::registry::SessionId;

/// Identifier tying a completion event back to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperationId(u64);

impl OperationId {
    /// Raw counter value.
    pub fn get(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// What a pending operation is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// A connect request; resolved by `Connected` or `Disconnected`.
    Connect(DeviceId),
    /// A service discovery; resolved by `ServicesDiscovered` or `ServicesDiscoveryFailed`.
    DiscoverServices,
    /// Advertising start; resolved by `AdvertisingStarted`.
    StartAdvertising,
    /// Service publication; resolved by `ServiceAdded`.
    AddService,
}

/// An accepted request whose outcome will arrive exactly once on the
/// session's event stream, tagged with [`PendingOperation::id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    id: OperationId,
    session: SessionId,
    kind: OperationKind,
}

impl PendingOperation {
    /// The operation identifier carried by the completion event.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The session the operation was issued on.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// What the operation is waiting for.
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }
}

/// Source of operation ids.
///
/// Ids are unique among the session managers sharing one counter; a
/// [`Store`](crate::store::Store) hands the same counter to every role.
#[derive(Debug, Default)]
pub struct OperationCounter(AtomicU64);

impl OperationCounter {
    /// Create a counter starting at `op#1`.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next(&self, session: &SessionId, kind: OperationKind) -> PendingOperation {
        PendingOperation {
            id: OperationId(self.0.fetch_add(1, Ordering::SeqCst) + 1),
            session: session.clone(),
            kind,
        }
    }
}
