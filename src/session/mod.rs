//! Hardware session management.
//!
//! Each BLE role is driven through a session manager that shares the same
//! machinery: a [`SessionRegistry`] holding per-session records, a callback
//! sink installed on the adapter, and an [`EventStream`] that reports
//! everything the hardware does.

pub mod central;
pub mod operation;
pub mod peripheral;
pub mod peripheral_manager;
pub mod registry;

pub use central::{CentralEvent, CentralSession, CentralState};
pub use operation::{OperationCounter, OperationId, OperationKind, PendingOperation};
pub use peripheral::{PeripheralEvent, PeripheralSession, PeripheralState};
pub use peripheral_manager::{
    PeripheralManagerEvent, PeripheralManagerSession, PeripheralManagerState,
};
pub use registry::{CallbackHandle, EventSink, EventStream, SessionId, SessionRecord, SessionRegistry};
