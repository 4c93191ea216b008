//! # ble-session
//!
//! Event-driven Bluetooth Low Energy session management: scanning,
//! connecting and service discovery behind a pure reducer.
//!
//! The radio stack is reached only through the [`HardwareAdapter`] and
//! [`PeripheralManagerAdapter`] traits. Each BLE role is driven by a session
//! manager that turns adapter callbacks into an ordered event stream, and a
//! [`Store`] folds those events together with user [`Intent`]s into one
//! consistent [`AppState`].
//!
//! ## Features
//!
//! - **Scanning**: Radio-state aware scanning with per-scan device maps
//! - **Connecting**: Single connection slot with timeout and cancellation
//! - **Service Discovery**: Exactly one result per accepted request
//! - **Advertising**: The peripheral-manager role in the same process
//! - **Deterministic Testing**: An in-memory radio that replays any interleaving
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_session::{Intent, Store, StoreConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Open the first Bluetooth adapter and bring the sessions up
//!     let store = Store::with_btleplug(StoreConfig::default()).await?;
//!     store.send(Intent::Appear)?;
//!     store.wait_until(|state| state.is_radio_ready()).await;
//!
//!     // Scan for a few seconds
//!     store.send(Intent::StartScan)?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     for device in store.state().devices_by_signal() {
//!         println!("{} {:?} ({} dBm)", device.id, device.name, device.rssi);
//!     }
//!
//!     store.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data and config types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod reducer;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use config::StoreConfig;
pub use error::{Error, HardwareError, Result};
pub use store::{Rejection, Store};

// Re-export commonly used types from submodules
pub use ble::{
    AdvertisementData, AdvertisingParameters, BtleplugAdapter, ConnectOptions, DeviceId,
    DiscoveredDevice, HardwareAdapter, PeripheralManagerAdapter, RadioState, ServiceDescriptor,
    ServiceFilter, SimulatedAdapter,
};
pub use reducer::{
    reduce, Action, AdvertisingStatus, AppState, Command, ConnectionState, Intent, Reduced,
    ServiceDiscoveryState,
};
pub use session::{
    CentralEvent, CentralSession, EventStream, OperationId, PeripheralEvent, PeripheralManagerEvent,
    PeripheralManagerSession, PeripheralSession, PendingOperation, SessionId, SessionRegistry,
};
