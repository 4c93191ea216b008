//! BLE radio abstraction.
//!
//! This module defines the capability interface the session layer drives,
//! the plain data types that cross it, and two implementations: one over
//! `btleplug` for real hardware and one in memory for tests and demos.

pub mod adapter;
pub mod btleplug;
pub mod simulated;
pub mod types;

pub use adapter::{
    CallbackSink, CentralCallback, HardwareAdapter, PeripheralCallback, PeripheralManagerAdapter,
    PeripheralManagerCallback,
};
pub use self::btleplug::BtleplugAdapter;
pub use simulated::{Request, SimulatedAdapter};
pub use types::{
    AdvertisementData, AdvertisingParameters, ConnectOptions, DeviceId, DiscoveredDevice,
    RadioState, ServiceDescriptor, ServiceFilter,
};
