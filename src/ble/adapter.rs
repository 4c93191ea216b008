//! Capability interfaces for the radio stack.
//!
//! The core never talks to a BLE driver directly. It issues requests through
//! [`HardwareAdapter`] (central role) and [`PeripheralManagerAdapter`]
//! (advertiser role) and learns about results through callback sinks it
//! installs on the adapter. Every request returns immediately; completion is
//! only ever reported through a callback.

use std::sync::Arc;

use crate::ble::types::{
    AdvertisementData, AdvertisingParameters, ConnectOptions, DeviceId, RadioState,
    ServiceDescriptor, ServiceFilter,
};
use crate::error::{Error, Result};

/// Callback installed on an adapter. May be invoked from any thread.
pub type CallbackSink<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Raw callbacks raised by the central role of the radio stack.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralCallback {
    /// The radio power state changed.
    StateChanged(RadioState),
    /// A scan that was started could not be kept running.
    ScanFailed(Error),
    /// An advertisement was observed.
    Advertisement {
        /// The advertising device.
        device: DeviceId,
        /// Advertised or cached local name.
        name: Option<String>,
        /// Advertisement contents.
        data: AdvertisementData,
        /// Received signal strength in dBm.
        rssi: i16,
    },
    /// A link to the device was established.
    Connected(DeviceId),
    /// A connect request could not be completed.
    ConnectFailed {
        /// The device that was being connected.
        device: DeviceId,
        /// Why the connection failed.
        error: Error,
    },
    /// The link to the device went down.
    Disconnected {
        /// The device that disconnected.
        device: DeviceId,
        /// Set when the link was lost rather than closed on request.
        error: Option<Error>,
    },
}

/// Raw callbacks scoped to one connected device.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralCallback {
    /// A service discovery request finished.
    ServicesDiscovered(std::result::Result<Vec<ServiceDescriptor>, Error>),
}

/// Raw callbacks raised by the advertiser role of the radio stack.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralManagerCallback {
    /// The radio power state changed.
    StateChanged(RadioState),
    /// Advertising started, or failed to.
    AdvertisingStarted(Option<Error>),
    /// A service was published, or failed to be.
    ServiceAdded {
        /// The service that was added.
        service: ServiceDescriptor,
        /// Set if publishing failed.
        error: Option<Error>,
    },
    /// A remote central connected to us.
    CentralConnected(DeviceId),
    /// A remote central went away.
    CentralDisconnected(DeviceId),
    /// A remote central finished discovering our services.
    ServicesDiscoveredByRemote {
        /// The remote central.
        central: DeviceId,
        /// Set if the remote discovery failed.
        error: Option<Error>,
    },
}

/// Central-role capability of the radio stack.
///
/// Requests return `Err` only when they cannot even be issued; everything
/// else is reported through the installed delegates.
#[cfg_attr(test, mockall::automock)]
pub trait HardwareAdapter: Send + Sync {
    /// Current power state.
    fn power_state(&self) -> RadioState;

    /// Install (or, with `None`, remove) the central-role delegate.
    fn set_central_delegate(&self, sink: Option<CallbackSink<CentralCallback>>);

    /// Begin scanning for advertisements.
    fn start_scan(&self, filter: &ServiceFilter) -> Result<()>;

    /// Stop scanning.
    fn stop_scan(&self) -> Result<()>;

    /// Request a link to a device.
    fn connect(&self, device: &DeviceId, options: &ConnectOptions) -> Result<()>;

    /// Tear down a link, or abandon a pending connect.
    fn cancel_connection(&self, device: &DeviceId) -> Result<()>;

    /// Install (or remove) the delegate scoped to one device.
    fn set_peripheral_delegate(
        &self,
        device: &DeviceId,
        sink: Option<CallbackSink<PeripheralCallback>>,
    );

    /// Discover services on a connected device.
    fn discover_services(&self, device: &DeviceId, filter: &ServiceFilter) -> Result<()>;
}

/// Advertiser-role capability of the radio stack.
#[cfg_attr(test, mockall::automock)]
pub trait PeripheralManagerAdapter: Send + Sync {
    /// Current power state.
    fn power_state(&self) -> RadioState;

    /// Install (or remove) the peripheral-manager delegate.
    fn set_delegate(&self, sink: Option<CallbackSink<PeripheralManagerCallback>>);

    /// Publish a service so remote centrals can discover it.
    fn add_service(&self, service: &ServiceDescriptor) -> Result<()>;

    /// Begin advertising.
    fn start_advertising(&self, parameters: &AdvertisingParameters) -> Result<()>;

    /// Stop advertising.
    fn stop_advertising(&self) -> Result<()>;
}
