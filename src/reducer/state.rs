//! Application state owned by the reducer.

use std::collections::{BTreeSet, HashMap};

use crate::ble::types::{DeviceId, DiscoveredDevice, RadioState, ServiceDescriptor};
use crate::error::Error;
use crate::session::OperationId;

/// Connection state of a device once a connect intent has been issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the device.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// The device holding the single connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Connection {
    /// The device.
    pub device: DeviceId,
    /// Where the link is in its lifecycle.
    pub state: ConnectionState,
    /// The accepted connect request, until it resolves.
    pub operation: Option<OperationId>,
}

/// Result of service discovery on the connected device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServiceDiscoveryState {
    /// No discovery requested since connecting.
    #[default]
    NotRequested,
    /// Waiting for the radio. Carries the accepted request once the session
    /// has issued it; only that request's result is taken.
    InProgress(Option<OperationId>),
    /// Services, in the order the radio returned them.
    Completed(Vec<ServiceDescriptor>),
    /// Discovery failed.
    Failed(Error),
}

impl ServiceDiscoveryState {
    /// Check if a discovery is outstanding.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress(_))
    }
}

/// Advertising status of the peripheral-manager role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdvertisingStatus {
    /// Not advertising.
    #[default]
    Idle,
    /// Start requested.
    Starting,
    /// Advertising.
    Advertising,
}

/// A remote central's discovery of our services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDiscovery {
    /// The remote central.
    pub central: DeviceId,
    /// Set if the discovery failed.
    pub error: Option<Error>,
}

/// State of the advertiser role.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertiserState {
    /// Radio state as seen by the peripheral manager.
    pub radio: RadioState,
    /// Advertising status.
    pub status: AdvertisingStatus,
    /// The accepted advertising start, while `Starting`.
    pub operation: Option<OperationId>,
    /// Remote centrals currently connected.
    pub connected_centrals: BTreeSet<DeviceId>,
    /// Most recent remote discovery of our services.
    pub last_remote_discovery: Option<RemoteDiscovery>,
}

/// Snapshot of everything the presentation layer can observe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppState {
    /// Whether the view has appeared and sessions are up.
    pub is_active: bool,
    /// Radio state as seen by the central.
    pub radio: RadioState,
    /// Whether a scan is running.
    pub is_scanning: bool,
    /// Scan epoch the central session confirmed for the running scan.
    /// `None` until the confirmation arrives; sightings are taken only from
    /// this epoch.
    pub scan_epoch: Option<u64>,
    /// Devices seen during the current scan, keyed by id.
    pub discovered: HashMap<DeviceId, DiscoveredDevice>,
    /// The single connection slot.
    pub connection: Option<Connection>,
    /// Service discovery on the connected device.
    pub service_discovery: ServiceDiscoveryState,
    /// Most recent asynchronous failure.
    pub last_error: Option<Error>,
    /// Advertiser role.
    pub advertiser: AdvertiserState,
}

impl AppState {
    /// Check if the radio permits scanning and connecting.
    pub fn is_radio_ready(&self) -> bool {
        self.radio.is_powered_on()
    }

    /// Check if a connect request is outstanding.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self.connection,
            Some(Connection {
                state: ConnectionState::Connecting,
                ..
            })
        )
    }

    /// Connection state of a particular device.
    pub fn connection_state(&self, device: &DeviceId) -> ConnectionState {
        match &self.connection {
            Some(c) if &c.device == device => c.state,
            _ => ConnectionState::Disconnected,
        }
    }

    /// The connected device, if the link is up.
    pub fn connected_device(&self) -> Option<DeviceId> {
        self.connection
            .filter(|c| c.state.is_connected())
            .map(|c| c.device)
    }

    /// Discovered devices sorted by signal strength (strongest first).
    pub fn devices_by_signal(&self) -> Vec<&DiscoveredDevice> {
        let mut devices: Vec<_> = self.discovered.values().collect();
        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi));
        devices
    }
}
