//! Plain data types shared by the adapters, sessions and reducer.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Power/authorization state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// State not yet reported by the radio stack.
    #[default]
    Unknown,
    /// The radio stack is restarting.
    Resetting,
    /// This platform has no BLE support.
    Unsupported,
    /// The application is not allowed to use the radio.
    Unauthorized,
    /// The radio is switched off.
    PoweredOff,
    /// The radio is on and ready.
    PoweredOn,
}

impl RadioState {
    /// Check if scanning and connecting are permitted.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Resetting => write!(f, "resetting"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::PoweredOff => write!(f, "poweredOff"),
            Self::PoweredOn => write!(f, "poweredOn"),
        }
    }
}

/// Identifier of a remote device, stable for the lifetime of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Wrap an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Allocate a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for DeviceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Contents of one observed advertisement.
///
/// The payload is kept opaque; the core only stores the most recent one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementData {
    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Bytes>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Bytes>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Advertised transmit power, in dBm.
    pub tx_power_level: Option<i16>,
}

/// A device seen during the current scan, as of its latest advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Device identifier.
    pub id: DeviceId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Most recent advertisement contents.
    pub advertisement: AdvertisementData,
    /// Most recent signal strength in dBm.
    pub rssi: i16,
    /// When the most recent advertisement was observed.
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Fold a newer sighting of the same device into this entry.
    ///
    /// A sighting without a name keeps the previously advertised one.
    pub fn update_from(&mut self, newer: DiscoveredDevice) {
        debug_assert_eq!(self.id, newer.id);
        if newer.name.is_some() {
            self.name = newer.name;
        }
        self.advertisement = newer.advertisement;
        self.rssi = newer.rssi;
        self.last_seen = newer.last_seen;
    }
}

/// Optional restriction to a set of service UUIDs.
///
/// `ServiceFilter::any()` places no restriction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceFilter {
    services: Option<BTreeSet<Uuid>>,
}

impl ServiceFilter {
    /// A filter that matches everything.
    pub fn any() -> Self {
        Self { services: None }
    }

    /// A filter restricted to the given services.
    pub fn only(services: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            services: Some(services.into_iter().collect()),
        }
    }

    /// The service set, or `None` when unrestricted.
    pub fn services(&self) -> Option<&BTreeSet<Uuid>> {
        self.services.as_ref()
    }

    /// Check if this filter places no restriction.
    pub fn is_any(&self) -> bool {
        self.services.is_none()
    }

    /// Check whether an advertisement listing `advertised` passes the filter.
    pub fn matches(&self, advertised: &[Uuid]) -> bool {
        match &self.services {
            None => true,
            Some(wanted) => advertised.iter().any(|uuid| wanted.contains(uuid)),
        }
    }
}

/// One GATT service as reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

impl ServiceDescriptor {
    /// Create a primary service descriptor.
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
        }
    }
}

/// Options passed along with a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectOptions {
    /// Ask the system to alert the user on connection.
    pub notify_on_connection: bool,
    /// Ask the system to alert the user on disconnection.
    pub notify_on_disconnection: bool,
    /// Give up if the link is not established within this duration.
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Default connect timeout (10 seconds).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            notify_on_connection: false,
            notify_on_disconnection: false,
            timeout: Some(Self::DEFAULT_TIMEOUT),
        }
    }
}

/// What the peripheral-manager role advertises.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisingParameters {
    /// Local name placed in the advertisement.
    pub local_name: Option<String>,
    /// Services published before advertising starts.
    pub services: Vec<ServiceDescriptor>,
}
