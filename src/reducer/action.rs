//! Inputs and outputs of the reducer.

use crate::ble::types::{
    AdvertisingParameters, ConnectOptions, DeviceId, ServiceDescriptor, ServiceFilter,
};
use crate::error::Error;
use crate::session::{
    CentralEvent, PendingOperation, PeripheralEvent, PeripheralManagerEvent, SessionId,
};

/// User actions submitted by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// The view appeared: bring sessions up.
    Appear,
    /// The view disappeared: tear sessions down.
    Disappear,
    /// Start (or restart) scanning.
    StartScan,
    /// Stop scanning.
    StopScan,
    /// Connect to a discovered device.
    Connect(DeviceId),
    /// Drop the current link.
    Disconnect,
    /// Discover services on the connected device.
    DiscoverServices,
    /// Start advertising with the configured parameters.
    StartAdvertising,
    /// Stop advertising.
    StopAdvertising,
}

/// Everything the reducer consumes, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A user intent.
    Intent(Intent),
    /// An event from the central session.
    Central(CentralEvent),
    /// An event from the session bound to `device`.
    Peripheral {
        /// The device the session is bound to.
        device: DeviceId,
        /// The event.
        event: PeripheralEvent,
    },
    /// An event from the peripheral-manager session.
    PeripheralManager(PeripheralManagerEvent),
    /// The central session accepted a `StartScan` command; sightings from
    /// this scan carry `epoch`.
    ScanStarted {
        /// Scan epoch assigned by the session.
        epoch: u64,
    },
    /// A session accepted a command whose outcome arrives later as an event.
    OperationStarted(PendingOperation),
    /// The session layer refused a command the reducer issued.
    CommandFailed {
        /// The command.
        command: Command,
        /// Why it was refused.
        error: Error,
    },
}

impl From<Intent> for Action {
    fn from(intent: Intent) -> Self {
        Self::Intent(intent)
    }
}

/// Instructions for the session layer, produced by the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create the central session.
    CreateCentral {
        /// Session id.
        id: SessionId,
    },
    /// Destroy the central session.
    DestroyCentral {
        /// Session id.
        id: SessionId,
    },
    /// Start scanning.
    StartScan {
        /// Central session id.
        id: SessionId,
        /// Services to scan for.
        filter: ServiceFilter,
    },
    /// Stop scanning.
    StopScan {
        /// Central session id.
        id: SessionId,
    },
    /// Connect to a device.
    Connect {
        /// Central session id.
        id: SessionId,
        /// The device.
        device: DeviceId,
        /// Connect options.
        options: ConnectOptions,
    },
    /// Drop the current link.
    CancelConnection {
        /// Central session id.
        id: SessionId,
    },
    /// Bind a peripheral session to a connected device.
    CreatePeripheral {
        /// Session id.
        id: SessionId,
        /// The device.
        device: DeviceId,
    },
    /// Destroy a peripheral session.
    DestroyPeripheral {
        /// Session id.
        id: SessionId,
    },
    /// Discover services.
    DiscoverServices {
        /// Peripheral session id.
        id: SessionId,
        /// Services to look for.
        filter: ServiceFilter,
    },
    /// Create the peripheral-manager session.
    CreatePeripheralManager {
        /// Session id.
        id: SessionId,
    },
    /// Destroy the peripheral-manager session.
    DestroyPeripheralManager {
        /// Session id.
        id: SessionId,
    },
    /// Publish a service.
    AddService {
        /// Peripheral-manager session id.
        id: SessionId,
        /// The service.
        service: ServiceDescriptor,
    },
    /// Start advertising.
    StartAdvertising {
        /// Peripheral-manager session id.
        id: SessionId,
        /// What to advertise.
        parameters: AdvertisingParameters,
    },
    /// Stop advertising.
    StopAdvertising {
        /// Peripheral-manager session id.
        id: SessionId,
    },
}

/// Output of one reducer step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reduced {
    /// Commands to execute, in order.
    pub commands: Vec<Command>,
    /// Set when the input was an intent that was refused. State is untouched.
    pub rejection: Option<Error>,
}

impl Reduced {
    /// Nothing to do.
    pub fn none() -> Self {
        Self::default()
    }

    /// Execute these commands.
    pub fn commands(commands: Vec<Command>) -> Self {
        Self {
            commands,
            rejection: None,
        }
    }

    /// The intent was refused.
    pub fn reject(error: Error) -> Self {
        Self {
            commands: Vec::new(),
            rejection: Some(error),
        }
    }
}
