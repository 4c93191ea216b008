//! Pure state transitions.
//!
//! [`reduce`] folds one [`Action`] into the [`AppState`] and returns the
//! [`Command`]s the session layer must execute. It never performs I/O and
//! never blocks: everything that touches the radio is described as a command
//! and its outcome comes back later as another action.
//!
//! Intents are validated against the current state before anything is
//! mutated, so a rejected intent leaves the state exactly as it was.

pub mod action;
pub mod state;

pub use action::{Action, Command, Intent, Reduced};
pub use state::{
    AdvertiserState, AdvertisingStatus, AppState, Connection, ConnectionState, RemoteDiscovery,
    ServiceDiscoveryState,
};

use tracing::{debug, trace, warn};

use crate::ble::types::{DeviceId, RadioState};
use crate::config::StoreConfig;
use crate::error::Error;
use crate::session::{
    CentralEvent, OperationKind, PendingOperation, PeripheralEvent, PeripheralManagerEvent,
    SessionId,
};

/// Apply one action to the state.
pub fn reduce(state: &mut AppState, action: Action, config: &StoreConfig) -> Reduced {
    match action {
        Action::Intent(intent) => reduce_intent(state, intent, config),
        Action::Central(event) => reduce_central(state, event, config),
        Action::Peripheral { device, event } => reduce_peripheral(state, device, event),
        Action::PeripheralManager(event) => reduce_peripheral_manager(state, event, config),
        Action::ScanStarted { epoch } => {
            if state.is_scanning {
                debug!("Scan running as epoch {}", epoch);
                state.scan_epoch = Some(epoch);
            } else {
                debug!("Scan epoch {} confirmed after the scan ended, ignoring", epoch);
            }
            Reduced::none()
        }
        Action::OperationStarted(pending) => reduce_operation_started(state, pending),
        Action::CommandFailed { command, error } => reduce_command_failure(state, command, error),
    }
}

fn reduce_intent(state: &mut AppState, intent: Intent, config: &StoreConfig) -> Reduced {
    let central = config.central_session.clone();

    match intent {
        Intent::Appear => {
            if state.is_active {
                debug!("Already active, ignoring appear");
                return Reduced::none();
            }
            state.is_active = true;

            let mut commands = vec![Command::CreateCentral { id: central }];
            if config.advertising.is_some() {
                commands.push(Command::CreatePeripheralManager {
                    id: config.peripheral_manager_session.clone(),
                });
            }
            Reduced::commands(commands)
        }
        Intent::Disappear => {
            if !state.is_active {
                debug!("Not active, ignoring disappear");
                return Reduced::none();
            }

            let mut commands = Vec::new();
            if let Some(connection) = state.connection {
                commands.push(Command::DestroyPeripheral {
                    id: SessionId::peripheral(&connection.device),
                });
            }
            commands.push(Command::DestroyCentral { id: central });
            if config.advertising.is_some() {
                commands.push(Command::DestroyPeripheralManager {
                    id: config.peripheral_manager_session.clone(),
                });
            }

            *state = AppState::default();
            Reduced::commands(commands)
        }
        Intent::StartScan => {
            if !state.is_radio_ready() {
                return reject(Error::RadioNotReady { state: state.radio });
            }

            state.discovered.clear();
            state.scan_epoch = None;
            let mut commands = Vec::with_capacity(2);
            if state.is_scanning {
                debug!("Restarting scan");
                commands.push(Command::StopScan {
                    id: central.clone(),
                });
            }
            commands.push(Command::StartScan {
                id: central,
                filter: config.scan_filter.clone(),
            });
            state.is_scanning = true;
            Reduced::commands(commands)
        }
        Intent::StopScan => {
            if !state.is_scanning {
                debug!("Not scanning, ignoring stop");
                return Reduced::none();
            }
            state.is_scanning = false;
            state.scan_epoch = None;
            Reduced::commands(vec![Command::StopScan { id: central }])
        }
        Intent::Connect(device) => {
            if !state.is_radio_ready() {
                return reject(Error::RadioNotReady { state: state.radio });
            }
            if !state.discovered.contains_key(&device) {
                return reject(Error::UnknownDevice { device });
            }
            if let Some(connection) = state.connection {
                return reject(Error::AlreadyConnecting {
                    device: connection.device,
                });
            }

            state.connection = Some(Connection {
                device,
                state: ConnectionState::Connecting,
                operation: None,
            });
            state.service_discovery = ServiceDiscoveryState::NotRequested;
            Reduced::commands(vec![Command::Connect {
                id: central,
                device,
                options: config.connect_options.clone(),
            }])
        }
        Intent::Disconnect => {
            let Some(connection) = state.connection.as_mut() else {
                return reject(Error::NotConnected);
            };
            if connection.state == ConnectionState::Disconnecting {
                debug!("Already disconnecting from {}", connection.device);
                return Reduced::none();
            }
            connection.state = ConnectionState::Disconnecting;
            Reduced::commands(vec![Command::CancelConnection { id: central }])
        }
        Intent::DiscoverServices => {
            let Some(device) = state.connected_device() else {
                return reject(Error::NotConnected);
            };
            if state.service_discovery.is_in_progress() {
                return reject(Error::DiscoveryInProgress);
            }

            state.service_discovery = ServiceDiscoveryState::InProgress(None);
            Reduced::commands(vec![Command::DiscoverServices {
                id: SessionId::peripheral(&device),
                filter: config.discovery_filter.clone(),
            }])
        }
        Intent::StartAdvertising => {
            let Some(parameters) = &config.advertising else {
                return reject(Error::NotSupported {
                    operation: "advertising is not configured".to_string(),
                });
            };
            let radio = state.advertiser.radio;
            if !radio.is_powered_on() {
                return reject(Error::RadioNotReady { state: radio });
            }
            if state.advertiser.status != AdvertisingStatus::Idle {
                debug!("Advertising already {:?}", state.advertiser.status);
                return Reduced::none();
            }

            state.advertiser.status = AdvertisingStatus::Starting;
            state.advertiser.operation = None;
            Reduced::commands(vec![Command::StartAdvertising {
                id: config.peripheral_manager_session.clone(),
                parameters: parameters.clone(),
            }])
        }
        Intent::StopAdvertising => {
            if state.advertiser.status == AdvertisingStatus::Idle {
                debug!("Not advertising, ignoring stop");
                return Reduced::none();
            }
            state.advertiser.status = AdvertisingStatus::Idle;
            state.advertiser.operation = None;
            Reduced::commands(vec![Command::StopAdvertising {
                id: config.peripheral_manager_session.clone(),
            }])
        }
    }
}

fn reduce_central(state: &mut AppState, event: CentralEvent, _config: &StoreConfig) -> Reduced {
    match event {
        CentralEvent::RadioStateChanged(radio) => {
            state.radio = radio;
            if !radio.is_powered_on() && state.is_scanning {
                debug!("Radio {} while scanning, scan stopped", radio);
                state.is_scanning = false;
                state.scan_epoch = None;
            }
            Reduced::none()
        }
        CentralEvent::DeviceDiscovered { device, epoch } => {
            if !state.is_scanning {
                trace!("Discovery of {} outside a scan, dropping", device.id);
                return Reduced::none();
            }
            if state.scan_epoch != Some(epoch) {
                trace!("Discovery of {} from scan epoch {}, dropping", device.id, epoch);
                return Reduced::none();
            }
            match state.discovered.get_mut(&device.id) {
                Some(existing) => existing.update_from(device),
                None => {
                    state.discovered.insert(device.id, device);
                }
            }
            Reduced::none()
        }
        CentralEvent::ScanFailed(error) => {
            warn!("Scan failed: {}", error);
            state.is_scanning = false;
            state.scan_epoch = None;
            state.last_error = Some(error);
            Reduced::none()
        }
        CentralEvent::Connected { device, operation } => match state.connection.as_mut() {
            Some(connection)
                if connection.device == device
                    && connection.state == ConnectionState::Connecting
                    && operation.is_some()
                    && connection.operation == operation =>
            {
                connection.state = ConnectionState::Connected;
                state.service_discovery = ServiceDiscoveryState::NotRequested;
                Reduced::commands(vec![Command::CreatePeripheral {
                    id: SessionId::peripheral(&device),
                    device,
                }])
            }
            _ => {
                debug!("Connected event for {} not awaited, ignoring", device);
                Reduced::none()
            }
        },
        CentralEvent::Disconnected {
            device,
            operation,
            error,
        } => {
            let Some(connection) = state.connection.filter(|c| c.device == device) else {
                debug!("Disconnect of {} does not hold the slot, ignoring", device);
                return Reduced::none();
            };
            if let Some(operation) = operation {
                if connection.operation != Some(operation) {
                    debug!("Connect {} to {} superseded, ignoring", operation, device);
                    return Reduced::none();
                }
            }
            state.connection = None;
            state.service_discovery = ServiceDiscoveryState::NotRequested;
            if let Some(error) = error {
                warn!("Link to {} ended: {}", device, error);
                state.last_error = Some(error);
            }
            Reduced::commands(vec![Command::DestroyPeripheral {
                id: SessionId::peripheral(&device),
            }])
        }
    }
}

fn reduce_peripheral(state: &mut AppState, device: DeviceId, event: PeripheralEvent) -> Reduced {
    let awaited = ServiceDiscoveryState::InProgress(Some(event.operation()));
    if state.connected_device() != Some(device) || state.service_discovery != awaited {
        debug!(
            "Discovery result {} for {} not awaited, dropping",
            event.operation(),
            device
        );
        return Reduced::none();
    }

    state.service_discovery = match event {
        PeripheralEvent::ServicesDiscovered { services, .. } => {
            debug!("{} services discovered on {}", services.len(), device);
            ServiceDiscoveryState::Completed(services)
        }
        PeripheralEvent::ServicesDiscoveryFailed { error, .. } => {
            warn!("Service discovery on {} failed: {}", device, error);
            state.last_error = Some(error.clone());
            ServiceDiscoveryState::Failed(error)
        }
    };
    Reduced::none()
}

fn reduce_peripheral_manager(
    state: &mut AppState,
    event: PeripheralManagerEvent,
    config: &StoreConfig,
) -> Reduced {
    let advertiser = &mut state.advertiser;

    match event {
        PeripheralManagerEvent::RadioStateChanged(radio) => {
            advertiser.radio = radio;
            if !radio.is_powered_on() {
                advertiser.status = AdvertisingStatus::Idle;
                advertiser.operation = None;
                return Reduced::none();
            }

            let Some(parameters) = &config.advertising else {
                return Reduced::none();
            };
            if advertiser.status != AdvertisingStatus::Idle {
                return Reduced::none();
            }

            advertiser.status = AdvertisingStatus::Starting;
            advertiser.operation = None;
            let id = config.peripheral_manager_session.clone();
            let mut commands: Vec<_> = parameters
                .services
                .iter()
                .map(|service| Command::AddService {
                    id: id.clone(),
                    service: service.clone(),
                })
                .collect();
            commands.push(Command::StartAdvertising {
                id,
                parameters: parameters.clone(),
            });
            Reduced::commands(commands)
        }
        PeripheralManagerEvent::AdvertisingStarted { operation, error } => {
            if advertiser.status != AdvertisingStatus::Starting
                || advertiser.operation != Some(operation)
            {
                debug!("Advertising result {} not awaited, dropping", operation);
                return Reduced::none();
            }
            advertiser.operation = None;
            match error {
                None => advertiser.status = AdvertisingStatus::Advertising,
                Some(error) => {
                    warn!("Advertising failed: {}", error);
                    advertiser.status = AdvertisingStatus::Idle;
                    state.last_error = Some(error);
                }
            }
            Reduced::none()
        }
        PeripheralManagerEvent::ServiceAdded { service, error, .. } => {
            if let Some(error) = error {
                warn!("Publishing service {} failed: {}", service.uuid, error);
                state.last_error = Some(error);
            }
            Reduced::none()
        }
        PeripheralManagerEvent::PeripheralConnected(central) => {
            advertiser.connected_centrals.insert(central);
            Reduced::none()
        }
        PeripheralManagerEvent::PeripheralDisconnected(central) => {
            advertiser.connected_centrals.remove(&central);
            Reduced::none()
        }
        PeripheralManagerEvent::ServicesDiscoveredByRemote { central, error } => {
            advertiser.last_remote_discovery = Some(RemoteDiscovery { central, error });
            Reduced::none()
        }
    }
}

/// Record the operation a command started, so only its outcome is accepted.
fn reduce_operation_started(state: &mut AppState, pending: PendingOperation) -> Reduced {
    let id = pending.id();
    let tracked = match pending.kind() {
        OperationKind::Connect(device) => match state.connection.as_mut() {
            Some(connection)
                if connection.device == *device
                    && connection.state == ConnectionState::Connecting
                    && connection.operation.is_none() =>
            {
                connection.operation = Some(id);
                true
            }
            _ => false,
        },
        OperationKind::DiscoverServices => {
            let session = state.connected_device().map(|d| SessionId::peripheral(&d));
            if session.as_ref() == Some(pending.session())
                && state.service_discovery == ServiceDiscoveryState::InProgress(None)
            {
                state.service_discovery = ServiceDiscoveryState::InProgress(Some(id));
                true
            } else {
                false
            }
        }
        OperationKind::StartAdvertising => {
            let advertiser = &mut state.advertiser;
            if advertiser.status == AdvertisingStatus::Starting && advertiser.operation.is_none() {
                advertiser.operation = Some(id);
                true
            } else {
                false
            }
        }
        OperationKind::AddService => true,
    };

    if tracked {
        trace!("Awaiting {} on {}", id, pending.session());
    } else {
        debug!("{} on {} no longer awaited", id, pending.session());
    }
    Reduced::none()
}

/// Undo the optimistic transition made when `command` was issued.
fn reduce_command_failure(state: &mut AppState, command: Command, error: Error) -> Reduced {
    warn!("Command {:?} failed: {}", command, error);

    match command {
        Command::StartScan { .. } => {
            state.is_scanning = false;
            state.scan_epoch = None;
        }
        Command::Connect { device, .. } | Command::CreatePeripheral { device, .. } => {
            if state.connection.map(|c| c.device) == Some(device) {
                state.connection = None;
                state.service_discovery = ServiceDiscoveryState::NotRequested;
            }
        }
        Command::CancelConnection { .. } => {
            if matches!(error, Error::NotConnected | Error::SessionNotFound { .. }) {
                state.connection = None;
                state.service_discovery = ServiceDiscoveryState::NotRequested;
            }
        }
        Command::DiscoverServices { .. } => {
            if state.service_discovery.is_in_progress() {
                state.service_discovery = ServiceDiscoveryState::Failed(error.clone());
            }
        }
        Command::StartAdvertising { .. } | Command::CreatePeripheralManager { .. } => {
            state.advertiser.status = AdvertisingStatus::Idle;
            state.advertiser.operation = None;
        }
        Command::CreateCentral { .. } => {
            state.radio = RadioState::Unknown;
            state.is_scanning = false;
            state.scan_epoch = None;
        }
        Command::AddService { .. }
        | Command::StopScan { .. }
        | Command::DestroyCentral { .. }
        | Command::DestroyPeripheral { .. }
        | Command::DestroyPeripheralManager { .. }
        | Command::StopAdvertising { .. } => {}
    }

    state.last_error = Some(error);
    Reduced::none()
}

fn reject(error: Error) -> Reduced {
    warn!("Intent rejected: {}", error);
    Reduced::reject(error)
}
