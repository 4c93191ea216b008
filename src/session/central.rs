//! Central-role session: scanning and connecting.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use crate::ble::adapter::{CentralCallback, HardwareAdapter};
use crate::ble::types::{ConnectOptions, DeviceId, DiscoveredDevice, RadioState, ServiceFilter};
use crate::error::{Error, Result};
use crate::session::operation::{OperationCounter, OperationId, OperationKind, PendingOperation};
use crate::session::registry::{CallbackHandle, EventStream, SessionId, SessionRecord, SessionRegistry};

/// Events emitted on a central session's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// The radio power state changed (also emitted once on creation).
    RadioStateChanged(RadioState),
    /// A device was seen, or seen again, during scan `epoch`.
    DeviceDiscovered {
        /// The sighting.
        device: DiscoveredDevice,
        /// Scan epoch the sighting belongs to.
        epoch: u64,
    },
    /// A scan request was refused or the running scan died.
    ScanFailed(Error),
    /// A link was established.
    Connected {
        /// The connected device.
        device: DeviceId,
        /// The connect request this resolves.
        operation: Option<OperationId>,
    },
    /// A link went down, or a connect attempt ended without one.
    Disconnected {
        /// The device.
        device: DeviceId,
        /// The connect request this resolves, if it never succeeded.
        operation: Option<OperationId>,
        /// Why the link ended, if not on request.
        error: Option<Error>,
    },
}

/// Scan lifecycle of a central session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPhase {
    /// Radio has not reported `poweredOn` yet.
    #[default]
    Uninitialized,
    /// Ready, not scanning.
    Idle,
    /// Scanning.
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone)]
struct Link {
    device: DeviceId,
    state: LinkState,
    operation: Option<OperationId>,
}

/// Hardware-facing state of one central session.
#[derive(Debug, Clone, Default)]
pub struct CentralState {
    radio: RadioState,
    phase: ScanPhase,
    epoch: u64,
    seen: HashSet<DeviceId>,
    link: Option<Link>,
}

impl CentralState {
    fn new(radio: RadioState) -> Self {
        Self {
            radio,
            phase: if radio.is_powered_on() {
                ScanPhase::Idle
            } else {
                ScanPhase::Uninitialized
            },
            ..Default::default()
        }
    }

    /// Last reported radio state.
    pub fn radio(&self) -> RadioState {
        self.radio
    }

    /// Current scan phase.
    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Number of scans started on this session.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Check if a device has been seen during the current scan epoch.
    pub fn has_seen(&self, device: &DeviceId) -> bool {
        self.seen.contains(device)
    }

    /// The device holding the connection slot, if any.
    pub fn linked_device(&self) -> Option<DeviceId> {
        self.link.as_ref().map(|l| l.device)
    }
}

type CentralRecord = SessionRecord<CentralState, CentralEvent>;

/// Manages central-role sessions against a [`HardwareAdapter`].
pub struct CentralSession {
    adapter: Arc<dyn HardwareAdapter>,
    registry: Arc<SessionRegistry<CentralState, CentralEvent>>,
    operations: Arc<OperationCounter>,
}

impl CentralSession {
    /// Create a session manager with its own registry and operation counter.
    pub fn new(adapter: Arc<dyn HardwareAdapter>) -> Self {
        Self::with_registry(
            adapter,
            Arc::new(SessionRegistry::new()),
            Arc::new(OperationCounter::new()),
        )
    }

    /// Create a session manager over a caller-owned registry and counter.
    pub fn with_registry(
        adapter: Arc<dyn HardwareAdapter>,
        registry: Arc<SessionRegistry<CentralState, CentralEvent>>,
        operations: Arc<OperationCounter>,
    ) -> Self {
        Self {
            adapter,
            registry,
            operations,
        }
    }

    /// Register a session and install its adapter delegate.
    ///
    /// The stream starts with the current radio state. The adapter has one
    /// central delegate, so only one central session can be live at a time.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSession`] if `id` is already live.
    /// - [`Error::AdapterInUse`] if another central session is live.
    pub fn create(&self, id: SessionId) -> Result<EventStream<CentralEvent>> {
        let radio = self.adapter.power_state();
        let adapter = self.adapter.clone();

        let stream = self.registry.create_exclusive(
            id.clone(),
            CentralState::new(radio),
            |_, _| true,
            |cb| CallbackHandle::new(cb, move || adapter.set_central_delegate(None)),
        )?;
        self.registry
            .with_record(&id, |record| record.emit(CentralEvent::RadioStateChanged(radio)))?;

        let sink = self.registry.callback_sink(id.clone(), handle_callback);
        self.adapter.set_central_delegate(Some(sink));

        info!("Central session {} created (radio {})", id, radio);
        Ok(stream)
    }

    /// Stop any scan, drop any link, end the stream and release the session.
    ///
    /// Idempotent.
    pub fn destroy(&self, id: &SessionId) {
        let Ok((scanning, linked)) = self.registry.with_record(id, |record| {
            let state = record.hardware();
            (state.phase == ScanPhase::Scanning, state.linked_device())
        }) else {
            trace!("Central session {} already gone", id);
            return;
        };

        self.registry.destroy(id);

        if scanning {
            if let Err(e) = self.adapter.stop_scan() {
                error!("Failed to stop scan while destroying {}: {}", id, e);
            }
        }
        if let Some(device) = linked {
            if let Err(e) = self.adapter.cancel_connection(&device) {
                error!("Failed to release {} while destroying {}: {}", device, id, e);
            }
        }

        info!("Central session {} destroyed", id);
    }

    /// Begin scanning; a new scan epoch forgets previously seen devices.
    ///
    /// Returns the epoch that sightings from this scan carry, or `None` if
    /// the scan was refused. Coalesced while already scanning, returning the
    /// running epoch. A refusal is also reported as a
    /// [`CentralEvent::ScanFailed`] event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] for an unknown session.
    pub fn start_scan(&self, id: &SessionId, filter: &ServiceFilter) -> Result<Option<u64>> {
        let started = self.registry.with_record(id, |record| {
            let state = record.hardware_mut();
            if state.phase == ScanPhase::Scanning {
                debug!("Already scanning on {}, ignoring start request", id);
                return Err(state.epoch);
            }
            if !state.radio.is_powered_on() {
                let radio = state.radio;
                warn!("Scan refused on {}: radio {}", id, radio);
                record.emit(CentralEvent::ScanFailed(Error::RadioNotReady { state: radio }));
                return Ok(None);
            }
            state.phase = ScanPhase::Scanning;
            state.epoch += 1;
            state.seen.clear();
            Ok(Some(state.epoch))
        })?;

        let epoch = match started {
            Ok(Some(epoch)) => epoch,
            Ok(None) => return Ok(None),
            Err(running) => return Ok(Some(running)),
        };

        info!("Starting scan on {} (epoch {})", id, epoch);
        if let Err(e) = self.adapter.start_scan(filter) {
            error!("Adapter refused scan on {}: {}", id, e);
            let _ = self.registry.with_record(id, |record| {
                let state = record.hardware_mut();
                if state.phase == ScanPhase::Scanning {
                    state.phase = ScanPhase::Idle;
                }
                record.emit(CentralEvent::ScanFailed(e));
            });
            return Ok(None);
        }
        Ok(Some(epoch))
    }

    /// Stop scanning. No-op if not scanning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] for an unknown session.
    pub fn stop_scan(&self, id: &SessionId) -> Result<()> {
        let was_scanning = self.registry.with_record(id, |record| {
            let state = record.hardware_mut();
            if state.phase != ScanPhase::Scanning {
                return false;
            }
            state.phase = ScanPhase::Idle;
            true
        })?;

        if !was_scanning {
            debug!("Not scanning on {}, ignoring stop request", id);
            return Ok(());
        }

        info!("Stopping scan on {}", id);
        if let Err(e) = self.adapter.stop_scan() {
            error!("Adapter failed to stop scan on {}: {}", id, e);
        }
        Ok(())
    }

    /// Request a link to a device seen during the current scan epoch.
    ///
    /// The outcome arrives as exactly one `Connected` or `Disconnected` event
    /// tagged with the returned operation.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownDevice`] if `device` was not seen this epoch.
    /// - [`Error::AlreadyConnecting`] if another link is outstanding.
    /// - [`Error::RadioNotReady`] if the radio is not powered on.
    /// - [`Error::SessionNotFound`] for an unknown session.
    pub fn connect(
        &self,
        id: &SessionId,
        device: &DeviceId,
        options: &ConnectOptions,
    ) -> Result<PendingOperation> {
        let pending = self.registry.with_record(id, |record| {
            let state = record.hardware_mut();
            if let Some(link) = &state.link {
                return Err(Error::AlreadyConnecting {
                    device: link.device,
                });
            }
            if !state.radio.is_powered_on() {
                return Err(Error::RadioNotReady { state: state.radio });
            }
            if !state.seen.contains(device) {
                return Err(Error::UnknownDevice { device: *device });
            }
            let pending = self.operations.next(id, OperationKind::Connect(*device));
            state.link = Some(Link {
                device: *device,
                state: LinkState::Connecting,
                operation: Some(pending.id()),
            });
            Ok(pending)
        })??;

        info!("Connecting to {} on {} ({})", device, id, pending.id());
        if let Err(e) = self.adapter.connect(device, options) {
            error!("Adapter refused connect to {}: {}", device, e);
            let _ = self.registry.with_record(id, |record| {
                release_link(record, *device, Some(e));
            });
        }
        Ok(pending)
    }

    /// Tear down the current link, or abandon a pending connect.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if there is no link.
    /// - [`Error::SessionNotFound`] for an unknown session.
    pub fn cancel_connection(&self, id: &SessionId) -> Result<()> {
        let device = self.registry.with_record(id, |record| -> Result<Option<DeviceId>> {
            let link = record
                .hardware_mut()
                .link
                .as_mut()
                .ok_or(Error::NotConnected)?;
            if link.state == LinkState::Disconnecting {
                debug!("Already disconnecting from {}", link.device);
                return Ok(None);
            }
            link.state = LinkState::Disconnecting;
            Ok(Some(link.device))
        })??;

        let Some(device) = device else {
            return Ok(());
        };

        info!("Disconnecting from {} on {}", device, id);
        if let Err(e) = self.adapter.cancel_connection(&device) {
            error!("Adapter failed to disconnect {}: {}", device, e);
            let _ = self.registry.with_record(id, |record| {
                release_link(record, device, Some(e));
            });
        }
        Ok(())
    }

    /// Last radio state reported to a session.
    pub fn radio_state(&self, id: &SessionId) -> Option<RadioState> {
        self.registry.lookup(id).ok().map(|state| state.radio)
    }

    /// Check if a session is scanning.
    pub fn is_scanning(&self, id: &SessionId) -> bool {
        self.registry
            .lookup(id)
            .map(|state| state.phase == ScanPhase::Scanning)
            .unwrap_or(false)
    }

    /// Snapshot of a session's hardware-facing state.
    pub fn state(&self, id: &SessionId) -> Option<CentralState> {
        self.registry.lookup(id).ok()
    }

    /// The shared session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry<CentralState, CentralEvent>> {
        &self.registry
    }
}

/// Interpret a raw adapter callback for one session. Runs under the registry lock.
fn handle_callback(record: &mut CentralRecord, callback: CentralCallback) {
    match callback {
        CentralCallback::StateChanged(radio) => {
            let state = record.hardware_mut();
            if state.radio == radio {
                trace!("Radio state unchanged ({})", radio);
                return;
            }
            debug!("Radio state changed: {} -> {}", state.radio, radio);
            state.radio = radio;

            let lost_link = if radio.is_powered_on() {
                if state.phase == ScanPhase::Uninitialized {
                    state.phase = ScanPhase::Idle;
                }
                None
            } else {
                if state.phase == ScanPhase::Scanning {
                    info!("Radio lost while scanning, scan cancelled");
                }
                state.phase = ScanPhase::Uninitialized;
                state.link.as_ref().map(|l| l.device)
            };

            record.emit(CentralEvent::RadioStateChanged(radio));
            if let Some(device) = lost_link {
                release_link(record, device, Some(Error::RadioNotReady { state: radio }));
            }
        }
        CentralCallback::ScanFailed(e) => {
            let state = record.hardware_mut();
            if state.phase != ScanPhase::Scanning {
                trace!("Scan failure while not scanning: {}", e);
                return;
            }
            state.phase = ScanPhase::Idle;
            error!("Scan failed: {}", e);
            record.emit(CentralEvent::ScanFailed(e));
        }
        CentralCallback::Advertisement {
            device,
            name,
            data,
            rssi,
        } => {
            let state = record.hardware_mut();
            if state.phase != ScanPhase::Scanning {
                trace!("Advertisement from {} outside a scan, dropping", device);
                return;
            }
            trace!("Advertisement from {} ({:?}, {} dBm)", device, name, rssi);
            state.seen.insert(device);
            let epoch = state.epoch;
            record.emit(CentralEvent::DeviceDiscovered {
                device: DiscoveredDevice {
                    id: device,
                    name,
                    advertisement: data,
                    rssi,
                    last_seen: Utc::now(),
                },
                epoch,
            });
        }
        CentralCallback::Connected(device) => {
            let state = record.hardware_mut();
            match state.link.as_mut() {
                Some(link) if link.device == device && link.state == LinkState::Connecting => {
                    link.state = LinkState::Connected;
                    let operation = link.operation.take();
                    info!("Connected to {}", device);
                    record.emit(CentralEvent::Connected { device, operation });
                }
                _ => debug!("Unsolicited connect from {}, ignoring", device),
            }
        }
        CentralCallback::ConnectFailed { device, error } => {
            warn!("Connect to {} failed: {}", device, error);
            release_link(record, device, Some(error));
        }
        CentralCallback::Disconnected { device, error } => {
            info!("Disconnected from {}", device);
            release_link(record, device, error);
        }
    }
}

/// Free the connection slot held by `device` and report it.
fn release_link(record: &mut CentralRecord, device: DeviceId, error: Option<Error>) {
    let state = record.hardware_mut();
    if state.linked_device() != Some(device) {
        debug!("Disconnect for unlinked device {}, ignoring", device);
        return;
    }
    let operation = state.link.take().and_then(|l| l.operation);
    record.emit(CentralEvent::Disconnected {
        device,
        operation,
        error,
    });
}
