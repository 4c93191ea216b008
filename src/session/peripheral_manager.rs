//! Peripheral-manager session: this device in the advertiser role.
//!
//! Mirrors [`CentralSession`](crate::session::central::CentralSession) from
//! the other side of the link: it publishes services, advertises, and reports
//! remote centrals connecting and discovering those services.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::ble::adapter::{PeripheralManagerAdapter, PeripheralManagerCallback};
use crate::ble::types::{AdvertisingParameters, DeviceId, RadioState, ServiceDescriptor};
use crate::error::{Error, Result};
use crate::session::operation::{OperationCounter, OperationId, OperationKind, PendingOperation};
use crate::session::registry::{CallbackHandle, EventStream, SessionId, SessionRecord, SessionRegistry};

/// Events emitted on a peripheral-manager session's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralManagerEvent {
    /// The radio power state changed (also emitted once on creation).
    RadioStateChanged(RadioState),
    /// An advertising request finished.
    AdvertisingStarted {
        /// The request this resolves.
        operation: OperationId,
        /// Set if advertising could not start.
        error: Option<Error>,
    },
    /// A service publication finished.
    ServiceAdded {
        /// The request this resolves.
        operation: OperationId,
        /// The service.
        service: ServiceDescriptor,
        /// Set if publishing failed.
        error: Option<Error>,
    },
    /// A remote central connected.
    PeripheralConnected(DeviceId),
    /// A remote central went away.
    PeripheralDisconnected(DeviceId),
    /// A remote central finished discovering our services.
    ServicesDiscoveredByRemote {
        /// The remote central.
        central: DeviceId,
        /// Set if the remote discovery failed.
        error: Option<Error>,
    },
}

/// Advertising lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvertisingPhase {
    /// Not advertising.
    #[default]
    Idle,
    /// Start requested, waiting for the radio.
    Starting(OperationId),
    /// Advertising.
    Advertising,
}

/// Hardware-facing state of one peripheral-manager session.
#[derive(Debug, Clone, Default)]
pub struct PeripheralManagerState {
    radio: RadioState,
    phase: AdvertisingPhase,
    centrals: BTreeSet<DeviceId>,
    pending_services: Vec<(OperationId, ServiceDescriptor)>,
}

impl PeripheralManagerState {
    /// Last reported radio state.
    pub fn radio(&self) -> RadioState {
        self.radio
    }

    /// Current advertising phase.
    pub fn phase(&self) -> AdvertisingPhase {
        self.phase
    }

    /// Remote centrals currently connected.
    pub fn centrals(&self) -> &BTreeSet<DeviceId> {
        &self.centrals
    }
}

type ManagerRecord = SessionRecord<PeripheralManagerState, PeripheralManagerEvent>;

/// Manages advertiser-role sessions against a [`PeripheralManagerAdapter`].
pub struct PeripheralManagerSession {
    adapter: Arc<dyn PeripheralManagerAdapter>,
    registry: Arc<SessionRegistry<PeripheralManagerState, PeripheralManagerEvent>>,
    operations: Arc<OperationCounter>,
}

impl PeripheralManagerSession {
    /// Create a session manager with its own registry and operation counter.
    pub fn new(adapter: Arc<dyn PeripheralManagerAdapter>) -> Self {
        Self::with_registry(
            adapter,
            Arc::new(SessionRegistry::new()),
            Arc::new(OperationCounter::new()),
        )
    }

    /// Create a session manager over a caller-owned registry and counter.
    pub fn with_registry(
        adapter: Arc<dyn PeripheralManagerAdapter>,
        registry: Arc<SessionRegistry<PeripheralManagerState, PeripheralManagerEvent>>,
        operations: Arc<OperationCounter>,
    ) -> Self {
        Self {
            adapter,
            registry,
            operations,
        }
    }

    /// Register a session and install its delegate.
    ///
    /// The adapter has one delegate, so only one session can be live.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSession`] if `id` is already live.
    /// - [`Error::AdapterInUse`] if another session is live.
    pub fn create(&self, id: SessionId) -> Result<EventStream<PeripheralManagerEvent>> {
        let radio = self.adapter.power_state();
        let adapter = self.adapter.clone();
        let state = PeripheralManagerState {
            radio,
            ..Default::default()
        };

        let stream = self.registry.create_exclusive(
            id.clone(),
            state,
            |_, _| true,
            |cb| CallbackHandle::new(cb, move || adapter.set_delegate(None)),
        )?;
        self.registry.with_record(&id, |record| {
            record.emit(PeripheralManagerEvent::RadioStateChanged(radio))
        })?;

        let sink = self.registry.callback_sink(id.clone(), handle_callback);
        self.adapter.set_delegate(Some(sink));

        info!("Peripheral manager session {} created (radio {})", id, radio);
        Ok(stream)
    }

    /// Stop advertising, end the stream and release the session. Idempotent.
    pub fn destroy(&self, id: &SessionId) {
        let Ok(advertising) = self
            .registry
            .with_record(id, |record| record.hardware().phase != AdvertisingPhase::Idle)
        else {
            trace!("Peripheral manager session {} already gone", id);
            return;
        };

        self.registry.destroy(id);

        if advertising {
            if let Err(e) = self.adapter.stop_advertising() {
                error!("Failed to stop advertising while destroying {}: {}", id, e);
            }
        }
        info!("Peripheral manager session {} destroyed", id);
    }

    /// Publish a service.
    ///
    /// The outcome arrives as one `ServiceAdded` event.
    ///
    /// # Errors
    ///
    /// - [`Error::RadioNotReady`] if the radio is not powered on.
    /// - [`Error::SessionNotFound`] for an unknown session.
    pub fn add_service(
        &self,
        id: &SessionId,
        service: &ServiceDescriptor,
    ) -> Result<PendingOperation> {
        let pending = self.registry.with_record(id, |record| {
            let state = record.hardware_mut();
            if !state.radio.is_powered_on() {
                return Err(Error::RadioNotReady { state: state.radio });
            }
            let pending = self.operations.next(id, OperationKind::AddService);
            state.pending_services.push((pending.id(), service.clone()));
            Ok(pending)
        })??;

        debug!("Adding service {} on {}", service.uuid, id);
        if let Err(e) = self.adapter.add_service(service) {
            error!("Adapter refused service {}: {}", service.uuid, e);
            let _ = self.registry.with_record(id, |record| {
                complete_service(record, &service.uuid, Some(e));
            });
        }
        Ok(pending)
    }

    /// Begin advertising.
    ///
    /// Returns the in-flight operation if a start is already pending. The
    /// outcome arrives as one `AdvertisingStarted` event.
    ///
    /// # Errors
    ///
    /// - [`Error::RadioNotReady`] if the radio is not powered on.
    /// - [`Error::SessionNotFound`] for an unknown session.
    pub fn start_advertising(
        &self,
        id: &SessionId,
        parameters: &AdvertisingParameters,
    ) -> Result<Option<PendingOperation>> {
        let pending = self.registry.with_record(id, |record| {
            let state = record.hardware_mut();
            if state.phase != AdvertisingPhase::Idle {
                debug!("Already advertising on {}, ignoring start request", id);
                return Ok(None);
            }
            if !state.radio.is_powered_on() {
                return Err(Error::RadioNotReady { state: state.radio });
            }
            let pending = self.operations.next(id, OperationKind::StartAdvertising);
            state.phase = AdvertisingPhase::Starting(pending.id());
            Ok(Some(pending))
        })??;

        let Some(pending) = pending else {
            return Ok(None);
        };

        info!("Starting advertising on {} as {:?}", id, parameters.local_name);
        if let Err(e) = self.adapter.start_advertising(parameters) {
            error!("Adapter refused advertising on {}: {}", id, e);
            let _ = self.registry.with_record(id, |record| {
                finish_advertising_start(record, Some(e));
            });
        }
        Ok(Some(pending))
    }

    /// Stop advertising. No-op if idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] for an unknown session.
    pub fn stop_advertising(&self, id: &SessionId) -> Result<()> {
        let was_advertising = self.registry.with_record(id, |record| {
            let state = record.hardware_mut();
            let was = state.phase != AdvertisingPhase::Idle;
            state.phase = AdvertisingPhase::Idle;
            was
        })?;

        if !was_advertising {
            debug!("Not advertising on {}, ignoring stop request", id);
            return Ok(());
        }

        info!("Stopping advertising on {}", id);
        if let Err(e) = self.adapter.stop_advertising() {
            error!("Adapter failed to stop advertising on {}: {}", id, e);
        }
        Ok(())
    }

    /// Snapshot of a session's hardware-facing state.
    pub fn state(&self, id: &SessionId) -> Option<PeripheralManagerState> {
        self.registry.lookup(id).ok()
    }

    /// The shared session registry.
    pub fn registry(
        &self,
    ) -> &Arc<SessionRegistry<PeripheralManagerState, PeripheralManagerEvent>> {
        &self.registry
    }
}

fn handle_callback(record: &mut ManagerRecord, callback: PeripheralManagerCallback) {
    match callback {
        PeripheralManagerCallback::StateChanged(radio) => {
            let state = record.hardware_mut();
            if state.radio == radio {
                return;
            }
            debug!("Peripheral manager radio: {} -> {}", state.radio, radio);
            state.radio = radio;

            let mut dropped = Vec::new();
            let mut abandoned = None;
            if !radio.is_powered_on() {
                if let AdvertisingPhase::Starting(operation) = state.phase {
                    abandoned = Some(operation);
                }
                state.phase = AdvertisingPhase::Idle;
                dropped.extend(std::mem::take(&mut state.centrals));
            }

            record.emit(PeripheralManagerEvent::RadioStateChanged(radio));
            if let Some(operation) = abandoned {
                record.emit(PeripheralManagerEvent::AdvertisingStarted {
                    operation,
                    error: Some(Error::RadioNotReady { state: radio }),
                });
            }
            for central in dropped {
                record.emit(PeripheralManagerEvent::PeripheralDisconnected(central));
            }
        }
        PeripheralManagerCallback::AdvertisingStarted(error) => {
            finish_advertising_start(record, error);
        }
        PeripheralManagerCallback::ServiceAdded { service, error } => {
            complete_service(record, &service.uuid, error);
        }
        PeripheralManagerCallback::CentralConnected(central) => {
            if record.hardware_mut().centrals.insert(central) {
                info!("Remote central {} connected", central);
                record.emit(PeripheralManagerEvent::PeripheralConnected(central));
            }
        }
        PeripheralManagerCallback::CentralDisconnected(central) => {
            if record.hardware_mut().centrals.remove(&central) {
                info!("Remote central {} disconnected", central);
                record.emit(PeripheralManagerEvent::PeripheralDisconnected(central));
            }
        }
        PeripheralManagerCallback::ServicesDiscoveredByRemote { central, error } => {
            debug!("Remote central {} discovered our services", central);
            record.emit(PeripheralManagerEvent::ServicesDiscoveredByRemote { central, error });
        }
    }
}

fn finish_advertising_start(record: &mut ManagerRecord, error: Option<Error>) {
    let state = record.hardware_mut();
    let AdvertisingPhase::Starting(operation) = state.phase else {
        trace!("Advertising result with no start pending, dropping");
        return;
    };
    state.phase = if error.is_none() {
        AdvertisingPhase::Advertising
    } else {
        AdvertisingPhase::Idle
    };
    if let Some(e) = &error {
        warn!("Advertising failed to start: {}", e);
    }
    record.emit(PeripheralManagerEvent::AdvertisingStarted { operation, error });
}

fn complete_service(record: &mut ManagerRecord, uuid: &uuid::Uuid, error: Option<Error>) {
    let state = record.hardware_mut();
    let Some(index) = state.pending_services.iter().position(|(_, s)| &s.uuid == uuid) else {
        trace!("Service result for {} with no request pending", uuid);
        return;
    };
    let (operation, service) = state.pending_services.remove(index);
    record.emit(PeripheralManagerEvent::ServiceAdded {
        operation,
        service,
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{CallbackSink, MockPeripheralManagerAdapter};
    use crate::error::HardwareError;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    type Slot = Arc<Mutex<Option<CallbackSink<PeripheralManagerCallback>>>>;

    fn mock_adapter(radio: RadioState) -> (MockPeripheralManagerAdapter, Slot) {
        let delegate: Slot = Arc::new(Mutex::new(None));
        let slot = delegate.clone();
        let mut adapter = MockPeripheralManagerAdapter::new();
        adapter.expect_power_state().return_const(radio);
        adapter
            .expect_set_delegate()
            .returning(move |sink| *slot.lock() = sink);
        (adapter, delegate)
    }

    fn fire(delegate: &Slot, cb: PeripheralManagerCallback) {
        let sink = delegate.lock().clone().expect("delegate installed");
        sink(cb);
    }

    fn drain(stream: &mut EventStream<PeripheralManagerEvent>) -> Vec<PeripheralManagerEvent> {
        std::iter::from_fn(|| stream.try_next()).collect()
    }

    #[test]
    fn test_advertising_lifecycle() {
        let (mut adapter, delegate) = mock_adapter(RadioState::PoweredOn);
        adapter
            .expect_start_advertising()
            .times(1)
            .returning(|_| Ok(()));
        adapter.expect_stop_advertising().times(1).returning(|| Ok(()));
        let session = PeripheralManagerSession::new(Arc::new(adapter));
        let id = SessionId::new("pm");
        let mut stream = session.create(id.clone()).unwrap();

        let params = AdvertisingParameters {
            local_name: Some("Sample".to_string()),
            services: vec![],
        };
        let pending = session.start_advertising(&id, &params).unwrap().unwrap();
        assert_eq!(session.start_advertising(&id, &params).unwrap(), None);

        fire(&delegate, PeripheralManagerCallback::AdvertisingStarted(None));
        assert_eq!(
            session.state(&id).unwrap().phase(),
            AdvertisingPhase::Advertising
        );

        session.stop_advertising(&id).unwrap();
        session.stop_advertising(&id).unwrap();

        assert_eq!(
            drain(&mut stream),
            vec![
                PeripheralManagerEvent::RadioStateChanged(RadioState::PoweredOn),
                PeripheralManagerEvent::AdvertisingStarted {
                    operation: pending.id(),
                    error: None,
                },
            ]
        );
    }

    #[test]
    fn test_second_session_rejected() {
        let (adapter, delegate) = mock_adapter(RadioState::PoweredOn);
        let session = PeripheralManagerSession::new(Arc::new(adapter));
        let _stream = session.create(SessionId::new("pm")).unwrap();

        let err = session.create(SessionId::new("other")).unwrap_err();

        assert_eq!(err, Error::AdapterInUse { id: SessionId::new("pm") });
        assert!(delegate.lock().is_some());
    }

    #[test]
    fn test_remote_central_events() {
        let (adapter, delegate) = mock_adapter(RadioState::PoweredOn);
        let session = PeripheralManagerSession::new(Arc::new(adapter));
        let id = SessionId::new("pm");
        let mut stream = session.create(id.clone()).unwrap();
        let central = DeviceId::random();

        fire(&delegate, PeripheralManagerCallback::CentralConnected(central));
        fire(&delegate, PeripheralManagerCallback::CentralConnected(central));
        fire(
            &delegate,
            PeripheralManagerCallback::ServicesDiscoveredByRemote {
                central,
                error: None,
            },
        );
        fire(&delegate, PeripheralManagerCallback::StateChanged(RadioState::PoweredOff));

        assert_eq!(
            drain(&mut stream),
            vec![
                PeripheralManagerEvent::RadioStateChanged(RadioState::PoweredOn),
                PeripheralManagerEvent::PeripheralConnected(central),
                PeripheralManagerEvent::ServicesDiscoveredByRemote {
                    central,
                    error: None,
                },
                PeripheralManagerEvent::RadioStateChanged(RadioState::PoweredOff),
                PeripheralManagerEvent::PeripheralDisconnected(central),
            ]
        );
        assert!(session.state(&id).unwrap().centrals().is_empty());
    }

    #[test]
    fn test_add_service_refused_when_powered_off() {
        let (mut adapter, _delegate) = mock_adapter(RadioState::PoweredOff);
        adapter.expect_add_service().never();
        let session = PeripheralManagerSession::new(Arc::new(adapter));
        let id = SessionId::new("pm");
        let _stream = session.create(id.clone()).unwrap();

        let err = session
            .add_service(&id, &ServiceDescriptor::primary(Uuid::from_u128(7)))
            .unwrap_err();
        assert_eq!(
            err,
            Error::RadioNotReady {
                state: RadioState::PoweredOff
            }
        );
    }

    #[test]
    fn test_add_service_adapter_error_completes() {
        let (mut adapter, _delegate) = mock_adapter(RadioState::PoweredOn);
        adapter
            .expect_add_service()
            .returning(|_| Err(HardwareError::msg("table full").into()));
        let session = PeripheralManagerSession::new(Arc::new(adapter));
        let id = SessionId::new("pm");
        let mut stream = session.create(id.clone()).unwrap();
        let service = ServiceDescriptor::primary(Uuid::from_u128(7));

        let pending = session.add_service(&id, &service).unwrap();

        assert_eq!(
            drain(&mut stream).last(),
            Some(&PeripheralManagerEvent::ServiceAdded {
                operation: pending.id(),
                service,
                error: Some(HardwareError::msg("table full").into()),
            })
        );
    }

    #[test]
    fn test_destroy_stops_advertising() {
        let (mut adapter, delegate) = mock_adapter(RadioState::PoweredOn);
        adapter.expect_start_advertising().returning(|_| Ok(()));
        adapter.expect_stop_advertising().times(1).returning(|| Ok(()));
        let session = PeripheralManagerSession::new(Arc::new(adapter));
        let id = SessionId::new("pm");
        let _stream = session.create(id.clone()).unwrap();

        session
            .start_advertising(&id, &AdvertisingParameters::default())
            .unwrap();
        session.destroy(&id);
        session.destroy(&id);

        assert!(delegate.lock().is_none());
        assert!(session.registry().is_empty());
    }
}
