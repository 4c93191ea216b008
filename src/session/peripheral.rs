//! Peripheral session: service discovery on one connected device.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::ble::adapter::{HardwareAdapter, PeripheralCallback};
use crate::ble::types::{DeviceId, ServiceDescriptor, ServiceFilter};
use crate::error::{Error, Result};
use crate::session::operation::{OperationCounter, OperationId, OperationKind, PendingOperation};
use crate::session::registry::{CallbackHandle, EventStream, SessionId, SessionRecord, SessionRegistry};

/// Events emitted on a peripheral session's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    /// Discovery finished; services in the order the radio reported them.
    ServicesDiscovered {
        /// The discovery request this resolves.
        operation: OperationId,
        /// Discovered services.
        services: Vec<ServiceDescriptor>,
    },
    /// Discovery failed.
    ServicesDiscoveryFailed {
        /// The discovery request this resolves.
        operation: OperationId,
        /// Why it failed.
        error: Error,
    },
}

impl PeripheralEvent {
    /// The operation this event completes.
    pub fn operation(&self) -> OperationId {
        match self {
            Self::ServicesDiscovered { operation, .. } => *operation,
            Self::ServicesDiscoveryFailed { operation, .. } => *operation,
        }
    }
}

/// Hardware-facing state of one peripheral session.
#[derive(Debug, Clone)]
pub struct PeripheralState {
    device: DeviceId,
    outstanding: Option<OperationId>,
    services: Option<Vec<ServiceDescriptor>>,
}

impl PeripheralState {
    /// The bound device.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The discovery currently awaiting a result.
    pub fn outstanding(&self) -> Option<OperationId> {
        self.outstanding
    }
}

type PeripheralRecord = SessionRecord<PeripheralState, PeripheralEvent>;

/// Manages sessions bound to connected devices.
///
/// Callers are trusted to bind only devices that are currently connected;
/// the reducer checks connection state before issuing discovery.
pub struct PeripheralSession {
    adapter: Arc<dyn HardwareAdapter>,
    registry: Arc<SessionRegistry<PeripheralState, PeripheralEvent>>,
    operations: Arc<OperationCounter>,
}

impl PeripheralSession {
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
        registry: Arc<SessionRegistry<PeripheralState, PeripheralEvent>>,
        operations: Arc<OperationCounter>,
    ) -> Self {
        Self {
            adapter,
            registry,
            operations,
        }
    }

    /// Bind a session to `device` and install its delegate.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSession`] if `id` is already live.
    /// - [`Error::AdapterInUse`] if another live session is bound to `device`.
    pub fn create(&self, id: SessionId, device: DeviceId) -> Result<EventStream<PeripheralEvent>> {
        let adapter = self.adapter.clone();
        let state = PeripheralState {
            device,
            outstanding: None,
            services: None,
        };

        let stream = self.registry.create_exclusive(
            id.clone(),
            state,
            |_, other| other.device == device,
            |cb| CallbackHandle::new(cb, move || adapter.set_peripheral_delegate(&device, None)),
        )?;

        let sink = self.registry.callback_sink(id.clone(), handle_callback);
        self.adapter.set_peripheral_delegate(&device, Some(sink));

        info!("Peripheral session {} bound to {}", id, device);
        Ok(stream)
    }

    /// Detach the delegate and end the stream. Idempotent.
    ///
    /// An outstanding discovery is abandoned; its result is never reported.
    pub fn destroy(&self, id: &SessionId) {
        if self.registry.destroy(id) {
            info!("Peripheral session {} destroyed", id);
        }
    }

    /// Discover services on the bound device.
    ///
    /// The result arrives as exactly one `ServicesDiscovered` or
    /// `ServicesDiscoveryFailed` event tagged with the returned operation.
    ///
    /// # Errors
    ///
    /// - [`Error::DiscoveryInProgress`] if a discovery is outstanding.
    /// - [`Error::SessionNotFound`] for an unknown session.
    pub fn discover_services(
        &self,
        id: &SessionId,
        filter: &ServiceFilter,
    ) -> Result<PendingOperation> {
        let (device, pending) = self.registry.with_record(id, |record| {
            let state = record.hardware_mut();
            if state.outstanding.is_some() {
                return Err(Error::DiscoveryInProgress);
            }
            let pending = self.operations.next(id, OperationKind::DiscoverServices);
            state.outstanding = Some(pending.id());
            Ok((state.device, pending))
        })??;

        info!("Discovering services on {} ({})", device, pending.id());
        if let Err(e) = self.adapter.discover_services(&device, filter) {
            error!("Adapter refused discovery on {}: {}", device, e);
            let _ = self.registry.with_record(id, |record| {
                if let Some(operation) = record.hardware_mut().outstanding.take() {
                    record.emit(PeripheralEvent::ServicesDiscoveryFailed {
                        operation,
                        error: e,
                    });
                }
            });
        }
        Ok(pending)
    }

    /// Services from the last successful discovery.
    pub fn services(&self, id: &SessionId) -> Option<Vec<ServiceDescriptor>> {
        self.registry.lookup(id).ok().and_then(|state| state.services)
    }

    /// Snapshot of a session's hardware-facing state.
    pub fn state(&self, id: &SessionId) -> Option<PeripheralState> {
        self.registry.lookup(id).ok()
    }

    /// The shared session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry<PeripheralState, PeripheralEvent>> {
        &self.registry
    }
}

fn handle_callback(record: &mut PeripheralRecord, callback: PeripheralCallback) {
    match callback {
        PeripheralCallback::ServicesDiscovered(result) => {
            let state = record.hardware_mut();
            let Some(operation) = state.outstanding.take() else {
                warn!("Unrequested discovery result for {}, dropping", state.device);
                return;
            };
            let event = match result {
                Ok(services) => {
                    debug!("Discovered {} services on {}", services.len(), state.device);
                    state.services = Some(services.clone());
                    PeripheralEvent::ServicesDiscovered {
                        operation,
                        services,
                    }
                }
                Err(error) => {
                    warn!("Service discovery on {} failed: {}", state.device, error);
                    PeripheralEvent::ServicesDiscoveryFailed { operation, error }
                }
            };
            record.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{CallbackSink, MockHardwareAdapter};
    use crate::error::HardwareError;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    type Slot = Arc<Mutex<Option<CallbackSink<PeripheralCallback>>>>;

    fn mock_adapter() -> (MockHardwareAdapter, Slot) {
        let delegate: Slot = Arc::new(Mutex::new(None));
        let slot = delegate.clone();
        let mut adapter = MockHardwareAdapter::new();
        adapter
            .expect_set_peripheral_delegate()
            .returning(move |_, sink| *slot.lock() = sink);
        (adapter, delegate)
    }

    fn fire(delegate: &Slot, cb: PeripheralCallback) {
        let sink = delegate.lock().clone().expect("delegate installed");
        sink(cb);
    }

    fn services() -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor::primary(Uuid::from_u128(2)),
            ServiceDescriptor::primary(Uuid::from_u128(1)),
        ]
    }

    #[test]
    fn test_discovery_completes_once() {
        let (mut adapter, delegate) = mock_adapter();
        adapter
            .expect_discover_services()
            .times(1)
            .returning(|_, _| Ok(()));
        let session = PeripheralSession::new(Arc::new(adapter));
        let id = SessionId::new("p");
        let mut stream = session.create(id.clone(), DeviceId::random()).unwrap();

        let pending = session
            .discover_services(&id, &ServiceFilter::any())
            .unwrap();
        fire(&delegate, PeripheralCallback::ServicesDiscovered(Ok(services())));
        fire(&delegate, PeripheralCallback::ServicesDiscovered(Ok(vec![])));

        assert_eq!(
            stream.try_next(),
            Some(PeripheralEvent::ServicesDiscovered {
                operation: pending.id(),
                services: services(),
            })
        );
        assert_eq!(stream.try_next(), None);
        assert_eq!(session.services(&id), Some(services()));
    }

    #[test]
    fn test_second_discovery_rejected_while_outstanding() {
        let (mut adapter, delegate) = mock_adapter();
        adapter
            .expect_discover_services()
            .times(2)
            .returning(|_, _| Ok(()));
        let session = PeripheralSession::new(Arc::new(adapter));
        let id = SessionId::new("p");
        let _stream = session.create(id.clone(), DeviceId::random()).unwrap();

        session
            .discover_services(&id, &ServiceFilter::any())
            .unwrap();
        let err = session
            .discover_services(&id, &ServiceFilter::any())
            .unwrap_err();
        assert_eq!(err, Error::DiscoveryInProgress);

        let failure = Error::from(HardwareError::msg("att timeout"));
        fire(&delegate, PeripheralCallback::ServicesDiscovered(Err(failure)));

        session
            .discover_services(&id, &ServiceFilter::any())
            .unwrap();
    }

    #[test]
    fn test_adapter_refusal_reports_failure() {
        let (mut adapter, _delegate) = mock_adapter();
        adapter
            .expect_discover_services()
            .returning(|_, _| Err(HardwareError::msg("not connected").into()));
        let session = PeripheralSession::new(Arc::new(adapter));
        let id = SessionId::new("p");
        let mut stream = session.create(id.clone(), DeviceId::random()).unwrap();

        let pending = session
            .discover_services(&id, &ServiceFilter::any())
            .unwrap();

        assert_eq!(
            stream.try_next(),
            Some(PeripheralEvent::ServicesDiscoveryFailed {
                operation: pending.id(),
                error: HardwareError::msg("not connected").into(),
            })
        );
        assert_eq!(session.state(&id).unwrap().outstanding(), None);
    }

    #[test]
    fn test_one_session_per_device() {
        let (adapter, _delegate) = mock_adapter();
        let session = PeripheralSession::new(Arc::new(adapter));
        let device = DeviceId::random();
        let _stream = session.create(SessionId::new("p"), device).unwrap();

        let err = session.create(SessionId::new("q"), device).unwrap_err();
        assert_eq!(err, Error::AdapterInUse { id: SessionId::new("p") });

        let _other = session
            .create(SessionId::new("q"), DeviceId::random())
            .unwrap();
        assert_eq!(session.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_detaches_and_is_idempotent() {
        let (adapter, delegate) = mock_adapter();
        let session = PeripheralSession::new(Arc::new(adapter));
        let id = SessionId::new("p");
        let mut stream = session.create(id.clone(), DeviceId::random()).unwrap();
        assert!(delegate.lock().is_some());

        session.destroy(&id);
        session.destroy(&id);

        assert!(delegate.lock().is_none());
        assert_eq!(stream.recv().await, None);
        assert!(session
            .discover_services(&id, &ServiceFilter::any())
            .is_err());
    }
}
