//! In-memory radio.
//!
//! [`SimulatedAdapter`] implements both adapter traits without any hardware.
//! Requests are recorded and acknowledged; results are produced only when the
//! owner injects them (`complete_connect`, `complete_discovery`, ...), which
//! makes every interleaving of hardware callbacks reproducible.
//!
//! The one exception is the connect timeout: a connect request carrying
//! [`ConnectOptions::timeout`] fails with [`Error::Timeout`] unless it is
//! resolved first. The timer runs on the Tokio clock, so paused-time tests
//! control it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::ble::adapter::{
    CallbackSink, CentralCallback, HardwareAdapter, PeripheralCallback, PeripheralManagerAdapter,
    PeripheralManagerCallback,
};
use crate::ble::types::{
    AdvertisementData, AdvertisingParameters, ConnectOptions, DeviceId, RadioState,
    ServiceDescriptor, ServiceFilter,
};
use crate::error::{Error, HardwareError, Result};

/// A request the core issued to the simulated radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `start_scan`.
    StartScan(ServiceFilter),
    /// `stop_scan`.
    StopScan,
    /// `connect`.
    Connect(DeviceId, ConnectOptions),
    /// `cancel_connection`.
    CancelConnection(DeviceId),
    /// `discover_services`.
    DiscoverServices(DeviceId, ServiceFilter),
    /// `add_service`.
    AddService(ServiceDescriptor),
    /// `start_advertising`.
    StartAdvertising(AdvertisingParameters),
    /// `stop_advertising`.
    StopAdvertising,
}

#[derive(Default)]
struct Inner {
    radio: RadioState,
    central: Option<CallbackSink<CentralCallback>>,
    peripherals: HashMap<DeviceId, CallbackSink<PeripheralCallback>>,
    manager: Option<CallbackSink<PeripheralManagerCallback>>,
    scan_filter: Option<ServiceFilter>,
    advertising: Option<AdvertisingParameters>,
    requests: Vec<Request>,
    failure: Option<HardwareError>,
    /// Unresolved connects, keyed by device, tagged with a per-request token.
    connects: HashMap<DeviceId, u64>,
    next_connect: u64,
}

impl Inner {
    fn admit(&mut self, request: Request) -> Result<()> {
        trace!("Simulated radio request: {:?}", request);
        if let Some(e) = &self.failure {
            return Err(e.clone().into());
        }
        self.requests.push(request);
        Ok(())
    }
}

/// Simulated radio implementing [`HardwareAdapter`] and [`PeripheralManagerAdapter`].
///
/// Delegates are always invoked with the internal lock released.
#[derive(Default)]
pub struct SimulatedAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedAdapter {
    /// Create a radio in the given power state.
    pub fn new(radio: RadioState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                radio,
                ..Default::default()
            })),
        }
    }

    /// Create a powered-on radio.
    pub fn powered_on() -> Self {
        Self::new(RadioState::PoweredOn)
    }

    /// Change the power state and notify both roles.
    ///
    /// Losing power stops the scan and advertising.
    pub fn set_power(&self, radio: RadioState) {
        let (central, manager) = {
            let mut inner = self.inner.lock();
            if inner.radio == radio {
                return;
            }
            debug!("Simulated radio: {} -> {}", inner.radio, radio);
            inner.radio = radio;
            if !radio.is_powered_on() {
                inner.scan_filter = None;
                inner.advertising = None;
                inner.connects.clear();
            }
            (inner.central.clone(), inner.manager.clone())
        };

        if let Some(sink) = central {
            sink(CentralCallback::StateChanged(radio));
        }
        if let Some(sink) = manager {
            sink(PeripheralManagerCallback::StateChanged(radio));
        }
    }

    /// Broadcast an advertisement carrying only a name.
    ///
    /// Returns whether it was delivered (a scan is running and its filter matches).
    pub fn advertise(&self, device: DeviceId, name: Option<&str>, rssi: i16) -> bool {
        self.advertise_with(device, name, AdvertisementData::default(), rssi)
    }

    /// Broadcast an advertisement.
    pub fn advertise_with(
        &self,
        device: DeviceId,
        name: Option<&str>,
        data: AdvertisementData,
        rssi: i16,
    ) -> bool {
        let sink = {
            let inner = self.inner.lock();
            match &inner.scan_filter {
                Some(filter) if filter.matches(&data.services) => inner.central.clone(),
                _ => None,
            }
        };
        let Some(sink) = sink else {
            trace!("Advertisement from {} not heard", device);
            return false;
        };
        sink(CentralCallback::Advertisement {
            device,
            name: name.map(str::to_string),
            data,
            rssi,
        });
        true
    }

    /// Report a link as established.
    pub fn complete_connect(&self, device: DeviceId) {
        self.inner.lock().connects.remove(&device);
        self.fire_central(CentralCallback::Connected(device));
    }

    /// Report a connect request as failed.
    pub fn fail_connect(&self, device: DeviceId, error: Error) {
        self.inner.lock().connects.remove(&device);
        self.fire_central(CentralCallback::ConnectFailed { device, error });
    }

    /// Check if a connect to `device` is waiting for an outcome.
    pub fn is_connecting(&self, device: &DeviceId) -> bool {
        self.inner.lock().connects.contains_key(device)
    }

    /// Report a link as lost.
    pub fn drop_link(&self, device: DeviceId, error: Error) {
        self.inner.lock().connects.remove(&device);
        self.fire_central(CentralCallback::Disconnected {
            device,
            error: Some(error),
        });
    }

    /// Report a running scan as failed.
    pub fn fail_scan(&self, error: Error) {
        self.inner.lock().scan_filter = None;
        self.fire_central(CentralCallback::ScanFailed(error));
    }

    /// Answer a discovery request on `device`.
    pub fn complete_discovery(&self, device: DeviceId, services: Vec<ServiceDescriptor>) {
        self.fire_peripheral(device, PeripheralCallback::ServicesDiscovered(Ok(services)));
    }

    /// Fail a discovery request on `device`.
    pub fn fail_discovery(&self, device: DeviceId, error: Error) {
        self.fire_peripheral(device, PeripheralCallback::ServicesDiscovered(Err(error)));
    }

    /// Answer the pending advertising request.
    pub fn confirm_advertising(&self, error: Option<Error>) {
        if error.is_some() {
            self.inner.lock().advertising = None;
        }
        self.fire_manager(PeripheralManagerCallback::AdvertisingStarted(error));
    }

    /// Answer a service publication request.
    pub fn confirm_service(&self, service: ServiceDescriptor, error: Option<Error>) {
        self.fire_manager(PeripheralManagerCallback::ServiceAdded { service, error });
    }

    /// A remote central connects to the advertiser.
    pub fn remote_connect(&self, central: DeviceId) {
        self.fire_manager(PeripheralManagerCallback::CentralConnected(central));
    }

    /// A remote central goes away.
    pub fn remote_disconnect(&self, central: DeviceId) {
        self.fire_manager(PeripheralManagerCallback::CentralDisconnected(central));
    }

    /// A remote central finishes discovering our services.
    pub fn remote_discovery(&self, central: DeviceId, error: Option<Error>) {
        self.fire_manager(PeripheralManagerCallback::ServicesDiscoveredByRemote { central, error });
    }

    /// Refuse every subsequent request with `error` (or accept again with `None`).
    pub fn fail_requests_with(&self, error: Option<HardwareError>) {
        self.inner.lock().failure = error;
    }

    /// Requests admitted so far.
    pub fn requests(&self) -> Vec<Request> {
        self.inner.lock().requests.clone()
    }

    /// Requests admitted so far, clearing the log.
    pub fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut self.inner.lock().requests)
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scan_filter.is_some()
    }

    /// Check if advertising was requested and not stopped.
    pub fn is_advertising(&self) -> bool {
        self.inner.lock().advertising.is_some()
    }

    /// Check if a central delegate is installed.
    pub fn has_central_delegate(&self) -> bool {
        self.inner.lock().central.is_some()
    }

    /// Check if a delegate is installed for `device`.
    pub fn has_peripheral_delegate(&self, device: &DeviceId) -> bool {
        self.inner.lock().peripherals.contains_key(device)
    }

    /// Check if a peripheral-manager delegate is installed.
    pub fn has_manager_delegate(&self) -> bool {
        self.inner.lock().manager.is_some()
    }

    /// Fail the connect tagged `token` with [`Error::Timeout`] after `limit`.
    fn arm_connect_timeout(&self, device: DeviceId, token: u64, limit: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to time connect to {}, timeout ignored", device);
            return;
        };
        let inner = Arc::downgrade(&self.inner);

        runtime.spawn(async move {
            tokio::time::sleep(limit).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let sink = {
                let mut inner = inner.lock();
                if inner.connects.get(&device) != Some(&token) {
                    return;
                }
                inner.connects.remove(&device);
                inner.central.clone()
            };
            debug!("Simulated connect to {} timed out after {:?}", device, limit);
            if let Some(sink) = sink {
                sink(CentralCallback::ConnectFailed {
                    device,
                    error: Error::Timeout,
                });
            }
        });
    }

    fn fire_central(&self, callback: CentralCallback) {
        let sink = self.inner.lock().central.clone();
        match sink {
            Some(sink) => sink(callback),
            None => trace!("No central delegate for {:?}", callback),
        }
    }

    fn fire_peripheral(&self, device: DeviceId, callback: PeripheralCallback) {
        let sink = self.inner.lock().peripherals.get(&device).cloned();
        match sink {
            Some(sink) => sink(callback),
            None => trace!("No delegate for {}", device),
        }
    }

    fn fire_manager(&self, callback: PeripheralManagerCallback) {
        let sink = self.inner.lock().manager.clone();
        match sink {
            Some(sink) => sink(callback),
            None => trace!("No peripheral-manager delegate for {:?}", callback),
        }
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn power_state(&self) -> RadioState {
        self.inner.lock().radio
    }

    fn set_central_delegate(&self, sink: Option<CallbackSink<CentralCallback>>) {
        self.inner.lock().central = sink;
    }

    fn start_scan(&self, filter: &ServiceFilter) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.admit(Request::StartScan(filter.clone()))?;
        inner.scan_filter = Some(filter.clone());
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.admit(Request::StopScan)?;
        inner.scan_filter = None;
        Ok(())
    }

    /// Waits for `complete_connect` or `fail_connect`, or for the timeout.
    fn connect(&self, device: &DeviceId, options: &ConnectOptions) -> Result<()> {
        let token = {
            let mut inner = self.inner.lock();
            inner.admit(Request::Connect(*device, options.clone()))?;
            inner.next_connect += 1;
            let token = inner.next_connect;
            inner.connects.insert(*device, token);
            token
        };
        if let Some(limit) = options.timeout {
            self.arm_connect_timeout(*device, token, limit);
        }
        Ok(())
    }

    /// Cancelling always completes with a clean `Disconnected` callback.
    fn cancel_connection(&self, device: &DeviceId) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.admit(Request::CancelConnection(*device))?;
            inner.connects.remove(device);
        }
        self.fire_central(CentralCallback::Disconnected {
            device: *device,
            error: None,
        });
        Ok(())
    }

    fn set_peripheral_delegate(
        &self,
        device: &DeviceId,
        sink: Option<CallbackSink<PeripheralCallback>>,
    ) {
        let mut inner = self.inner.lock();
        match sink {
            Some(sink) => {
                inner.peripherals.insert(*device, sink);
            }
            None => {
                inner.peripherals.remove(device);
            }
        }
    }

    fn discover_services(&self, device: &DeviceId, filter: &ServiceFilter) -> Result<()> {
        self.inner
            .lock()
            .admit(Request::DiscoverServices(*device, filter.clone()))
    }
}

impl PeripheralManagerAdapter for SimulatedAdapter {
    fn power_state(&self) -> RadioState {
        self.inner.lock().radio
    }

    fn set_delegate(&self, sink: Option<CallbackSink<PeripheralManagerCallback>>) {
        self.inner.lock().manager = sink;
    }

    fn add_service(&self, service: &ServiceDescriptor) -> Result<()> {
        self.inner
            .lock()
            .admit(Request::AddService(service.clone()))
    }

    fn start_advertising(&self, parameters: &AdvertisingParameters) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.admit(Request::StartAdvertising(parameters.clone()))?;
        inner.advertising = Some(parameters.clone());
        Ok(())
    }

    fn stop_advertising(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.admit(Request::StopAdvertising)?;
        inner.advertising = None;
        Ok(())
    }
}
