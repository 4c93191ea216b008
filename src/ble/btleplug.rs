//! [`HardwareAdapter`] backed by `btleplug`.
//!
//! btleplug is async while the adapter trait is not, so every request is
//! queued to one worker task. The worker also owns the adapter's event stream
//! and turns btleplug events into [`CentralCallback`]s. Connect and service
//! discovery run in their own tasks so a slow peripheral never stalls the
//! queue.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use btleplug::api::{
    Central, CentralEvent as BtleEvent, CentralState, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::adapter::{CallbackSink, CentralCallback, HardwareAdapter, PeripheralCallback};
use crate::ble::types::{
    AdvertisementData, ConnectOptions, DeviceId, RadioState, ServiceDescriptor, ServiceFilter,
};
use crate::error::{Error, HardwareError, Result};

enum Request {
    StartScan(ServiceFilter),
    StopScan,
    Connect(DeviceId, ConnectOptions),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId, ServiceFilter),
}

/// Two-way map between platform peripheral ids and [`DeviceId`]s.
#[derive(Debug)]
struct DeviceIds<K> {
    forward: HashMap<K, DeviceId>,
    reverse: HashMap<DeviceId, K>,
}

impl<K: Clone + Eq + Hash> Default for DeviceIds<K> {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> DeviceIds<K> {
    /// The device id for `key`, assigning a fresh one on first sight.
    fn assign(&mut self, key: &K) -> DeviceId {
        if let Some(device) = self.forward.get(key) {
            return *device;
        }
        let device = DeviceId::random();
        self.forward.insert(key.clone(), device);
        self.reverse.insert(device, key.clone());
        device
    }

    fn device(&self, key: &K) -> Option<DeviceId> {
        self.forward.get(key).copied()
    }

    fn key(&self, device: &DeviceId) -> Option<K> {
        self.reverse.get(device).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Connecting,
    Connected,
}

/// State shared between the adapter handle, the worker and its tasks.
struct Shared {
    radio: RwLock<RadioState>,
    central: RwLock<Option<CallbackSink<CentralCallback>>>,
    peripherals: RwLock<HashMap<DeviceId, CallbackSink<PeripheralCallback>>>,
    ids: RwLock<DeviceIds<PeripheralId>>,
    scan_filter: RwLock<Option<ServiceFilter>>,
    links: Mutex<HashMap<DeviceId, LinkPhase>>,
}

impl Shared {
    fn notify_central(&self, callback: CentralCallback) {
        let sink = self.central.read().clone();
        match sink {
            Some(sink) => sink(callback),
            None => trace!("No central delegate, dropping {:?}", callback),
        }
    }

    fn notify_peripheral(&self, device: DeviceId, callback: PeripheralCallback) {
        let sink = self.peripherals.read().get(&device).cloned();
        match sink {
            Some(sink) => sink(callback),
            None => trace!("No delegate for {}, dropping result", device),
        }
    }
}

/// Central-role adapter over the first Bluetooth adapter of this machine.
pub struct BtleplugAdapter {
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter and start the worker.
    ///
    /// The radio is assumed powered on until the stack reports otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if no adapter can be opened.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Drive a specific btleplug adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter's event stream cannot be opened.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let events = adapter.events().await?;

        let shared = Arc::new(Shared {
            radio: RwLock::new(RadioState::PoweredOn),
            central: RwLock::new(None),
            peripherals: RwLock::new(HashMap::new()),
            ids: RwLock::new(DeviceIds::default()),
            scan_filter: RwLock::new(None),
            links: Mutex::new(HashMap::new()),
        });
        let (requests, rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(Worker {
            adapter,
            shared: shared.clone(),
        }
        .run(rx, events));

        Ok(Self {
            requests,
            shared,
            worker,
        })
    }

    fn submit(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::BluetoothUnavailable)
    }

    fn require_known(&self, device: &DeviceId) -> Result<()> {
        if self.shared.ids.read().key(device).is_none() {
            return Err(Error::UnknownDevice { device: *device });
        }
        Ok(())
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl HardwareAdapter for BtleplugAdapter {
    fn power_state(&self) -> RadioState {
        *self.shared.radio.read()
    }

    fn set_central_delegate(&self, sink: Option<CallbackSink<CentralCallback>>) {
        *self.shared.central.write() = sink;
    }

    fn start_scan(&self, filter: &ServiceFilter) -> Result<()> {
        self.submit(Request::StartScan(filter.clone()))
    }

    fn stop_scan(&self) -> Result<()> {
        self.submit(Request::StopScan)
    }

    fn connect(&self, device: &DeviceId, options: &ConnectOptions) -> Result<()> {
        self.require_known(device)?;
        self.submit(Request::Connect(*device, options.clone()))
    }

    fn cancel_connection(&self, device: &DeviceId) -> Result<()> {
        self.require_known(device)?;
        self.submit(Request::CancelConnection(*device))
    }

    fn set_peripheral_delegate(
        &self,
        device: &DeviceId,
        sink: Option<CallbackSink<PeripheralCallback>>,
    ) {
        let mut peripherals = self.shared.peripherals.write();
        match sink {
            Some(sink) => {
                peripherals.insert(*device, sink);
            }
            None => {
                peripherals.remove(device);
            }
        }
    }

    fn discover_services(&self, device: &DeviceId, filter: &ServiceFilter) -> Result<()> {
        self.require_known(device)?;
        self.submit(Request::DiscoverServices(*device, filter.clone()))
    }
}

struct Worker {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = BtleEvent> + Send>>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Adapter event stream ended");
                        break;
                    }
                },
            }
        }
        debug!("btleplug worker ended");
    }

    async fn handle_request(&self, request: Request) {
        match request {
            Request::StartScan(filter) => {
                *self.shared.scan_filter.write() = Some(filter.clone());
                let scan_filter = ScanFilter {
                    services: filter
                        .services()
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default(),
                };
                info!("Starting BLE scan");
                if let Err(e) = self.adapter.start_scan(scan_filter).await {
                    error!("Failed to start scan: {}", e);
                    *self.shared.scan_filter.write() = None;
                    self.shared.notify_central(CentralCallback::ScanFailed(e.into()));
                }
            }
            Request::StopScan => {
                *self.shared.scan_filter.write() = None;
                info!("Stopping BLE scan");
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            Request::Connect(device, options) => {
                let Some(peripheral) = self.peripheral(&device).await else {
                    self.shared.notify_central(CentralCallback::ConnectFailed {
                        device,
                        error: Error::UnknownDevice { device },
                    });
                    return;
                };
                self.shared.links.lock().insert(device, LinkPhase::Connecting);
                tokio::spawn(connect(self.shared.clone(), device, peripheral, options));
            }
            Request::CancelConnection(device) => {
                self.shared.links.lock().remove(&device);
                let peripheral = self.peripheral(&device).await;
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    let error = match peripheral {
                        Some(peripheral) => peripheral.disconnect().await.err().map(Error::from),
                        None => None,
                    };
                    if let Some(e) = &error {
                        warn!("Disconnect from {} failed: {}", device, e);
                    }
                    shared.notify_central(CentralCallback::Disconnected { device, error });
                });
            }
            Request::DiscoverServices(device, filter) => {
                let Some(peripheral) = self.peripheral(&device).await else {
                    self.shared.notify_peripheral(
                        device,
                        PeripheralCallback::ServicesDiscovered(Err(Error::NotConnected)),
                    );
                    return;
                };
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    let result = discover(&peripheral, &filter).await;
                    shared.notify_peripheral(device, PeripheralCallback::ServicesDiscovered(result));
                });
            }
        }
    }

    async fn handle_event(&self, event: BtleEvent) {
        match event {
            BtleEvent::StateUpdate(state) => {
                let radio = radio_state(state);
                let changed = {
                    let mut current = self.shared.radio.write();
                    std::mem::replace(&mut *current, radio) != radio
                };
                if !changed {
                    return;
                }
                debug!("Adapter state: {}", radio);
                if !radio.is_powered_on() {
                    *self.shared.scan_filter.write() = None;
                    self.shared.links.lock().clear();
                }
                self.shared.notify_central(CentralCallback::StateChanged(radio));
            }
            BtleEvent::DeviceDiscovered(id)
            | BtleEvent::DeviceUpdated(id)
            | BtleEvent::ManufacturerDataAdvertisement { id, .. }
            | BtleEvent::ServiceDataAdvertisement { id, .. }
            | BtleEvent::ServicesAdvertisement { id, .. } => {
                self.report_advertisement(id).await;
            }
            BtleEvent::DeviceConnected(id) => {
                trace!("Device connected: {:?}", id);
            }
            BtleEvent::DeviceDisconnected(id) => {
                let Some(device) = self.shared.ids.read().device(&id) else {
                    return;
                };
                if self.shared.links.lock().remove(&device).is_some() {
                    info!("Link to {} lost", device);
                    self.shared.notify_central(CentralCallback::Disconnected {
                        device,
                        error: Some(HardwareError::msg("connection lost").into()),
                    });
                }
            }
            #[allow(unreachable_patterns)]
            other => trace!("Ignoring adapter event {:?}", other),
        }
    }

    async fn report_advertisement(&self, id: PeripheralId) {
        let Some(filter) = self.shared.scan_filter.read().clone() else {
            return;
        };

        let peripheral = match self.adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };
        let Some(rssi) = properties.rssi else {
            trace!("Sighting of {:?} without RSSI", id);
            return;
        };
        if !filter.matches(&properties.services) {
            return;
        }

        let device = self.shared.ids.write().assign(&id);
        self.shared.notify_central(CentralCallback::Advertisement {
            device,
            name: properties.local_name.clone(),
            data: advertisement(&properties),
            rssi,
        });
    }

    async fn peripheral(&self, device: &DeviceId) -> Option<Peripheral> {
        let id = self.shared.ids.read().key(device)?;
        match self.adapter.peripheral(&id).await {
            Ok(p) => Some(p),
            Err(e) => {
                debug!("Peripheral {} unavailable: {}", device, e);
                None
            }
        }
    }
}

async fn connect(
    shared: Arc<Shared>,
    device: DeviceId,
    peripheral: Peripheral,
    options: ConnectOptions,
) {
    debug!("Connecting to {} (timeout {:?})", device, options.timeout);
    let result = match options.timeout {
        Some(limit) => match tokio::time::timeout(limit, peripheral.connect()).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout),
        },
        None => peripheral.connect().await.map_err(Error::from),
    };

    match result {
        Ok(()) => {
            let wanted = match shared.links.lock().get_mut(&device) {
                Some(phase) => {
                    *phase = LinkPhase::Connected;
                    true
                }
                None => false,
            };
            if !wanted {
                debug!("Connect to {} completed after cancel, disconnecting", device);
                let _ = peripheral.disconnect().await;
                return;
            }
            info!("Connected to {}", device);
            shared.notify_central(CentralCallback::Connected(device));
        }
        Err(error) => {
            if error == Error::Timeout {
                let _ = peripheral.disconnect().await;
            }
            if shared.links.lock().remove(&device).is_some() {
                warn!("Connect to {} failed: {}", device, error);
                shared.notify_central(CentralCallback::ConnectFailed { device, error });
            }
        }
    }
}

async fn discover(peripheral: &Peripheral, filter: &ServiceFilter) -> Result<Vec<ServiceDescriptor>> {
    peripheral.discover_services().await?;
    let wanted: Option<HashSet<_>> = filter.services().map(|s| s.iter().copied().collect());
    Ok(peripheral
        .services()
        .into_iter()
        .filter(|service| wanted.as_ref().map_or(true, |w| w.contains(&service.uuid)))
        .map(|service| ServiceDescriptor {
            uuid: service.uuid,
            primary: service.primary,
        })
        .collect())
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        #[allow(unreachable_patterns)]
        _ => RadioState::Unknown,
    }
}

fn advertisement(properties: &PeripheralProperties) -> AdvertisementData {
    AdvertisementData {
        manufacturer_data: properties
            .manufacturer_data
            .iter()
            .map(|(id, data)| (*id, Bytes::copy_from_slice(data)))
            .collect(),
        service_data: properties
            .service_data
            .iter()
            .map(|(uuid, data)| (*uuid, Bytes::copy_from_slice(data)))
            .collect(),
        services: properties.services.clone(),
        tx_power_level: properties.tx_power_level,
    }
}
