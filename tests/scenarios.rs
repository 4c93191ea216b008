//! End-to-end scenarios: a [`Store`] driving the simulated radio.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ble_session::ble::Request;
use ble_session::{
    AdvertisingParameters, AdvertisingStatus, AppState, ConnectOptions, ConnectionState, DeviceId,
    Error, HardwareAdapter, Intent, RadioState, Rejection, ServiceDescriptor, ServiceDiscoveryState,
    SimulatedAdapter, Store, StoreConfig,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting for the store")
}

struct Fixture {
    radio: Arc<SimulatedAdapter>,
    store: Store,
    rejections: broadcast::Receiver<Rejection>,
}

impl Fixture {
    async fn start(config: StoreConfig) -> Self {
        Self::start_with(SimulatedAdapter::powered_on(), config).await
    }

    async fn start_with(radio: SimulatedAdapter, config: StoreConfig) -> Self {
        init_tracing();
        let expected = HardwareAdapter::power_state(&radio);
        let radio = Arc::new(radio);
        let store = Store::with_peripheral_manager(radio.clone(), radio.clone(), config);
        let rejections = store.subscribe_rejections();

        store.send(Intent::Appear).unwrap();
        within(store.wait_until(|s| s.is_active && s.radio == expected)).await;
        Self {
            radio,
            store,
            rejections,
        }
    }

    async fn until(&self, predicate: impl FnMut(&AppState) -> bool) -> AppState {
        within(self.store.wait_until(predicate)).await
    }

    async fn rejected(&mut self) -> Rejection {
        within(self.rejections.recv()).await.unwrap()
    }

    async fn scanning(&self) {
        self.store.send(Intent::StartScan).unwrap();
        self.until(|s| s.is_scanning).await;
    }

    async fn discover(&self, name: &str, rssi: i16) -> DeviceId {
        let device = DeviceId::random();
        assert!(self.radio.advertise(device, Some(name), rssi));
        self.until(|s| s.discovered.contains_key(&device)).await;
        device
    }

    async fn connected(&self, device: DeviceId) {
        self.store.send(Intent::Connect(device)).unwrap();
        self.until(|s| s.is_connecting()).await;
        self.radio.complete_connect(device);
        self.until(|s| s.connected_device() == Some(device)).await;
    }

    fn count(&self, matches: impl Fn(&Request) -> bool) -> usize {
        self.radio.requests().iter().filter(|r| matches(r)).count()
    }
}

fn service(n: u128) -> ServiceDescriptor {
    ServiceDescriptor::primary(Uuid::from_u128(n))
}

#[tokio::test]
async fn scan_collects_devices_and_rescan_starts_fresh() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;

    let widget = f.discover("Widget", -50).await;
    let state = f.store.state();
    assert_eq!(state.discovered.len(), 1);
    assert_eq!(state.discovered[&widget].name.as_deref(), Some("Widget"));
    assert_eq!(state.discovered[&widget].rssi, -50);

    // A nameless sighting keeps the name and updates the signal
    f.radio.advertise(widget, None, -40);
    let state = f.until(|s| s.discovered[&widget].rssi == -40).await;
    assert_eq!(state.discovered[&widget].name.as_deref(), Some("Widget"));

    f.radio.take_requests();
    f.store.send(Intent::StartScan).unwrap();
    let state = f.until(|s| s.discovered.is_empty()).await;
    assert!(state.is_scanning);
    assert_eq!(
        f.radio.requests(),
        vec![
            Request::StopScan,
            Request::StartScan(StoreConfig::default().scan_filter)
        ]
    );
}

#[tokio::test]
async fn rescan_forgets_sightings_from_the_previous_scan() {
    let mut f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;

    // Heard by the first scan, possibly reduced only after the restart
    let stale = DeviceId::random();
    assert!(f.radio.advertise(stale, Some("Stale"), -50));
    f.store.send(Intent::StartScan).unwrap();
    f.until(|s| s.scan_epoch == Some(2)).await;

    let fresh = f.discover("Fresh", -60).await;
    let state = f.store.state();
    assert!(!state.discovered.contains_key(&stale));
    assert_eq!(state.discovered.len(), 1);
    assert!(state.discovered.contains_key(&fresh));

    f.store.send(Intent::Connect(stale)).unwrap();
    assert_eq!(
        f.rejected().await.error,
        Error::UnknownDevice { device: stale }
    );
    assert_eq!(f.count(|r| matches!(r, Request::Connect(..))), 0);
}

#[tokio::test]
async fn connect_then_discover_services() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;

    f.connected(device).await;
    assert!(f.radio.has_peripheral_delegate(&device));
    assert_eq!(
        f.store.state().connection_state(&device),
        ConnectionState::Connected
    );

    f.store.send(Intent::DiscoverServices).unwrap();
    f.until(|s| s.service_discovery.is_in_progress()).await;
    f.radio
        .complete_discovery(device, vec![service(0x1), service(0x2)]);

    let state = f
        .until(|s| matches!(s.service_discovery, ServiceDiscoveryState::Completed(_)))
        .await;
    assert_eq!(
        state.service_discovery,
        ServiceDiscoveryState::Completed(vec![service(0x1), service(0x2)])
    );
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn failed_discovery_is_reported() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    f.store.send(Intent::DiscoverServices).unwrap();
    f.until(|s| s.service_discovery.is_in_progress()).await;
    f.radio.fail_discovery(device, Error::Timeout);

    let state = f
        .until(|s| matches!(s.service_discovery, ServiceDiscoveryState::Failed(_)))
        .await;
    assert_eq!(
        state.service_discovery,
        ServiceDiscoveryState::Failed(Error::Timeout)
    );
    assert_eq!(state.last_error, Some(Error::Timeout));
}

#[tokio::test]
async fn radio_off_while_scanning_clears_scan() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;

    f.radio.set_power(RadioState::PoweredOff);
    let state = f.until(|s| s.radio == RadioState::PoweredOff).await;
    assert!(!state.is_scanning);
    assert!(!f.radio.is_scanning());
}

#[tokio::test]
async fn scan_on_powered_off_radio_is_rejected() {
    let mut f = Fixture::start_with(
        SimulatedAdapter::new(RadioState::PoweredOff),
        StoreConfig::default(),
    )
    .await;

    f.store.send(Intent::StartScan).unwrap();
    let rejection = f.rejected().await;
    assert_eq!(rejection.intent, Intent::StartScan);
    assert_eq!(
        rejection.error,
        Error::RadioNotReady {
            state: RadioState::PoweredOff
        }
    );
    assert!(f.radio.requests().is_empty());

    f.radio.set_power(RadioState::PoweredOn);
    f.until(|s| s.is_radio_ready()).await;
    f.scanning().await;
}

#[tokio::test]
async fn second_connect_is_rejected_while_first_resolves() {
    let mut f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let first = f.discover("First", -50).await;
    let second = f.discover("Second", -60).await;

    f.store.send(Intent::Connect(first)).unwrap();
    f.until(|s| s.is_connecting()).await;
    f.store.send(Intent::Connect(second)).unwrap();

    let rejection = f.rejected().await;
    assert_eq!(rejection.intent, Intent::Connect(second));
    assert_eq!(rejection.error, Error::AlreadyConnecting { device: first });

    f.radio.complete_connect(first);
    f.until(|s| s.connected_device() == Some(first)).await;
    assert_eq!(f.count(|r| matches!(r, Request::Connect(..))), 1);
}

#[tokio::test]
async fn connect_to_unknown_device_changes_nothing() {
    let mut f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    f.discover("Widget", -50).await;
    let before = f.store.state();

    let stranger = DeviceId::random();
    f.store.send(Intent::Connect(stranger)).unwrap();

    let rejection = f.rejected().await;
    assert_eq!(rejection.error, Error::UnknownDevice { device: stranger });
    assert_eq!(f.store.state(), before);
    assert_eq!(f.count(|r| matches!(r, Request::Connect(..))), 0);
}

#[tokio::test]
async fn discovery_and_disconnect_need_a_link() {
    let mut f = Fixture::start(StoreConfig::default()).await;

    f.store.send(Intent::DiscoverServices).unwrap();
    assert_eq!(f.rejected().await.error, Error::NotConnected);

    f.store.send(Intent::Disconnect).unwrap();
    assert_eq!(f.rejected().await.error, Error::NotConnected);

    // Connecting is not connected yet
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.store.send(Intent::Connect(device)).unwrap();
    f.until(|s| s.is_connecting()).await;
    f.store.send(Intent::DiscoverServices).unwrap();
    assert_eq!(f.rejected().await.error, Error::NotConnected);
}

#[tokio::test]
async fn overlapping_discovery_is_rejected() {
    let mut f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    f.store.send(Intent::DiscoverServices).unwrap();
    f.store.send(Intent::DiscoverServices).unwrap();
    assert_eq!(f.rejected().await.error, Error::DiscoveryInProgress);
    assert_eq!(
        f.count(|r| matches!(r, Request::DiscoverServices(..))),
        1
    );

    f.radio.complete_discovery(device, vec![service(0x1)]);
    f.until(|s| matches!(s.service_discovery, ServiceDiscoveryState::Completed(_)))
        .await;
}

#[tokio::test]
async fn radio_loss_drops_the_connection() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    f.radio.set_power(RadioState::PoweredOff);
    let state = f.until(|s| s.connection.is_none()).await;

    assert_eq!(state.radio, RadioState::PoweredOff);
    assert_eq!(
        state.last_error,
        Some(Error::RadioNotReady {
            state: RadioState::PoweredOff
        })
    );
    assert_eq!(state.service_discovery, ServiceDiscoveryState::NotRequested);
    assert!(!f.radio.has_peripheral_delegate(&device));
}

#[tokio::test]
async fn lost_link_frees_the_slot() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    f.radio.drop_link(device, Error::Timeout);
    let state = f.until(|s| s.connection.is_none()).await;
    assert_eq!(state.last_error, Some(Error::Timeout));

    // The slot is free again
    f.connected(device).await;
}

#[tokio::test]
async fn disconnect_intent_releases_the_device() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    f.store.send(Intent::Disconnect).unwrap();
    let state = f.until(|s| s.connection.is_none()).await;

    assert!(state.last_error.is_none());
    assert!(!f.radio.has_peripheral_delegate(&device));
    assert_eq!(f.count(|r| *r == Request::CancelConnection(device)), 1);
}

#[tokio::test]
async fn failed_connect_is_reported() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;

    f.store.send(Intent::Connect(device)).unwrap();
    f.until(|s| s.is_connecting()).await;
    f.radio.fail_connect(device, Error::Timeout);

    let state = f.until(|s| s.connection.is_none()).await;
    assert_eq!(state.last_error, Some(Error::Timeout));
}

#[tokio::test]
async fn advertiser_starts_on_appear_and_tracks_centrals() {
    let parameters = AdvertisingParameters {
        local_name: Some("Beacon".to_string()),
        services: vec![service(0x180d)],
    };
    let f = Fixture::start(StoreConfig::default().with_advertising(parameters.clone())).await;

    f.until(|s| s.advertiser.status == AdvertisingStatus::Starting)
        .await;
    assert!(f.radio.has_manager_delegate());
    assert!(f.radio.is_advertising());
    assert_eq!(
        f.radio.requests(),
        vec![
            Request::AddService(service(0x180d)),
            Request::StartAdvertising(parameters)
        ]
    );

    f.radio.confirm_advertising(None);
    f.until(|s| s.advertiser.status == AdvertisingStatus::Advertising)
        .await;

    let central = DeviceId::random();
    f.radio.remote_connect(central);
    f.until(|s| s.advertiser.connected_centrals.contains(&central))
        .await;
    f.radio.remote_discovery(central, None);
    let state = f
        .until(|s| s.advertiser.last_remote_discovery.is_some())
        .await;
    assert_eq!(
        state.advertiser.last_remote_discovery.map(|d| d.central),
        Some(central)
    );

    f.radio.remote_disconnect(central);
    f.until(|s| s.advertiser.connected_centrals.is_empty())
        .await;

    f.store.send(Intent::StopAdvertising).unwrap();
    f.until(|s| s.advertiser.status == AdvertisingStatus::Idle)
        .await;
    assert!(!f.radio.is_advertising());
}

#[tokio::test]
async fn advertising_without_configuration_is_rejected() {
    let mut f = Fixture::start(StoreConfig::default()).await;

    f.store.send(Intent::StartAdvertising).unwrap();
    let rejection = f.rejected().await;
    assert!(matches!(rejection.error, Error::NotSupported { .. }));
    assert!(!f.radio.has_manager_delegate());
}

#[tokio::test]
async fn disappear_tears_down_and_is_idempotent() {
    let config = StoreConfig::default().with_advertising(AdvertisingParameters::default());
    let f = Fixture::start(config).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    f.store.send(Intent::Disappear).unwrap();
    f.store.send(Intent::Disappear).unwrap();
    let state = f.until(|s| !s.is_active).await;

    assert_eq!(state, AppState::default());
    assert!(!f.radio.has_central_delegate());
    assert!(!f.radio.has_peripheral_delegate(&device));
    assert!(!f.radio.has_manager_delegate());
    assert!(!f.radio.is_scanning());

    // Sessions can be brought up again under the same identifiers
    f.store.send(Intent::Appear).unwrap();
    f.until(|s| s.is_active && s.is_radio_ready()).await;
    assert!(f.radio.has_central_delegate());
    f.store.shutdown().await.unwrap();
}

#[tokio::test]
async fn discovery_after_reconnect_resolves_the_new_request() {
    let f = Fixture::start(StoreConfig::default()).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    f.store.send(Intent::DiscoverServices).unwrap();
    f.until(|s| s.service_discovery.is_in_progress()).await;
    f.radio.drop_link(device, Error::Timeout);
    f.until(|s| s.connection.is_none()).await;

    f.connected(device).await;
    f.store.send(Intent::DiscoverServices).unwrap();
    f.until(|s| s.service_discovery.is_in_progress()).await;
    f.radio.complete_discovery(device, vec![service(0x3)]);

    let state = f
        .until(|s| matches!(s.service_discovery, ServiceDiscoveryState::Completed(_)))
        .await;
    assert_eq!(
        state.service_discovery,
        ServiceDiscoveryState::Completed(vec![service(0x3)])
    );
    assert_eq!(
        f.count(|r| matches!(r, Request::DiscoverServices(..))),
        2
    );
}

fn connect_within(limit: Duration) -> StoreConfig {
    StoreConfig::default().with_connect_options(ConnectOptions {
        timeout: Some(limit),
        ..Default::default()
    })
}

#[tokio::test(start_paused = true)]
async fn unanswered_connect_times_out() {
    let f = Fixture::start(connect_within(Duration::from_millis(500))).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;

    let asked = tokio::time::Instant::now();
    f.store.send(Intent::Connect(device)).unwrap();
    f.until(|s| s.is_connecting()).await;

    let state = f.until(|s| s.connection.is_none()).await;
    assert_eq!(state.last_error, Some(Error::Timeout));
    assert!(asked.elapsed() >= Duration::from_millis(500));
    assert!(!f.radio.is_connecting(&device));
    assert!(!f.radio.has_peripheral_delegate(&device));

    // The slot is free again
    f.connected(device).await;
}

#[tokio::test(start_paused = true)]
async fn answered_connect_outlives_its_timeout() {
    let f = Fixture::start(connect_within(Duration::from_millis(500))).await;
    f.scanning().await;
    let device = f.discover("Widget", -50).await;
    f.connected(device).await;

    tokio::time::sleep(Duration::from_secs(1)).await;

    let state = f.store.state();
    assert_eq!(state.connected_device(), Some(device));
    assert_eq!(state.last_error, None);
}
