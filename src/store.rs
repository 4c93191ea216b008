//! Serialized runtime around the reducer.
//!
//! A [`Store`] owns one ordered action channel. User intents and every session
//! event stream feed into it; a single background task pops actions, runs
//! [`reduce`], executes the resulting commands against the sessions and
//! publishes the new state. Application state is only ever touched by that
//! task, so it needs no locking beyond the published snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::ble::adapter::{HardwareAdapter, PeripheralManagerAdapter};
use crate::ble::btleplug::BtleplugAdapter;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::reducer::{reduce, Action, AppState, Command, Intent, Reduced};
use crate::session::{
    CentralSession, EventStream, OperationCounter, PendingOperation, PeripheralManagerSession,
    PeripheralSession, SessionId, SessionRegistry,
};

/// An intent the reducer refused, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// The refused intent.
    pub intent: Intent,
    /// Why it was refused.
    pub error: Error,
}

enum Envelope {
    Action(Action),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running BLE session store.
///
/// Dropping the store stops its background task and tears down all sessions.
pub struct Store {
    /// Ordered input channel of the reducer loop.
    actions: mpsc::UnboundedSender<Envelope>,
    /// Most recently published state.
    snapshot: Arc<RwLock<AppState>>,
    /// State change channel.
    state_tx: broadcast::Sender<AppState>,
    /// Rejected intent channel.
    rejection_tx: broadcast::Sender<Rejection>,
    /// Reducer loop handle.
    background_handle: RwLock<Option<JoinHandle<()>>>,
}

impl Store {
    /// Start a store driving the central role only.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(adapter: Arc<dyn HardwareAdapter>, config: StoreConfig) -> Self {
        Self::spawn(adapter, None, config)
    }

    /// Start a store driving both the central and the advertiser role.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_peripheral_manager(
        adapter: Arc<dyn HardwareAdapter>,
        peripheral_manager: Arc<dyn PeripheralManagerAdapter>,
        config: StoreConfig,
    ) -> Self {
        Self::spawn(adapter, Some(peripheral_manager), config)
    }

    /// Start a store on the first Bluetooth adapter of this machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no usable adapter.
    pub async fn with_btleplug(config: StoreConfig) -> Result<Self> {
        let adapter = BtleplugAdapter::new().await?;
        Ok(Self::new(Arc::new(adapter), config))
    }

    fn spawn(
        adapter: Arc<dyn HardwareAdapter>,
        peripheral_manager: Option<Arc<dyn PeripheralManagerAdapter>>,
        config: StoreConfig,
    ) -> Self {
        let (actions, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(config.event_capacity);
        let (rejection_tx, _) = broadcast::channel(config.event_capacity);
        let snapshot = Arc::new(RwLock::new(AppState::default()));

        // Operation ids are unique across every role of this store
        let operations = Arc::new(OperationCounter::new());
        let central = CentralSession::with_registry(
            adapter.clone(),
            Arc::new(SessionRegistry::new()),
            operations.clone(),
        );
        let peripherals = PeripheralSession::with_registry(
            adapter,
            Arc::new(SessionRegistry::new()),
            operations.clone(),
        );
        let peripheral_manager = peripheral_manager.map(|adapter| {
            PeripheralManagerSession::with_registry(
                adapter,
                Arc::new(SessionRegistry::new()),
                operations,
            )
        });

        let runtime = Runtime {
            config,
            state: AppState::default(),
            central,
            peripherals,
            peripheral_manager,
            actions: actions.clone(),
            forwarders: HashMap::new(),
            snapshot: snapshot.clone(),
            state_tx: state_tx.clone(),
            rejection_tx: rejection_tx.clone(),
        };
        let handle = tokio::spawn(runtime.run(rx));

        info!("Store started");
        Self {
            actions,
            snapshot,
            state_tx,
            rejection_tx,
            background_handle: RwLock::new(Some(handle)),
        }
    }

    /// Submit a user intent. It is reduced after everything already queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the store has been shut down.
    pub fn send(&self, intent: Intent) -> Result<()> {
        debug!("Intent submitted: {:?}", intent);
        self.actions
            .send(Envelope::Action(Action::Intent(intent)))
            .map_err(|_| Error::Internal("store is shut down".to_string()))
    }

    /// The most recently published state.
    pub fn state(&self) -> AppState {
        self.snapshot.read().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<AppState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to rejected intents.
    pub fn subscribe_rejections(&self) -> broadcast::Receiver<Rejection> {
        self.rejection_tx.subscribe()
    }

    /// Wait until the published state satisfies `predicate`, and return it.
    pub async fn wait_until<F>(&self, mut predicate: F) -> AppState
    where
        F: FnMut(&AppState) -> bool,
    {
        let mut rx = self.state_tx.subscribe();
        let current = self.state();
        if predicate(&current) {
            return current;
        }

        loop {
            match rx.recv().await {
                Ok(state) if predicate(&state) => return state,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!("State subscriber lagged by {}", skipped);
                    let current = self.state();
                    if predicate(&current) {
                        return current;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return self.state(),
            }
        }
    }

    /// Tear down every session and stop the background task.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down store");

        let (done_tx, done_rx) = oneshot::channel();
        if self.actions.send(Envelope::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }

        let handle = self.background_handle.write().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Internal(format!("store task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let (done_tx, _) = oneshot::channel();
        let _ = self.actions.send(Envelope::Shutdown(done_tx));
    }
}

/// State owned by the reducer loop.
struct Runtime {
    config: StoreConfig,
    state: AppState,
    central: CentralSession,
    peripherals: PeripheralSession,
    peripheral_manager: Option<PeripheralManagerSession>,
    actions: mpsc::UnboundedSender<Envelope>,
    forwarders: HashMap<SessionId, JoinHandle<()>>,
    snapshot: Arc<RwLock<AppState>>,
    state_tx: broadcast::Sender<AppState>,
    rejection_tx: broadcast::Sender<Rejection>,
}

impl Runtime {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Action(action) => self.dispatch(action),
                Envelope::Shutdown(done) => {
                    self.dispatch(Action::Intent(Intent::Disappear));
                    for (_, forwarder) in self.forwarders.drain() {
                        forwarder.abort();
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("Store loop ended");
    }

    /// Reduce one action and everything its commands feed back.
    fn dispatch(&mut self, action: Action) {
        let mut queue = VecDeque::from([action]);

        while let Some(action) = queue.pop_front() {
            trace!("Reducing {:?}", action);
            let intent = match &action {
                Action::Intent(intent) => Some(intent.clone()),
                _ => None,
            };

            let Reduced {
                commands,
                rejection,
            } = reduce(&mut self.state, action, &self.config);

            if let (Some(intent), Some(error)) = (intent, rejection) {
                let _ = self.rejection_tx.send(Rejection { intent, error });
            }

            for command in commands {
                match self.execute(&command) {
                    Ok(Some(started)) => queue.push_back(started),
                    Ok(None) => {}
                    Err(error) => {
                        error!("Session refused {:?}: {}", command, error);
                        queue.push_back(Action::CommandFailed { command, error });
                    }
                }
            }
        }

        self.publish();
    }

    /// Run one command against the sessions.
    ///
    /// Returns the action reporting what the session accepted, if the
    /// reducer needs it to match a later outcome.
    fn execute(&mut self, command: &Command) -> Result<Option<Action>> {
        debug!("Executing {:?}", command);

        let pending = match command {
            Command::CreateCentral { id } => {
                let stream = self.central.create(id.clone())?;
                self.forward(id.clone(), stream, Action::Central);
                None
            }
            Command::DestroyCentral { id } => {
                self.central.destroy(id);
                self.unforward(id);
                None
            }
            Command::StartScan { id, filter } => {
                return Ok(self
                    .central
                    .start_scan(id, filter)?
                    .map(|epoch| Action::ScanStarted { epoch }));
            }
            Command::StopScan { id } => {
                self.central.stop_scan(id)?;
                None
            }
            Command::Connect {
                id,
                device,
                options,
            } => Some(self.central.connect(id, device, options)?),
            Command::CancelConnection { id } => {
                self.central.cancel_connection(id)?;
                None
            }
            Command::CreatePeripheral { id, device } => {
                let stream = self.peripherals.create(id.clone(), *device)?;
                let device = *device;
                self.forward(id.clone(), stream, move |event| Action::Peripheral {
                    device,
                    event,
                });
                None
            }
            Command::DestroyPeripheral { id } => {
                self.peripherals.destroy(id);
                self.unforward(id);
                None
            }
            Command::DiscoverServices { id, filter } => {
                Some(self.peripherals.discover_services(id, filter)?)
            }
            Command::CreatePeripheralManager { id } => {
                let stream = self.peripheral_manager()?.create(id.clone())?;
                self.forward(id.clone(), stream, Action::PeripheralManager);
                None
            }
            Command::DestroyPeripheralManager { id } => {
                if let Some(manager) = &self.peripheral_manager {
                    manager.destroy(id);
                }
                self.unforward(id);
                None
            }
            Command::AddService { id, service } => {
                Some(self.peripheral_manager()?.add_service(id, service)?)
            }
            Command::StartAdvertising { id, parameters } => self
                .peripheral_manager()?
                .start_advertising(id, parameters)?,
            Command::StopAdvertising { id } => {
                self.peripheral_manager()?.stop_advertising(id)?;
                None
            }
        };

        Ok(pending.map(|pending: PendingOperation| {
            debug!("{:?} pending as {}", pending.kind(), pending.id());
            Action::OperationStarted(pending)
        }))
    }

    fn peripheral_manager(&self) -> Result<&PeripheralManagerSession> {
        self.peripheral_manager
            .as_ref()
            .ok_or_else(|| Error::NotSupported {
                operation: "advertiser role without a peripheral-manager adapter".to_string(),
            })
    }

    /// Pump a session's events into the action channel until it ends.
    fn forward<E, F>(&mut self, id: SessionId, mut stream: EventStream<E>, wrap: F)
    where
        E: Send + 'static,
        F: Fn(E) -> Action + Send + 'static,
    {
        let actions = self.actions.clone();
        let name = id.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if actions.send(Envelope::Action(wrap(event))).is_err() {
                    break;
                }
            }
            trace!("Event stream of {} ended", name);
        });

        if self.forwarders.insert(id, handle).is_some() {
            debug!("Replaced forwarder of a recreated session");
        }
    }

    /// Drop the forwarder of a destroyed session.
    ///
    /// Destroying a session closes its stream, so the forwarder is left to
    /// drain what was already emitted and exit on its own.
    fn unforward(&mut self, id: &SessionId) {
        if self.forwarders.remove(id).is_some() {
            trace!("Forwarder of {} released", id);
        }
    }

    fn publish(&self) {
        if *self.snapshot.read() == self.state {
            return;
        }
        *self.snapshot.write() = self.state.clone();
        if self.state_tx.send(self.state.clone()).is_err() {
            trace!("No state subscribers");
        }
    }
}
