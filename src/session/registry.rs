//! Keyed storage for live hardware sessions.
//!
//! Every session (central, one per connected peripheral, peripheral manager)
//! lives in a [`SessionRegistry`] under a caller-assigned [`SessionId`]. The
//! record owns the callback handle that keeps the adapter delegate installed,
//! the role-specific hardware state, and the sending half of the session's
//! event stream. Dropping a record releases all three.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::adapter::CallbackSink;
use crate::ble::types::DeviceId;
use crate::error::{Error, Result};

/// Caller-assigned identifier of one logical session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionId(String);

impl SessionId {
    /// Create a session identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Identifier of the session bound to a connected device.
    pub fn peripheral(device: &DeviceId) -> Self {
        Self(format!("peripheral-{}", device))
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle that removes an installed callback when dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("armed", &self.unregister_fn.is_some())
            .finish()
    }
}

/// Sending half of a session event stream.
///
/// Clones share one underlying channel; [`EventSink::close`] ends the stream
/// for every clone at once.
pub struct EventSink<E> {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    /// Create a connected sink/stream pair.
    pub fn channel() -> (EventSink<E>, EventStream<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            EventStream { rx },
        )
    }

    /// Deliver an event. Returns `false` if the stream is closed.
    pub fn send(&self, event: E) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Signal end-of-stream to the listener.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Check if the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Receiving half of a session event stream.
///
/// Yields events in the order the session emitted them and ends once the
/// session is destroyed.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
    /// Take the next already-delivered event without waiting.
    pub fn try_next(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.rx.poll_recv(cx)
    }
}

/// Per-session resources owned by the registry.
pub struct SessionRecord<H, E> {
    callback: CallbackHandle,
    hardware: H,
    emitter: EventSink<E>,
}

impl<H, E> SessionRecord<H, E> {
    /// Role-specific hardware state.
    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Mutable role-specific hardware state.
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    /// Emit an event on this session's stream.
    pub fn emit(&self, event: E) {
        if !self.emitter.send(event) {
            trace!("Event dropped, listener gone");
        }
    }

    fn close(self) {
        self.emitter.close();
        drop(self.callback);
    }
}

/// Thread-safe map from [`SessionId`] to live session records.
///
/// Hardware callbacks and command issuance may run on different threads; all
/// lookups, inserts and removals go through one mutex. Closures passed to
/// [`SessionRegistry::with_record`] run under that mutex and must not call
/// back into the adapter.
pub struct SessionRegistry<H, E> {
    records: Mutex<HashMap<SessionId, SessionRecord<H, E>>>,
    callback_counter: AtomicU64,
}

impl<H, E> Default for SessionRegistry<H, E> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            callback_counter: AtomicU64::new(0),
        }
    }
}

impl<H, E> SessionRegistry<H, E>
where
    H: Send + 'static,
    E: Send + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return the listening end of its event stream.
    ///
    /// `callback` is only invoked once the id is known to be free, so a
    /// rejected create never builds (or drops) a callback handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSession`] if `id` is already live.
    pub fn create(
        &self,
        id: SessionId,
        hardware: H,
        callback: impl FnOnce(u64) -> CallbackHandle,
    ) -> Result<EventStream<E>> {
        self.create_exclusive(id, hardware, |_, _| false, callback)
    }

    /// Like [`create`](Self::create), but refuse while another live session
    /// for which `conflicts` holds exists. Checked under the registry lock.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSession`] if `id` is already live.
    /// - [`Error::AdapterInUse`] naming the conflicting session.
    pub fn create_exclusive(
        &self,
        id: SessionId,
        hardware: H,
        conflicts: impl Fn(&SessionId, &H) -> bool,
        callback: impl FnOnce(u64) -> CallbackHandle,
    ) -> Result<EventStream<E>> {
        let mut records = self.records.lock();
        if records.contains_key(&id) {
            return Err(Error::DuplicateSession { id });
        }
        if let Some(other) = records
            .iter()
            .find(|(other, record)| conflicts(other, &record.hardware))
            .map(|(other, _)| other.clone())
        {
            return Err(Error::AdapterInUse { id: other });
        }

        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let (emitter, stream) = EventSink::channel();
        records.insert(
            id.clone(),
            SessionRecord {
                callback: callback(callback_id),
                hardware,
                emitter,
            },
        );

        debug!("Session {} registered (callback {})", id, callback_id);
        Ok(stream)
    }

    /// Remove a session, release its callback and end its event stream.
    ///
    /// Idempotent: returns `false` if nothing was registered under `id`.
    pub fn destroy(&self, id: &SessionId) -> bool {
        // Release outside the lock: unregistering may call into the adapter.
        let removed = self.records.lock().remove(id);

        match removed {
            Some(record) => {
                record.close();
                debug!("Session {} destroyed", id);
                true
            }
            None => {
                trace!("Destroy for absent session {}, ignoring", id);
                false
            }
        }
    }

    /// Run `f` against the record for `id` while holding the registry lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if `id` is not live.
    pub fn with_record<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionRecord<H, E>) -> R,
    ) -> Result<R> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound { id: id.clone() })?;
        Ok(f(record))
    }

    /// Check if a session is live.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.records.lock().contains_key(id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Check if no session is live.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Identifiers of all live sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.records.lock().keys().cloned().collect()
    }

    /// Build the callback sink installed on the adapter for session `id`.
    ///
    /// The sink holds the registry weakly; callbacks that arrive after the
    /// session (or the registry) is gone are dropped.
    pub fn callback_sink<C, F>(self: &Arc<Self>, id: SessionId, handler: F) -> CallbackSink<C>
    where
        C: Send + 'static,
        F: Fn(&mut SessionRecord<H, E>, C) + Send + Sync + 'static,
    {
        let registry: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |callback: C| {
            let Some(registry) = registry.upgrade() else {
                trace!("Callback for {} after registry dropped", id);
                return;
            };
            if registry
                .with_record(&id, |record| handler(record, callback))
                .is_err()
            {
                trace!("Callback for destroyed session {}, dropping", id);
            }
        })
    }
}

impl<H: Clone, E> SessionRegistry<H, E> {
    /// Clone the hardware state of a live session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if `id` is not live.
    pub fn lookup(&self, id: &SessionId) -> Result<H> {
        self.records
            .lock()
            .get(id)
            .map(|record| record.hardware.clone())
            .ok_or_else(|| Error::SessionNotFound { id: id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;

    type TestRegistry = SessionRegistry<u32, &'static str>;

    fn counting_handle(counter: &Arc<AtomicUsize>) -> impl FnOnce(u64) -> CallbackHandle {
        let counter = counter.clone();
        move |id| {
            CallbackHandle::new(id, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let registry = TestRegistry::new();
        let released = Arc::new(AtomicUsize::new(0));

        let _stream = registry
            .create(SessionId::new("a"), 7, counting_handle(&released))
            .unwrap();

        assert_eq!(registry.lookup(&SessionId::new("a")).unwrap(), 7);
        assert!(registry.contains(&SessionId::new("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_create_keeps_original() {
        let registry = TestRegistry::new();
        let released = Arc::new(AtomicUsize::new(0));
        let id = SessionId::new("dup");

        let _stream = registry
            .create(id.clone(), 1, counting_handle(&released))
            .unwrap();
        let err = registry
            .create(id.clone(), 2, counting_handle(&released))
            .unwrap_err();

        assert_eq!(err, Error::DuplicateSession { id: id.clone() });
        assert_eq!(registry.lookup(&id).unwrap(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exclusive_create_names_conflicting_session() {
        let registry = TestRegistry::new();
        let released = Arc::new(AtomicUsize::new(0));
        let _a = registry
            .create(SessionId::new("a"), 1, counting_handle(&released))
            .unwrap();

        let err = registry
            .create_exclusive(
                SessionId::new("b"),
                1,
                |_, other| *other == 1,
                counting_handle(&released),
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::AdapterInUse {
                id: SessionId::new("a")
            }
        );
        assert!(!registry.contains(&SessionId::new("b")));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let _c = registry
            .create_exclusive(
                SessionId::new("c"),
                2,
                |_, other| *other == 2,
                counting_handle(&released),
            )
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = TestRegistry::new();
        let err = registry.lookup(&SessionId::new("missing")).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_ends_stream() {
        let registry = TestRegistry::new();
        let released = Arc::new(AtomicUsize::new(0));
        let id = SessionId::new("s");

        let mut stream = registry
            .create(id.clone(), 0, counting_handle(&released))
            .unwrap();
        registry
            .with_record(&id, |record| record.emit("hello"))
            .unwrap();

        assert!(registry.destroy(&id));
        assert!(!registry.destroy(&id));

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert_eq!(stream.next().await, Some("hello"));
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn test_callback_sink_routes_to_record() {
        let registry = Arc::new(TestRegistry::new());
        let released = Arc::new(AtomicUsize::new(0));
        let id = SessionId::new("sink");

        let mut stream = registry
            .create(id.clone(), 0, counting_handle(&released))
            .unwrap();
        let sink = registry.callback_sink(id.clone(), |record, value: u32| {
            *record.hardware_mut() += value;
            record.emit("bumped");
        });

        sink(3);
        sink(4);
        assert_eq!(registry.lookup(&id).unwrap(), 7);
        assert_eq!(stream.try_next(), Some("bumped"));
        assert_eq!(stream.try_next(), Some("bumped"));

        registry.destroy(&id);
        sink(100);
        assert!(registry.lookup(&id).is_err());
    }

    #[test]
    fn test_stream_wakes_on_emit() {
        let registry = TestRegistry::new();
        let released = Arc::new(AtomicUsize::new(0));
        let id = SessionId::new("wake");

        let mut stream = registry
            .create(id.clone(), 0, counting_handle(&released))
            .unwrap();
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());

        registry
            .with_record(&id, |record| record.emit("ping"))
            .unwrap();
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some("ping"));
    }

    #[test]
    fn test_callback_handle_unregister_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = counting_handle(&counter)(9);
        assert_eq!(handle.id(), 9);
        handle.unregister();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_sink_close_shared_by_clones() {
        let (sink, mut stream) = EventSink::<u8>::channel();
        let other = sink.clone();
        assert!(other.send(1));
        sink.close();
        assert!(!other.send(2));
        assert!(other.is_closed());
        assert_eq!(stream.try_next(), Some(1));
        assert_eq!(stream.try_next(), None);
    }

    #[test]
    fn test_peripheral_session_id() {
        let device = DeviceId::from_uuid(Uuid::nil());
        assert_eq!(
            SessionId::peripheral(&device).as_str(),
            "peripheral-00000000-0000-0000-0000-000000000000"
        );
    }
}
