//! # Event dispatch
//!
//! The [`EventDispatcher`] is the single entry point for notifications coming
//! out of a [`Connection`](crate::connection::Connection). Session events
//! drive the connection state machine and fan out to the connecting,
//! connected and connection-lost watcher lists; node events fan out to the
//! watchers registered for their path.
//!
//! Watchers are persistent: they stay registered until their
//! [`Subscription`] is used to unsubscribe, and survive reconnects.
//!
//! Every dispatch iterates over a snapshot of the list taken when the pass
//! starts. A watcher added while a pass is running is first invoked on the
//! next pass, a watcher removed mid-pass is skipped if it has not run yet.
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};
use zkem_core::{reactor::panic_message, Reactor};

use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use crate::{
    error::ZkError,
    metrics,
    models::{ConnectionEvent, ConnectionState, NodeEvent, RawEvent, WatchEvent},
};

type Watcher<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

struct WatcherList<E> {
    name: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Watcher<E>)>>,
}

impl<E> WatcherList<E> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, watcher: Watcher<E>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, watcher));
        id
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        self.entries.lock().iter().any(|(entry, _)| *entry == id)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn dispatch(&self, event: &E) {
        let snapshot = self.entries.lock().clone();
        trace!(list = self.name, watchers = snapshot.len(), "dispatching");
        for (id, watcher) in snapshot {
            if !self.contains(id) {
                continue;
            }
            // a panicking watcher is logged, the rest still run
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| watcher(event))) {
                error!(
                    list = self.name,
                    panic = panic_message(&*panic),
                    "watcher panicked"
                );
            }
        }
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<E: 'static> Detach for WatcherList<E> {
    fn detach(&self, id: u64) -> bool {
        self.remove(id)
    }
}

/// Handle to a registered watcher
pub struct Subscription {
    list: Weak<dyn Detach>,
    id: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    fn new<E: 'static>(list: &Arc<WatcherList<E>>, id: u64) -> Self {
        let list: Arc<dyn Detach> = list.clone();
        Self {
            list: Arc::downgrade(&list),
            id,
        }
    }

    /// Stop the watcher from being invoked again. Returns false if it was
    /// already unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        match self.list.upgrade() {
            Some(list) => list.detach(self.id),
            None => false,
        }
    }
}

/// Demultiplexes raw notifications onto watcher lists.
///
/// Cheap to clone. All dispatching happens as jobs on the reactor.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    reactor: Reactor,
    state: Mutex<ConnectionState>,
    connecting: Arc<WatcherList<ConnectionState>>,
    connected: Arc<WatcherList<ConnectionState>>,
    lost: Arc<WatcherList<ZkError>>,
    nodes: Mutex<HashMap<String, Arc<WatcherList<NodeEvent>>>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("state", &*self.inner.state.lock())
            .field("connecting", &self.inner.connecting.len())
            .field("connected", &self.inner.connected.len())
            .field("connection_lost", &self.inner.lost.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(reactor: Reactor) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                reactor,
                state: Mutex::new(ConnectionState::Disconnected),
                connecting: Arc::new(WatcherList::new("connecting")),
                connected: Arc::new(WatcherList::new("connected")),
                lost: Arc::new(WatcherList::new("connection_lost")),
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Feed a raw notification in. Dispatch happens on a later reactor tick,
    /// in the order notifications were fed.
    pub fn process(&self, event: RawEvent) {
        let this = self.clone();
        self.inner.reactor.next_tick(move || this.handle(event));
    }

    fn handle(&self, raw: RawEvent) {
        match raw.classify() {
            Some(WatchEvent::Session(event)) => self.transition(event),
            Some(WatchEvent::Node(event)) => self.dispatch_node(event),
            None => warn!(?raw, "ignoring notification with unknown type or state"),
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = event.state();
        let prev = std::mem::replace(&mut *self.inner.state.lock(), next);
        metrics::ZK_STATE_TRANSITIONS
            .with_label_values(&[&next.to_string()])
            .inc();
        match event {
            ConnectionEvent::Connecting => {
                debug!(%prev, "connecting");
                self.inner.connecting.dispatch(&next);
            }
            ConnectionEvent::Connected => {
                info!(%prev, "connected");
                self.inner.connected.dispatch(&next);
            }
            ConnectionEvent::ConnectionLost(err) => {
                warn!(%prev, %err, "connection lost");
                self.inner.lost.dispatch(&err);
            }
        }
    }

    fn dispatch_node(&self, event: NodeEvent) {
        let list = {
            let mut nodes = self.inner.nodes.lock();
            let unwatched = nodes.get(&event.path).is_some_and(|list| list.is_empty());
            if unwatched {
                nodes.remove(&event.path);
                None
            } else {
                nodes.get(&event.path).cloned()
            }
        };
        match list {
            Some(list) => list.dispatch(&event),
            None => trace!(?event, "no watchers for node event"),
        }
    }

    /// An operation completed with a connection-level failure. Watchers of
    /// the connection-lost list fire if this is news, i.e. the last known
    /// state was connecting or connected. Must be called on the reactor.
    pub fn observe_connection_loss(&self, err: ZkError) {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.transition(ConnectionEvent::ConnectionLost(err));
        } else {
            trace!(%state, %err, "connection loss already reported");
        }
    }

    /// Back to `Disconnected`, watchers stay registered
    pub fn reset(&self) {
        *self.inner.state.lock() = ConnectionState::Disconnected;
    }

    /// last connection state seen
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Invoke `f` every time a connection attempt starts
    pub fn on_connecting<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let id = self.inner.connecting.add(Arc::new(f));
        Subscription::new(&self.inner.connecting, id)
    }

    /// Invoke `f` every time the session becomes usable
    pub fn on_connected<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let id = self.inner.connected.add(Arc::new(f));
        Subscription::new(&self.inner.connected, id)
    }

    /// Invoke `f` with the cause every time the connection is lost. Session
    /// expiry is reported here as [`ZkError::SessionExpired`].
    pub fn on_connection_lost<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ZkError) + Send + Sync + 'static,
    {
        let id = self.inner.lost.add(Arc::new(f));
        Subscription::new(&self.inner.lost, id)
    }

    /// Invoke `f` for node events on `path`. Watches still have to be armed
    /// per operation (see the `watch` flag on reads).
    pub fn on_node_event<F>(&self, path: impl Into<String>, f: F) -> Subscription
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        // paths nobody watches anymore are pruned here, and the new watcher
        // is added under the same lock so it can't land in a pruned list
        let mut nodes = self.inner.nodes.lock();
        nodes.retain(|_, list| !list.is_empty());
        let list = nodes
            .entry(path.into())
            .or_insert_with(|| Arc::new(WatcherList::new("node")))
            .clone();
        let id = list.add(Arc::new(f));
        Subscription::new(&list, id)
    }
}
