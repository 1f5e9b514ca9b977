//! # Client
//!
//! The composition root. A [`Client`] owns one [`Connection`], the reactor
//! every callback runs on, the [`EventDispatcher`] fed by the connection and
//! the [`Bridge`] operations go through.
//!
//! Every operation is offered twice: `op(..)` returns a [`Deferred`], and
//! `op_then(.., callback)` additionally runs `callback` with the whole
//! `ZkResult` right after the deferred's own continuations.
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;
use zkem_core::Reactor;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    bridge::{Bridge, Completion},
    connection::Connection,
    deferred::Deferred,
    error::{ZkError, ZkResult},
    events::{EventDispatcher, Subscription},
    models::{Acl, ConnectionState, NodeEvent, SessionInfo, Stat},
    ops::{Children, Create, Delete, Exists, Get, GetAcl, GetStat, Operation, Set, SetAcl},
};

/// Async coordination client with deferred and combined-callback surfaces
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    conn: Arc<dyn Connection>,
    reactor: Reactor,
    owns_reactor: bool,
    dispatcher: EventDispatcher,
    bridge: Bridge,
    session: Mutex<Option<SessionInfo>>,
    connecting: AtomicBool,
    connect_waiters: Mutex<Vec<Deferred<()>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.inner.conn)
            .field("state", &self.inner.dispatcher.state())
            .field("session", &*self.inner.session.lock())
            .finish()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.owns_reactor {
            debug!("client dropped, stopping its reactor");
            self.reactor.stop();
        }
    }
}

impl ClientInner {
    /// runs on the reactor ahead of any user `on_connected` watcher
    fn connected(&self) {
        let session = self.conn.session();
        if let Some(info) = &session {
            info!(session = format_args!("{:#x}", info.id), "session established");
        }
        *self.session.lock() = session;
        self.connecting.store(false, Ordering::SeqCst);
        let waiters = std::mem::take(&mut *self.connect_waiters.lock());
        for waiter in waiters {
            waiter.succeed(());
        }
    }

    /// runs on the reactor ahead of any user `on_connection_lost` watcher
    fn lost(&self, err: &ZkError) {
        if self.connecting.swap(false, Ordering::SeqCst) {
            warn!(%err, "connection attempt failed");
            self.fail_waiters(err.clone());
        }
    }

    fn fail_waiters(&self, err: ZkError) {
        let waiters = std::mem::take(&mut *self.connect_waiters.lock());
        for waiter in waiters {
            waiter.fail(err.clone());
        }
    }
}

macro_rules! operations {
    ($(
        $(#[$meta:meta])*
        $name:ident, $then:ident ( $($arg:ident : $ty:ty),* ) -> $out:ty = $op:expr;
    )*) => {
        $(
            $(#[$meta])*
            pub fn $name(&self, $($arg: $ty),*) -> Deferred<$out> {
                self.call($op)
            }

            #[doc = concat!("[`Client::", stringify!($name), "`] with a combined completion callback")]
            pub fn $then<F>(&self, $($arg: $ty,)* callback: F) -> Deferred<$out>
            where
                F: FnOnce(ZkResult<$out>) + Send + 'static,
            {
                self.call_then($op, callback)
            }
        )*
    };
}

impl Client {
    /// New client over `conn`, with a reactor of its own that stops when the
    /// last clone of the client is dropped.
    ///
    /// # Panics
    /// if called outside of a tokio runtime
    pub fn new<C: Connection>(conn: C) -> Self {
        Self::shared(Arc::new(conn))
    }

    /// [`Client::new`] for a connection the caller keeps a handle to
    pub fn shared(conn: Arc<dyn Connection>) -> Self {
        let (reactor, _handle) = Reactor::start(CancellationToken::new());
        Self::build(conn, reactor, true)
    }

    /// New client sharing an existing reactor
    pub fn with_reactor(conn: Arc<dyn Connection>, reactor: Reactor) -> Self {
        Self::build(conn, reactor, false)
    }

    fn build(conn: Arc<dyn Connection>, reactor: Reactor, owns_reactor: bool) -> Self {
        let dispatcher = EventDispatcher::new(reactor.clone());
        let bridge = Bridge::new(conn.clone(), reactor.clone(), dispatcher.clone());
        let inner = Arc::new(ClientInner {
            conn,
            reactor,
            owns_reactor,
            dispatcher,
            bridge,
            session: Mutex::new(None),
            connecting: AtomicBool::new(false),
            connect_waiters: Mutex::new(Vec::new()),
        });
        // registered first, so session info and pending connects are settled
        // before user watchers run
        let weak = Arc::downgrade(&inner);
        let _connected = inner.dispatcher.on_connected(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.connected();
            }
        });
        let weak = Arc::downgrade(&inner);
        let _lost = inner.dispatcher.on_connection_lost(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.lost(err);
            }
        });
        Self { inner }
    }

    /// Connect, or resolve right away (on a later reactor tick) if already
    /// connected. Concurrent calls share one connection attempt. If the
    /// session is lost before it becomes usable (auth failure, expiry) every
    /// pending connect fails with that kind and the next call starts over.
    pub fn connect(&self) -> Deferred<()> {
        let deferred = Deferred::new();
        if self.is_connected() {
            let d = deferred.clone();
            self.inner.reactor.next_tick(move || {
                d.succeed(());
            });
            return deferred;
        }
        self.inner.connect_waiters.lock().push(deferred.clone());
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            debug!("connection attempt already in progress");
            return deferred;
        }
        info!(conn = ?self.inner.conn, "connecting");
        let inner = self.inner.clone();
        self.inner.reactor.spawn(
            async move {
                if let Err(err) = inner.conn.connect(inner.dispatcher.clone()).await {
                    warn!(%err, "failed to initiate connection");
                    let reactor = inner.reactor.clone();
                    reactor.next_tick(move || {
                        inner.connecting.store(false, Ordering::SeqCst);
                        inner.fail_waiters(err);
                    });
                }
            }
            .instrument(info_span!("zk_connect")),
        );
        deferred
    }

    /// [`Client::connect`] with a combined completion callback
    pub fn connect_then<F>(&self, callback: F) -> Deferred<()>
    where
        F: FnOnce(ZkResult<()>) + Send + 'static,
    {
        let deferred = self.connect();
        deferred.on_complete(move |res| callback(res.copied().map_err(ZkError::clone)));
        deferred
    }

    /// Close the session. Once the connection is torn down the session info
    /// is cleared, the state goes back to `Disconnected` and every operation
    /// still waiting for a reply fails with [`ZkError::Closed`].
    pub fn close(&self) -> Deferred<()> {
        let deferred = Deferred::new();
        let d = deferred.clone();
        let inner = self.inner.clone();
        info!("closing");
        self.inner.reactor.spawn(
            async move {
                let res = inner.conn.close().await;
                let reactor = inner.reactor.clone();
                reactor.next_tick(move || {
                    *inner.session.lock() = None;
                    inner.connecting.store(false, Ordering::SeqCst);
                    inner.dispatcher.reset();
                    inner.bridge.fail_inflight(ZkError::Closed);
                    inner.fail_waiters(ZkError::Closed);
                    debug!(ok = res.is_ok(), "closed");
                    d.resolve(res);
                });
            }
            .instrument(info_span!("zk_close")),
        );
        deferred
    }

    /// [`Client::close`] with a combined completion callback
    pub fn close_then<F>(&self, callback: F) -> Deferred<()>
    where
        F: FnOnce(ZkResult<()>) + Send + 'static,
    {
        let deferred = self.close();
        deferred.on_complete(move |res| callback(res.copied().map_err(ZkError::clone)));
        deferred
    }

    /// Issue any operation
    pub fn call<O: Operation>(&self, op: O) -> Deferred<O::Output> {
        self.inner.bridge.call(op, None)
    }

    /// Issue any operation with a combined completion callback
    pub fn call_then<O, F>(&self, op: O, callback: F) -> Deferred<O::Output>
    where
        O: Operation,
        F: FnOnce(ZkResult<O::Output>) + Send + 'static,
    {
        let callback: Completion<O::Output> = Box::new(callback);
        self.inner.bridge.call(op, Some(callback))
    }

    operations! {
        /// Data and stat of `path`
        get, get_then(path: &str) -> (Bytes, Stat) = Get::new(path);
        /// Overwrite the data of `path` regardless of its version
        set, set_then(path: &str, data: impl Into<Bytes>) -> Stat = Set::new(path, data);
        /// Create a persistent node, resolves with the created path. Use
        /// [`Client::call`] with [`Create`] for other modes and ACLs.
        create, create_then(path: &str, data: impl Into<Bytes>) -> String =
            Create::new(path).data(data);
        delete, delete_then(path: &str) -> () = Delete::new(path);
        /// Child names of `path`, in no particular order, and its stat
        children, children_then(path: &str) -> (Vec<String>, Stat) = Children::new(path);
        /// Never fails with [`ZkError::NoNode`]
        exists, exists_then(path: &str) -> bool = Exists::new(path);
        /// Stat of `path`, check [`Stat::exists`] for missing nodes
        stat, stat_then(path: &str) -> Stat = GetStat::new(path);
        get_acl, get_acl_then(path: &str) -> (Vec<Acl>, Stat) = GetAcl::new(path);
        set_acl, set_acl_then(path: &str, acl: Vec<Acl>) -> Stat = SetAcl::new(path, acl);
    }

    /// session id, once connected
    pub fn session_id(&self) -> Option<i64> {
        self.inner.session.lock().as_ref().map(|s| s.id)
    }

    /// session password, once connected
    pub fn session_password(&self) -> Option<Vec<u8>> {
        self.inner.session.lock().as_ref().map(|s| s.password.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.dispatcher.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.inner.session.lock().is_some()
    }

    pub fn event_dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// operations waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.inner.bridge.in_flight()
    }

    pub fn on_connecting<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_connecting(f)
    }

    pub fn on_connected<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_connected(f)
    }

    /// See [`EventDispatcher::on_connection_lost`]
    pub fn on_connection_lost<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ZkError) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_connection_lost(f)
    }

    pub fn on_node_event<F>(&self, path: impl Into<String>, f: F) -> Subscription
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_node_event(path, f)
    }
}
