//! # Operation bridge
//!
//! Adapts the single-shot raw replies of a [`Connection`] to the two
//! completion surfaces the client offers: a [`Deferred`] returned right away,
//! and an optional combined callback receiving the whole `ZkResult`.
//!
//! The request itself runs as a task on the runtime. Its reply is posted back
//! to the reactor where, in one job, it is classified, a connection loss is
//! reported to the dispatcher, the deferred is resolved (running its
//! continuations), and then the combined callback runs.
//! A reply for an operation that was already settled (a duplicate, or one
//! that arrives after `close`) is dropped.
use parking_lot::Mutex;
use tracing::{debug, debug_span, trace};
use tracing_futures::Instrument;
use zkem_core::Reactor;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    connection::Connection,
    deferred::Deferred,
    error::{ZkError, ZkResult},
    events::EventDispatcher,
    metrics,
    ops::Operation,
    result::RawResult,
};

/// Combined-style completion: `Err(kind)` or `Ok(payload)`
pub type Completion<T> = Box<dyn FnOnce(ZkResult<T>) + Send + 'static>;

type Abort = Box<dyn FnOnce(ZkError) + Send + 'static>;

struct Pending<T> {
    deferred: Deferred<T>,
    callback: Option<Completion<T>>,
}

type Slot<T> = Arc<Mutex<Option<Pending<T>>>>;

/// Issues operations and settles their results on the reactor
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    conn: Arc<dyn Connection>,
    reactor: Reactor,
    dispatcher: EventDispatcher,
    next_id: AtomicU64,
    inflight: Mutex<HashMap<u64, Abort>>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("conn", &self.inner.conn)
            .field("inflight", &self.in_flight())
            .finish()
    }
}

impl Bridge {
    pub fn new(conn: Arc<dyn Connection>, reactor: Reactor, dispatcher: EventDispatcher) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                conn,
                reactor,
                dispatcher,
                next_id: AtomicU64::new(0),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Issue `op`. The returned deferred is pending until the reply has been
    /// processed on the reactor; `callback`, if any, runs right after the
    /// deferred's continuations in the same reactor job.
    pub fn call<O>(&self, op: O, callback: Option<Completion<O::Output>>) -> Deferred<O::Output>
    where
        O: Operation,
    {
        let deferred = Deferred::new();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot: Slot<O::Output> = Arc::new(Mutex::new(Some(Pending {
            deferred: deferred.clone(),
            callback,
        })));

        let abort_slot = slot.clone();
        self.inner.inflight.lock().insert(
            id,
            Box::new(move |err| {
                settle(&abort_slot, Err(err));
            }),
        );
        metrics::ZK_OPS_ISSUED.with_label_values(&[O::NAME]).inc();
        metrics::ZK_OPS_IN_FLIGHT.inc();

        let span = debug_span!("zk_op", op = O::NAME, path = op.path(), id);
        let request = op.issue(self.inner.conn.clone());
        let bridge = self.clone();
        self.inner.reactor.spawn(
            async move {
                let raw = request.await;
                trace!(code = raw.code, "reply received");
                let reactor = bridge.inner.reactor.clone();
                reactor.next_tick(move || bridge.complete::<O>(id, &slot, raw));
            }
            .instrument(span),
        );
        deferred
    }

    fn complete<O: Operation>(&self, id: u64, slot: &Slot<O::Output>, raw: RawResult<O::Raw>) {
        if self.inner.inflight.lock().remove(&id).is_some() {
            metrics::ZK_OPS_IN_FLIGHT.dec();
        }
        let Some(pending) = slot.lock().take() else {
            debug!(op = O::NAME, id, "dropping reply for settled operation");
            metrics::ZK_LATE_REPLIES.with_label_values(&[O::NAME]).inc();
            return;
        };
        let res = O::complete(raw);
        if let Err(err) = &res {
            metrics::ZK_OPS_FAILED
                .with_label_values(&[O::NAME, err.kind()])
                .inc();
            // reported ahead of user continuations, which may panic
            if err.is_connection_loss() {
                self.inner.dispatcher.observe_connection_loss(err.clone());
            }
        }
        pending.settle(res);
    }

    /// Settle every operation still waiting for a reply with `err`. Must be
    /// called on the reactor.
    pub fn fail_inflight(&self, err: ZkError) {
        let aborted: Vec<Abort> = {
            let mut inflight = self.inner.inflight.lock();
            inflight.drain().map(|(_, abort)| abort).collect()
        };
        if !aborted.is_empty() {
            debug!(count = aborted.len(), %err, "failing in-flight operations");
        }
        for abort in aborted {
            metrics::ZK_OPS_IN_FLIGHT.dec();
            abort(err.clone());
        }
    }

    /// number of operations awaiting a reply
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.lock().len()
    }
}

impl<T> Pending<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Resolve the deferred, then run the combined callback
    fn settle(self, res: ZkResult<T>) {
        let callback = self.callback.map(|cb| (cb, res.clone()));
        self.deferred.resolve(res);
        if let Some((cb, res)) = callback {
            cb(res);
        }
    }
}

/// Settle the operation behind `slot` unless its reply got there first
fn settle<T>(slot: &Slot<T>, res: ZkResult<T>) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    let Some(pending) = slot.lock().take() else {
        return false;
    };
    pending.settle(res);
    true
}
