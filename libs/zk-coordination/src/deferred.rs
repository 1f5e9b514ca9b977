//! # Deferred
//!
//! A resolve-once cell with late-binding continuations. Operations hand one
//! back synchronously; the reactor resolves it when the reply arrives.
//!
//! ```
//! use zk_coordination::{Deferred, ZkError};
//!
//! let d = Deferred::<u32>::new();
//! d.on_success(|v| assert_eq!(*v, 7))
//!     .on_failure(|_| unreachable!());
//! assert!(d.succeed(7));
//! // first resolution wins
//! assert!(!d.fail(ZkError::NoNode));
//! ```
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use std::{fmt, sync::Arc};

use crate::error::{ZkError, ZkResult};

type OnSuccess<T> = Box<dyn FnOnce(&T) + Send + 'static>;
type OnFailure = Box<dyn FnOnce(&ZkError) + Send + 'static>;
type OnComplete<T> = Box<dyn FnOnce(Result<&T, &ZkError>) + Send + 'static>;

enum Continuation<T> {
    Success(OnSuccess<T>),
    Failure(OnFailure),
    Complete(OnComplete<T>),
}

impl<T> Continuation<T> {
    /// runs `self` if it matches the outcome, otherwise drops it
    fn run(self, outcome: &ZkResult<T>) {
        match (self, outcome) {
            (Continuation::Success(f), Ok(v)) => f(v),
            (Continuation::Failure(f), Err(e)) => f(e),
            (Continuation::Complete(f), outcome) => f(outcome.as_ref()),
            _ => {}
        }
    }
}

enum Inner<T> {
    Pending(Vec<Continuation<T>>),
    Resolved(Arc<ZkResult<T>>),
}

/// Observable state of a [`Deferred`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Succeeded,
    Failed,
}

/// Single-assignment result of an asynchronous operation.
///
/// Clones share the same cell. Continuations registered while pending run in
/// registration order on whichever thread resolves the deferred (the reactor,
/// for everything the client hands out). Continuations registered after
/// resolution run immediately on the registering thread.
pub struct Deferred<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Deferred<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, waiting) = match &*self.inner.lock() {
            Inner::Pending(list) => (DeferredState::Pending, list.len()),
            Inner::Resolved(res) if res.is_ok() => (DeferredState::Succeeded, 0),
            Inner::Resolved(_) => (DeferredState::Failed, 0),
        };
        f.debug_struct("Deferred")
            .field("state", &state)
            .field("continuations", &waiting)
            .finish()
    }
}

impl<T> Deferred<T>
where
    T: Send + Sync + 'static,
{
    /// a new, pending deferred
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::Pending(Vec::new()))),
        }
    }

    /// a deferred that is already resolved with `res`
    pub fn resolved(res: ZkResult<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::Resolved(Arc::new(res)))),
        }
    }

    /// Run `f` with the value if this deferred succeeds
    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.register(Continuation::Success(Box::new(f)))
    }

    /// Run `f` with the error if this deferred fails
    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&ZkError) + Send + 'static,
    {
        self.register(Continuation::Failure(Box::new(f)))
    }

    /// Run `f` with the outcome, whichever it is
    pub fn on_complete<F>(&self, f: F) -> &Self
    where
        F: FnOnce(Result<&T, &ZkError>) + Send + 'static,
    {
        self.register(Continuation::Complete(Box::new(f)))
    }

    fn register(&self, cont: Continuation<T>) -> &Self {
        let resolved = {
            let mut inner = self.inner.lock();
            match &mut *inner {
                Inner::Pending(list) => {
                    list.push(cont);
                    return self;
                }
                Inner::Resolved(res) => Arc::clone(res),
            }
        };
        // lock released, the continuation may touch this deferred again
        cont.run(&resolved);
        self
    }

    /// Resolve with a value. Returns false if already resolved.
    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolve with an error. Returns false if already resolved.
    pub fn fail(&self, err: ZkError) -> bool {
        self.resolve(Err(err))
    }

    /// Resolve with `res` and run pending continuations matching it, in order.
    /// The first call wins, any later call is a no-op returning false.
    pub fn resolve(&self, res: ZkResult<T>) -> bool {
        let res = Arc::new(res);
        let pending = {
            let mut inner = self.inner.lock();
            match &mut *inner {
                Inner::Resolved(_) => {
                    trace!("deferred already resolved, ignoring");
                    return false;
                }
                Inner::Pending(list) => {
                    let list = std::mem::take(list);
                    *inner = Inner::Resolved(Arc::clone(&res));
                    list
                }
            }
        };
        for cont in pending {
            cont.run(&res);
        }
        true
    }

    pub fn state(&self) -> DeferredState {
        match &*self.inner.lock() {
            Inner::Pending(_) => DeferredState::Pending,
            Inner::Resolved(res) if res.is_ok() => DeferredState::Succeeded,
            Inner::Resolved(_) => DeferredState::Failed,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != DeferredState::Pending
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> ZkResult<T>
    where
        T: Clone,
    {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |res| {
            let _ = tx.send(res.cloned().map_err(ZkError::clone));
        });
        rx.await.unwrap_or(Err(ZkError::Closed))
    }
}
