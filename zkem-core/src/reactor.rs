//! # Reactor
//!
//! A single consumer task that drains a FIFO queue of jobs. Every callback,
//! continuation and watcher of the client is posted here, so user code only
//! ever runs one job at a time and in the order it was scheduled, no matter
//! which runtime worker finished the underlying I/O.
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Instrument};

use std::{
    any::Any,
    cell::Cell,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A unit of work for the reactor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IN_REACTOR: Cell<bool> = const { Cell::new(false) };
}

/// Handle to a running reactor. Cheap to clone, all clones feed the same queue.
#[derive(Clone)]
pub struct Reactor {
    tx: mpsc::UnboundedSender<Job>,
    runtime: Handle,
    token: CancellationToken,
    /// jobs executed so far, useful for tests and diagnostics
    ticks: Arc<AtomicU64>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .field("stopped", &self.token.is_cancelled())
            .finish()
    }
}

impl Reactor {
    /// Spawn the reactor task on the current tokio runtime. The task exits when
    /// `token` is cancelled or every `Reactor` handle has been dropped.
    ///
    /// # Panics
    /// if called outside of a tokio runtime
    pub fn start(token: CancellationToken) -> (Reactor, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let ticks = Arc::new(AtomicU64::new(0));
        let reactor = Reactor {
            tx,
            runtime: Handle::current(),
            token: token.clone(),
            ticks: ticks.clone(),
        };
        let handle = tokio::spawn(async move {
            debug!("reactor started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("reactor received shutdown notifier");
                        break;
                    }
                    job = rx.recv() => match job {
                        Some(job) => {
                            run_job(job);
                            ticks.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            debug!("all reactor handles dropped");
                            break;
                        }
                    }
                }
            }
        }
        // jobs log under whatever span started the reactor
        .in_current_span());
        (reactor, handle)
    }

    /// Schedule `job` to run on the reactor after everything already queued.
    /// Never runs the job inline, even when called from the reactor itself.
    pub fn next_tick<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("reactor has stopped, dropping scheduled job");
        }
    }

    /// Run a future on the runtime backing this reactor. Its output is not
    /// delivered anywhere, post back with [`Reactor::next_tick`] when it's done.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(fut)
    }

    /// true when the calling code is running as a reactor job
    pub fn in_reactor() -> bool {
        IN_REACTOR.with(Cell::get)
    }

    /// number of jobs the reactor has finished
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop the reactor. Jobs still queued are dropped without running.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// has [`Reactor::stop`] been called (or the start token cancelled)
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn run_job(job: Job) {
    IN_REACTOR.with(|flag| flag.set(true));
    // a panicking callback is a caller bug, it must not take the reactor down with it
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = panic_message(&*panic), "reactor job panicked");
    }
    IN_REACTOR.with(|flag| flag.set(false));
    trace!("reactor job finished");
}

/// Best effort text of a caught panic payload
pub fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}
