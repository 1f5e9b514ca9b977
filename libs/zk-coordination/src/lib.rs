//! # zk-coordination
//!
//! Asynchronous facade over a tree-structured coordination service session
//! (ZooKeeper-style nodes, versions, ACLs, sessions and watches).
//!
//! This library provides:
//! - **Result classification** of raw numeric result codes into [`ZkError`].
//! - **Deferred results** with success/failure continuations that can be
//!   attached before or after resolution.
//! - **Operation bridge** turning each single-shot raw request into a
//!   [`Deferred`] plus an optional combined `ZkResult` callback.
//! - **Event dispatch** of session state changes to connecting, connected and
//!   connection-lost watchers, and of node events to per-path watchers.
//! - **Client facade** with idempotent connect/close, session accessors and
//!   `mkdir_p`/`rm_rf` helpers.
//! - **In-memory ensemble** implementing [`Connection`] for tests and local
//!   development.
//!
//! ## Design Principles
//!
//! - Every callback, continuation and watcher runs on one reactor task, one at
//!   a time, in the order it was scheduled.
//! - Failures are data: nothing panics across the callback boundary.
//! - The client owns its connection handle, there is no global session.

pub mod bridge;
pub mod client;
pub mod connection;
pub mod deferred;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod ops;
pub mod result;
pub mod unixisms;

// Re-export key types for convenient access
pub use bridge::Completion;
pub use client::Client;
pub use connection::Connection;
pub use deferred::{Deferred, DeferredState};
pub use error::{ZkError, ZkResult};
pub use events::{EventDispatcher, Subscription};
pub use memory::{MemoryConnection, MemoryEnsemble};
pub use models::{
    Acl, ConnectionEvent, ConnectionState, CreateMode, Id, NodeEvent, NodeEventKind, Perms,
    RawEvent, SessionInfo, Stat, WatchEvent,
};
pub use ops::{Children, Create, Delete, Exists, Get, GetAcl, GetStat, Operation, Set, SetAcl};
pub use result::{classify, codes, RawResult};
pub use zkem_core::Reactor;
