//! The underlying client the facade adapts.
//!
//! A `Connection` is a session to the ensemble. Each request resolves exactly
//! once with a [`RawResult`]; session and node notifications are pushed into
//! the [`EventDispatcher`] handed over on [`Connection::connect`].

use async_trait::async_trait;
use bytes::Bytes;

use std::fmt;

use crate::{
    error::ZkResult,
    events::EventDispatcher,
    models::{Acl, CreateMode, SessionInfo, Stat},
    result::RawResult,
};

/// Raw single-shot operations of a coordination session
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug + 'static {
    /// Start establishing the session. Returns once the attempt has been
    /// initiated; progress is reported through `events`.
    async fn connect(&self, events: EventDispatcher) -> ZkResult<()>;

    /// Tear the session down. Requests that have not been answered yet may
    /// never be.
    async fn close(&self) -> ZkResult<()>;

    /// credentials of the current session, if one is established
    fn session(&self) -> Option<SessionInfo>;

    async fn get(&self, path: &str, watch: bool) -> RawResult<(Bytes, Stat)>;

    async fn set(&self, path: &str, data: Bytes, version: Option<i32>) -> RawResult<Stat>;

    /// payload is the path actually created
    async fn create(
        &self,
        path: &str,
        data: Bytes,
        acl: &[Acl],
        mode: CreateMode,
    ) -> RawResult<String>;

    async fn delete(&self, path: &str, version: Option<i32>) -> RawResult<()>;

    async fn children(&self, path: &str, watch: bool) -> RawResult<(Vec<String>, Stat)>;

    /// fails with the no-node code when `path` is missing
    async fn exists(&self, path: &str, watch: bool) -> RawResult<Stat>;

    async fn get_acl(&self, path: &str) -> RawResult<(Vec<Acl>, Stat)>;

    async fn set_acl(&self, path: &str, acl: &[Acl], version: Option<i32>) -> RawResult<Stat>;
}
