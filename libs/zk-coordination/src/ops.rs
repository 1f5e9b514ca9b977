//! Coordination operations.
//!
//! Each operation is a small builder carrying its arguments. It knows how to
//! issue itself against a [`Connection`] and how to turn the raw reply into
//! its typed payload, which is where the per-operation edge cases live
//! (`exists` and `stat` treat a missing node as a successful answer).

use bytes::Bytes;
use futures::future::BoxFuture;

use std::sync::Arc;

use crate::{
    connection::Connection,
    error::{ZkError, ZkResult},
    models::{Acl, CreateMode, Stat},
    result::{classify, RawResult},
};

/// A single coordination request
pub trait Operation: Send + 'static {
    /// payload delivered on success
    type Output: Clone + Send + Sync + 'static;
    /// payload of the raw reply
    type Raw: Send + 'static;

    /// operation name for logs and metrics
    const NAME: &'static str;

    /// path the operation targets
    fn path(&self) -> &str;

    /// send the request, the future resolves with the raw reply
    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>>;

    /// classify the raw reply
    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output>;
}

/// Read data and stat of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Get {
    path: String,
    watch: bool,
}

impl Get {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            watch: false,
        }
    }

    /// arm a one-shot data watch
    pub fn watch(mut self) -> Self {
        self.watch = true;
        self
    }
}

impl Operation for Get {
    type Output = (Bytes, Stat);
    type Raw = (Bytes, Stat);
    const NAME: &'static str = "get";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.get(&self.path, self.watch).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        classify(raw)
    }
}

/// Overwrite the data of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Set {
    path: String,
    data: Bytes,
    version: Option<i32>,
}

impl Set {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            version: None,
        }
    }

    /// only succeed if the node is at `version`
    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }
}

impl Operation for Set {
    type Output = Stat;
    type Raw = Stat;
    const NAME: &'static str = "set";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.set(&self.path, self.data, self.version).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        classify(raw)
    }
}

/// Create a node. Succeeds with the path actually created, which differs
/// from the requested one for sequential nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create {
    path: String,
    data: Bytes,
    acl: Vec<Acl>,
    ephemeral: bool,
    sequential: bool,
}

impl Create {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: Bytes::new(),
            acl: Acl::open_unsafe(),
            ephemeral: false,
            sequential: false,
        }
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = acl;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn mode(&self) -> CreateMode {
        CreateMode::from_flags(self.ephemeral, self.sequential)
    }
}

impl Operation for Create {
    type Output = String;
    type Raw = String;
    const NAME: &'static str = "create";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        let mode = self.mode();
        Box::pin(async move { conn.create(&self.path, self.data, &self.acl, mode).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        classify(raw)
    }
}

/// Delete a leaf node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    path: String,
    version: Option<i32>,
}

impl Delete {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: None,
        }
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }
}

impl Operation for Delete {
    type Output = ();
    type Raw = ();
    const NAME: &'static str = "delete";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.delete(&self.path, self.version).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        classify(raw)
    }
}

/// List the children of a node. Names are relative, in no particular order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Children {
    path: String,
    watch: bool,
}

impl Children {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            watch: false,
        }
    }

    /// arm a one-shot child watch
    pub fn watch(mut self) -> Self {
        self.watch = true;
        self
    }
}

impl Operation for Children {
    type Output = (Vec<String>, Stat);
    type Raw = (Vec<String>, Stat);
    const NAME: &'static str = "children";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.children(&self.path, self.watch).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        classify(raw)
    }
}

/// Does the node exist. Never fails with [`ZkError::NoNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exists {
    path: String,
    watch: bool,
}

impl Exists {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            watch: false,
        }
    }

    /// arm a one-shot watch, fires on creation if the node is missing
    pub fn watch(mut self) -> Self {
        self.watch = true;
        self
    }
}

impl Operation for Exists {
    type Output = bool;
    type Raw = Stat;
    const NAME: &'static str = "exists";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.exists(&self.path, self.watch).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        match classify(raw) {
            Ok(stat) => Ok(stat.exists()),
            Err(ZkError::NoNode) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Stat of a node. A missing node is reported through [`Stat::exists`], not
/// as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStat {
    path: String,
    watch: bool,
}

impl GetStat {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            watch: false,
        }
    }

    pub fn watch(mut self) -> Self {
        self.watch = true;
        self
    }
}

impl Operation for GetStat {
    type Output = Stat;
    type Raw = Stat;
    const NAME: &'static str = "stat";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.exists(&self.path, self.watch).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        match classify(raw) {
            Err(ZkError::NoNode) => Ok(Stat::missing()),
            res => res,
        }
    }
}

/// Read the ACL of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAcl {
    path: String,
}

impl GetAcl {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Operation for GetAcl {
    type Output = (Vec<Acl>, Stat);
    type Raw = (Vec<Acl>, Stat);
    const NAME: &'static str = "get_acl";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.get_acl(&self.path).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        classify(raw)
    }
}

/// Replace the ACL of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetAcl {
    path: String,
    acl: Vec<Acl>,
    version: Option<i32>,
}

impl SetAcl {
    pub fn new(path: impl Into<String>, acl: Vec<Acl>) -> Self {
        Self {
            path: path.into(),
            acl,
            version: None,
        }
    }

    /// only succeed if the node's ACL is at `version`
    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }
}

impl Operation for SetAcl {
    type Output = Stat;
    type Raw = Stat;
    const NAME: &'static str = "set_acl";

    fn path(&self) -> &str {
        &self.path
    }

    fn issue(self, conn: Arc<dyn Connection>) -> BoxFuture<'static, RawResult<Self::Raw>> {
        Box::pin(async move { conn.set_acl(&self.path, &self.acl, self.version).await })
    }

    fn complete(raw: RawResult<Self::Raw>) -> ZkResult<Self::Output> {
        classify(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::codes;

    #[test]
    fn test_exists_never_fails_with_no_node() {
        assert_eq!(
            Exists::complete(RawResult::err(codes::NO_NODE)),
            Ok(false)
        );
        assert_eq!(Exists::complete(RawResult::ok(Stat::new())), Ok(true));
        assert_eq!(
            Exists::complete(RawResult::err(codes::CONNECTION_LOSS)),
            Err(ZkError::ConnectionLoss)
        );
    }

    #[test]
    fn test_stat_of_missing_node() {
        let stat = GetStat::complete(RawResult::err(codes::NO_NODE)).unwrap();
        assert!(!stat.exists());
        assert_eq!(
            GetStat::complete(RawResult::err(codes::NO_AUTH)),
            Err(ZkError::NoAuth)
        );
    }

    #[test]
    fn test_get_no_node_is_failure() {
        assert_eq!(
            Get::complete(RawResult::err(codes::NO_NODE)),
            Err(ZkError::NoNode)
        );
        assert_eq!(
            Children::complete(RawResult::err(codes::NO_NODE)),
            Err(ZkError::NoNode)
        );
    }

    #[test]
    fn test_create_builder() {
        let op = Create::new("/seq-").data("x").sequential().ephemeral();
        assert_eq!(op.mode(), CreateMode::EphemeralSequential);
        assert_eq!(op.path(), "/seq-");
        assert_eq!(Create::new("/a").mode(), CreateMode::Persistent);
        assert_eq!(Create::new("/a").acl, Acl::open_unsafe());
    }
}
