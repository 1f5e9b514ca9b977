//! Typed models shared by operations, events and connections.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{error::ZkError, result::codes};

// ---------------------------------------------------------------------------
// Node metadata
// ---------------------------------------------------------------------------

/// Node metadata as reported by the ensemble.
///
/// A `Stat` returned from a `stat` call on a missing path has every field
/// zeroed and [`Stat::exists`] false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    /// creation time, millis since epoch
    pub ctime: i64,
    /// last modification time, millis since epoch
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    /// session id of the owner for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
    #[serde(default = "default_exists")]
    exists: bool,
}

fn default_exists() -> bool {
    true
}

impl Stat {
    /// stat for an existing node, everything else zeroed
    pub fn new() -> Self {
        Self {
            exists: true,
            ..Self::default()
        }
    }

    /// stat describing a node that is not there
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

// ---------------------------------------------------------------------------
// ACLs
// ---------------------------------------------------------------------------

/// Permission bits of an ACL entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Perms(u32);

impl Perms {
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(1 << 1);
    pub const CREATE: Perms = Perms(1 << 2);
    pub const DELETE: Perms = Perms(1 << 3);
    pub const ADMIN: Perms = Perms(1 << 4);
    pub const ALL: Perms = Perms(0x1f);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Perms) -> Perms {
        Perms(self.0 | rhs.0)
    }
}

/// Authentication identity an ACL entry applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    pub scheme: String,
    pub id: String,
}

impl Id {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// `world:anyone`
    pub fn anyone() -> Self {
        Self::new("world", "anyone")
    }
}

/// One access control entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    pub perms: Perms,
    pub id: Id,
}

impl Acl {
    pub fn new(perms: Perms, id: Id) -> Self {
        Self { perms, id }
    }

    /// everyone may do everything, the default for `create`
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl::new(Perms::ALL, Id::anyone())]
    }

    /// everyone may read
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl::new(Perms::READ, Id::anyone())]
    }
}

// ---------------------------------------------------------------------------
// Create modes
// ---------------------------------------------------------------------------

/// How `create` should make the node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    #[default]
    Persistent,
    /// removed when the creating session ends
    Ephemeral,
    /// server appends a monotonically increasing 10 digit suffix
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn from_flags(ephemeral: bool, sequential: bool) -> Self {
        match (ephemeral, sequential) {
            (false, false) => CreateMode::Persistent,
            (true, false) => CreateMode::Ephemeral,
            (false, true) => CreateMode::PersistentSequential,
            (true, true) => CreateMode::EphemeralSequential,
        }
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

// ---------------------------------------------------------------------------
// Connection state & session
// ---------------------------------------------------------------------------

/// Last connection state seen by the dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ConnectionLost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ConnectionLost => write!(f, "connection_lost"),
        }
    }
}

/// Session credentials handed out by the ensemble on connect
#[derive(Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: i64,
    pub password: Vec<u8>,
}

// the password stays out of logs
impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("id", &format_args!("{:#x}", self.id))
            .field("password", &format_args!("<{} bytes>", self.password.len()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A notification exactly as the underlying client reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_type: i32,
    pub state: i32,
    /// empty for session events
    pub path: String,
}

impl RawEvent {
    /// session state change with no path attached
    pub fn session(state: i32) -> Self {
        Self {
            event_type: codes::EVENT_SESSION,
            state,
            path: String::new(),
        }
    }

    /// node watch firing while connected
    pub fn node(event_type: i32, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: codes::STATE_CONNECTED,
            path: path.into(),
        }
    }

    pub fn is_session_event(&self) -> bool {
        self.event_type == codes::EVENT_SESSION
    }

    pub fn is_node_event(&self) -> bool {
        !self.is_session_event()
    }

    /// Turn into a semantic event. `None` for codes with no meaning to us
    pub fn classify(&self) -> Option<WatchEvent> {
        if self.is_session_event() {
            let event = match self.state {
                codes::STATE_CONNECTING | codes::STATE_ASSOCIATING => ConnectionEvent::Connecting,
                codes::STATE_CONNECTED | codes::STATE_READONLY => ConnectionEvent::Connected,
                codes::STATE_EXPIRED_SESSION => {
                    ConnectionEvent::ConnectionLost(ZkError::SessionExpired)
                }
                codes::STATE_AUTH_FAILED => ConnectionEvent::ConnectionLost(ZkError::AuthFailed),
                codes::STATE_CLOSED => ConnectionEvent::ConnectionLost(ZkError::ConnectionLoss),
                _ => return None,
            };
            return Some(WatchEvent::Session(event));
        }
        let kind = match self.event_type {
            codes::EVENT_CREATED => NodeEventKind::Created,
            codes::EVENT_DELETED => NodeEventKind::Deleted,
            codes::EVENT_CHANGED => NodeEventKind::Changed,
            codes::EVENT_CHILD => NodeEventKind::Child,
            codes::EVENT_NOT_WATCHING => NodeEventKind::NotWatching,
            _ => return None,
        };
        Some(WatchEvent::Node(NodeEvent {
            kind,
            path: self.path.clone(),
        }))
    }
}

/// Classified notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Session(ConnectionEvent),
    Node(NodeEvent),
}

/// Connection state transition delivered to connection watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    /// carries [`ZkError::ConnectionLoss`], [`ZkError::SessionExpired`] or
    /// [`ZkError::AuthFailed`]
    ConnectionLost(ZkError),
}

impl ConnectionEvent {
    pub fn state(&self) -> ConnectionState {
        match self {
            ConnectionEvent::Connecting => ConnectionState::Connecting,
            ConnectionEvent::Connected => ConnectionState::Connected,
            ConnectionEvent::ConnectionLost(_) => ConnectionState::ConnectionLost,
        }
    }

    pub fn error(&self) -> Option<&ZkError> {
        match self {
            ConnectionEvent::ConnectionLost(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Created,
    Deleted,
    Changed,
    Child,
    NotWatching,
}

/// A one-shot node watch firing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub path: String,
}
