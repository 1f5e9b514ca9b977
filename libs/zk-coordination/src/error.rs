//! Error types for coordination operations.
//!
//! Every failed operation and every connection-lost notification carries
//! exactly one [`ZkError`] kind. The raw result code is always recoverable
//! through [`ZkError::code`] for diagnostics.

use thiserror::Error;

use crate::result::codes;

/// Classified failure of a coordination operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ZkError {
    /// The node does not exist.
    #[error("no node")]
    NoNode,

    /// A node already exists at the path being created.
    #[error("node exists")]
    NodeExists,

    /// The connection to the ensemble was lost. The session may survive.
    #[error("connection lost")]
    ConnectionLoss,

    /// The session expired; ephemeral nodes and watches are gone.
    /// Delivered to connection-lost watchers as a specialisation of
    /// [`ZkError::ConnectionLoss`].
    #[error("session expired")]
    SessionExpired,

    /// Expected version did not match the node's version.
    #[error("bad version")]
    BadVersion,

    /// Attempted to delete a node that still has children.
    #[error("node has children")]
    NotEmpty,

    /// Client authentication failed.
    #[error("authentication failed")]
    AuthFailed,

    /// The ACL supplied is invalid.
    #[error("invalid acl")]
    InvalidAcl,

    /// The session lacks permission for the operation.
    #[error("not authorized")]
    NoAuth,

    /// Ephemeral nodes may not have children.
    #[error("ephemeral nodes may not have children")]
    NoChildrenForEphemerals,

    /// The ensemble did not answer within the client's operation timeout.
    #[error("operation timed out")]
    OperationTimeout,

    /// Malformed arguments, e.g. a relative path.
    #[error("bad arguments")]
    BadArguments,

    /// The session was moved to another server.
    #[error("session moved")]
    SessionMoved,

    /// The client was closed while the operation was in flight.
    #[error("client closed")]
    Closed,

    /// Any result code without a dedicated kind.
    #[error("api error (code {code})")]
    Api { code: i32 },
}

impl ZkError {
    /// Classify a raw result code. Returns `None` for the success code.
    pub fn from_code(code: i32) -> Option<ZkError> {
        let err = match code {
            codes::OK => return None,
            codes::NO_NODE => ZkError::NoNode,
            codes::NODE_EXISTS => ZkError::NodeExists,
            codes::CONNECTION_LOSS => ZkError::ConnectionLoss,
            codes::SESSION_EXPIRED => ZkError::SessionExpired,
            codes::BAD_VERSION => ZkError::BadVersion,
            codes::NOT_EMPTY => ZkError::NotEmpty,
            codes::AUTH_FAILED => ZkError::AuthFailed,
            codes::INVALID_ACL => ZkError::InvalidAcl,
            codes::NO_AUTH => ZkError::NoAuth,
            codes::NO_CHILDREN_FOR_EPHEMERALS => ZkError::NoChildrenForEphemerals,
            codes::OPERATION_TIMEOUT => ZkError::OperationTimeout,
            codes::BAD_ARGUMENTS => ZkError::BadArguments,
            codes::SESSION_MOVED => ZkError::SessionMoved,
            codes::CLOSING => ZkError::Closed,
            code => ZkError::Api { code },
        };
        Some(err)
    }

    /// The raw result code this error corresponds to.
    pub fn code(&self) -> i32 {
        match self {
            ZkError::NoNode => codes::NO_NODE,
            ZkError::NodeExists => codes::NODE_EXISTS,
            ZkError::ConnectionLoss => codes::CONNECTION_LOSS,
            ZkError::SessionExpired => codes::SESSION_EXPIRED,
            ZkError::BadVersion => codes::BAD_VERSION,
            ZkError::NotEmpty => codes::NOT_EMPTY,
            ZkError::AuthFailed => codes::AUTH_FAILED,
            ZkError::InvalidAcl => codes::INVALID_ACL,
            ZkError::NoAuth => codes::NO_AUTH,
            ZkError::NoChildrenForEphemerals => codes::NO_CHILDREN_FOR_EPHEMERALS,
            ZkError::OperationTimeout => codes::OPERATION_TIMEOUT,
            ZkError::BadArguments => codes::BAD_ARGUMENTS,
            ZkError::SessionMoved => codes::SESSION_MOVED,
            ZkError::Closed => codes::CLOSING,
            ZkError::Api { code } => *code,
        }
    }

    /// Returns true for errors that mean the connection, or the whole
    /// session, is gone (connection loss or session expiry).
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ZkError::ConnectionLoss | ZkError::SessionExpired)
    }

    /// Short stable name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            ZkError::NoNode => "no_node",
            ZkError::NodeExists => "node_exists",
            ZkError::ConnectionLoss => "connection_loss",
            ZkError::SessionExpired => "session_expired",
            ZkError::BadVersion => "bad_version",
            ZkError::NotEmpty => "not_empty",
            ZkError::AuthFailed => "auth_failed",
            ZkError::InvalidAcl => "invalid_acl",
            ZkError::NoAuth => "no_auth",
            ZkError::NoChildrenForEphemerals => "no_children_for_ephemerals",
            ZkError::OperationTimeout => "operation_timeout",
            ZkError::BadArguments => "bad_arguments",
            ZkError::SessionMoved => "session_moved",
            ZkError::Closed => "closed",
            ZkError::Api { .. } => "api_error",
        }
    }
}

/// Shorthand result alias for coordination operations.
pub type ZkResult<T> = Result<T, ZkError>;
