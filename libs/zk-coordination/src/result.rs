//! Raw results as reported by a [`Connection`] and their classification into
//! `ZkResult`.
//!
//! [`Connection`]: crate::connection::Connection

use crate::error::{ZkError, ZkResult};

/// Numeric constants of the wire protocol
pub mod codes {
    // result codes
    pub const OK: i32 = 0;
    pub const SYSTEM_ERROR: i32 = -1;
    pub const RUNTIME_INCONSISTENCY: i32 = -2;
    pub const DATA_INCONSISTENCY: i32 = -3;
    pub const CONNECTION_LOSS: i32 = -4;
    pub const MARSHALLING_ERROR: i32 = -5;
    pub const UNIMPLEMENTED: i32 = -6;
    pub const OPERATION_TIMEOUT: i32 = -7;
    pub const BAD_ARGUMENTS: i32 = -8;
    pub const INVALID_STATE: i32 = -9;
    pub const API_ERROR: i32 = -100;
    pub const NO_NODE: i32 = -101;
    pub const NO_AUTH: i32 = -102;
    pub const BAD_VERSION: i32 = -103;
    pub const NO_CHILDREN_FOR_EPHEMERALS: i32 = -108;
    pub const NODE_EXISTS: i32 = -110;
    pub const NOT_EMPTY: i32 = -111;
    pub const SESSION_EXPIRED: i32 = -112;
    pub const INVALID_CALLBACK: i32 = -113;
    pub const INVALID_ACL: i32 = -114;
    pub const AUTH_FAILED: i32 = -115;
    pub const CLOSING: i32 = -116;
    pub const NOTHING: i32 = -117;
    pub const SESSION_MOVED: i32 = -118;

    // session states carried by session events
    pub const STATE_CLOSED: i32 = 0;
    pub const STATE_CONNECTING: i32 = 1;
    pub const STATE_ASSOCIATING: i32 = 2;
    pub const STATE_CONNECTED: i32 = 3;
    pub const STATE_READONLY: i32 = 5;
    pub const STATE_EXPIRED_SESSION: i32 = -112;
    pub const STATE_AUTH_FAILED: i32 = -113;

    // event types
    pub const EVENT_CREATED: i32 = 1;
    pub const EVENT_DELETED: i32 = 2;
    pub const EVENT_CHANGED: i32 = 3;
    pub const EVENT_CHILD: i32 = 4;
    pub const EVENT_SESSION: i32 = -1;
    pub const EVENT_NOT_WATCHING: i32 = -2;
}

/// What the underlying client hands back for a single request: a result
/// code, and on success the operation-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult<T> {
    pub code: i32,
    pub payload: Option<T>,
}

impl<T> RawResult<T> {
    /// successful reply carrying `payload`
    pub fn ok(payload: T) -> Self {
        Self {
            code: codes::OK,
            payload: Some(payload),
        }
    }

    /// failed reply with result code `code`
    pub fn err(code: i32) -> Self {
        Self {
            code,
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == codes::OK
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RawResult<U> {
        RawResult {
            code: self.code,
            payload: self.payload.map(f),
        }
    }
}

/// Map a raw result to success or a classified failure.
///
/// Total over all codes: a success code without a payload is reported as a
/// marshalling failure rather than panicking.
pub fn classify<T>(raw: RawResult<T>) -> ZkResult<T> {
    match ZkError::from_code(raw.code) {
        Some(err) => Err(err),
        None => raw.payload.ok_or(ZkError::Api {
            code: codes::MARSHALLING_ERROR,
        }),
    }
}
