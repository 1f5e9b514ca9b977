//! Coordination client metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered with the default prometheus registry. Registration panics on a
//! duplicate metric name.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge,
};

lazy_static! {
    /// Count of operations issued, by operation
    pub static ref ZK_OPS_ISSUED: IntCounterVec = register_int_counter_vec!(
        "zk_ops_issued",
        "count of coordination operations issued",
        &["op"]
    ).unwrap();

    /// Count of failed operations, by error kind
    pub static ref ZK_OPS_FAILED: IntCounterVec = register_int_counter_vec!(
        "zk_ops_failed",
        "count of coordination operations that completed with an error",
        &["op", "kind"]
    ).unwrap();

    /// Operations issued but not yet completed
    pub static ref ZK_OPS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "zk_ops_in_flight",
        "coordination operations awaiting a reply"
    ).unwrap();

    /// Count of connection state transitions, by new state
    pub static ref ZK_STATE_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "zk_state_transitions",
        "count of connection state transitions",
        &["state"]
    ).unwrap();

    /// Count of replies that arrived after their operation was already settled
    pub static ref ZK_LATE_REPLIES: IntCounterVec = register_int_counter_vec!(
        "zk_late_replies",
        "count of replies dropped because the operation was already settled",
        &["op"]
    ).unwrap();
}
