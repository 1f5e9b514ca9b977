//! # zkem-core
//!
//! Runtime plumbing shared by the zkem crates: the single-consumer [`Reactor`]
//! every callback is delivered on, and the cli/env/tracing configuration.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub use crate::reactor::Reactor;

pub mod config;
pub mod env;
pub mod reactor;
