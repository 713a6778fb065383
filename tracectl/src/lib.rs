// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of the API server's tracing targets.
//!
//! Every module declares its target with [`trace_target!`]; targets are gathered at link
//! time and their levels can be changed by tag while the server runs.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::module_name_repetitions)]

pub mod control;
pub mod display;
pub mod targets;

// re-exports
pub use control::{TraceCtl, TraceCtlError, get_trace_ctl, install_error_reporting};
pub use tracing_subscriber::filter::LevelFilter;
