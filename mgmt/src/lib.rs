// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The configuration API server: request pipeline, type hooks, reference engine, actions,
//! default resources and the REST surface.

#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod actions;
pub mod addrmgr;
pub mod cache;
pub mod context;
pub mod hooks;
pub mod launch;
pub mod pipeline;
pub mod refs;
pub mod rest;
pub mod seed;
pub mod server;

/* In-process server for tests */
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::RequestContext;
pub use pipeline::{ListParams, Outcome, ReadParams, Status};
pub use server::{ApiServer, ApiServerParams, ApiServerParamsBuilder};
