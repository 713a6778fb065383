// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Neutron adapter: serves the resource requests of the Neutron plugin by translating them
//! into operations on the configuration API server.

#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod errors;
pub mod plugin;
pub mod request;
pub mod rest;

mod floatingip;
mod network;
mod port;
mod router;
mod routes;
mod security_group;
mod subnet;

pub use errors::{NeutronError, NeutronResult};
pub use plugin::NeutronPlugin;
pub use request::{NeutronRequest, Operation, Resource};
pub use rest::router;
