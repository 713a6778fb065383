// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Container orchestrator adapter: follows the orchestrator's object streams and reflects
//! namespaces, networks, pods, services, endpoints, ingresses and network policies into
//! configuration objects of the API server.

#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod client;
pub mod errors;
pub mod event;
pub mod localdb;
pub mod manager;
pub mod naming;
pub mod reflector;
pub mod vlan;

pub use client::KubeClient;
pub use errors::{KubeError, KubeResult};
pub use event::{EventQueue, EventType, Kind, KubeEvent};
pub use manager::KubeManager;
pub use reflector::Reflector;

use futures::FutureExt;
use futures::future::BoxFuture;
use mgmt::ApiServer;
use std::sync::Arc;

/// The long-lived tasks of the adapter: one stream follower per kind plus the manager.
pub fn tasks(api: Arc<ApiServer>) -> KubeResult<Vec<BoxFuture<'static, ()>>> {
    let client = Arc::new(KubeClient::new(&api.config().kubernetes)?);
    let manager = KubeManager::new(api);
    let queue = manager.queue();
    let mut tasks: Vec<BoxFuture<'static, ()>> = Kind::all()
        .map(|kind| client.clone().follow(kind, queue.clone()).boxed())
        .collect();
    tasks.push(manager.run().boxed());
    Ok(tasks)
}
