// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface to the coordination service: named locks, counters, znodes holding allocator
//! mappings, and leader election. [`MemCoordinator`] implements it in process.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

mod memory;

pub use memory::MemCoordinator;

use async_trait::async_trait;
use config::ApiError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, watch};

use tracectl::trace_target;
trace_target!("coord", LevelFilter::INFO, &["coordination"]);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("Timed out acquiring lock {0}")]
    LockTimeout(String),
    #[error("Node {0} already exists")]
    NodeExists(String),
    #[error("Node {0} does not exist")]
    NoNode(String),
    #[error("Counter {path} would exceed {limit}")]
    LimitExceeded { path: String, limit: i64 },
    #[error("Coordination service is not connected")]
    Disconnected,
}

impl From<CoordError> for ApiError {
    fn from(value: CoordError) -> Self {
        match value {
            CoordError::LockTimeout(_) | CoordError::Disconnected => {
                ApiError::Backpressure(value.to_string())
            }
            CoordError::NodeExists(_) => ApiError::Conflict(value.to_string()),
            CoordError::NoNode(_) => ApiError::NotFound(value.to_string()),
            CoordError::LimitExceeded { .. } => ApiError::Internal(value.to_string()),
        }
    }
}

/// A held named lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Leadership of an election.
///
/// The receiver flips to `true` when the session backing the leadership is lost.
#[derive(Debug)]
pub struct Leadership {
    pub path: String,
    pub candidate: String,
    pub lost: watch::Receiver<bool>,
}

impl Leadership {
    #[must_use]
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Whether the session to the service is up. Writes are refused while it is down.
    fn is_connected(&self) -> bool;

    async fn lock(&self, path: &str, timeout: Duration) -> Result<LockGuard, CoordError>;

    /// Create a node; fails if it exists.
    async fn create_node(&self, path: &str, value: &str) -> Result<(), CoordError>;
    async fn read_node(&self, path: &str) -> Result<Option<String>, CoordError>;
    async fn delete_node(&self, path: &str) -> Result<(), CoordError>;
    /// Direct children of a path as `(name, value)`, sorted by name.
    async fn list_children(&self, path: &str) -> Result<Vec<(String, String)>, CoordError>;

    async fn counter_get(&self, path: &str) -> Result<Option<i64>, CoordError>;
    async fn counter_set(&self, path: &str, value: i64) -> Result<(), CoordError>;
    /// Add `delta` to a counter (missing counters start at 0).
    ///
    /// With a `limit`, an increment that would leave the counter above it is refused and the
    /// counter is left unchanged.
    async fn counter_add(
        &self,
        path: &str,
        delta: i64,
        limit: Option<i64>,
    ) -> Result<i64, CoordError>;
    async fn counter_delete(&self, path: &str) -> Result<(), CoordError>;

    /// Wait until `candidate` leads the election at `path`.
    async fn campaign(&self, path: &str, candidate: &str) -> Result<Leadership, CoordError>;
    async fn resign(&self, leadership: Leadership);
}
