// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Cluster-wide numeric identifier allocation.
//!
//! An [`IdAllocator`] hands out integers from a range. Every allocation is persisted in the
//! coordination service as a node `<path><id>` holding the owner name before the id is
//! returned, so that a restarted server rebuilds the same state with [`IdAllocator::resync`].

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

mod allocator;
mod allocators;

pub use allocator::IdAllocator;
pub use allocators::{
    BGPAAS_PORT_PATH, IdAllocators, ROUTE_TARGET_MIN, SG_ID_MIN_ALLOC, SG_RESERVED_OWNER,
    TAG_TYPE_USER_MIN, VN_ID_MAX,
};

use config::ApiError;
use coord::CoordError;
use thiserror::Error;

use tracectl::trace_target;
trace_target!("idalloc", LevelFilter::INFO, &["allocation"]);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("{0} allocation failed: no free identifier")]
    Exhausted(String),
    #[error("Identifier {id} already allocated to {owner}")]
    InUse { id: u32, owner: String },
    #[error("Identifier {id} is out of range [{start}, {end}]")]
    OutOfRange { id: u32, start: u32, end: u32 },
    #[error(transparent)]
    Coord(#[from] CoordError),
}

impl From<AllocError> for ApiError {
    fn from(value: AllocError) -> Self {
        match value {
            AllocError::Exhausted(_) => ApiError::Internal(value.to_string()),
            AllocError::InUse { .. } => ApiError::Conflict(value.to_string()),
            AllocError::OutOfRange { .. } => ApiError::Validation(value.to_string()),
            AllocError::Coord(e) => e.into(),
        }
    }
}
