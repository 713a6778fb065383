// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Resource model of the API server: the schema of every resource type, the registry derived
//! from it, property validators, fq-names and the error kinds surfaced by the REST API.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod errors;
pub mod fqname;
pub mod registry;
pub mod schema;
pub mod validate;

pub use errors::{ApiError, ApiResult}; // re-export
pub use fqname::FqName; // re-export
pub use registry::{Registry, ResourceDesc, registry}; // re-export

use tracectl::trace_target;
trace_target!("schema", LevelFilter::INFO, &["schema"]);
