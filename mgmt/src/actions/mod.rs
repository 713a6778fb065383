// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Operations served outside of the per-type CRUD verbs.
//!
//! Each action takes the decoded request and returns the JSON body of the response. Actions
//! changing state record one audit line like the CRUD verbs do.

mod admin;
mod collection;
mod draft;
mod lookup;
mod network;
mod ownership;
mod tag;

pub use admin::{ExecuteJob, ObjCacheQuery, UserAgentKvRequest};
pub use collection::{PropCollectionGet, PropCollectionUpdate};
pub use draft::DraftAction;
pub use lookup::{FqNameToId, IdToFqName};
pub use network::{IpAlloc, IpFree, SubnetIpCount};
pub use ownership::{Chmod, Chown};

use config::{ApiError, ApiResult};
use id::Uuid;
use serde::de::DeserializeOwned;
use serde_json::Value;

use tracectl::trace_target;
trace_target!("actions", LevelFilter::INFO, &["pipeline"]);

/// Decode an action body, reporting what is wrong with it as a bad request.
pub fn decode<T: DeserializeOwned>(action: &str, body: Value) -> ApiResult<T> {
    serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("Bad Request, {action}: {e}")))
}

/// An id given in a request body, with the message used when it is malformed.
fn request_uuid(value: &str, what: &str) -> ApiResult<Uuid> {
    id::parse_lenient(value).map_err(|_| ApiError::bad_request(format!("Bad Request, invalid {what}")))
}
