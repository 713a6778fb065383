// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use config::ApiError;
use coord::CoordError;
use id::Uuid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("Request to the orchestrator failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Orchestrator answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("Cannot decode orchestrator object: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Object {0} misses {1}")]
    Malformed(String, &'static str),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Coord(#[from] CoordError),
    #[error("No free vlan under interface {0}")]
    VlanExhausted(Uuid),
    #[error("Vlan {0} is out of range")]
    VlanRange(u32),
    #[error("Mastership lost")]
    SessionLost,
}

pub type KubeResult<T> = Result<T, KubeError>;

impl From<KubeError> for ApiError {
    fn from(value: KubeError) -> Self {
        match value {
            KubeError::Api(e) => e,
            KubeError::Coord(e) => e.into(),
            KubeError::Malformed(..) | KubeError::VlanRange(_) | KubeError::Decode(_) => {
                ApiError::Validation(value.to_string())
            }
            KubeError::SessionLost => ApiError::Backpressure(value.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl KubeError {
    /// Whether the core refused the write because the target is already gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(e) if e.is_not_found())
    }
}
