// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The error type crossing the request pipeline. Each variant maps to exactly one HTTP status.

use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    MethodNotAllowed(String),
    #[error("{0}")]
    Conflict(String),
    /// Deletion refused because children or back-references remain
    #[error("{0}")]
    RefsExist(String),
    #[error("{0}")]
    PreconditionFailed(String),
    #[error("quota limit ({limit}) exceeded for resource {resource}")]
    OverQuota { limit: i64, resource: String },
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Backpressure(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Permission(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::MethodNotAllowed(_) => 405,
            ApiError::Conflict(_) | ApiError::RefsExist(_) => 409,
            ApiError::PreconditionFailed(_) | ApiError::OverQuota { .. } => 412,
            ApiError::Internal(_) => 500,
            ApiError::Backpressure(_) => 503,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "ValidationError",
            ApiError::Unauthorized(_) => "AuthenticationError",
            ApiError::Permission(_) => "PermissionError",
            ApiError::NotFound(_) => "NotFoundError",
            ApiError::MethodNotAllowed(_) => "MethodNotAllowedError",
            ApiError::Conflict(_) => "ConflictError",
            ApiError::RefsExist(_) => "RefsExistError",
            ApiError::PreconditionFailed(_) => "PreconditionFailedError",
            ApiError::OverQuota { .. } => "OverQuota",
            ApiError::Internal(_) => "InternalError",
            ApiError::Backpressure(_) => "BackpressureError",
        }
    }

    /// The JSON rendered in error responses.
    #[must_use]
    pub fn body(&self) -> Value {
        json!({ "exception": self.kind_name(), "msg": self.to_string() })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    #[must_use]
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    #[must_use]
    pub fn no_id(uuid: impl std::fmt::Display) -> Self {
        ApiError::NotFound(format!("ID {uuid} not found"))
    }

    #[must_use]
    pub fn no_fq_name(resource_type: &str, fq_name: impl std::fmt::Display) -> Self {
        ApiError::NotFound(format!("Name {fq_name} of type {resource_type} not found"))
    }
}

impl From<id::IdError> for ApiError {
    fn from(value: id::IdError) -> Self {
        ApiError::Validation(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_and_body() {
        let e = ApiError::OverQuota {
            limit: 2,
            resource: "virtual_network".to_string(),
        };
        assert_eq!(e.status(), 412);
        assert_eq!(
            e.body(),
            json!({"exception": "OverQuota", "msg": "quota limit (2) exceeded for resource virtual_network"})
        );
        assert_eq!(ApiError::RefsExist(String::new()).status(), 409);
        assert_eq!(ApiError::Backpressure(String::new()).status(), 503);
        assert!(ApiError::no_id("x").is_not_found());
    }
}
