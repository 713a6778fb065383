// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rendering of pipeline outcomes and errors as HTTP responses.

use crate::pipeline::{Outcome, Status};
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use config::ApiError;
use tracing::debug;

/// An [`ApiError`] on its way to the client.
#[derive(Debug)]
pub struct RestError(pub ApiError);

impl From<ApiError> for RestError {
    fn from(value: ApiError) -> Self {
        Self(value)
    }
}

impl From<id::IdError> for RestError {
    fn from(value: id::IdError) -> Self {
        Self(value.into())
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!("Request failed with {status}: {}", self.0);
        (status, Json(self.0.body())).into_response()
    }
}

pub type RestResult = Result<Outcome, RestError>;

fn etag_header(etag: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("\"{etag}\"")).ok()
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        let status = match self.status {
            Status::Ok => StatusCode::OK,
            Status::Accepted => StatusCode::ACCEPTED,
            Status::NotModified => StatusCode::NOT_MODIFIED,
        };
        let mut response = if self.status == Status::NotModified {
            status.into_response()
        } else {
            (status, Json(self.body)).into_response()
        };
        if let Some(value) = self.etag.as_deref().and_then(etag_header) {
            response.headers_mut().insert(header::ETAG, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn errors_carry_their_status() {
        let response = RestError(ApiError::NotFound("gone".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = RestError(ApiError::Backpressure("busy".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn not_modified_has_etag_and_no_body_status() {
        let response = Outcome::not_modified("2026-01-01T00:00:00.000000".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(
            response.headers().get(header::ETAG).unwrap(),
            "\"2026-01-01T00:00:00.000000\""
        );
        let response = Outcome::accepted(json!({})).into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
