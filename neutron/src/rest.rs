// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! `POST /neutron/{resource}`.

use crate::errors::NeutronError;
use crate::plugin::NeutronPlugin;
use crate::request::{NeutronRequest, Resource};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

impl IntoResponse for NeutronError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!("Neutron request failed with {status}: {self}");
        (status, Json(self.body())).into_response()
    }
}

/// Routes of the adapter, to merge with the core ones.
pub fn router(plugin: Arc<NeutronPlugin>) -> Router {
    Router::new()
        .route("/neutron/{resource}", post(neutron_request))
        .with_state(plugin)
}

async fn neutron_request(
    State(plugin): State<Arc<NeutronPlugin>>,
    Path(resource): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, NeutronError> {
    let resource: Resource = resource.parse().map_err(|_| NeutronError::NotFound {
        msg: format!("Unknown resource {resource}"),
    })?;
    let req = NeutronRequest::parse(&body)?;
    plugin.handle(resource, &req).await.map(Json)
}
