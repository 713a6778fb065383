// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The request pipeline shared by every CRUD verb.
//!
//! Each verb walks its own state machine (see [`state`]). Stages that change something outside
//! the resource table push a compensation on an [`undo::CompensationList`]; a failure unwinds
//! that list before the error is returned.

mod create;
mod delete;
mod list;
mod read;
pub mod state;
pub mod undo;
mod update;

pub use list::ListParams;
pub use read::ReadParams;

use crate::context::RequestContext;
use crate::server::ApiServer;
use config::{ApiError, ApiResult, registry};
use futures::future::BoxFuture;
use id::Uuid;
use perms::Perms2;
use serde_json::{Map, Value, json};
use tracing::info;

use tracectl::{custom_target, trace_target};
trace_target!("pipeline", LevelFilter::INFO, &["pipeline"]);
custom_target!("audit", LevelFilter::INFO, &["audit"]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Deferred, e.g. staged in a security draft.
    Accepted,
    NotModified,
}

/// What a verb produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    pub body: Value,
    pub etag: Option<String>,
}

impl Outcome {
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: Status::Ok,
            body,
            etag: None,
        }
    }

    #[must_use]
    pub fn accepted(body: Value) -> Self {
        Self {
            status: Status::Accepted,
            body,
            etag: None,
        }
    }

    #[must_use]
    pub fn not_modified(etag: String) -> Self {
        Self {
            status: Status::NotModified,
            body: Value::Null,
            etag: Some(etag),
        }
    }

    /// The id in a `{type: {uuid, ...}}` or `{uuid}` body.
    #[must_use]
    pub fn uuid(&self) -> Option<Uuid> {
        let uuid = self.body.get("uuid").or_else(|| {
            self.body
                .as_object()
                .and_then(|m| m.values().next())
                .and_then(|inner| inner.get("uuid"))
        })?;
        uuid.as_str().and_then(|u| Uuid::parse_str(u).ok())
    }

    /// The inner object of a `{type: {...}}` body.
    #[must_use]
    pub fn object(&self) -> Option<&Map<String, Value>> {
        self.body
            .as_object()
            .and_then(|m| m.values().next())
            .and_then(Value::as_object)
    }
}

/// Record one state-changing request on the audit target.
pub(crate) fn audit(
    ctx: &RequestContext,
    oper: &str,
    resource_type: &str,
    uuid: Option<&Uuid>,
    result: Result<(), &ApiError>,
) {
    let uuid = uuid.map(ToString::to_string).unwrap_or_default();
    metrics::counter!(
        "api_requests_total",
        "operation" => oper.to_string(),
        "resource_type" => resource_type.to_string(),
        "outcome" => if result.is_ok() { "ok" } else { "error" }
    )
    .increment(1);
    match result {
        Ok(()) => info!(
            target: "audit",
            "{} user={} project={} {oper} {resource_type} {uuid}: ok",
            ctx.request_id,
            ctx.identity.user_name(),
            ctx.identity.project_id.as_deref().unwrap_or("-"),
        ),
        Err(e) => info!(
            target: "audit",
            "{} user={} project={} {oper} {resource_type} {uuid}: {} {e}",
            ctx.request_id,
            ctx.identity.user_name(),
            ctx.identity.project_id.as_deref().unwrap_or("-"),
            e.status(),
        ),
    }
}

/// The `{uuid, fq_name, name, href, parent_*}` summary returned by create.
pub(crate) fn summary(api: &ApiServer, resource_type: &str, obj: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for key in ["uuid", "fq_name", "name", "parent_type", "parent_uuid"] {
        if let Some(value) = obj.get(key).filter(|v| !v.is_null()) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(uuid) = obj.get("uuid").and_then(Value::as_str) {
        out.insert(
            "href".into(),
            json!(format!("{}/{resource_type}/{uuid}", api.base_url())),
        );
    }
    if let (Some(ptype), Some(puuid)) = (
        obj.get("parent_type").and_then(Value::as_str),
        obj.get("parent_uuid").and_then(Value::as_str),
    ) {
        out.insert(
            "parent_href".into(),
            json!(format!("{}/{ptype}/{puuid}", api.base_url())),
        );
    }
    json!({ resource_type: out })
}

/// The current stamp for `id_perms.created` and `last_modified`.
pub(crate) fn now_stamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// The perms2 of a stored resource.
pub(crate) fn perms_of(api: &ApiServer, uuid: &Uuid) -> ApiResult<Perms2> {
    let body = api.db().read(uuid, &store::ReadOptions::shallow())?;
    Ok(Perms2::of(&body))
}

impl ApiServer {
    /// Create on behalf of another request, e.g. from a type hook.
    pub fn create_boxed(
        &self,
        ctx: RequestContext,
        resource_type: &'static str,
        body: Map<String, Value>,
    ) -> BoxFuture<'_, ApiResult<Outcome>> {
        Box::pin(async move { self.create(&ctx, resource_type, body).await })
    }

    pub fn update_boxed(
        &self,
        ctx: RequestContext,
        resource_type: &'static str,
        uuid: Uuid,
        body: Map<String, Value>,
    ) -> BoxFuture<'_, ApiResult<Outcome>> {
        Box::pin(async move { self.update(&ctx, resource_type, &uuid, body).await })
    }

    pub fn delete_boxed(
        &self,
        ctx: RequestContext,
        resource_type: &'static str,
        uuid: Uuid,
    ) -> BoxFuture<'_, ApiResult<Outcome>> {
        Box::pin(async move { self.delete(&ctx, resource_type, &uuid).await })
    }

    /// Create a resource unless one with the same fq-name exists. Returns its id either way.
    pub async fn get_or_create(
        &self,
        ctx: &RequestContext,
        resource_type: &'static str,
        body: Map<String, Value>,
    ) -> ApiResult<Uuid> {
        if let Some(fq) = body
            .get("fq_name")
            .cloned()
            .and_then(|v| serde_json::from_value::<config::FqName>(v).ok())
            && let Ok(uuid) = self.db().uuid_of(resource_type, &fq)
        {
            return Ok(uuid);
        }
        let outcome = self.create_boxed(ctx.clone(), resource_type, body).await?;
        outcome
            .uuid()
            .ok_or_else(|| ApiError::Internal(format!("Create of {resource_type} returned no id")))
    }

    /// Invalidate the cached bodies a write to `uuid` may have made stale.
    pub(crate) fn invalidate_around(&self, uuid: &Uuid) {
        self.cache().invalidate(uuid);
        if let Ok(Some(parent)) = self.db().parent(uuid) {
            self.cache().invalidate(&parent.uuid);
        }
        if let Ok(refs) = self.db().refs(uuid) {
            self.cache().invalidate_all(refs.into_iter().map(|e| e.uuid));
        }
        if let Ok(backrefs) = self.db().backrefs(uuid) {
            self.cache().invalidate_all(backrefs.into_iter().map(|b| b.uuid));
        }
    }
}

/// Normalize a type name given in hyphen or underscore form.
pub(crate) fn resource_desc(name: &str) -> ApiResult<&'static config::ResourceDesc> {
    registry()
        .lookup(name)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown resource type {name}")))
}
