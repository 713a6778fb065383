// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Element-wise access to list and map properties.

use super::request_uuid;
use crate::context::RequestContext;
use crate::pipeline::audit;
use crate::server::ApiServer;
use config::{ApiError, ApiResult};
use perms::{Crud, Perms2};
use serde::Deserialize;
use serde_json::{Value, json};
use store::{CollectionOp, ReadOptions};
use tracing::debug;

/// Query of a prop-collection-get request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropCollectionGet {
    pub uuid: Option<String>,
    /// Comma separated.
    pub fields: Option<String>,
    pub position: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropCollectionUpdate {
    pub uuid: Option<String>,
    #[serde(default)]
    pub updates: Vec<CollectionOp>,
}

impl ApiServer {
    pub fn prop_collection_get(
        &self,
        ctx: &RequestContext,
        req: &PropCollectionGet,
    ) -> ApiResult<Value> {
        let uuid = req.uuid.as_deref().ok_or_else(|| {
            ApiError::bad_request("Object uuid needed for property collection get")
        })?;
        let fields: Vec<String> = req
            .fields
            .as_deref()
            .ok_or_else(|| {
                ApiError::bad_request("Object fields needed for property collection get")
            })?
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        let not_found = || ApiError::NotFound(format!("Object Not Found: {uuid}"));
        let uuid = id::parse_lenient(uuid).map_err(|_| not_found())?;
        let ty = self.db().resource_type(&uuid).map_err(|_| not_found())?;
        self.check_rbac(ctx, ty, &[], Crud::Read)?;

        let mut result = self
            .db()
            .prop_collection_get(&uuid, &fields, req.position.as_deref())?;
        let id_perms = result.remove("id_perms").unwrap_or(Value::Null);
        if !self.perms().is_admin(&ctx.identity) {
            let body = self.db().read(&uuid, &ReadOptions::shallow())?;
            self.perms()
                .check_read(&ctx.identity, &Perms2::of(&body))?;
            if id_perms.get("user_visible").and_then(Value::as_bool) == Some(false) {
                return Err(ApiError::NotFound(format!(
                    "This object is not visible by users: {uuid}"
                )));
            }
        }
        Ok(Value::Object(result))
    }

    /// Apply every update of the request, or none of them.
    pub fn prop_collection_update(
        &self,
        ctx: &RequestContext,
        req: &PropCollectionUpdate,
    ) -> ApiResult<Value> {
        let uuid = req
            .uuid
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Error: prop_collection_update needs obj_uuid"))?;
        let not_found = || ApiError::NotFound(format!("Object Not Found: {uuid}"));
        let uuid = request_uuid(uuid, "object id")?;
        let ty = self.db().resource_type(&uuid).map_err(|_| not_found())?;
        let fields: Vec<&str> = req.updates.iter().map(|u| u.field.as_str()).collect();
        self.check_rbac(ctx, ty, &fields, Crud::Update)?;
        if !self.perms().is_admin(&ctx.identity) {
            let body = self.db().read(&uuid, &ReadOptions::shallow())?;
            self.perms()
                .check_write(&ctx.identity, &Perms2::of(&body))?;
        }
        self.check_backpressure()?;
        let result = self.db().prop_collection_update(&uuid, &req.updates);
        audit(ctx, "prop-collection-update", ty, Some(&uuid), result.as_ref().map(|_| ()));
        result?;
        self.invalidate_around(&uuid);
        debug!("Applied {} collection updates to {ty} {uuid}", req.updates.len());
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_body_parses() {
        let req: PropCollectionUpdate = serde_json::from_value(json!({
            "uuid": "6e5bd3a4-8bfa-4a45-9d63-4c7cb1a5a1c2",
            "updates": [
                {"field": "annotations", "operation": "set",
                 "value": {"key": "k", "value": "v"}},
                {"field": "annotations", "operation": "delete", "position": "k"}
            ]
        }))
        .unwrap();
        assert_eq!(req.updates.len(), 2);
        assert_eq!(req.updates[1].position.as_deref(), Some("k"));
    }
}
