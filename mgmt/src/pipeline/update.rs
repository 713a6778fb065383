// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::state::{Stage, UpdateState};
use super::undo::CompensationList;
use super::{Outcome, audit, now_stamp, resource_desc};
use crate::context::RequestContext;
use crate::server::ApiServer;
use config::validate::{validate_props, validate_refs};
use config::{ApiError, ApiResult, FqName, ResourceDesc};
use id::Uuid;
use perms::{Crud, Perms2};
use serde_json::{Map, Value, json};
use store::ReadOptions;
use tracing::error;

impl ApiServer {
    /// Merge `patch` into the resource `uuid` of `resource_type`.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        uuid: &Uuid,
        mut patch: Map<String, Value>,
    ) -> ApiResult<Outcome> {
        let desc = resource_desc(resource_type)?;
        let ty = desc.name();
        let mut stage = Stage::new(
            &ctx.request_id,
            format!("update {ty} {uuid}"),
            UpdateState::Initial,
        );
        let mut undo = CompensationList::new();
        let result = self
            .update_stages(ctx, desc, uuid, &mut patch, &mut stage, &mut undo)
            .await;
        match &result {
            Ok(_) => audit(ctx, "update", ty, Some(uuid), Ok(())),
            Err(e) => {
                stage.failed(e);
                undo.unwind(self, ctx).await;
                audit(ctx, "update", ty, Some(uuid), Err(e));
            }
        }
        result
    }

    async fn update_stages(
        &self,
        ctx: &RequestContext,
        desc: &'static ResourceDesc,
        uuid: &Uuid,
        patch: &mut Map<String, Value>,
        stage: &mut Stage<UpdateState>,
        undo: &mut CompensationList,
    ) -> ApiResult<Outcome> {
        let ty = desc.name();
        let hooks = self.hooks(ty);
        self.check_backpressure()?;
        if self.db().resource_type(uuid)? != ty {
            return Err(ApiError::no_id(uuid));
        }
        let current = self.db().read(uuid, &ReadOptions::shallow())?;
        {
            let fields: Vec<&str> = patch.keys().map(String::as_str).collect();
            self.check_rbac(ctx, ty, &fields, Crud::Update)?;
        }
        let admin = self.perms().is_admin(&ctx.identity);
        let perms = Perms2::of(&current);
        if !admin {
            self.perms().check_write(&ctx.identity, &perms)?;
        }
        check_identity_unchanged(&current, patch)?;
        if let Some(given) = patch.get("perms2").filter(|v| !v.is_null()) {
            let given: Perms2 = serde_json::from_value(given.clone())
                .map_err(|e| ApiError::bad_request(format!("Bad Request, perms2: {e}")))?;
            if !admin && given.owner.replace('-', "") != perms.owner {
                return Err(ApiError::Permission(
                    "Permission Denied: only the cloud admin may change the owner".to_string(),
                ));
            }
        }
        validate_props(desc, patch, false)?;
        validate_refs(desc, patch)?;
        self.resolve_refs(ctx, desc, patch)?;
        merge_id_perms(&current, patch);
        stage.enter(UpdateState::Validated);

        stage.enter(UpdateState::PendingDbeUpdate);
        if let Some(body) = hooks.pending_update(self, ctx, &current, patch).await? {
            return Ok(Outcome::accepted(body));
        }

        stage.enter(UpdateState::PreDbeUpdate);
        hooks.pre_update(self, ctx, &current, patch, undo).await?;

        stage.enter(UpdateState::DbeUpdate);
        self.check_backpressure()?;
        self.invalidate_around(uuid);
        self.db().update(uuid, patch)?;
        self.invalidate_around(uuid);

        stage.enter(UpdateState::PostDbeUpdate);
        if let Err(e) = hooks.post_update(self, ctx, &current, patch).await {
            error!("{}: post-update of {ty} {uuid} failed: {e}", ctx.request_id);
        }
        stage.enter(UpdateState::Done);
        Ok(Outcome::ok(json!({ ty: {
            "uuid": uuid.to_string(),
            "href": self.href(ty, uuid),
        }})))
    }
}

/// The fq-name and id of a resource never change.
fn check_identity_unchanged(current: &Map<String, Value>, patch: &Map<String, Value>) -> ApiResult<()> {
    if let Some(fq) = patch.get("fq_name").filter(|v| !v.is_null()) {
        let fq: FqName = serde_json::from_value(fq.clone())
            .map_err(|_| ApiError::bad_request("Bad Request, fq_name must be a list of strings"))?;
        if Some(&json!(fq)) != current.get("fq_name") {
            return Err(ApiError::bad_request(format!(
                "Bad Request, cannot change fq_name of a resource to {fq}"
            )));
        }
    }
    if let Some(uuid) = patch.get("uuid").filter(|v| !v.is_null())
        && Some(uuid) != current.get("uuid")
    {
        return Err(ApiError::bad_request(
            "Bad Request, cannot change the uuid of a resource",
        ));
    }
    Ok(())
}

/// Keep the server-maintained part of `id_perms` and bump `last_modified`.
fn merge_id_perms(current: &Map<String, Value>, patch: &mut Map<String, Value>) {
    let mut id_perms = current
        .get("id_perms")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    if let Some(Value::Object(given)) = patch.get("id_perms") {
        for (key, value) in given {
            if !matches!(key.as_str(), "uuid" | "created" | "creator" | "last_modified") {
                id_perms.insert(key.clone(), value.clone());
            }
        }
    }
    id_perms.insert("last_modified".into(), json!(now_stamp()));
    patch.insert("id_perms".into(), Value::Object(id_perms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_fields_are_immutable() {
        let mut current = Map::new();
        current.insert("fq_name".into(), json!(["a", "b"]));
        current.insert("uuid".into(), json!("u1"));
        let mut patch = Map::new();
        patch.insert("fq_name".into(), json!(["a", "b"]));
        assert!(check_identity_unchanged(&current, &patch).is_ok());
        patch.insert("fq_name".into(), json!(["a", "c"]));
        assert!(check_identity_unchanged(&current, &patch).is_err());
        patch.remove("fq_name");
        patch.insert("uuid".into(), json!("u2"));
        assert!(check_identity_unchanged(&current, &patch).is_err());
    }

    #[test]
    fn id_perms_keeps_server_fields() {
        let mut current = Map::new();
        current.insert(
            "id_perms".into(),
            json!({"created": "then", "enable": true, "last_modified": "then"}),
        );
        let mut patch = Map::new();
        patch.insert(
            "id_perms".into(),
            json!({"created": "now", "enable": false, "description": "d"}),
        );
        merge_id_perms(&current, &mut patch);
        let merged = &patch["id_perms"];
        assert_eq!(merged["created"], json!("then"));
        assert_eq!(merged["enable"], json!(false));
        assert_eq!(merged["description"], json!("d"));
        assert_ne!(merged["last_modified"], json!("then"));
    }
}
