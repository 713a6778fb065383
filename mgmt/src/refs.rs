// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Edge updates outside of CRUD: `ref-update` and `ref-relax-for-delete`.
//!
//! A ref update walks the update states of its owning resource, so type hooks see it as an
//! update of the reference field.

use crate::context::RequestContext;
use crate::pipeline::state::{Stage, UpdateState};
use crate::pipeline::undo::CompensationList;
use crate::pipeline::{audit, perms_of};
use crate::server::ApiServer;
use config::validate::validate_refs;
use config::{ApiError, ApiResult, FqName, registry};
use id::Uuid;
use perms::{Crud, Perms2};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use store::{ReadOptions, RefOp};
use strum::EnumString;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum RefOperation {
    Add,
    Delete,
}

impl From<RefOperation> for RefOp {
    fn from(value: RefOperation) -> Self {
        match value {
            RefOperation::Add => RefOp::Add,
            RefOperation::Delete => RefOp::Delete,
        }
    }
}

/// Body of a `ref-update` request.
#[derive(Debug, Clone, Deserialize)]
pub struct RefUpdate {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub uuid: String,
    #[serde(rename = "ref-type")]
    pub ref_type: String,
    #[serde(rename = "ref-uuid", default)]
    pub ref_uuid: Option<String>,
    #[serde(rename = "ref-fq-name", default)]
    pub ref_fq_name: Option<FqName>,
    pub operation: RefOperation,
    #[serde(default)]
    pub attr: Option<Value>,
    #[serde(default)]
    pub relax_ref_for_delete: bool,
}

/// Body of a `ref-relax-for-delete` request.
#[derive(Debug, Clone, Deserialize)]
pub struct RefRelax {
    pub uuid: String,
    #[serde(rename = "ref-uuid")]
    pub ref_uuid: String,
}

impl RefUpdate {
    #[must_use]
    pub fn new(resource_type: &str, uuid: &Uuid, ref_type: &str, ref_uuid: &Uuid, op: RefOperation) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            uuid: uuid.to_string(),
            ref_type: ref_type.to_string(),
            ref_uuid: Some(ref_uuid.to_string()),
            ref_fq_name: None,
            operation: op,
            attr: None,
            relax_ref_for_delete: false,
        }
    }
}

impl ApiServer {
    /// Add or remove one reference of a resource. Returns the owning id.
    pub async fn ref_update(&self, ctx: &RequestContext, req: &RefUpdate) -> ApiResult<Uuid> {
        let uuid = id::parse_canonical(&req.uuid)?;
        let mut stage = Stage::new(
            &ctx.request_id,
            format!("ref-update {} {uuid}", req.resource_type),
            UpdateState::Initial,
        );
        let mut undo = CompensationList::new();
        let result = self.ref_update_stages(ctx, req, &uuid, &mut stage, &mut undo).await;
        let ty = req.resource_type.replace('_', "-");
        match &result {
            Ok(()) => audit(ctx, "ref-update", &ty, Some(&uuid), Ok(())),
            Err(e) => {
                stage.failed(e);
                undo.unwind(self, ctx).await;
                audit(ctx, "ref-update", &ty, Some(&uuid), Err(e));
            }
        }
        result.map(|()| uuid)
    }

    async fn ref_update_stages(
        &self,
        ctx: &RequestContext,
        req: &RefUpdate,
        uuid: &Uuid,
        stage: &mut Stage<UpdateState>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let desc = registry()
            .lookup(&req.resource_type)
            .ok_or_else(|| ApiError::bad_request(format!("Bad type {}", req.resource_type)))?;
        let ty = desc.name();
        let ref_type = Self::resource_type(&req.ref_type)
            .map_err(|_| ApiError::bad_request(format!("Bad type {}", req.ref_type)))?;
        let field = desc
            .ref_to(ref_type)
            .ok_or_else(|| ApiError::bad_request(format!("{ty} has no reference to {ref_type}")))?;
        if self.db().resource_type(uuid)? != ty {
            return Err(ApiError::no_id(uuid));
        }
        let ref_uuid = self.ref_target(req, ref_type)?;
        self.check_rbac(ctx, ty, &[field.field.as_str()], Crud::Update)?;
        let current = self.db().read(uuid, &ReadOptions::shallow())?;
        if !self.perms().is_admin(&ctx.identity) {
            self.perms()
                .check_write(&ctx.identity, &Perms2::of(&current))?;
            if req.operation == RefOperation::Add {
                self.perms()
                    .check_read(&ctx.identity, &perms_of(self, &ref_uuid)?)?;
            }
        }
        let attr = match req.attr.clone().filter(|a| !a.is_null()) {
            Some(attr) => {
                let mut wrapped = Map::new();
                wrapped.insert(field.field.clone(), json!([{ "attr": attr }]));
                validate_refs(desc, &mut wrapped)?;
                wrapped[&field.field][0].get("attr").cloned()
            }
            None => None,
        };
        stage.enter(UpdateState::Validated);

        // hooks see the reference field as it will be after the update
        let mut patch = Map::new();
        patch.insert(
            field.field.clone(),
            Value::Array(edited_refs(&current, &field.field, &ref_uuid, attr.as_ref(), req.operation)),
        );
        stage.enter(UpdateState::PendingDbeUpdate);
        let hooks = self.hooks(ty);
        stage.enter(UpdateState::PreDbeUpdate);
        hooks.pre_update(self, ctx, &current, &mut patch, undo).await?;

        stage.enter(UpdateState::DbeUpdate);
        self.check_backpressure()?;
        self.db().ref_update(
            uuid,
            ref_type,
            &ref_uuid,
            attr,
            req.operation.into(),
            req.relax_ref_for_delete,
        )?;
        self.invalidate_around(uuid);
        self.cache().invalidate(&ref_uuid);
        debug!(
            "{}: {:?} {ty} {uuid} -> {ref_type} {ref_uuid}",
            ctx.request_id, req.operation
        );

        stage.enter(UpdateState::PostDbeUpdate);
        if let Err(e) = hooks.post_update(self, ctx, &current, &patch).await {
            error!("{}: post-update of {ty} {uuid} failed: {e}", ctx.request_id);
        }
        stage.enter(UpdateState::Done);
        Ok(())
    }

    /// The peer of a ref update: by id, by fq-name, or both when they agree.
    fn ref_target(&self, req: &RefUpdate, ref_type: &str) -> ApiResult<Uuid> {
        let by_id = req
            .ref_uuid
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(id::parse_canonical)
            .transpose()?;
        let by_name = match &req.ref_fq_name {
            Some(fq) if !fq.is_empty() => Some(self.db().uuid_of(ref_type, fq)?),
            _ => None,
        };
        match (by_id, by_name) {
            (Some(id), Some(named)) if id != named => Err(ApiError::bad_request(format!(
                "ref-uuid {id} and ref-fq-name {} do not match",
                req.ref_fq_name.as_ref().map(ToString::to_string).unwrap_or_default()
            ))),
            (Some(id), _) => {
                // removing an edge towards a deleted peer stays allowed
                if req.operation == RefOperation::Add && self.db().resource_type(&id)? != ref_type {
                    return Err(ApiError::bad_request(format!("{id} is not a {ref_type}")));
                }
                Ok(id)
            }
            (None, Some(named)) => Ok(named),
            (None, None) => Err(ApiError::bad_request(
                "Bad Request, ref-uuid or ref-fq-name needed",
            )),
        }
    }

    /// Stop the edge from `uuid` to `ref_uuid` from blocking the deletion of the latter.
    pub fn ref_relax_for_delete(&self, ctx: &RequestContext, req: &RefRelax) -> ApiResult<Uuid> {
        let uuid = id::parse_canonical(&req.uuid)?;
        let ref_uuid = id::parse_canonical(&req.ref_uuid)?;
        let ty = self.db().resource_type(&uuid)?;
        self.check_rbac(ctx, "ref-relax-for-delete", &[], Crud::Update)?;
        if !self.perms().is_admin(&ctx.identity) {
            self.perms()
                .check_write(&ctx.identity, &perms_of(self, &uuid)?)?;
        }
        self.check_backpressure()?;
        self.db().relax_ref(&uuid, &ref_uuid)?;
        self.invalidate_around(&uuid);
        audit(ctx, "ref-relax-for-delete", ty, Some(&uuid), Ok(()));
        Ok(uuid)
    }
}

/// The reference list of `field` once the edge to `peer` is added or removed.
fn edited_refs(
    current: &Map<String, Value>,
    field: &str,
    peer: &Uuid,
    attr: Option<&Value>,
    op: RefOperation,
) -> Vec<Value> {
    let mut refs: Vec<Value> = current
        .get(field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let peer_str = peer.to_string();
    refs.retain(|r| r.get("uuid").and_then(Value::as_str) != Some(peer_str.as_str()));
    if op == RefOperation::Add {
        let mut edge = json!({ "uuid": peer_str });
        if let Some(attr) = attr {
            edge["attr"] = attr.clone();
        }
        refs.push(edge);
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_body_parses() {
        let req: RefUpdate = serde_json::from_value(json!({
            "type": "virtual-machine-interface",
            "uuid": "6e5bd3a4-8bfa-4a45-9d63-4c7cb1a5a1c2",
            "ref-type": "security-group",
            "operation": "ADD",
            "ref-fq-name": ["default-domain", "p1", "default"]
        }))
        .unwrap();
        assert_eq!(req.operation, RefOperation::Add);
        assert_eq!(req.ref_uuid, None);
        assert_eq!(req.ref_fq_name.unwrap().to_string(), "default-domain:p1:default");
        assert!(!req.relax_ref_for_delete);
    }

    #[test]
    fn edits_are_idempotent() {
        let peer = Uuid::new_v4();
        let mut current = Map::new();
        current.insert(
            "security_group_refs".into(),
            json!([{ "uuid": peer.to_string(), "attr": null }]),
        );
        let added = edited_refs(&current, "security_group_refs", &peer, None, RefOperation::Add);
        assert_eq!(added.len(), 1);
        let removed = edited_refs(&current, "security_group_refs", &peer, None, RefOperation::Delete);
        assert!(removed.is_empty());
        let none = edited_refs(&Map::new(), "security_group_refs", &peer, None, RefOperation::Delete);
        assert!(none.is_empty());
    }
}
