// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::state::{CreateState, Stage};
use super::undo::{Compensation, CompensationList};
use super::{Outcome, audit, now_stamp, perms_of, resource_desc, summary};
use crate::context::RequestContext;
use crate::server::ApiServer;
use config::registry::object_type;
use config::validate::{validate_props, validate_refs};
use config::{ApiError, ApiResult, FqName, ResourceDesc};
use id::Uuid;
use perms::{Crud, Perms2};
use serde_json::{Map, Value, json};
use store::{NewRow, Parent, ReadOptions};
use tracing::{debug, error};

/// Fq-name of the default instance of a parent type.
pub(crate) fn default_parent_fq(parent_type: &str) -> Option<FqName> {
    let segments: &[&str] = match parent_type {
        "domain" => &["default-domain"],
        "project" => &["default-domain", "default-project"],
        "global-system-config" => &["default-global-system-config"],
        "policy-management" => &["default-policy-management"],
        "virtual-network" => &["default-domain", "default-project", "default-virtual-network"],
        _ => return None,
    };
    Some(FqName::from(segments))
}

fn parse_fq(value: &Value) -> ApiResult<FqName> {
    serde_json::from_value::<FqName>(value.clone())
        .map_err(|_| ApiError::bad_request("Bad Request, fq_name must be a list of strings"))
}

impl ApiServer {
    /// Create a resource of `resource_type` from a request body.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        mut obj: Map<String, Value>,
    ) -> ApiResult<Outcome> {
        let desc = resource_desc(resource_type)?;
        let ty = desc.name();
        let mut stage = Stage::new(&ctx.request_id, format!("create {ty}"), CreateState::Initial);
        let mut undo = CompensationList::new();
        let result = self
            .create_stages(ctx, desc, &mut obj, &mut stage, &mut undo)
            .await;
        match &result {
            Ok(outcome) => audit(ctx, "create", ty, outcome.uuid().as_ref(), Ok(())),
            Err(e) => {
                stage.failed(e);
                undo.unwind(self, ctx).await;
                audit(ctx, "create", ty, None, Err(e));
            }
        }
        result
    }

    /// Decide the fq-name and parent of a new resource and write them back into `obj`.
    fn locate(
        &self,
        desc: &'static ResourceDesc,
        obj: &mut Map<String, Value>,
    ) -> ApiResult<(FqName, Option<Parent>)> {
        let ty = desc.name();
        let mut requested = obj
            .get("parent_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let default_name = format!("default-{ty}");
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .unwrap_or(default_name.as_str())
            .to_string();
        let fq = if let Some(value) = obj.get("fq_name").filter(|v| !v.is_null()) {
            parse_fq(value)?
        } else if let Some(puuid) = obj.get("parent_uuid").and_then(Value::as_str) {
            let puuid = id::parse_canonical(puuid)?;
            requested = Some(self.db().resource_type(&puuid)?.to_string());
            self.db().fq_name(&puuid)?.child(name)
        } else {
            let first = desc.parent_types().next();
            match requested.as_deref().or(first) {
                Some(ptype) if requested.is_some() || !desc.root_allowed() => {
                    let ptype = ptype.replace('_', "-");
                    default_parent_fq(&ptype)
                        .ok_or_else(|| {
                            ApiError::bad_request(format!(
                                "Bad Request, no fq_name and no default {ptype} to create {ty} in"
                            ))
                        })?
                        .child(name)
                }
                _ => FqName::new([name]),
            }
        };
        fq.check_name(desc.ty.colon_allowed)?;
        let parent_type = desc.resolve_parent_type(requested.as_deref(), &fq)?;
        let parent = match parent_type {
            None => {
                if fq.len() != 1 {
                    return Err(ApiError::bad_request(format!(
                        "Bad Request, fq_name {fq} of a top level {ty} must have one segment"
                    )));
                }
                None
            }
            Some(ptype) => {
                let pfq = fq.parent();
                let puuid = self.db().uuid_of(ptype, &pfq).map_err(|_| {
                    ApiError::NotFound(format!(
                        "Parent {:?} type {ptype} does not exist",
                        pfq.segments()
                    ))
                })?;
                if let Some(given) = obj.get("parent_uuid").and_then(Value::as_str)
                    && id::parse_canonical(given)? != puuid
                {
                    return Err(ApiError::bad_request(format!(
                        "Bad Request, parent_uuid {given} does not match fq_name {fq}"
                    )));
                }
                Some(Parent {
                    resource_type: ptype,
                    uuid: puuid,
                })
            }
        };
        obj.insert("fq_name".into(), json!(fq));
        obj.insert("name".into(), json!(fq.name()));
        match &parent {
            Some(p) => {
                obj.insert("parent_type".into(), json!(p.resource_type));
                obj.insert("parent_uuid".into(), json!(p.uuid.to_string()));
            }
            None => {
                obj.remove("parent_type");
                obj.remove("parent_uuid");
            }
        }
        Ok((fq, parent))
    }

    /// Resolve every reference of `obj` to an id, checking read access on each peer.
    pub(crate) fn resolve_refs(
        &self,
        ctx: &RequestContext,
        desc: &ResourceDesc,
        obj: &mut Map<String, Value>,
    ) -> ApiResult<()> {
        let admin = self.perms().is_admin(&ctx.identity);
        for field in &desc.refs {
            let Some(Value::Array(items)) = obj.get_mut(&field.field) else {
                continue;
            };
            let target = field.desc.to;
            for item in items.iter_mut() {
                let Some(item) = item.as_object_mut() else {
                    return Err(ApiError::bad_request(format!(
                        "Bad Request, {} entries must be objects",
                        field.field
                    )));
                };
                let uuid = match item.get("uuid").and_then(Value::as_str) {
                    Some(uuid) => {
                        let uuid = id::parse_canonical(uuid)?;
                        if !self.db().exists(&uuid) {
                            return Err(ApiError::no_id(uuid));
                        }
                        uuid
                    }
                    None => {
                        let to = item
                            .get("to")
                            .map(parse_fq)
                            .transpose()?
                            .ok_or_else(|| {
                                ApiError::bad_request(format!(
                                    "Bad Request, {} needs to or uuid",
                                    field.field
                                ))
                            })?;
                        let uuid = self.db().uuid_of(target, &to)?;
                        item.insert("uuid".into(), json!(uuid.to_string()));
                        uuid
                    }
                };
                if !admin {
                    self.perms()
                        .check_read(&ctx.identity, &perms_of(self, &uuid)?)?;
                }
            }
        }
        Ok(())
    }

    async fn create_stages(
        &self,
        ctx: &RequestContext,
        desc: &'static ResourceDesc,
        obj: &mut Map<String, Value>,
        stage: &mut Stage<CreateState>,
        undo: &mut CompensationList,
    ) -> ApiResult<Outcome> {
        let ty = desc.name();
        let hooks = self.hooks(ty);
        self.check_backpressure()?;
        {
            let fields: Vec<&str> = obj.keys().map(String::as_str).collect();
            self.check_rbac(ctx, ty, &fields, Crud::Create)?;
        }

        let (_, parent) = self.locate(desc, obj)?;
        let admin = self.perms().is_admin(&ctx.identity);
        if !admin && let Some(parent) = &parent {
            self.perms()
                .check_write(&ctx.identity, &perms_of(self, &parent.uuid)?)?;
        }
        validate_props(desc, obj, true)?;
        validate_refs(desc, obj)?;
        self.resolve_refs(ctx, desc, obj)?;

        let owner = ctx
            .identity
            .project_id
            .clone()
            .unwrap_or_else(|| "cloud-admin".to_string());
        let mut perms2 = Perms2::owned_by(&owner);
        if let Some(given) = obj.get("perms2") {
            let given: Perms2 = serde_json::from_value(given.clone())
                .map_err(|e| ApiError::bad_request(format!("Bad Request, perms2: {e}")))?;
            if admin && !given.owner.is_empty() {
                perms2.owner = given.owner.replace('-', "");
            }
            perms2.owner_access = given.owner_access;
            perms2.global_access = given.global_access;
            perms2.share = given.share;
        }
        obj.insert("perms2".into(), perms2.to_value());
        stage.enter(CreateState::Validated);

        stage.enter(CreateState::PendingDbeCreate);
        if let Some(body) = hooks.pending_create(self, ctx, obj).await? {
            return Ok(Outcome::accepted(body));
        }

        stage.enter(CreateState::PreDbeAlloc);
        hooks.pre_alloc(self, ctx, obj).await?;
        let fq = obj
            .get("fq_name")
            .map(parse_fq)
            .transpose()?
            .ok_or_else(|| ApiError::Internal("fq_name lost before allocation".to_string()))?;

        stage.enter(CreateState::DbeAlloc);
        self.check_backpressure()?;
        let requested = obj
            .get("uuid")
            .and_then(Value::as_str)
            .map(id::parse_canonical)
            .transpose()?;
        let uuid = self.db().alloc(ty, &fq, requested)?;
        undo.push(Compensation::ReleaseName {
            resource_type: ty,
            fq_name: fq.clone(),
        });
        obj.insert("uuid".into(), json!(uuid.to_string()));
        stamp_id_perms(obj, &uuid, ctx.identity.user.as_deref());

        stage.enter(CreateState::PreDbeCreate);
        hooks.pre_create(self, ctx, obj, undo).await?;

        stage.enter(CreateState::DbeCreate);
        // re-read: a pre-alloc hook may have moved the resource
        let parent = obj
            .get("parent_uuid")
            .and_then(Value::as_str)
            .map(|p| -> ApiResult<Parent> {
                let uuid = id::parse_canonical(p)?;
                Ok(Parent {
                    resource_type: self.db().resource_type(&uuid)?,
                    uuid,
                })
            })
            .transpose()?;
        if desc.quota_tracked()
            && let Some(parent) = parent.filter(|p| p.resource_type == "project")
        {
            self.acquire_quota(&parent.uuid, ty, undo).await?;
        }
        self.db().create(NewRow {
            resource_type: ty,
            uuid,
            fq_name: fq,
            parent,
            body: obj.clone(),
        })?;

        stage.enter(CreateState::PostDbeCreate);
        if let Err(e) = hooks.post_create(self, ctx, obj).await {
            error!("{}: post-create of {ty} {uuid} failed: {e}", ctx.request_id);
        }
        self.invalidate_around(&uuid);
        stage.enter(CreateState::Done);
        Ok(Outcome::ok(summary(self, ty, obj)))
    }

    /// Count a new resource against the limit its project sets, if any.
    async fn acquire_quota(
        &self,
        project: &Uuid,
        resource_type: &str,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let body = self.db().read(project, &ReadOptions::shallow())?;
        let ot = object_type(resource_type);
        let Some(limit) = perms::quota_limit(&body, &ot) else {
            return Ok(());
        };
        let ticket = self
            .quota()
            .acquire_counted(project, &ot, limit, || {
                self.db().count(resource_type, Some(project))
            })
            .await?;
        debug!("Quota ticket {} taken", ticket.path);
        undo.push(Compensation::ReturnQuota(ticket));
        Ok(())
    }
}

/// Fill in the server-maintained part of `id_perms`.
pub(crate) fn stamp_id_perms(obj: &mut Map<String, Value>, uuid: &Uuid, creator: Option<&str>) {
    let now = now_stamp();
    let (ms, ls) = uuid.as_u64_pair();
    let mut id_perms = obj
        .get("id_perms")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    id_perms.insert("uuid".into(), json!({"uuid_mslong": ms, "uuid_lslong": ls}));
    id_perms.entry("enable").or_insert(json!(true));
    id_perms.entry("user_visible").or_insert(json!(true));
    id_perms.insert("created".into(), json!(now));
    id_perms.insert("last_modified".into(), json!(now));
    if let Some(creator) = creator {
        id_perms.entry("creator").or_insert(json!(creator));
    }
    obj.insert("id_perms".into(), Value::Object(id_perms));
}
