// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Security policy draft mode.
//!
//! While a scope (a project, or the global policy-management) has drafting enabled, writes to
//! its firewall resources are staged as copies under a `draft-policy-management` child and
//! answered with 202. A commit replays the staged copies onto the scope; a discard drops them.

use super::{TypeHooks, fq_of, parent_uuid_of};
use crate::context::RequestContext;
use crate::pipeline::Outcome;
use crate::pipeline::undo::{Compensation, CompensationList};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::schema::catalog::SECURITY_OBJECT_TYPES;
use config::{ApiError, ApiResult, FqName, registry};
use id::Uuid;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use store::ReadOptions;
use tracing::{debug, info, warn};

pub const DRAFT_POLICY_MANAGEMENT: &str = "draft-policy-management";

/// Staging order of a commit: referenced resources before their referrers.
const COMMIT_ORDER: &[&str] = &[
    "address-group",
    "service-group",
    "firewall-rule",
    "firewall-policy",
    "application-policy-set",
];

const GLOBAL_SCOPE: &[&str] = &["default-policy-management"];

/// Where live security resources of a scope sit and where their drafts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftScope {
    /// The project or the global policy-management.
    pub scope_uuid: Uuid,
    /// The parent live resources are created under.
    pub live_parent: (&'static str, Uuid),
    pub live_fq: FqName,
    pub draft_fq: FqName,
    pub enabled: bool,
}

impl DraftScope {
    fn draft_parent_type(&self) -> Option<&'static str> {
        (self.draft_fq.len() > 1).then_some("project")
    }
}

fn draft_enabled(api: &ApiServer, resource_type: &str, fq: &FqName) -> bool {
    api.db()
        .uuid_of(resource_type, fq)
        .and_then(|u| api.db().read(&u, &ReadOptions::shallow()))
        .ok()
        .and_then(|body| body.get("enable_security_policy_draft").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// The draft scope of a live parent. `None` for parents that are drafts themselves or that
/// hold no security resources.
pub fn draft_scope_of(
    api: &ApiServer,
    parent_type: &str,
    parent_uuid: &Uuid,
) -> ApiResult<Option<DraftScope>> {
    let parent_fq = api.db().fq_name(parent_uuid)?;
    match parent_type {
        "project" => Ok(Some(DraftScope {
            scope_uuid: *parent_uuid,
            live_parent: ("project", *parent_uuid),
            draft_fq: parent_fq.child(DRAFT_POLICY_MANAGEMENT),
            enabled: draft_enabled(api, "project", &parent_fq),
            live_fq: parent_fq,
        })),
        "policy-management" if parent_fq == FqName::new(GLOBAL_SCOPE.iter().copied()) => {
            Ok(Some(DraftScope {
                scope_uuid: *parent_uuid,
                live_parent: ("policy-management", *parent_uuid),
                draft_fq: FqName::new([DRAFT_POLICY_MANAGEMENT]),
                enabled: draft_enabled(
                    api,
                    "global-system-config",
                    &FqName::new(["default-global-system-config"]),
                ),
                live_fq: parent_fq,
            }))
        }
        // drafts themselves and project owned policy-managements are never staged
        _ => Ok(None),
    }
}

/// The draft scope of a scope id given to the commit and discard actions.
pub(crate) fn scope_by_id(api: &ApiServer, scope_uuid: &Uuid) -> ApiResult<DraftScope> {
    let (ty, uuid) = match api.db().resource_type(scope_uuid)? {
        "global-system-config" => (
            "policy-management",
            api.db()
                .uuid_of("policy-management", &FqName::new(GLOBAL_SCOPE.iter().copied()))?,
        ),
        ty @ ("project" | "policy-management") => (ty, *scope_uuid),
        ty => {
            return Err(ApiError::bad_request(format!(
                "Bad Request, {scope_uuid} is a {ty}, not a security draft scope"
            )));
        }
    };
    draft_scope_of(api, ty, &uuid)?.ok_or_else(|| {
        ApiError::bad_request(format!("Bad Request, {scope_uuid} is not a security draft scope"))
    })
}

/// Make sure the draft container of a scope exists.
pub(crate) async fn ensure_draft_pm(
    api: &ApiServer,
    ctx: &RequestContext,
    scope: &DraftScope,
) -> ApiResult<Uuid> {
    let mut body = Map::new();
    body.insert("fq_name".into(), json!(scope.draft_fq));
    if let Some(ptype) = scope.draft_parent_type() {
        body.insert("parent_type".into(), json!(ptype));
    }
    api.get_or_create(&ctx.as_internal(), "policy-management", body)
        .await
}

/// Ids of the staged resources of a scope, per type.
fn drafts(api: &ApiServer, scope: &DraftScope) -> HashMap<&'static str, Vec<Uuid>> {
    let mut out: HashMap<&'static str, Vec<Uuid>> = HashMap::new();
    let Ok(draft_pm) = api.db().uuid_of("policy-management", &scope.draft_fq) else {
        return out;
    };
    for (ty, uuid) in api.db().children(&draft_pm).unwrap_or_default() {
        out.entry(ty).or_default().push(uuid);
    }
    out
}

/// Whether a scope has staged resources.
pub(crate) fn has_drafts(api: &ApiServer, scope: &DraftScope) -> bool {
    drafts(api, scope).values().any(|v| !v.is_empty())
}

/// A staging copy of `body`, placed in the draft container.
fn draft_copy(
    body: &Map<String, Value>,
    draft_pm: &Uuid,
    draft_fq: &FqName,
    state: &str,
) -> ApiResult<Map<String, Value>> {
    let name = fq_of(body)?.name().to_string();
    let mut copy = body.clone();
    for key in ["uuid", "href", "parent_href", "id_perms"] {
        copy.remove(key);
    }
    copy.insert("fq_name".into(), json!(draft_fq.child(name)));
    copy.insert("parent_type".into(), json!("policy-management"));
    copy.insert("parent_uuid".into(), json!(draft_pm.to_string()));
    copy.insert("draft_mode_state".into(), json!(state));
    Ok(copy)
}

/// Stage `body` (the merged view of the resource) with `state`, creating or refreshing its copy.
async fn stage_draft(
    api: &ApiServer,
    ctx: &RequestContext,
    resource_type: &'static str,
    scope: &DraftScope,
    body: &Map<String, Value>,
    state: &str,
) -> ApiResult<Outcome> {
    let draft_pm = ensure_draft_pm(api, ctx, scope).await?;
    let name = fq_of(body)?.name().to_string();
    let draft_fq = scope.draft_fq.child(name);
    match api.db().uuid_of(resource_type, &draft_fq) {
        Ok(existing) => {
            let current = api.db().read(&existing, &ReadOptions::shallow())?;
            // a resource created in this draft stays "created" until committed
            let state = match current.get("draft_mode_state").and_then(Value::as_str) {
                Some("created") if state != "deleted" => "created",
                _ => state,
            };
            let mut patch = draft_copy(body, &draft_pm, &scope.draft_fq, state)?;
            for key in ["fq_name", "parent_type", "parent_uuid", "perms2"] {
                patch.remove(key);
            }
            api.update_boxed(ctx.as_internal(), resource_type, existing, patch)
                .await?;
            debug!("Refreshed draft {resource_type} {existing} ({state})");
            Ok(Outcome::accepted(json!({ resource_type: {
                "uuid": existing.to_string(),
                "fq_name": draft_fq,
                "draft_mode_state": state,
            }})))
        }
        Err(e) if e.is_not_found() => {
            let copy = draft_copy(body, &draft_pm, &scope.draft_fq, state)?;
            let outcome = api
                .create_boxed(ctx.as_internal(), resource_type, copy)
                .await?;
            Ok(Outcome::accepted(outcome.body))
        }
        Err(e) => Err(e),
    }
}

/// The scope a live resource body belongs to, when drafting applies to it.
fn live_scope(
    api: &ApiServer,
    ctx: &RequestContext,
    body: &Map<String, Value>,
) -> ApiResult<Option<DraftScope>> {
    if ctx.draft_commit {
        return Ok(None);
    }
    let Some(parent_uuid) = parent_uuid_of(body) else {
        return Ok(None);
    };
    let parent_type = api.db().resource_type(&parent_uuid)?;
    Ok(draft_scope_of(api, parent_type, &parent_uuid)?.filter(|s| s.enabled))
}

/// Only the server writes the draft state of a resource.
fn check_draft_state_untouched(ctx: &RequestContext, obj: &Map<String, Value>) -> ApiResult<()> {
    if !ctx.is_internal() && obj.get("draft_mode_state").is_some_and(|v| !v.is_null()) {
        return Err(ApiError::bad_request(
            "Security resource property 'draft_mode_state' is only readable",
        ));
    }
    Ok(())
}

fn merged(current: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut out = current.clone();
    for (key, value) in patch {
        if value.is_null() {
            out.remove(key);
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Draft staging for a firewall resource type.
pub struct DraftHooks(pub &'static str);

/// Stage a create if the parent scope is drafting.
pub(crate) async fn draft_create(
    api: &ApiServer,
    ctx: &RequestContext,
    resource_type: &'static str,
    obj: &Map<String, Value>,
) -> ApiResult<Option<Value>> {
    check_draft_state_untouched(ctx, obj)?;
    let Some(scope) = live_scope(api, ctx, obj)? else {
        return Ok(None);
    };
    info!("Staging new {resource_type} {} in draft", fq_of(obj)?);
    let outcome = stage_draft(api, ctx, resource_type, &scope, obj, "created").await?;
    Ok(Some(outcome.body))
}

pub(crate) async fn draft_update(
    api: &ApiServer,
    ctx: &RequestContext,
    resource_type: &'static str,
    current: &Map<String, Value>,
    patch: &Map<String, Value>,
) -> ApiResult<Option<Value>> {
    check_draft_state_untouched(ctx, patch)?;
    let Some(scope) = live_scope(api, ctx, current)? else {
        return Ok(None);
    };
    let body = merged(current, patch);
    let outcome = stage_draft(api, ctx, resource_type, &scope, &body, "updated").await?;
    Ok(Some(outcome.body))
}

pub(crate) async fn draft_delete(
    api: &ApiServer,
    ctx: &RequestContext,
    resource_type: &'static str,
    current: &Map<String, Value>,
) -> ApiResult<Option<Value>> {
    let Some(scope) = live_scope(api, ctx, current)? else {
        return Ok(None);
    };
    let outcome = stage_draft(api, ctx, resource_type, &scope, current, "deleted").await?;
    Ok(Some(outcome.body))
}

#[async_trait]
impl TypeHooks for DraftHooks {
    async fn pending_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        draft_create(api, ctx, self.0, obj).await
    }

    async fn pending_update(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        draft_update(api, ctx, self.0, current, patch).await
    }

    async fn pending_delete(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        draft_delete(api, ctx, self.0, current).await
    }
}

/// Point references at staged resources to their live counterparts.
fn remap_refs(
    api: &ApiServer,
    resource_type: &str,
    body: &mut Map<String, Value>,
    scope: &DraftScope,
    remap: &HashMap<Uuid, Uuid>,
) -> ApiResult<()> {
    let desc = registry().get(resource_type)?;
    for field in &desc.refs {
        let Some(Value::Array(items)) = body.get_mut(&field.field) else {
            continue;
        };
        for item in items.iter_mut() {
            let Some(item) = item.as_object_mut() else {
                continue;
            };
            let Some(peer) = item
                .get("uuid")
                .and_then(Value::as_str)
                .and_then(|u| Uuid::parse_str(u).ok())
            else {
                continue;
            };
            let live = match remap.get(&peer) {
                Some(live) => *live,
                None => {
                    let peer_fq = api.db().fq_name(&peer)?;
                    if !peer_fq.starts_with(&scope.draft_fq) {
                        continue;
                    }
                    api.db()
                        .uuid_of(field.desc.to, &scope.live_fq.child(peer_fq.name()))?
                }
            };
            item.remove("to");
            item.insert("uuid".into(), json!(live.to_string()));
        }
    }
    Ok(())
}

/// The body a staged resource contributes to its live counterpart.
fn live_body(staged: &Map<String, Value>) -> Map<String, Value> {
    let mut body = staged.clone();
    for key in [
        "uuid",
        "fq_name",
        "name",
        "parent_type",
        "parent_uuid",
        "href",
        "id_perms",
        "draft_mode_state",
    ] {
        body.remove(key);
    }
    body
}

fn lock_path(api: &ApiServer, scope: &DraftScope) -> String {
    format!(
        "{}/lock/security/{}/{}",
        api.config().cluster_prefix(),
        scope.live_parent.0,
        scope.live_fq
    )
}

/// A staged change and the live resource it applies to.
struct StagedChange {
    ty: &'static str,
    draft: Uuid,
    body: Map<String, Value>,
    live_fq: FqName,
    live: Option<Uuid>,
    deleted: bool,
}

fn staged_changes(
    api: &ApiServer,
    scope: &DraftScope,
    staged: &HashMap<&'static str, Vec<Uuid>>,
) -> ApiResult<Vec<StagedChange>> {
    let mut changes = Vec::new();
    for &ty in COMMIT_ORDER {
        for draft in staged.get(ty).into_iter().flatten() {
            let body = api.db().read(draft, &ReadOptions::shallow())?;
            let live_fq = scope.live_fq.child(fq_of(&body)?.name());
            let deleted = body.get("draft_mode_state").and_then(Value::as_str) == Some("deleted");
            changes.push(StagedChange {
                ty,
                draft: *draft,
                live: api.db().uuid_of(ty, &live_fq).ok(),
                body,
                live_fq,
                deleted,
            });
        }
    }
    Ok(changes)
}

/// Refuse the commit before anything is applied when a staged delete would be blocked by a
/// resource the commit leaves alone.
fn check_deletes(api: &ApiServer, changes: &[StagedChange]) -> ApiResult<()> {
    let touched: Vec<Uuid> = changes.iter().filter_map(|c| c.live).collect();
    for change in changes.iter().filter(|c| c.deleted) {
        let Some(live) = change.live else {
            continue;
        };
        let mut blockers = api.db().blockers(&live, true)?;
        blockers.backrefs.retain(|(_, from)| !touched.contains(from));
        blockers.children.retain(|(_, child)| !touched.contains(child));
        if !blockers.is_empty() {
            return Err(blockers.to_error(|ty, uuid| api.href(ty, uuid)));
        }
    }
    Ok(())
}

async fn apply_changes(
    api: &ApiServer,
    cctx: &RequestContext,
    scope: &DraftScope,
    changes: &[StagedChange],
    undo: &mut CompensationList,
) -> ApiResult<()> {
    let mut remap: HashMap<Uuid, Uuid> = HashMap::new();
    let mut deleted: Vec<(&'static str, Uuid)> = Vec::new();
    for change in changes {
        let ty = change.ty;
        if change.deleted {
            deleted.extend(change.live.map(|live| (ty, live)));
            continue;
        }
        let mut live = live_body(&change.body);
        remap_refs(api, ty, &mut live, scope, &remap)?;
        let live_uuid = match change.live {
            Some(existing) => {
                let previous = api.db().read(&existing, &ReadOptions::shallow())?;
                let restore: Map<String, Value> = live
                    .keys()
                    .map(|k| (k.clone(), previous.get(k).cloned().unwrap_or(Value::Null)))
                    .collect();
                api.update_boxed(cctx.clone(), ty, existing, live).await?;
                undo.push(Compensation::RestoreResource {
                    resource_type: ty,
                    uuid: existing,
                    body: restore,
                });
                existing
            }
            None => {
                live.insert("fq_name".into(), json!(change.live_fq));
                live.insert("parent_type".into(), json!(scope.live_parent.0));
                live.insert("parent_uuid".into(), json!(scope.live_parent.1.to_string()));
                let created = api
                    .create_boxed(cctx.clone(), ty, live)
                    .await?
                    .uuid()
                    .ok_or_else(|| {
                        ApiError::Internal(format!("Commit of {} gave no id", change.live_fq))
                    })?;
                undo.push(Compensation::DeleteResource {
                    resource_type: ty,
                    uuid: created,
                });
                created
            }
        };
        remap.insert(change.draft, live_uuid);
    }

    deleted.sort_by_key(|(ty, _)| SECURITY_OBJECT_TYPES.iter().position(|t| t == ty));
    for (ty, live) in deleted {
        api.delete_if_exists(cctx, ty, live).await?;
    }
    Ok(())
}

/// Apply every staged change of a scope to its live resources, then drop the drafts.
///
/// Creates and updates already applied are taken back when a later change fails, and the
/// drafts are kept.
pub(crate) async fn commit(
    api: &ApiServer,
    ctx: &RequestContext,
    scope: &DraftScope,
) -> ApiResult<()> {
    let _lock = api
        .coord()
        .lock(&lock_path(api, scope), api.lock_timeout())
        .await?;
    let staged = drafts(api, scope);
    let cctx = ctx.for_draft_commit();
    let changes = staged_changes(api, scope, &staged)?;
    check_deletes(api, &changes)?;

    let mut undo = CompensationList::new();
    if let Err(e) = apply_changes(api, &cctx, scope, &changes, &mut undo).await {
        warn!(
            "Commit of security draft of scope {} failed, taking back {} change(s): {e}",
            scope.scope_uuid,
            undo.len()
        );
        undo.unwind(api, &cctx).await;
        return Err(e);
    }
    drop_drafts(api, &cctx, &staged).await?;
    info!("Committed security draft of scope {}", scope.scope_uuid);
    Ok(())
}

/// Drop every staged change of a scope.
pub(crate) async fn discard(
    api: &ApiServer,
    ctx: &RequestContext,
    scope: &DraftScope,
) -> ApiResult<()> {
    let _lock = api
        .coord()
        .lock(&lock_path(api, scope), api.lock_timeout())
        .await?;
    let staged = drafts(api, scope);
    drop_drafts(api, &ctx.for_draft_commit(), &staged).await?;
    info!("Discarded security draft of scope {}", scope.scope_uuid);
    Ok(())
}

async fn drop_drafts(
    api: &ApiServer,
    ctx: &RequestContext,
    staged: &HashMap<&'static str, Vec<Uuid>>,
) -> ApiResult<()> {
    for &ty in SECURITY_OBJECT_TYPES {
        if let Some(uuids) = staged.get(ty) {
            for uuid in uuids {
                api.delete_if_exists(ctx, ty, *uuid).await?;
            }
        }
    }
    Ok(())
}

/// Follow a change of `enable_security_policy_draft` on a scope owner.
pub(crate) async fn set_drafting(
    api: &ApiServer,
    ctx: &RequestContext,
    scope: &DraftScope,
    enable: bool,
) -> ApiResult<()> {
    if enable {
        ensure_draft_pm(api, ctx, scope).await?;
        info!("Security draft mode enabled on {}", scope.live_fq);
        return Ok(());
    }
    let staged = drafts(api, scope);
    let pending: Vec<String> = SECURITY_OBJECT_TYPES
        .iter()
        .filter_map(|ty| staged.get(ty).filter(|v| !v.is_empty()).map(|v| (ty, v)))
        .map(|(ty, uuids)| {
            let names: Vec<String> = uuids
                .iter()
                .map(|u| {
                    let fq = api.db().fq_name(u).map(|f| f.to_string()).unwrap_or_default();
                    format!("{fq} ({u})")
                })
                .collect();
            format!("\t- {ty}: {}", names.join(", "))
        })
        .collect();
    if !pending.is_empty() {
        return Err(ApiError::Conflict(format!(
            "Cannot disable security draft mode on scope {} ({}) as some pending security \
             resource(s) need to be reviewed:\n{}",
            scope.live_fq,
            scope.scope_uuid,
            pending.join("\n")
        )));
    }
    if let Ok(draft_pm) = api.db().uuid_of("policy-management", &scope.draft_fq) {
        api.delete_if_exists(ctx, "policy-management", draft_pm).await?;
    }
    info!("Security draft mode disabled on {}", scope.live_fq);
    Ok(())
}
