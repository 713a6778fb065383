// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Projects and the global system config: quota limits and security draft mode.

use super::draft::{DraftScope, draft_scope_of, set_drafting};
use super::{TypeHooks, as_bool, effective, uuid_of};
use crate::context::RequestContext;
use crate::pipeline::undo::CompensationList;
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName, registry};
use id::Uuid;
use serde_json::{Map, Value};
use tracing::debug;

/// Quota keys naming a resource type, with the type.
fn quota_types(quota: Option<&Value>) -> Vec<(String, &'static str)> {
    quota
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(key, _)| registry().lookup(key).map(|d| (key.clone(), d.name())))
        .collect()
}

/// Refuse limits below what the project already holds.
fn check_limits(api: &ApiServer, project: &Uuid, quota: &Value) -> ApiResult<()> {
    let mut body = Map::new();
    body.insert("quota".into(), quota.clone());
    for (key, ty) in quota_types(Some(quota)) {
        let Some(limit) = perms::quota_limit(&body, &key) else {
            continue;
        };
        let used = api.db().count(ty, Some(project));
        if usize::try_from(limit).is_ok_and(|limit| used > limit) {
            return Err(ApiError::bad_request(format!(
                "Quota limit ({limit}) is less than the {used} {ty} resources in use"
            )));
        }
    }
    Ok(())
}

/// Draft mode toggling shared by the two scope owners.
async fn follow_draft_flag(
    api: &ApiServer,
    ctx: &RequestContext,
    scope: Option<DraftScope>,
    before: bool,
    after: bool,
) -> ApiResult<()> {
    match scope {
        Some(scope) if before != after => set_drafting(api, ctx, &scope, after).await,
        _ => Ok(()),
    }
}

fn global_scope(api: &ApiServer) -> ApiResult<Option<DraftScope>> {
    let Ok(pm) = api
        .db()
        .uuid_of("policy-management", &FqName::new(["default-policy-management"]))
    else {
        return Ok(None);
    };
    draft_scope_of(api, "policy-management", &pm)
}

pub struct ProjectHooks;

#[async_trait]
impl TypeHooks for ProjectHooks {
    async fn post_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &Map<String, Value>,
    ) -> ApiResult<()> {
        if as_bool(obj.get("enable_security_policy_draft")) {
            let scope = draft_scope_of(api, "project", &uuid_of(obj)?)?;
            follow_draft_flag(api, ctx, scope, false, true).await?;
        }
        Ok(())
    }

    async fn pre_update(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let project = uuid_of(current)?;
        if let Some(quota) = patch.get("quota").filter(|q| !q.is_null()) {
            check_limits(api, &project, quota)?;
        }
        let before = as_bool(current.get("enable_security_policy_draft"));
        let after = as_bool(effective(current, patch, "enable_security_policy_draft"));
        if before && !after {
            // refuse before the flag is written if drafts are pending
            let scope = draft_scope_of(api, "project", &project)?;
            follow_draft_flag(api, &RequestContext::internal(), scope, true, false).await?;
        }
        Ok(())
    }

    async fn post_update(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        previous: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> ApiResult<()> {
        let project = uuid_of(previous)?;
        if patch.contains_key("quota") {
            let mut types: Vec<String> = quota_types(previous.get("quota"))
                .into_iter()
                .chain(quota_types(patch.get("quota")))
                .map(|(key, _)| key)
                .collect();
            types.sort();
            types.dedup();
            // counters are rebuilt from the stored resources on next use
            api.quota().forget_project(&project, &types).await;
            debug!("Quota counters of project {project} reset");
        }
        let before = as_bool(previous.get("enable_security_policy_draft"));
        let after = as_bool(effective(previous, patch, "enable_security_policy_draft"));
        if !before && after {
            let scope = draft_scope_of(api, "project", &project)?;
            follow_draft_flag(api, ctx, scope, before, after).await?;
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        let types: Vec<String> = quota_types(current.get("quota"))
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        api.quota().forget_project(&uuid_of(current)?, &types).await;
        Ok(())
    }
}

pub struct GlobalSystemConfigHooks;

#[async_trait]
impl TypeHooks for GlobalSystemConfigHooks {
    async fn pre_update(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if let Some(asn) = patch.get("autonomous_system").filter(|v| !v.is_null())
            && Some(asn) != current.get("autonomous_system")
            && api.db().count("bgp-as-a-service", None) > 0
        {
            return Err(ApiError::bad_request(
                "Cannot change the global ASN while BGP as a service sessions exist",
            ));
        }
        let before = as_bool(current.get("enable_security_policy_draft"));
        let after = as_bool(effective(current, patch, "enable_security_policy_draft"));
        if before && !after {
            let scope = global_scope(api)?;
            follow_draft_flag(api, &RequestContext::internal(), scope, true, false).await?;
        }
        Ok(())
    }

    async fn post_update(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        previous: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> ApiResult<()> {
        let before = as_bool(previous.get("enable_security_policy_draft"));
        let after = as_bool(effective(previous, patch, "enable_security_policy_draft"));
        if !before && after {
            follow_draft_flag(api, ctx, global_scope(api)?, before, after).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quota_keys_map_to_types() {
        let quota = json!({"defaults": 5, "virtual_network": 2, "subnet": 3, "security_group": 1});
        let mut types = quota_types(Some(&quota));
        types.sort();
        assert_eq!(
            types,
            vec![
                ("security_group".to_string(), "security-group"),
                ("virtual_network".to_string(), "virtual-network"),
            ]
        );
    }
}
