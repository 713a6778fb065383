// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Security groups: group ids and rule identity.

use super::{TypeHooks, effective, fq_of};
use crate::context::RequestContext;
use crate::pipeline::undo::{Compensation, CompensationList, IdPool};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult};
use coord::LockGuard;
use id::Uuid;
use idalloc::AllocError;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

/// Fields of a rule that do not take part in comparing rules.
const RULE_IDENTITY: &[&str] = &["rule_uuid", "created", "last_modified"];

fn rules_mut(entries: &mut Value) -> impl Iterator<Item = &mut Map<String, Value>> {
    entries
        .get_mut("policy_rule")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object_mut)
}

fn rule_content(rule: &Map<String, Value>) -> Map<String, Value> {
    let mut content = rule.clone();
    content.retain(|k, v| !RULE_IDENTITY.contains(&k.as_str()) && !v.is_null());
    content
}

/// Give every rule a uuid and refuse rules repeated within the list.
pub(crate) fn normalize_rules(entries: &mut Value) -> ApiResult<()> {
    let mut seen: Vec<Map<String, Value>> = Vec::new();
    let mut uuids: Vec<String> = Vec::new();
    for rule in rules_mut(entries) {
        let content = rule_content(rule);
        if seen.contains(&content) {
            return Err(ApiError::Conflict(format!(
                "Rule already exists: {}",
                Value::Object(content)
            )));
        }
        seen.push(content);
        let uuid = match rule.get("rule_uuid").and_then(Value::as_str) {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => {
                let u = Uuid::new_v4().to_string();
                rule.insert("rule_uuid".into(), json!(u));
                u
            }
        };
        if uuids.contains(&uuid) {
            return Err(ApiError::bad_request(format!(
                "Bad Request, rule uuid {uuid} used twice"
            )));
        }
        uuids.push(uuid);
    }
    Ok(())
}

impl ApiServer {
    /// Serialize read-modify-write cycles on the rules of one security group.
    pub async fn security_group_lock(&self, sg: &Uuid) -> ApiResult<LockGuard> {
        let path = format!("{}/lock/security_group/{sg}", self.config().cluster_prefix());
        Ok(self.coord().lock(&path, self.lock_timeout()).await?)
    }
}

pub struct SecurityGroupHooks;

impl SecurityGroupHooks {
    /// The id of a group: the configured one when free, an allocated one otherwise.
    async fn pick_id(api: &ApiServer, owner: &str, configured: Option<u32>) -> ApiResult<u32> {
        if let Some(configured) = configured.filter(|c| *c > 0) {
            match api.ids().sg.reserve(configured, owner).await {
                Ok(id) => return Ok(id),
                Err(AllocError::InUse { id, owner: holder }) => {
                    warn!("Configured security group id {id} held by {holder}, allocating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(api.ids().alloc_sg_id(owner).await?)
    }

    fn configured(value: Option<&Value>) -> Option<u32> {
        value
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }
}

#[async_trait]
impl TypeHooks for SecurityGroupHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if obj.get("security_group_id").is_some_and(|v| !v.is_null()) {
            return Err(ApiError::Permission(
                "Cannot set the security group ID, use configured_security_group_id".to_string(),
            ));
        }
        if let Some(entries) = obj.get_mut("security_group_entries") {
            normalize_rules(entries)?;
        }
        let owner = fq_of(obj)?.to_string();
        let configured = Self::configured(obj.get("configured_security_group_id"));
        let id = Self::pick_id(api, &owner, configured).await?;
        undo.push(Compensation::FreeId {
            pool: IdPool::SecurityGroup,
            id,
        });
        obj.insert("security_group_id".into(), json!(id));
        debug!("Security group {owner} gets id {id}");
        Ok(())
    }

    async fn pre_update(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if let Some(given) = patch.get("security_group_id").filter(|v| !v.is_null())
            && Some(given) != current.get("security_group_id")
        {
            return Err(ApiError::Permission(
                "Cannot set the security group ID, use configured_security_group_id".to_string(),
            ));
        }
        if let Some(entries) = patch.get_mut("security_group_entries") {
            normalize_rules(entries)?;
        }
        if !patch.contains_key("configured_security_group_id") {
            return Ok(());
        }
        let before = Self::configured(current.get("configured_security_group_id"));
        let after = Self::configured(effective(current, patch, "configured_security_group_id"));
        if before == after {
            return Ok(());
        }
        let owner = fq_of(current)?.to_string();
        let old = Self::configured(current.get("security_group_id"));
        if let Some(old) = old {
            api.ids().sg.free(old).await?;
            undo.push(Compensation::ReclaimId {
                pool: IdPool::SecurityGroup,
                id: old,
                owner: owner.clone(),
            });
        }
        let id = Self::pick_id(api, &owner, after).await?;
        undo.push(Compensation::FreeId {
            pool: IdPool::SecurityGroup,
            id,
        });
        patch.insert("security_group_id".into(), json!(id));
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        if let Some(id) = Self::configured(current.get("security_group_id")) {
            api.ids().sg.free(id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_get_uuids() {
        let mut entries = json!({"policy_rule": [
            {"direction": ">", "protocol": "any"},
            {"direction": ">", "protocol": "tcp", "rule_uuid": "r2"}
        ]});
        normalize_rules(&mut entries).unwrap();
        assert!(entries["policy_rule"][0]["rule_uuid"].is_string());
        assert_eq!(entries["policy_rule"][1]["rule_uuid"], json!("r2"));
    }

    #[test]
    fn repeated_rules_conflict() {
        let mut entries = json!({"policy_rule": [
            {"direction": ">", "protocol": "any", "rule_uuid": "a"},
            {"direction": ">", "protocol": "any", "rule_uuid": "b"}
        ]});
        let err = normalize_rules(&mut entries).unwrap_err();
        assert_eq!(err.status(), 409);
    }
}
