// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ownership and sharing: chown, chmod, obj-perms and the aaa mode.

use super::request_uuid;
use crate::context::RequestContext;
use crate::pipeline::{audit, perms_of};
use crate::server::ApiServer;
use args::AaaMode;
use config::{ApiError, ApiResult, registry};
use id::Uuid;
use perms::{Perms2, ShareEntry, TokenInfo, access_string};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Chown {
    pub uuid: Option<String>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chmod {
    pub uuid: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub owner_access: Option<i64>,
    #[serde(default)]
    pub global_access: Option<i64>,
    #[serde(default)]
    pub share: Option<Vec<Value>>,
}

fn access_bits(value: i64, what: &str) -> ApiResult<u8> {
    u8::try_from(value)
        .ok()
        .filter(|v| *v < 8)
        .ok_or_else(|| ApiError::bad_request(format!("Bad Request, invalid {what} value")))
}

/// A share entry is `[tenant:|domain:]<uuid>` with access bits.
fn share_entry(value: &Value) -> ApiResult<ShareEntry> {
    let invalid = || ApiError::bad_request("Bad Request, invalid share list");
    let tenant = value.get("tenant").and_then(Value::as_str).ok_or_else(invalid)?;
    let access = value
        .get("tenant_access")
        .and_then(Value::as_i64)
        .ok_or_else(invalid)?;
    let (kind, id) = tenant.split_once(':').unwrap_or(("tenant", tenant));
    if !matches!(kind, "tenant" | "domain") || id::parse_lenient(id).is_err() {
        return Err(invalid());
    }
    Ok(ShareEntry {
        tenant: tenant.to_string(),
        tenant_access: access_bits(access, "share").map_err(|_| invalid())?,
    })
}

fn render(perms: &Perms2) -> String {
    let shares: Vec<String> = perms
        .share
        .iter()
        .map(|s| format!("{}:{}", s.tenant, s.tenant_access))
        .collect();
    format!(
        "{}/{} {} {shares:?}",
        perms.owner, perms.owner_access, perms.global_access
    )
}

impl ApiServer {
    /// Require read and write access on a resource for `ctx`.
    fn require_rw(&self, ctx: &RequestContext, uuid: &Uuid) -> ApiResult<Perms2> {
        let perms = perms_of(self, uuid)?;
        let access = self.perms().access(&ctx.identity, &perms);
        if access & perms::PERMS_RW != perms::PERMS_RW {
            return Err(ApiError::Permission(" Permission denied".to_string()));
        }
        Ok(perms)
    }

    pub fn chown(&self, ctx: &RequestContext, req: &Chown) -> ApiResult<Value> {
        let uuid = req
            .uuid
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Bad Request, no resource UUID provided to chown"))?;
        let owner = req
            .owner
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Bad Request, no owner UUID provided to chown"))?;
        let uuid = request_uuid(uuid, "resource UUID")?;
        request_uuid(owner, "owner UUID")?;
        let ty = self.db().resource_type(&uuid)?;
        self.check_backpressure()?;
        let mut perms = self.require_rw(ctx, &uuid)?;
        perms.owner = owner.replace('-', "");
        let mut patch = Map::new();
        patch.insert("perms2".into(), perms.to_value());
        self.db().update(&uuid, &patch)?;
        self.invalidate_around(&uuid);
        info!("chown: {uuid} owner set to {owner}");
        audit(ctx, "chown", ty, Some(&uuid), Ok(()));
        Ok(json!({}))
    }

    pub fn chmod(&self, ctx: &RequestContext, req: &Chmod) -> ApiResult<Value> {
        let uuid = request_uuid(&req.uuid, "object id")?;
        let ty = self.db().resource_type(&uuid)?;
        self.check_backpressure()?;
        let mut perms = self.require_rw(ctx, &uuid)?;
        let old = render(&perms);
        let mut patch = Map::new();

        if let Some(owner) = req.owner.as_deref().filter(|o| !o.is_empty()) {
            request_uuid(owner, "owner")?;
            perms.owner = owner.replace('-', "");
        }
        if let Some(access) = req.owner_access {
            perms.owner_access = access_bits(access, "owner_access")?;
        }
        if let Some(share) = &req.share {
            perms.share = share.iter().map(share_entry).collect::<ApiResult<_>>()?;
        }
        if let Some(access) = req.global_access {
            perms.global_access = access_bits(access, "global_access")?;
            let shareable = registry()
                .get(ty)
                .is_ok_and(|d| d.prop("is_shared").is_some());
            if shareable {
                patch.insert("is_shared".into(), json!(perms.global_access != 0));
            }
        }
        info!("chmod: {uuid} perms old={old}, new={}", render(&perms));
        patch.insert("perms2".into(), perms.to_value());
        self.db().update(&uuid, &patch)?;
        self.invalidate_around(&uuid);
        audit(ctx, "chmod", ty, Some(&uuid), Ok(()));
        Ok(json!({}))
    }

    /// What the caller may do, on a resource when `uuid` is given.
    pub fn obj_perms(&self, ctx: &RequestContext, uuid: Option<&str>) -> ApiResult<Value> {
        if !self.perms().is_auth_needed() {
            return Ok(json!({
                "token_info": null,
                "is_cloud_admin_role": false,
                "is_global_read_only_role": false,
                "permissions": "RWX",
            }));
        }
        let who = &ctx.identity;
        let token = TokenInfo {
            user: who.user.clone(),
            user_id: who.user_id.clone(),
            project: who.project.clone(),
            project_id: who.project_id.clone(),
            domain: who.domain.clone(),
            domain_id: who.domain_id.clone(),
            roles: who.roles.clone(),
        };
        let mut out = json!({
            "token_info": token,
            "is_cloud_admin_role": who.has_role(self.perms().cloud_admin_role()),
            "is_global_read_only_role": self.perms().is_global_read_only(who),
        });
        if let Some(uuid) = uuid {
            let uuid = request_uuid(uuid, "object id")?;
            let perms = perms_of(self, &uuid)?;
            out["permissions"] = json!(access_string(self.perms().access(who, &perms)));
        }
        Ok(out)
    }

    #[must_use]
    pub fn aaa_mode(&self) -> Value {
        json!({ "aaa-mode": self.perms().mode().to_string() })
    }

    /// Switch the permission mode. Enabling role based access plants the default rules.
    pub async fn set_aaa_mode(&self, ctx: &RequestContext, body: &Value) -> ApiResult<Value> {
        let wanted = body
            .get("aaa-mode")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::bad_request("Bad Request, aaa-mode needed"))?;
        let mode = AaaMode::from_str(wanted)
            .map_err(|_| ApiError::bad_request(format!("Invalid aaa-mode {wanted}")))?;
        if !self.perms().is_admin(&ctx.identity) {
            return Err(ApiError::Permission(" Permission denied".to_string()));
        }
        if self.perms().set_mode(mode) {
            crate::seed::default_rbac_rules(self).await?;
        }
        audit(ctx, "aaa-mode", "global-system-config", None, Ok(()));
        Ok(self.aaa_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_entries_are_checked() {
        let entry = share_entry(&json!({
            "tenant": "domain:4f5b2d2a-8ab4-4d0b-bb9b-4b0a3c6a7f10",
            "tenant_access": 4
        }))
        .unwrap();
        assert_eq!(entry.tenant_access, 4);
        assert!(share_entry(&json!({"tenant": "group:x", "tenant_access": 4})).is_err());
        assert!(
            share_entry(&json!({
                "tenant": "4f5b2d2a-8ab4-4d0b-bb9b-4b0a3c6a7f10",
                "tenant_access": 9
            }))
            .is_err()
        );
    }

    #[test]
    fn access_bits_are_ranged() {
        assert_eq!(access_bits(7, "owner_access").unwrap(), 7);
        assert!(access_bits(8, "owner_access").is_err());
        assert!(access_bits(-1, "owner_access").is_err());
    }
}
