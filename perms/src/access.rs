// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Object permissions.
//!
//! Every resource carries a `perms2` record: an owner tenant with its access bits, access bits
//! granted to everybody, and a list of tenants or domains the resource is shared with. The
//! effective access of a caller is the owner access if it owns the resource, otherwise the
//! union of the global access and every matching share entry.

use crate::identity::Identity;
use crate::rbac::{Crud, RbacRule, rbac_allowed};
use arc_swap::ArcSwap;
use args::AaaMode;
use config::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub const PERMS_NONE: u8 = 0;
pub const PERMS_X: u8 = 1;
pub const PERMS_W: u8 = 2;
pub const PERMS_R: u8 = 4;
pub const PERMS_RW: u8 = PERMS_R | PERMS_W;
pub const PERMS_RWX: u8 = PERMS_R | PERMS_W | PERMS_X;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEntry {
    /// `tenant:<id>` or `domain:<id>`. A bare id means a tenant.
    pub tenant: String,
    pub tenant_access: u8,
}

impl ShareEntry {
    fn matches(&self, who: &Identity) -> bool {
        let (kind, id) = self
            .tenant
            .split_once(':')
            .unwrap_or(("tenant", self.tenant.as_str()));
        let id = id.replace('-', "").to_ascii_lowercase();
        match kind {
            "tenant" => who.project_id.as_deref() == Some(id.as_str()),
            "domain" => who.domain_id.as_deref() == Some(id.as_str()),
            _ => false,
        }
    }
}

/// The sharing metadata of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms2 {
    #[serde(default)]
    pub owner: String,
    #[serde(default = "rwx")]
    pub owner_access: u8,
    #[serde(default)]
    pub global_access: u8,
    #[serde(default)]
    pub share: Vec<ShareEntry>,
}

const fn rwx() -> u8 {
    PERMS_RWX
}

impl Default for Perms2 {
    fn default() -> Self {
        Self {
            owner: "cloud-admin".to_string(),
            owner_access: PERMS_RWX,
            global_access: PERMS_NONE,
            share: Vec::new(),
        }
    }
}

impl Perms2 {
    /// Read the `perms2` of a resource body. Missing or malformed metadata reads as the default.
    #[must_use]
    pub fn of(body: &serde_json::Map<String, Value>) -> Self {
        body.get("perms2")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn owned_by(owner: &str) -> Self {
        Self {
            owner: owner.replace('-', ""),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn access_for(&self, who: &Identity) -> u8 {
        if who.owns(&self.owner) {
            return self.owner_access;
        }
        self.share
            .iter()
            .filter(|s| s.matches(who))
            .fold(self.global_access, |acc, s| acc | s.tenant_access)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// `"RWX"`-style rendering of access bits.
#[must_use]
pub fn access_string(access: u8) -> String {
    let mut out = String::new();
    if access & PERMS_R != 0 {
        out.push('R');
    }
    if access & PERMS_W != 0 {
        out.push('W');
    }
    if access & PERMS_X != 0 {
        out.push('X');
    }
    out
}

/// Process-wide permission settings. The mode may be switched at runtime.
pub struct PermEngine {
    mode: ArcSwap<AaaMode>,
    cloud_admin_role: String,
    global_read_only_role: Option<String>,
}

impl PermEngine {
    #[must_use]
    pub fn new(
        mode: AaaMode,
        cloud_admin_role: impl Into<String>,
        global_read_only_role: Option<String>,
    ) -> Self {
        Self {
            mode: ArcSwap::from_pointee(mode),
            cloud_admin_role: cloud_admin_role.into(),
            global_read_only_role,
        }
    }

    #[must_use]
    pub fn mode(&self) -> AaaMode {
        **self.mode.load()
    }

    /// Switch mode. Returns true if role based access just got enabled.
    pub fn set_mode(&self, mode: AaaMode) -> bool {
        let previous = *self.mode.swap(Arc::new(mode));
        info!("aaa-mode changed from {previous} to {mode}");
        mode == AaaMode::Rbac && previous != AaaMode::Rbac
    }

    #[must_use]
    pub fn is_auth_needed(&self) -> bool {
        self.mode() != AaaMode::NoAuth
    }

    #[must_use]
    pub fn is_rbac(&self) -> bool {
        self.mode() == AaaMode::Rbac
    }

    #[must_use]
    pub fn cloud_admin_role(&self) -> &str {
        &self.cloud_admin_role
    }

    #[must_use]
    pub fn is_admin(&self, who: &Identity) -> bool {
        !self.is_auth_needed() || who.internal || who.has_role(&self.cloud_admin_role)
    }

    #[must_use]
    pub fn is_global_read_only(&self, who: &Identity) -> bool {
        self.global_read_only_role
            .as_deref()
            .is_some_and(|role| who.has_role(role))
    }

    /// Effective access of `who` on a resource.
    #[must_use]
    pub fn access(&self, who: &Identity, perms: &Perms2) -> u8 {
        if self.is_admin(who) {
            return PERMS_RWX;
        }
        let access = perms.access_for(who);
        if self.is_global_read_only(who) {
            access | PERMS_R
        } else {
            access
        }
    }

    fn require(&self, who: &Identity, perms: &Perms2, needed: u8, what: &str) -> ApiResult<()> {
        let access = self.access(who, perms);
        if access & needed == needed {
            return Ok(());
        }
        debug!(
            "Denied {what} to user {} (access {})",
            who.user_name(),
            access_string(access)
        );
        Err(ApiError::Permission(format!(
            "Permission Denied: {what} requires {} access",
            access_string(needed)
        )))
    }

    pub fn check_read(&self, who: &Identity, perms: &Perms2) -> ApiResult<()> {
        self.require(who, perms, PERMS_R, "read")
    }

    pub fn check_write(&self, who: &Identity, perms: &Perms2) -> ApiResult<()> {
        if self.is_global_read_only(who) && !self.is_admin(who) {
            return Err(ApiError::Permission(
                "Permission Denied: global read-only role".to_string(),
            ));
        }
        self.require(who, perms, PERMS_W, "write")
    }

    /// Deleting needs write access on the resource and on its parent.
    pub fn check_delete(
        &self,
        who: &Identity,
        perms: &Perms2,
        parent: Option<&Perms2>,
    ) -> ApiResult<()> {
        self.check_write(who, perms)?;
        if let Some(parent) = parent {
            self.require(who, parent, PERMS_W, "delete in parent")?;
        }
        Ok(())
    }

    /// Role based check of an operation on a type (or on an action name).
    pub fn check_rbac(
        &self,
        who: &Identity,
        rules: &[RbacRule],
        object: &str,
        fields: &[&str],
        op: Crud,
    ) -> ApiResult<()> {
        if !self.is_rbac() || self.is_admin(who) {
            return Ok(());
        }
        if rbac_allowed(rules, &who.roles, object, fields, op) {
            Ok(())
        } else {
            Err(ApiError::Permission(format!(
                "Permission Denied for {:?} to {op} {object}",
                who.roles
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TENANT: &str = "4f5b2d2a8ab44d0bbb9b4b0a3c6a7f10";
    const OTHER: &str = "0000000000000000000000000000beef";

    fn member(project: &str) -> Identity {
        Identity {
            user: Some("bob".to_string()),
            roles: vec!["member".to_string()],
            domain_id: Some("d0".to_string()),
            ..Identity::default()
        }
        .with_project_id(project)
    }

    #[test]
    fn owner_global_and_share() {
        let engine = PermEngine::new(AaaMode::CloudAdmin, "admin", Some("reader".to_string()));
        let mut perms = Perms2::owned_by(TENANT);
        assert_eq!(engine.access(&member(TENANT), &perms), PERMS_RWX);
        assert_eq!(engine.access(&member(OTHER), &perms), PERMS_NONE);
        perms.global_access = PERMS_R;
        assert!(engine.check_read(&member(OTHER), &perms).is_ok());
        assert!(engine.check_write(&member(OTHER), &perms).is_err());
        perms.share.push(ShareEntry {
            tenant: format!("tenant:{OTHER}"),
            tenant_access: PERMS_W,
        });
        assert_eq!(engine.access(&member(OTHER), &perms), PERMS_RW);
        perms.share = vec![ShareEntry {
            tenant: "domain:d0".to_string(),
            tenant_access: PERMS_RWX,
        }];
        assert_eq!(engine.access(&member(OTHER), &perms), PERMS_RWX);

        let mut admin = member(OTHER);
        admin.roles.push("Admin".to_string());
        assert!(engine.is_admin(&admin));
        let mut reader = member(OTHER);
        reader.roles = vec!["reader".to_string()];
        assert!(engine.check_read(&reader, &Perms2::owned_by(TENANT)).is_ok());
        assert!(engine.check_write(&reader, &Perms2::owned_by(TENANT)).is_err());
    }

    #[test]
    fn delete_needs_parent_write() {
        let engine = PermEngine::new(AaaMode::CloudAdmin, "admin", None);
        let mine = Perms2::owned_by(TENANT);
        let theirs = Perms2::owned_by(OTHER);
        assert!(engine.check_delete(&member(TENANT), &mine, Some(&mine)).is_ok());
        let err = engine
            .check_delete(&member(TENANT), &mine, Some(&theirs))
            .expect_err("Should deny");
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn no_auth_allows_everything() {
        let engine = PermEngine::new(AaaMode::NoAuth, "admin", None);
        assert_eq!(engine.access(&member(OTHER), &Perms2::owned_by(TENANT)), PERMS_RWX);
        assert!(engine.set_mode(AaaMode::Rbac));
        assert!(!engine.set_mode(AaaMode::Rbac));
        assert_eq!(engine.mode(), AaaMode::Rbac);
        assert!(engine.is_auth_needed());
    }

    #[test]
    fn perms2_from_body() {
        let body = json!({"perms2": {"owner": TENANT, "owner_access": 6, "global_access": 4, "share": []}});
        let Value::Object(body) = body else {
            unreachable!()
        };
        let perms = Perms2::of(&body);
        assert_eq!(perms.owner_access, PERMS_RW);
        assert_eq!(Perms2::of(&serde_json::Map::new()), Perms2::default());
        assert_eq!(access_string(5), "RX");
    }
}
