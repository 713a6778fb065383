// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-type extension points of the request pipeline.
//!
//! Every resource type may plug a [`TypeHooks`] implementation. Hooks receive the request body
//! as a JSON object holding `uuid`, `fq_name`, `parent_type` and `parent_uuid` besides the
//! properties and references; they may rewrite it and record compensations.

mod bgpaas;
mod draft;
mod floating_ip;
mod instance_ip;
mod network;
mod policy;
mod project;
mod router;
mod security_group;
mod service;
mod tag;
mod vmi;
mod vpg;

pub use draft::{DRAFT_POLICY_MANAGEMENT, draft_scope_of};
pub(crate) use draft::{commit as commit_draft, discard as discard_draft, scope_by_id as draft_scope_by_id};
pub(crate) use network::default_ri_fq;
pub use vmi::normalize_mac;
pub(crate) use tag::{
    PREDEFINED_TAG_TYPES, TAG_TYPES_NOT_UNIQUE_PER_OBJECT, TAG_TYPES_ON_ADDRESS_GROUP, tag_fq,
};

use crate::context::RequestContext;
use crate::pipeline::undo::CompensationList;
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[async_trait]
pub trait TypeHooks: Send + Sync {
    /// Returning a body accepts the create without touching the store (202).
    async fn pending_create(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _obj: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        Ok(None)
    }

    /// May rewrite the fq-name before it is reserved.
    async fn pre_alloc(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _obj: &mut Map<String, Value>,
    ) -> ApiResult<()> {
        Ok(())
    }

    async fn pre_create(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _obj: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        Ok(())
    }

    /// Runs after the commit. Failures are logged, not returned.
    async fn post_create(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _obj: &Map<String, Value>,
    ) -> ApiResult<()> {
        Ok(())
    }

    async fn pending_update(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
        _patch: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        Ok(None)
    }

    async fn pre_update(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
        _patch: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        Ok(())
    }

    async fn post_update(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _previous: &Map<String, Value>,
        _patch: &Map<String, Value>,
    ) -> ApiResult<()> {
        Ok(())
    }

    async fn pending_delete(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        Ok(None)
    }

    async fn pre_delete(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        Ok(())
    }

    async fn post_delete(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
    ) -> ApiResult<()> {
        Ok(())
    }
}

struct NoHooks;
impl TypeHooks for NoHooks {}

static NO_HOOKS: NoHooks = NoHooks;

pub struct HookTable {
    table: HashMap<&'static str, Box<dyn TypeHooks>>,
}

impl HookTable {
    #[must_use]
    pub fn new() -> Self {
        let mut table: HashMap<&'static str, Box<dyn TypeHooks>> = HashMap::new();
        table.insert("virtual-network", Box::new(network::VirtualNetworkHooks));
        table.insert("network-ipam", Box::new(network::NetworkIpamHooks));
        table.insert("security-group", Box::new(security_group::SecurityGroupHooks));
        table.insert("network-policy", Box::new(policy::NetworkPolicyHooks));
        table.insert("project", Box::new(project::ProjectHooks));
        table.insert("global-system-config", Box::new(project::GlobalSystemConfigHooks));
        table.insert("tag-type", Box::new(tag::TagTypeHooks));
        table.insert("tag", Box::new(tag::TagHooks));
        table.insert("virtual-machine-interface", Box::new(vmi::VmiHooks));
        table.insert("virtual-machine", Box::new(vmi::VirtualMachineHooks));
        table.insert("instance-ip", Box::new(instance_ip::InstanceIpHooks));
        table.insert("floating-ip", Box::new(floating_ip::FloatingIpHooks));
        table.insert("logical-router", Box::new(router::LogicalRouterHooks));
        table.insert("bgp-as-a-service", Box::new(bgpaas::BgpaasHooks));
        table.insert("virtual-port-group", Box::new(vpg::VirtualPortGroupHooks));
        table.insert("service-instance", Box::new(service::ServiceInstanceHooks));
        table.insert("firewall-rule", Box::new(policy::FirewallRuleHooks));
        table.insert("service-group", Box::new(policy::ServiceGroupHooks));
        table.insert("firewall-policy", Box::new(draft::DraftHooks("firewall-policy")));
        table.insert("application-policy-set", Box::new(draft::DraftHooks("application-policy-set")));
        table.insert("address-group", Box::new(draft::DraftHooks("address-group")));
        Self { table }
    }

    #[must_use]
    pub fn get(&self, resource_type: &str) -> &dyn TypeHooks {
        self.table
            .get(resource_type)
            .map_or(&NO_HOOKS as &dyn TypeHooks, |h| h.as_ref())
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The fq-name carried by a hook body.
pub(crate) fn fq_of(obj: &Map<String, Value>) -> ApiResult<FqName> {
    obj.get("fq_name")
        .cloned()
        .and_then(|v| serde_json::from_value::<FqName>(v).ok())
        .filter(|fq| !fq.is_empty())
        .ok_or_else(|| ApiError::Internal("Request body has no fq_name".to_string()))
}

pub(crate) fn uuid_of(obj: &Map<String, Value>) -> ApiResult<Uuid> {
    obj.get("uuid")
        .and_then(Value::as_str)
        .and_then(|u| Uuid::parse_str(u).ok())
        .ok_or_else(|| ApiError::Internal("Request body has no uuid".to_string()))
}

pub(crate) fn parent_uuid_of(obj: &Map<String, Value>) -> Option<Uuid> {
    obj.get("parent_uuid")
        .and_then(Value::as_str)
        .and_then(|u| Uuid::parse_str(u).ok())
}

/// The value a field will have once `patch` is applied on `current`.
pub(crate) fn effective<'a>(
    current: &'a Map<String, Value>,
    patch: &'a Map<String, Value>,
    field: &str,
) -> Option<&'a Value> {
    match patch.get(field) {
        Some(Value::Null) => None,
        Some(value) => Some(value),
        None => current.get(field).filter(|v| !v.is_null()),
    }
}

pub(crate) fn as_bool(value: Option<&Value>) -> bool {
    value.and_then(Value::as_bool).unwrap_or(false)
}

/// Ids of the peers of a reference field, as written in a body read from the store.
pub(crate) fn ref_uuids(obj: &Map<String, Value>, field: &str) -> Vec<Uuid> {
    obj.get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("uuid").and_then(Value::as_str))
        .filter_map(|u| Uuid::parse_str(u).ok())
        .collect()
}

/// Infrastructure networks whose addresses are not managed here.
pub(crate) const IP_FABRIC_VN: &[&str] = &["default-domain", "default-project", "ip-fabric"];
pub(crate) const LINK_LOCAL_VN: &[&str] = &["default-domain", "default-project", "__link_local__"];

pub(crate) fn is_infra_network(fq: &FqName) -> bool {
    *fq == FqName::from(IP_FABRIC_VN) || *fq == FqName::from(LINK_LOCAL_VN)
}

/// The fq-name of the first peer of a reference field.
pub(crate) fn first_ref(
    api: &ApiServer,
    obj: &Map<String, Value>,
    field: &str,
) -> ApiResult<Option<(Uuid, FqName)>> {
    match ref_uuids(obj, field).first() {
        Some(uuid) => Ok(Some((*uuid, api.db().fq_name(uuid)?))),
        None => Ok(None),
    }
}

/// Default autonomous system of the cluster.
pub(crate) const DEFAULT_ASN: u64 = 64512;

/// The autonomous system configured on the global system config.
pub(crate) fn global_asn(api: &ApiServer) -> u64 {
    api.db()
        .uuid_of("global-system-config", &FqName::new(["default-global-system-config"]))
        .and_then(|u| api.db().read(&u, &store::ReadOptions::shallow()))
        .ok()
        .and_then(|body| body.get("autonomous_system").and_then(Value::as_u64))
        .unwrap_or(DEFAULT_ASN)
}
