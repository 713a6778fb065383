// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network policies and the firewall rule model.

use super::draft::{draft_create, draft_delete, draft_update};
use super::security_group::normalize_rules;
use super::{TypeHooks, effective, fq_of};
use crate::context::RequestContext;
use crate::pipeline::undo::CompensationList;
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;

pub struct NetworkPolicyHooks;

#[async_trait]
impl TypeHooks for NetworkPolicyHooks {
    async fn pre_create(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if let Some(entries) = obj.get_mut("network_policy_entries") {
            normalize_rules(entries)?;
        }
        Ok(())
    }

    async fn pre_update(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if let Some(entries) = patch.get_mut("network_policy_entries") {
            normalize_rules(entries)?;
        }
        Ok(())
    }
}

/// IANA number of a protocol given by name or number.
pub(crate) fn protocol_number(protocol: &str) -> ApiResult<i64> {
    let number = match protocol.to_ascii_lowercase().as_str() {
        "any" => 0,
        "icmp" => 1,
        "tcp" => 6,
        "udp" => 17,
        "icmp6" | "ipv6-icmp" => 58,
        "sctp" => 132,
        other => other
            .parse::<i64>()
            .ok()
            .filter(|n| (0..=255).contains(n))
            .ok_or_else(|| ApiError::bad_request(format!("Rule with invalid protocol: {protocol}")))?,
    };
    Ok(number)
}

fn check_ports(service: &Value) -> ApiResult<()> {
    for key in ["src_ports", "dst_ports"] {
        let Some(ports) = service.get(key).filter(|p| !p.is_null()) else {
            continue;
        };
        let start = ports.get("start_port").and_then(Value::as_i64).unwrap_or(0);
        let end = ports.get("end_port").and_then(Value::as_i64).unwrap_or(65535);
        if start > end {
            return Err(ApiError::bad_request(format!(
                "Invalid {key}: start port {start} is above end port {end}"
            )));
        }
    }
    Ok(())
}

/// Fill in `protocol_id` from the protocol name.
fn normalize_service(service: &mut Value) -> ApiResult<()> {
    check_ports(service)?;
    let Some(service) = service.as_object_mut() else {
        return Ok(());
    };
    let protocol = service
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or("any")
        .to_string();
    service.insert("protocol_id".into(), json!(protocol_number(&protocol)?));
    Ok(())
}

const ENDPOINT_KINDS: &[&str] = &["subnet", "virtual_network", "address_group", "tags", "any"];

/// An endpoint names at most one kind of peer.
fn check_endpoint(endpoint: &Value) -> ApiResult<()> {
    let given: Vec<&str> = ENDPOINT_KINDS
        .iter()
        .copied()
        .filter(|k| {
            endpoint.get(*k).is_some_and(|v| match v {
                Value::Null | Value::Bool(false) => false,
                Value::Array(items) => !items.is_empty(),
                _ => true,
            })
        })
        .collect();
    if given.len() > 1 {
        return Err(ApiError::bad_request(format!(
            "Endpoint is limited to only one endpoint type at a time, got {}",
            given.join(", ")
        )));
    }
    Ok(())
}

/// Scope of a firewall resource: the project fq-name when it lives in one.
fn project_scope(fq: &FqName) -> Option<FqName> {
    // domain:project:name or domain:project:policy-management:name
    (fq.len() >= 3).then(|| FqName::new(fq.segments()[..2].iter().cloned()))
}

/// Resolve a `type=value` tag name, a `global:` prefix selecting the global scope.
fn resolve_tag(api: &ApiServer, scope: Option<&FqName>, name: &str) -> ApiResult<(String, Option<String>)> {
    let (global, name) = match name.strip_prefix("global:") {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    let candidates = match scope.filter(|_| !global) {
        Some(project) => vec![project.child(name), FqName::new([name])],
        None => vec![FqName::new([name])],
    };
    for fq in candidates {
        if let Ok(uuid) = api.db().uuid_of("tag", &fq) {
            let tag_id = api
                .db()
                .read(&uuid, &store::ReadOptions::shallow())?
                .get("tag_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok((uuid.to_string(), tag_id));
        }
    }
    Err(ApiError::NotFound(format!("Tag {name} not found")))
}

/// Check a firewall rule and derive its references from the endpoints it names.
fn normalize_firewall_rule(
    api: &ApiServer,
    fq: &FqName,
    rule: &mut Map<String, Value>,
) -> ApiResult<()> {
    let has_service = rule.get("service").is_some_and(|v| !v.is_null());
    let has_groups = rule
        .get("service_group_refs")
        .and_then(Value::as_array)
        .is_some_and(|refs| !refs.is_empty());
    if has_service && has_groups {
        return Err(ApiError::bad_request(
            "Firewall Rule cannot have both defined 'service' property and Service Group \
             reference(s)",
        ));
    }
    if let Some(service) = rule.get_mut("service").filter(|v| !v.is_null()) {
        normalize_service(service)?;
    }

    let scope = project_scope(fq);
    let mut tag_refs: BTreeSet<String> = BTreeSet::new();
    let mut ag_refs: BTreeSet<String> = BTreeSet::new();
    let mut vn_refs: BTreeSet<String> = BTreeSet::new();
    for key in ["endpoint_1", "endpoint_2"] {
        let Some(endpoint) = rule.get_mut(key).filter(|v| !v.is_null()) else {
            continue;
        };
        check_endpoint(endpoint)?;
        if let Some(ag) = endpoint.get("address_group").and_then(Value::as_str) {
            let uuid = api
                .db()
                .uuid_of("address-group", &FqName::parse(ag, None))?;
            ag_refs.insert(uuid.to_string());
        }
        if let Some(vn) = endpoint.get("virtual_network").and_then(Value::as_str) {
            let uuid = api
                .db()
                .uuid_of("virtual-network", &FqName::parse(vn, None))?;
            vn_refs.insert(uuid.to_string());
        }
        let names: Vec<String> = endpoint
            .get("tags")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        let mut tag_ids = Vec::new();
        for name in names {
            let (uuid, tag_id) = resolve_tag(api, scope.as_ref(), &name)?;
            tag_refs.insert(uuid);
            if let Some(id) = tag_id.and_then(|t| i64::from_str_radix(t.trim_start_matches("0x"), 16).ok()) {
                tag_ids.push(id);
            }
        }
        if !tag_ids.is_empty()
            && let Some(endpoint) = endpoint.as_object_mut()
        {
            endpoint.insert("tag_ids".into(), json!(tag_ids));
        }
    }
    let edges = |set: BTreeSet<String>| -> Value {
        Value::Array(set.into_iter().map(|u| json!({ "uuid": u })).collect())
    };
    if !tag_refs.is_empty() {
        rule.insert("tag_refs".into(), edges(tag_refs));
    }
    if !ag_refs.is_empty() {
        rule.insert("address_group_refs".into(), edges(ag_refs));
    }
    if !vn_refs.is_empty() {
        rule.insert("virtual_network_refs".into(), edges(vn_refs));
    }
    Ok(())
}

pub struct FirewallRuleHooks;

#[async_trait]
impl TypeHooks for FirewallRuleHooks {
    async fn pending_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        let fq = fq_of(obj)?;
        normalize_firewall_rule(api, &fq, obj)?;
        draft_create(api, ctx, "firewall-rule", obj).await
    }

    async fn pending_update(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        let touched = ["service", "service_group_refs", "endpoint_1", "endpoint_2"]
            .iter()
            .any(|k| patch.contains_key(*k));
        if touched {
            // check the rule as it will be, then keep only what the patch changes
            let mut merged = Map::new();
            for key in ["service", "service_group_refs", "endpoint_1", "endpoint_2"] {
                if let Some(value) = effective(current, patch, key) {
                    merged.insert(key.to_string(), value.clone());
                }
            }
            normalize_firewall_rule(api, &fq_of(current)?, &mut merged)?;
            for (key, value) in merged {
                if patch.contains_key(&key) || key.ends_with("_refs") {
                    patch.insert(key, value);
                }
            }
        }
        draft_update(api, ctx, "firewall-rule", current, patch).await
    }

    async fn pending_delete(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        draft_delete(api, ctx, "firewall-rule", current).await
    }
}

pub struct ServiceGroupHooks;

impl ServiceGroupHooks {
    fn normalize(obj: &mut Map<String, Value>) -> ApiResult<()> {
        for service in obj
            .get_mut("service_group_firewall_service_list")
            .and_then(|l| l.get_mut("firewall_service"))
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten()
        {
            normalize_service(service)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TypeHooks for ServiceGroupHooks {
    async fn pending_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        Self::normalize(obj)?;
        draft_create(api, ctx, "service-group", obj).await
    }

    async fn pending_update(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        Self::normalize(patch)?;
        draft_update(api, ctx, "service-group", current, patch).await
    }

    async fn pending_delete(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<Option<Value>> {
        draft_delete(api, ctx, "service-group", current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocols_by_name_and_number() {
        assert_eq!(protocol_number("TCP").unwrap(), 6);
        assert_eq!(protocol_number("any").unwrap(), 0);
        assert_eq!(protocol_number("47").unwrap(), 47);
        assert!(protocol_number("300").is_err());
        assert!(protocol_number("bogus").is_err());
    }

    #[test]
    fn endpoint_takes_one_kind() {
        assert!(check_endpoint(&json!({"any": true})).is_ok());
        assert!(check_endpoint(&json!({"tags": [], "any": true})).is_ok());
        assert!(check_endpoint(&json!({"any": true, "virtual_network": "d:p:vn"})).is_err());
    }

    #[test]
    fn service_ports_are_ordered() {
        let mut service = json!({"protocol": "udp", "dst_ports": {"start_port": 10, "end_port": 5}});
        assert!(normalize_service(&mut service).is_err());
        let mut service = json!({"protocol": "udp", "dst_ports": {"start_port": 5, "end_port": 10}});
        normalize_service(&mut service).unwrap();
        assert_eq!(service["protocol_id"], json!(17));
    }

    #[test]
    fn project_scope_of_rules() {
        let fq = FqName::from(&["default-domain", "p", "r"][..]);
        assert_eq!(project_scope(&fq).map(|p| p.to_string()).as_deref(), Some("default-domain:p"));
        assert!(project_scope(&FqName::from(&["default-policy-management", "r"][..])).is_none());
    }
}
