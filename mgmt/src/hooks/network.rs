// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Virtual networks and ipams: network ids, subnets, the default routing instance.

use super::{TypeHooks, effective, fq_of, global_asn, uuid_of};
use crate::addrmgr::{SubnetSpec, check_overlap, vn_subnets};
use crate::context::RequestContext;
use crate::pipeline::undo::{Compensation, CompensationList, IdPool};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use idalloc::ROUTE_TARGET_MIN;
use perms::PERMS_RWX;
use serde_json::{Map, Value, json};
use store::ReadOptions;
use tracing::{debug, info, warn};

/// Check the user-configured route targets of a `RouteTargetList` value.
///
/// A configured target must not collide with the server allocated space: its ASN must differ
/// from the global one, or its number must stay below the allocated range.
pub(crate) fn check_route_targets(api: &ApiServer, value: Option<&Value>) -> ApiResult<()> {
    let Some(targets) = value
        .and_then(|v| v.get("route_target"))
        .and_then(Value::as_array)
    else {
        return Ok(());
    };
    let asn = global_asn(api);
    for target in targets {
        let text = target.as_str().unwrap_or_default();
        let parts: Vec<&str> = text.split(':').collect();
        let [kind, admin, number] = parts.as_slice() else {
            return Err(ApiError::bad_request(format!(
                "Route target must be of the format 'target:<asn>:<number>' or \
                 'target:<ip>:<number>': {text}"
            )));
        };
        let number: u64 = number.parse().map_err(|_| {
            ApiError::bad_request(format!("Route target number must be an integer: {text}"))
        })?;
        if *kind != "target" {
            return Err(ApiError::bad_request(format!(
                "Route target must start with 'target': {text}"
            )));
        }
        if admin.parse::<u64>().ok() == Some(asn) && number >= u64::from(ROUTE_TARGET_MIN) {
            return Err(ApiError::bad_request(format!(
                "Configured route target must use ASN that is different from global ASN or \
                 route target value must be less than {ROUTE_TARGET_MIN}"
            )));
        }
    }
    Ok(())
}

/// Keep `is_shared` and the global access mask in agreement.
pub(crate) fn sync_sharing(obj: &mut Map<String, Value>) {
    let global_access = obj
        .get("perms2")
        .and_then(|p| p.get("global_access"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let shared = obj.get("is_shared").and_then(Value::as_bool);
    if global_access == u64::from(PERMS_RWX) {
        obj.insert("is_shared".into(), json!(true));
    } else if shared == Some(true)
        && let Some(Value::Object(perms2)) = obj.get_mut("perms2")
    {
        perms2.insert("global_access".into(), json!(PERMS_RWX));
    }
}

/// Give every ipam subnet of the `network_ipam_refs` of `obj` a subnet uuid.
///
/// Subnets already known by prefix in `previous` keep their uuid. Flat ipams get a single
/// subnet entry carrying only the uuid.
fn assign_subnet_uuids(
    api: &ApiServer,
    obj: &mut Map<String, Value>,
    previous: &[SubnetSpec],
) -> ApiResult<()> {
    let Some(Value::Array(edges)) = obj.get_mut("network_ipam_refs") else {
        return Ok(());
    };
    for edge in edges.iter_mut() {
        let ipam = edge
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|u| Uuid::parse_str(u).ok())
            .map(|u| api.db().read(&u, &ReadOptions::shallow()))
            .transpose()?;
        let flat = ipam
            .as_ref()
            .and_then(|i| i.get("ipam_subnet_method"))
            .and_then(Value::as_str)
            == Some("flat-subnet");
        let Some(edge) = edge.as_object_mut() else {
            continue;
        };
        let attr = edge
            .entry("attr")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| ApiError::bad_request("network_ipam_refs attr must be an object"))?;
        if flat {
            let has_uuid = attr
                .get("ipam_subnets")
                .and_then(Value::as_array)
                .and_then(|s| s.first())
                .and_then(|s| s.get("subnet_uuid"))
                .is_some_and(|u| !u.is_null());
            if !has_uuid {
                attr.insert(
                    "ipam_subnets".into(),
                    json!([{ "subnet_uuid": Uuid::new_v4().to_string() }]),
                );
            }
            continue;
        }
        for subnet in attr
            .get_mut("ipam_subnets")
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten()
        {
            let Some(subnet) = subnet.as_object_mut() else {
                continue;
            };
            if subnet.get("subnet_uuid").is_some_and(|u| !u.is_null()) {
                continue;
            }
            let known = SubnetSpec::from_ipam_subnet(&Value::Object(subnet.clone()))?
                .and_then(|spec| previous.iter().find(|p| p.prefix == spec.prefix))
                .map(|p| p.subnet_uuid.clone())
                .filter(|u| !u.is_empty());
            let uuid = known.unwrap_or_else(|| Uuid::new_v4().to_string());
            subnet.insert("subnet_uuid".into(), json!(uuid));
        }
    }
    Ok(())
}

/// Every subnet a network allocates from: the ones of its references, plus the subnets of the
/// flat ipams it references.
pub(crate) fn network_subnets(api: &ApiServer, vn: &Map<String, Value>) -> ApiResult<Vec<SubnetSpec>> {
    let mut subnets = vn_subnets(vn)?;
    for edge in vn
        .get("network_ipam_refs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(ipam) = edge
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|u| Uuid::parse_str(u).ok())
        else {
            continue;
        };
        let ipam = api.db().read(&ipam, &ReadOptions::shallow())?;
        if ipam.get("ipam_subnet_method").and_then(Value::as_str) != Some("flat-subnet") {
            continue;
        }
        for subnet in ipam
            .get("ipam_subnets")
            .and_then(|v| v.get("subnets"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(spec) = SubnetSpec::from_ipam_subnet(subnet)? {
                subnets.push(spec);
            }
        }
    }
    check_overlap(&subnets)?;
    Ok(subnets)
}

/// Fq-name of the default routing instance of a network.
pub(crate) fn default_ri_fq(vn: &FqName) -> FqName {
    vn.child(vn.name())
}

/// Allocate a route target number for `owner` and the route-target resource naming it.
pub(crate) async fn alloc_route_target(
    api: &ApiServer,
    ctx: &RequestContext,
    owner: &str,
) -> ApiResult<Uuid> {
    let number = api.ids().route_target.alloc(owner).await?;
    let name = format!("target:{}:{number}", global_asn(api));
    let mut body = Map::new();
    body.insert("fq_name".into(), json!([name]));
    api.get_or_create(&ctx.as_internal(), "route-target", body)
        .await
}

/// Give back the route target number of `owner` and delete its resource.
pub(crate) async fn free_route_target(
    api: &ApiServer,
    ctx: &RequestContext,
    owner: &str,
) -> ApiResult<()> {
    if let Some(number) = api.ids().route_target.free_owner(owner).await? {
        let name = FqName::new([format!("target:{}:{number}", global_asn(api))]);
        if let Ok(rt) = api.db().uuid_of("route-target", &name) {
            api.delete_if_exists(ctx, "route-target", rt).await?;
        }
    }
    Ok(())
}

pub struct VirtualNetworkHooks;

#[async_trait]
impl TypeHooks for VirtualNetworkHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if obj
            .get("virtual_network_network_id")
            .is_some_and(|v| !v.is_null())
        {
            return Err(ApiError::Permission(
                "Cannot set the virtual network ID".to_string(),
            ));
        }
        sync_sharing(obj);
        check_route_targets(api, obj.get("route_target_list"))?;
        check_route_targets(api, obj.get("import_route_target_list"))?;
        check_route_targets(api, obj.get("export_route_target_list"))?;

        let fq = fq_of(obj)?;
        let vn_id = api.ids().vn.alloc(&fq.to_string()).await?;
        undo.push(Compensation::FreeId {
            pool: IdPool::VirtualNetwork,
            id: vn_id,
        });
        obj.insert("virtual_network_network_id".into(), json!(vn_id));

        assign_subnet_uuids(api, obj, &[])?;
        let subnets = network_subnets(api, obj)?;
        api.addrmgr().net_create(&fq, subnets);
        undo.push(Compensation::ForgetNetwork { vn: fq.clone() });
        info!("Virtual network {fq} gets id {vn_id}");
        Ok(())
    }

    async fn post_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &Map<String, Value>,
    ) -> ApiResult<()> {
        let fq = fq_of(obj)?;
        let ri_fq = default_ri_fq(&fq);
        let rt = alloc_route_target(api, ctx, &ri_fq.to_string()).await?;
        let mut ri = Map::new();
        ri.insert("fq_name".into(), json!(ri_fq));
        ri.insert("parent_type".into(), json!("virtual-network"));
        ri.insert("routing_instance_is_default".into(), json!(true));
        ri.insert(
            "routing_instance_fabric_snat".into(),
            json!(obj.get("fabric_snat").and_then(Value::as_bool).unwrap_or(false)),
        );
        ri.insert(
            "route_target_refs".into(),
            json!([{ "uuid": rt.to_string(), "attr": {} }]),
        );
        api.create_boxed(ctx.as_internal(), "routing-instance", ri)
            .await?;
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
        if let Some(given) = patch
            .get("virtual_network_network_id")
            .filter(|v| !v.is_null())
            && Some(given) != current.get("virtual_network_network_id")
        {
            return Err(ApiError::Permission(
                "Cannot update the virtual network ID".to_string(),
            ));
        }
        if patch.contains_key("is_shared") || patch.contains_key("perms2") {
            let mut merged = Map::new();
            for key in ["is_shared", "perms2"] {
                if let Some(value) = effective(current, patch, key) {
                    merged.insert(key.to_string(), value.clone());
                }
            }
            sync_sharing(&mut merged);
            patch.extend(merged);
        }
        for field in [
            "route_target_list",
            "import_route_target_list",
            "export_route_target_list",
        ] {
            check_route_targets(api, patch.get(field))?;
        }

        if patch.contains_key("network_ipam_refs") {
            let fq = fq_of(current)?;
            let previous = api.addrmgr().subnets(&fq);
            assign_subnet_uuids(api, patch, &previous)?;
            let subnets = network_subnets(api, patch)?;
            let previous = api.addrmgr().net_update(&fq, subnets)?;
            undo.push(Compensation::RestoreNetwork {
                vn: fq,
                subnets: previous,
            });
        }
        Ok(())
    }

    async fn pre_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let fq = fq_of(current)?;
        if let Some(subnets) = api.addrmgr().net_delete(&fq) {
            undo.push(Compensation::RestoreNetwork { vn: fq, subnets });
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        let fq = fq_of(current)?;
        let ri_fq = default_ri_fq(&fq);
        free_route_target(api, ctx, &ri_fq.to_string()).await?;
        if let Some(id) = current
            .get("virtual_network_network_id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
        {
            api.ids().vn.free(id).await?;
            debug!("Freed network id {id} of {fq}");
        } else {
            warn!("Virtual network {} had no network id", uuid_of(current)?);
        }
        Ok(())
    }
}

pub struct NetworkIpamHooks;

impl NetworkIpamHooks {
    fn assign_uuids(obj: &mut Map<String, Value>) {
        for subnet in obj
            .get_mut("ipam_subnets")
            .and_then(|s| s.get_mut("subnets"))
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object_mut)
        {
            if subnet.get("subnet_uuid").is_none_or(Value::is_null) {
                subnet.insert("subnet_uuid".into(), json!(Uuid::new_v4().to_string()));
            }
        }
    }

    fn check_subnets(obj: &Map<String, Value>) -> ApiResult<()> {
        let mut specs = Vec::new();
        for subnet in obj
            .get("ipam_subnets")
            .and_then(|v| v.get("subnets"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            specs.extend(SubnetSpec::from_ipam_subnet(subnet)?);
        }
        check_overlap(&specs)
    }
}

#[async_trait]
impl TypeHooks for NetworkIpamHooks {
    async fn pre_create(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let method = obj.get("ipam_subnet_method").and_then(Value::as_str);
        if obj.get("ipam_subnets").is_some_and(|v| !v.is_null())
            && method != Some("flat-subnet")
        {
            return Err(ApiError::bad_request(
                "ipam_subnets are allowed only with flat-subnet",
            ));
        }
        Self::check_subnets(obj)?;
        Self::assign_uuids(obj);
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
        let before = current.get("ipam_subnet_method");
        if let Some(after) = patch.get("ipam_subnet_method")
            && Some(after) != before
        {
            return Err(ApiError::bad_request("ipam_subnet_method can not be changed"));
        }
        if patch.contains_key("ipam_subnets") {
            Self::check_subnets(patch)?;
            Self::assign_uuids(patch);
            // networks on this ipam see the new subnets
            let uuid = uuid_of(current)?;
            for backref in api.db().backrefs(&uuid)? {
                if backref.from_type != "virtual-network" {
                    continue;
                }
                let vn = api.db().read(&backref.uuid, &ReadOptions::shallow())?;
                let mut subnets = vn_subnets(&vn)?;
                for subnet in patch
                    .get("ipam_subnets")
                    .and_then(|v| v.get("subnets"))
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    subnets.extend(SubnetSpec::from_ipam_subnet(subnet)?);
                }
                api.addrmgr().net_update(&fq_of(&vn)?, subnets)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharing_follows_global_access() {
        let mut obj = Map::new();
        obj.insert("is_shared".into(), json!(true));
        obj.insert("perms2".into(), json!({"owner": "x", "global_access": 0}));
        sync_sharing(&mut obj);
        assert_eq!(obj["perms2"]["global_access"], json!(PERMS_RWX));

        let mut obj = Map::new();
        obj.insert("perms2".into(), json!({"owner": "x", "global_access": PERMS_RWX}));
        sync_sharing(&mut obj);
        assert_eq!(obj["is_shared"], json!(true));
    }

    #[test]
    fn ri_name_repeats_network_name() {
        let vn = FqName::from(&["default-domain", "p", "vn"][..]);
        assert_eq!(default_ri_fq(&vn).to_string(), "default-domain:p:vn:vn");
    }

    #[test]
    fn ipam_subnets_get_uuids() {
        let mut obj = Map::new();
        obj.insert(
            "ipam_subnets".into(),
            json!({"subnets": [
                {"subnet": {"ip_prefix": "10.0.0.0", "ip_prefix_len": 24}},
                {"subnet": {"ip_prefix": "10.1.0.0", "ip_prefix_len": 24}, "subnet_uuid": "keep"}
            ]}),
        );
        NetworkIpamHooks::assign_uuids(&mut obj);
        let subnets = obj["ipam_subnets"]["subnets"].as_array().cloned().unwrap_or_default();
        assert!(subnets[0]["subnet_uuid"].is_string());
        assert_eq!(subnets[1]["subnet_uuid"], json!("keep"));
    }

    #[test]
    fn overlapping_ipam_subnets_are_refused() {
        let mut obj = Map::new();
        obj.insert(
            "ipam_subnets".into(),
            json!({"subnets": [
                {"subnet": {"ip_prefix": "10.0.0.0", "ip_prefix_len": 16}},
                {"subnet": {"ip_prefix": "10.0.1.0", "ip_prefix_len": 24}}
            ]}),
        );
        assert!(NetworkIpamHooks::check_subnets(&obj).is_err());
    }
}
