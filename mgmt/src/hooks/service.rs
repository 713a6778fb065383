// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Service instances: service chain addresses and per-VM chain VLANs.

use super::{TypeHooks, first_ref, fq_of, ref_uuids, uuid_of};
use crate::context::RequestContext;
use crate::pipeline::undo::CompensationList;
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use serde_json::{Map, Value, json};
use store::{ReadOptions, RefOp};
use tracing::{debug, warn};

/// Interface types of a service template, in order.
fn template_interfaces(template: &Map<String, Value>) -> Vec<String> {
    template
        .get("service_template_properties")
        .and_then(|p| p.get("interface_type"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|i| i.get("service_interface_type").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// The network and requested address of each data interface of an instance.
fn interface_networks(
    props: Option<&Value>,
    types: &[String],
) -> Vec<(String, String, Option<String>)> {
    let Some(props) = props else {
        return Vec::new();
    };
    let list: Vec<&Value> = props
        .get("interface_list")
        .and_then(Value::as_array)
        .map(|l| l.iter().collect())
        .unwrap_or_default();
    let mut out = Vec::new();
    for (i, ty) in types.iter().enumerate() {
        if ty == "management" {
            continue;
        }
        let (vn, ip) = match list.get(i) {
            Some(iface) => (
                iface.get("virtual_network").and_then(Value::as_str),
                iface.get("ip_address").and_then(Value::as_str),
            ),
            // older instances name left and right networks directly
            None => (
                props
                    .get(format!("{ty}_virtual_network"))
                    .and_then(Value::as_str),
                props.get(format!("{ty}_ip_address")).and_then(Value::as_str),
            ),
        };
        if let Some(vn) = vn.filter(|v| !v.is_empty()) {
            out.push((ty.clone(), vn.to_string(), ip.map(str::to_string)));
        }
    }
    out
}

/// Allocate or release the chain VLANs of a virtual machine as its service instances change.
pub(crate) async fn sync_chain_vlans(
    api: &ApiServer,
    vm: &Uuid,
    before: &[Uuid],
    after: &[Uuid],
) -> ApiResult<()> {
    let vlans = api.ids().vm_vlans(&vm.to_string()).await?;
    for si in after.iter().filter(|s| !before.contains(s)) {
        let owner = api.db().fq_name(si)?.to_string();
        if vlans.id_of(&owner).is_none() {
            let vlan = vlans.alloc(&owner).await?;
            debug!("Virtual machine {vm} gets chain vlan {vlan} for {owner}");
        }
    }
    for si in before.iter().filter(|s| !after.contains(s)) {
        if let Ok(fq) = api.db().fq_name(si) {
            vlans.free_owner(&fq.to_string()).await?;
        }
    }
    Ok(())
}

pub struct ServiceInstanceHooks;

#[async_trait]
impl TypeHooks for ServiceInstanceHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let Some((template, _)) = first_ref(api, obj, "service_template_refs")? else {
            return Err(ApiError::bad_request(
                "Service instance must refer to a service template",
            ));
        };
        let types = template_interfaces(&api.db().read(&template, &ReadOptions::shallow())?);
        let given = obj
            .get("service_instance_properties")
            .and_then(|p| p.get("interface_list"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        if given > types.len() {
            return Err(ApiError::bad_request(format!(
                "Service instance has {given} interfaces, its template defines {}",
                types.len()
            )));
        }
        Ok(())
    }

    async fn post_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &Map<String, Value>,
    ) -> ApiResult<()> {
        let uuid = uuid_of(obj)?;
        let Some((template, _)) = first_ref(api, obj, "service_template_refs")? else {
            return Ok(());
        };
        let types = template_interfaces(&api.db().read(&template, &ReadOptions::shallow())?);
        for (ty, vn, ip) in interface_networks(obj.get("service_instance_properties"), &types) {
            let vn_fq = FqName::parse(&vn, None);
            let Ok(vn_uuid) = api.db().uuid_of("virtual-network", &vn_fq) else {
                warn!("Service instance {uuid}: {ty} network {vn} not found");
                continue;
            };
            let mut iip = Map::new();
            iip.insert("fq_name".into(), json!([format!("{uuid}-{ty}")]));
            iip.insert(
                "virtual_network_refs".into(),
                json!([{ "uuid": vn_uuid.to_string() }]),
            );
            iip.insert("service_instance_ip".into(), json!(true));
            if let Some(ip) = ip {
                iip.insert("instance_ip_address".into(), json!(ip));
            }
            let iip = api
                .get_or_create(&ctx.as_internal(), "instance-ip", iip)
                .await?;
            api.db().ref_update(
                &uuid,
                "instance-ip",
                &iip,
                Some(json!({ "interface_type": ty })),
                RefOp::Add,
                false,
            )?;
            debug!("Service instance {} {ty} interface address {iip}", fq_of(obj)?);
        }
        api.invalidate_around(&uuid);
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        for iip in ref_uuids(current, "instance_ip_refs") {
            api.delete_if_exists(ctx, "instance-ip", iip).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_interfaces_follow_the_template() {
        let types = vec!["management".to_string(), "left".to_string(), "right".to_string()];
        let props = json!({"interface_list": [
            {"virtual_network": ""},
            {"virtual_network": "default-domain:p:left", "ip_address": "10.0.0.5"},
            {"virtual_network": "default-domain:p:right"}
        ]});
        assert_eq!(
            interface_networks(Some(&props), &types),
            vec![
                ("left".to_string(), "default-domain:p:left".to_string(), Some("10.0.0.5".to_string())),
                ("right".to_string(), "default-domain:p:right".to_string(), None),
            ]
        );
    }

    #[test]
    fn older_instances_name_networks_directly() {
        let types = vec!["left".to_string(), "right".to_string()];
        let props = json!({"left_virtual_network": "d:p:l", "right_virtual_network": "d:p:r"});
        let nets = interface_networks(Some(&props), &types);
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[1].1, "d:p:r");
    }
}
