// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Logical routers: interfaces, gateways and the router route target.

use super::network::{alloc_route_target, check_route_targets, free_route_target};
use super::{TypeHooks, fq_of, ref_uuids, uuid_of};
use crate::context::RequestContext;
use crate::pipeline::undo::CompensationList;
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult};
use id::Uuid;
use serde_json::{Map, Value, json};
use store::{ReadOptions, RefOp};
use tracing::debug;

/// Router interfaces must not already belong to a virtual machine.
fn check_ports_free(api: &ApiServer, obj: &Map<String, Value>) -> ApiResult<()> {
    for vmi in ref_uuids(obj, "virtual_machine_interface_refs") {
        let body = api.db().read(&vmi, &ReadOptions::shallow())?;
        let owned_by_vm = api
            .db()
            .parent(&vmi)?
            .filter(|p| p.resource_type == "virtual-machine");
        let vm = owned_by_vm
            .map(|p| p.uuid)
            .or_else(|| ref_uuids(&body, "virtual_machine_refs").first().copied());
        if let Some(vm) = vm {
            return Err(ApiError::Conflict(format!(
                "Port({vmi}) already in use by virtual-machine({vm})"
            )));
        }
    }
    Ok(())
}

/// The networks the given router interfaces sit in.
fn interface_networks(api: &ApiServer, vmis: &[Uuid]) -> ApiResult<Vec<Uuid>> {
    let mut networks = Vec::new();
    for vmi in vmis {
        let body = api.db().read(vmi, &ReadOptions::shallow())?;
        networks.extend(ref_uuids(&body, "virtual_network_refs").first().copied());
    }
    Ok(networks)
}

/// A router cannot have an interface in its gateway network.
fn check_gateway_apart(api: &ApiServer, vmis: &[Uuid], gateways: &[Uuid]) -> ApiResult<()> {
    let networks = interface_networks(api, vmis)?;
    if let Some(vn) = gateways.iter().find(|g| networks.contains(g)) {
        return Err(ApiError::bad_request(format!(
            "Logical router interface and gateway cannot be in VN({vn})"
        )));
    }
    Ok(())
}

pub struct LogicalRouterHooks;

#[async_trait]
impl TypeHooks for LogicalRouterHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        check_route_targets(api, obj.get("configured_route_target_list"))?;
        check_gateway_apart(
            api,
            &ref_uuids(obj, "virtual_machine_interface_refs"),
            &ref_uuids(obj, "virtual_network_refs"),
        )?;
        check_ports_free(api, obj)
    }

    async fn post_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &Map<String, Value>,
    ) -> ApiResult<()> {
        let fq = fq_of(obj)?;
        let uuid = uuid_of(obj)?;
        let rt = alloc_route_target(api, ctx, &fq.to_string()).await?;
        api.db()
            .ref_update(&uuid, "route-target", &rt, None, RefOp::Add, false)?;
        api.invalidate_around(&uuid);
        debug!("Logical router {fq} gets route target {rt}");
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
        check_route_targets(api, patch.get("configured_route_target_list"))?;
        let field = |name: &str| {
            if patch.contains_key(name) {
                ref_uuids(patch, name)
            } else {
                ref_uuids(current, name)
            }
        };
        if patch.contains_key("virtual_machine_interface_refs")
            || patch.contains_key("virtual_network_refs")
        {
            check_gateway_apart(
                api,
                &field("virtual_machine_interface_refs"),
                &field("virtual_network_refs"),
            )?;
        }
        // only interfaces the update adds need to be free
        let held = ref_uuids(current, "virtual_machine_interface_refs");
        let added: Vec<Value> = ref_uuids(patch, "virtual_machine_interface_refs")
            .into_iter()
            .filter(|u| !held.contains(u))
            .map(|u| json!({ "uuid": u.to_string() }))
            .collect();
        let mut additions = Map::new();
        additions.insert("virtual_machine_interface_refs".into(), Value::Array(added));
        check_ports_free(api, &additions)
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        free_route_target(api, ctx, &fq_of(current)?.to_string()).await
    }
}
