// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Instance ips: addresses taken from the address manager of their network.

use super::{TypeHooks, first_ref, is_infra_network, ref_uuids, uuid_of};
use crate::addrmgr::Family;
use crate::context::RequestContext;
use crate::pipeline::undo::{Compensation, CompensationList};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName};
use serde_json::{Map, Value, json};
use std::net::IpAddr;
use std::str::FromStr;
use store::ReadOptions;
use tracing::debug;

pub(crate) fn parse_addr(value: Option<&Value>) -> ApiResult<Option<IpAddr>> {
    match value.and_then(Value::as_str) {
        None => Ok(None),
        Some(text) => IpAddr::from_str(text)
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("Invalid ip address {text}"))),
    }
}

/// Whether `addr` is the gateway of one of the subnets of `vn`.
pub(crate) fn is_gateway(api: &ApiServer, vn: &FqName, addr: IpAddr) -> bool {
    api.addrmgr().subnets(vn).iter().any(|s| {
        s.prefix.contains(&addr) && s.gateway.unwrap_or_else(|| s.default_gateway()) == addr
    })
}

/// Whether one of the interfaces of an instance ip belongs to a virtual machine.
fn used_by_vm(api: &ApiServer, obj: &Map<String, Value>) -> bool {
    ref_uuids(obj, "virtual_machine_interface_refs")
        .iter()
        .filter_map(|vmi| api.db().read(vmi, &ReadOptions::shallow()).ok())
        .any(|vmi| !ref_uuids(&vmi, "virtual_machine_refs").is_empty())
}

pub struct InstanceIpHooks;

#[async_trait]
impl TypeHooks for InstanceIpHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let Some((_, vn)) = first_ref(api, obj, "virtual_network_refs")? else {
            return Err(ApiError::bad_request(
                "Instance ip must refer to a virtual network",
            ));
        };
        if is_infra_network(&vn) {
            return Ok(());
        }
        let requested = parse_addr(obj.get("instance_ip_address"))?;
        let family = obj
            .get("instance_ip_family")
            .and_then(Value::as_str)
            .map(Family::parse)
            .transpose()?;
        let subnet = obj
            .get("subnet_uuid")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(addr) = requested
            && api.addrmgr().is_allocated(&vn, addr)
        {
            return Err(ApiError::Conflict("Ip address already in use".to_string()));
        }
        if let Some(addr) = requested
            && is_gateway(api, &vn, addr)
        {
            // router ports may hold the gateway address, it stays reserved in the pools
            if used_by_vm(api, obj) {
                return Err(ApiError::bad_request("Gateway IP cannot be used by VM port"));
            }
            return Ok(());
        }

        let (addr, subnet_uuid) =
            api.addrmgr()
                .alloc(&vn, family, subnet.as_deref(), requested)?;
        undo.push(Compensation::FreeAddress {
            vn: vn.clone(),
            addr,
        });
        debug!("Instance ip {} gets {addr} in {vn}", uuid_of(obj)?);
        obj.insert("instance_ip_address".into(), json!(addr.to_string()));
        obj.insert("subnet_uuid".into(), json!(subnet_uuid));
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
        let Some((_, vn)) = first_ref(api, current, "virtual_network_refs")? else {
            return Ok(());
        };
        if is_infra_network(&vn) {
            return Ok(());
        }
        let stored = parse_addr(current.get("instance_ip_address"))?;
        if let Some(given) = parse_addr(patch.get("instance_ip_address"))?
            && Some(given) != stored
        {
            return Err(ApiError::bad_request(
                "Instance IP Address can not be changed",
            ));
        }
        if let Some(addr) = stored
            && is_gateway(api, &vn, addr)
            && used_by_vm(api, patch)
        {
            return Err(ApiError::bad_request("Gateway IP cannot be used by VM port"));
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        let Some(vn) = ref_uuids(current, "virtual_network_refs")
            .first()
            .and_then(|u| api.db().fq_name(u).ok())
        else {
            return Ok(());
        };
        if is_infra_network(&vn) {
            return Ok(());
        }
        if let Some(addr) = parse_addr(current.get("instance_ip_address"))? {
            api.addrmgr().free(&vn, addr);
            debug!("Freed {addr} in {vn}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_checked() {
        assert_eq!(
            parse_addr(Some(&json!("10.0.0.3"))).unwrap(),
            Some("10.0.0.3".parse().unwrap())
        );
        assert_eq!(parse_addr(None).unwrap(), None);
        assert_eq!(parse_addr(Some(&json!("10.0.0"))).unwrap_err().status(), 400);
    }
}
