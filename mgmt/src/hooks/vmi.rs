// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Virtual machine interfaces and virtual machines.

use super::network::default_ri_fq;
use super::service::sync_chain_vlans;
use super::{TypeHooks, effective, first_ref, ref_uuids, uuid_of};
use crate::context::RequestContext;
use crate::pipeline::undo::CompensationList;
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult};
use id::Uuid;
use mac_address::MacAddress;
use serde_json::{Map, Value, json};
use std::str::FromStr;
use store::{ReadOptions, RefOp};
use tracing::{debug, warn};

const VIF_TYPE_VROUTER: &str = "vrouter";
const VIF_TYPE_VHOST_USER: &str = "vhostuser";
const VNIC_TYPE_NORMAL: &str = "normal";
const VNIC_TYPE_BAREMETAL: &str = "baremetal";
const VNIC_TYPE_VIRTIO_FORWARDER: &str = "virtio-forwarder";
const VHOST_USER_SOCKET_DIR: &str = "/var/run/vrouter/";
const NIC_NAME_LEN: usize = 14;

/// Locally administered MAC derived from the interface id.
#[must_use]
pub fn mac_for(uuid: &Uuid) -> String {
    let b = uuid.as_bytes();
    MacAddress::new([0x02, b[0], b[1], b[2], b[3], b[5]])
        .to_string()
        .to_lowercase()
}

/// Parse a MAC given with `:` or `-` separators, rendered lowercase with `:`.
pub fn normalize_mac(mac: &str) -> ApiResult<String> {
    MacAddress::from_str(&mac.replace('-', ":"))
        .map(|m| m.to_string().to_lowercase())
        .map_err(|_| ApiError::bad_request(format!("Invalid mac address {mac}")))
}

fn vlan_tag(obj: &Map<String, Value>) -> u64 {
    obj.get("virtual_machine_interface_properties")
        .and_then(|p| p.get("sub_interface_vlan_tag"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn bindings(obj: &Map<String, Value>) -> Vec<(String, String)> {
    obj.get("virtual_machine_interface_bindings")
        .and_then(|b| b.get("key_value_pair"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|kvp| {
            Some((
                kvp.get("key")?.as_str()?.to_string(),
                kvp.get("value")?.as_str().unwrap_or_default().to_string(),
            ))
        })
        .collect()
}

fn binding<'a>(kvps: &'a [(String, String)], key: &str) -> Option<&'a str> {
    kvps.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn set_bindings(obj: &mut Map<String, Value>, kvps: &[(String, String)]) {
    let pairs: Vec<Value> = kvps
        .iter()
        .map(|(k, v)| json!({"key": k, "value": v}))
        .collect();
    obj.insert(
        "virtual_machine_interface_bindings".into(),
        json!({ "key_value_pair": pairs }),
    );
}

fn upsert(kvps: &mut Vec<(String, String)>, key: &str, value: String) {
    match kvps.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => kvps.push((key.to_string(), value)),
    }
}

fn vhostuser_socket(uuid: &str) -> String {
    let mut name = format!("tap{uuid}");
    name.truncate(NIC_NAME_LEN);
    format!("{VHOST_USER_SOCKET_DIR}uvh_vif_{name}")
}

/// Fill in the `vif_type` and `vnic_type` bindings the agents expect.
fn complete_bindings(uuid: &str, kvps: &mut Vec<(String, String)>) {
    if binding(kvps, "vnic_type") == Some(VNIC_TYPE_VIRTIO_FORWARDER) {
        upsert(kvps, "vif_type", VIF_TYPE_VHOST_USER.to_string());
        upsert(
            kvps,
            "vif_details",
            json!({"vhostuser_mode": "server", "vhostuser_socket": vhostuser_socket(uuid)})
                .to_string(),
        );
    }
    if binding(kvps, "vif_type").is_none() {
        kvps.push(("vif_type".into(), VIF_TYPE_VROUTER.into()));
    }
    if binding(kvps, "vnic_type").is_none() {
        kvps.push(("vnic_type".into(), VNIC_TYPE_NORMAL.into()));
    }
}

/// Allowed address pairs require port security.
fn check_port_security(
    current: &Map<String, Value>,
    patch: &Map<String, Value>,
) -> ApiResult<()> {
    if !patch.contains_key("port_security_enabled")
        && !patch.contains_key("virtual_machine_interface_allowed_address_pairs")
    {
        return Ok(());
    }
    let port_security = effective(current, patch, "port_security_enabled")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let has_pairs = effective(current, patch, "virtual_machine_interface_allowed_address_pairs")
        .and_then(|p| p.get("allowed_address_pair"))
        .and_then(Value::as_array)
        .is_some_and(|pairs| !pairs.is_empty());
    if !port_security && has_pairs {
        return Err(ApiError::bad_request(
            "Allowed address pairs are not allowed when port security is disabled",
        ));
    }
    Ok(())
}

/// A sub-interface hangs off a primary interface that is not itself one, with a VLAN unique
/// among its siblings.
fn check_sub_interface(api: &ApiServer, obj: &Map<String, Value>) -> ApiResult<()> {
    let tag = vlan_tag(obj);
    if tag == 0 {
        return Ok(());
    }
    let Some(primary) = ref_uuids(obj, "virtual_machine_interface_refs").first().copied() else {
        return Ok(());
    };
    let opts = ReadOptions::shallow();
    let primary_body = api.db().read(&primary, &opts)?;
    if vlan_tag(&primary_body) != 0 {
        return Err(ApiError::bad_request(
            "sub interface can't have another sub interface as it's primary port",
        ));
    }
    let siblings = api
        .db()
        .backrefs(&primary)?
        .into_iter()
        .filter(|b| b.from_type == "virtual-machine-interface")
        .map(|b| b.uuid)
        .chain(ref_uuids(&primary_body, "virtual_machine_interface_refs"));
    for sibling in siblings {
        if let Ok(body) = api.db().read(&sibling, &opts)
            && vlan_tag(&body) == tag
        {
            return Err(ApiError::bad_request(
                "Two sub interfaces under same primary port can't have same Vlan tag",
            ));
        }
    }
    Ok(())
}

fn is_bound(current: &Map<String, Value>, api: &ApiServer, uuid: &Uuid) -> bool {
    let to_router = api
        .db()
        .backrefs(uuid)
        .is_ok_and(|b| b.iter().any(|b| b.from_type == "logical-router"));
    to_router || !ref_uuids(current, "virtual_machine_refs").is_empty()
}

pub struct VmiHooks;

#[async_trait]
impl TypeHooks for VmiHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if first_ref(api, obj, "virtual_network_refs")?.is_none() {
            return Err(ApiError::bad_request(
                "Virtual machine interface must refer to a virtual network",
            ));
        }
        check_sub_interface(api, obj)?;

        let uuid = uuid_of(obj)?;
        let given: Vec<String> = obj
            .get("virtual_machine_interface_mac_addresses")
            .and_then(|m| m.get("mac_address"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        let mac = match given.as_slice() {
            [one] => normalize_mac(one)?,
            _ => mac_for(&uuid),
        };
        debug!("Interface {uuid} gets mac {mac}");
        obj.insert(
            "virtual_machine_interface_mac_addresses".into(),
            json!({ "mac_address": [mac] }),
        );

        if obj.contains_key("virtual_machine_interface_bindings") {
            let mut kvps = bindings(obj);
            complete_bindings(&uuid.to_string(), &mut kvps);
            set_bindings(obj, &kvps);
        }
        check_port_security(&Map::new(), obj)
    }

    async fn post_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &Map<String, Value>,
    ) -> ApiResult<()> {
        let Some((_, vn)) = first_ref(api, obj, "virtual_network_refs")? else {
            return Ok(());
        };
        let uuid = uuid_of(obj)?;
        let ri = api.db().uuid_of("routing-instance", &default_ri_fq(&vn))?;
        api.db().ref_update(
            &uuid,
            "routing-instance",
            &ri,
            Some(json!({"direction": "both"})),
            RefOp::Add,
            false,
        )?;
        api.invalidate_around(&uuid);
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
        let uuid = uuid_of(current)?;
        let wants_vm = !ref_uuids(patch, "virtual_machine_refs").is_empty();
        if wants_vm
            && api
                .db()
                .backrefs(&uuid)?
                .iter()
                .any(|b| b.from_type == "logical-router")
        {
            return Err(ApiError::bad_request(
                "Logical router interface cannot be used by VM",
            ));
        }
        if patch.contains_key("virtual_machine_interface_refs") {
            let kept = ref_uuids(patch, "virtual_machine_interface_refs");
            if ref_uuids(current, "virtual_machine_interface_refs")
                .iter()
                .any(|r| !kept.contains(r))
            {
                return Err(ApiError::Conflict(
                    "VMI ref delete not allowed during update".to_string(),
                ));
            }
        }
        if patch.contains_key("virtual_machine_interface_properties")
            && vlan_tag(patch) != vlan_tag(current)
        {
            return Err(ApiError::bad_request("Cannot change Vlan tag"));
        }
        if patch.contains_key("virtual_machine_interface_bindings") {
            let old = bindings(current);
            let mut new = bindings(patch);
            let old_vnic = binding(&old, "vnic_type").unwrap_or(VNIC_TYPE_NORMAL);
            let new_vnic = binding(&new, "vnic_type").unwrap_or(old_vnic);
            if new_vnic != VNIC_TYPE_BAREMETAL
                && new_vnic != old_vnic
                && is_bound(current, api, &uuid)
            {
                return Err(ApiError::Conflict(
                    "Vnic_type can not be modified when port is linked to Vrouter or VM."
                        .to_string(),
                ));
            }
            if binding(&new, "host_id") == Some("null") {
                warn!("Interface {uuid} unbound from its host");
            } else {
                complete_bindings(&uuid.to_string(), &mut new);
                set_bindings(patch, &new);
            }
        }
        if patch.contains_key("virtual_machine_interface_mac_addresses") {
            let given = patch
                .get("virtual_machine_interface_mac_addresses")
                .and_then(|m| m.get("mac_address"))
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .map(normalize_mac)
                .transpose()?;
            let stored = current
                .get("virtual_machine_interface_mac_addresses")
                .and_then(|m| m.get("mac_address"))
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .map(str::to_string);
            // only unbound and baremetal ports may take a new mac
            let kvps = if patch.contains_key("virtual_machine_interface_bindings") {
                bindings(patch)
            } else {
                bindings(current)
            };
            let movable = binding(&kvps, "vnic_type") == Some(VNIC_TYPE_BAREMETAL)
                || binding(&kvps, "host_id").is_none_or(|h| h == "null");
            if given.is_some() && given != stored && !movable {
                return Err(ApiError::bad_request("Mac address cannot be changed"));
            }
        }
        check_port_security(current, patch)
    }
}

pub struct VirtualMachineHooks;

#[async_trait]
impl TypeHooks for VirtualMachineHooks {
    async fn post_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &Map<String, Value>,
    ) -> ApiResult<()> {
        let chains = ref_uuids(obj, "service_instance_refs");
        if chains.is_empty() {
            return Ok(());
        }
        sync_chain_vlans(api, &uuid_of(obj)?, &[], &chains).await
    }

    async fn post_update(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        previous: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> ApiResult<()> {
        if !patch.contains_key("service_instance_refs") {
            return Ok(());
        }
        sync_chain_vlans(
            api,
            &uuid_of(previous)?,
            &ref_uuids(previous, "service_instance_refs"),
            &ref_uuids(patch, "service_instance_refs"),
        )
        .await
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        api.ids()
            .drop_vm_vlans(&uuid_of(current)?.to_string())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_macs_are_local() {
        let uuid = Uuid::parse_str("a1b2c3d4-e5f6-4711-8899-aabbccddeeff").unwrap();
        assert_eq!(mac_for(&uuid), "02:a1:b2:c3:d4:f6");
    }

    #[test]
    fn macs_accept_dashes() {
        assert_eq!(normalize_mac("AA-BB-CC-00-11-22").unwrap(), "aa:bb:cc:00:11:22");
        assert_eq!(normalize_mac("not-a-mac").unwrap_err().status(), 400);
    }

    #[test]
    fn bindings_default_to_vrouter() {
        let mut kvps = vec![("host_id".to_string(), "compute-1".to_string())];
        complete_bindings("1234", &mut kvps);
        assert_eq!(binding(&kvps, "vif_type"), Some(VIF_TYPE_VROUTER));
        assert_eq!(binding(&kvps, "vnic_type"), Some(VNIC_TYPE_NORMAL));
    }

    #[test]
    fn virtio_forwarder_gets_a_socket() {
        let mut kvps = vec![("vnic_type".to_string(), VNIC_TYPE_VIRTIO_FORWARDER.to_string())];
        complete_bindings("0123456789abcdef", &mut kvps);
        assert_eq!(binding(&kvps, "vif_type"), Some(VIF_TYPE_VHOST_USER));
        assert!(
            binding(&kvps, "vif_details")
                .unwrap()
                .contains("/var/run/vrouter/uvh_vif_tap0123456789a")
        );
    }

    #[test]
    fn address_pairs_need_port_security() {
        let current = Map::new();
        let patch = json!({
            "port_security_enabled": false,
            "virtual_machine_interface_allowed_address_pairs": {
                "allowed_address_pair": [{"ip": {"ip_prefix": "10.0.0.1", "ip_prefix_len": 32}}]
            }
        });
        let err = check_port_security(&current, patch.as_object().unwrap()).unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
