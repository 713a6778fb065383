// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ports: a virtual machine interface under the tenant's project, one instance ip per fixed
//! ip, and the virtual machine named by `device_id`.

use crate::errors::{NeutronError, NeutronResult};
use crate::network::subnet_ids;
use crate::plugin::{
    NeutronPlugin, description_of, id_perms_enable, id_perms_from, list_reply, project_fields,
    ref_uuids, tenant_of, timestamps,
};
use crate::request::{NeutronRequest, Operation};
use config::{ApiError, FqName};
use id::Uuid;
use ipnet::IpNet;
use mgmt::hooks::normalize_mac;
use mgmt::refs::RefOperation;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use store::ReadOptions;
use tracing::{debug, info, warn};

pub(crate) const ROUTER_INTERFACE: &str = "network:router_interface";
pub(crate) const NO_RULE_SG: &[&str] = &["default-domain", "default-project", "__no_rule__"];
const BINDING_KEYS: &[&str] = &["host_id", "vnic_type", "vif_type", "vif_details", "profile"];

/// Resources created for a port, in creation order.
#[derive(Default)]
struct Created(Vec<(&'static str, Uuid)>);

/// Networks read while rendering a batch of ports.
#[derive(Default)]
pub(crate) struct PortMemo {
    networks: HashMap<Uuid, Option<Map<String, Value>>>,
}

impl PortMemo {
    fn network(&mut self, plugin: &NeutronPlugin, uuid: &Uuid) -> Option<&Map<String, Value>> {
        self.networks
            .entry(*uuid)
            .or_insert_with(|| plugin.read_typed("virtual-network", uuid))
            .as_ref()
    }
}

pub(crate) fn mac_of(vmi: &Map<String, Value>) -> Option<String> {
    vmi.get("virtual_machine_interface_mac_addresses")
        .and_then(|m| m.get("mac_address"))
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn device_owner(vmi: &Map<String, Value>) -> String {
    vmi.get("virtual_machine_interface_device_owner")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn kvps(vmi: &Map<String, Value>) -> Vec<(String, Value)> {
    vmi.get("virtual_machine_interface_bindings")
        .and_then(|b| b.get("key_value_pair"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|kvp| {
            Some((
                kvp.get("key")?.as_str()?.to_string(),
                kvp.get("value").cloned().unwrap_or(Value::Null),
            ))
        })
        .collect()
}

/// Fold the `binding:*` keys of a Neutron body into the key-value pairs of an interface.
fn bindings_from(resource: &Map<String, Value>, current: Vec<(String, Value)>) -> Option<Value> {
    let mut pairs = current;
    let mut touched = false;
    for key in BINDING_KEYS {
        let Some(value) = resource.get(&format!("binding:{key}")) else {
            continue;
        };
        touched = true;
        let value = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        pairs.retain(|(k, _)| k != key);
        pairs.push(((*key).to_string(), json!(value)));
    }
    touched.then(|| {
        let pairs: Vec<Value> = pairs
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        json!({ "key_value_pair": pairs })
    })
}

fn address_pairs_from(pairs: &[Value]) -> NeutronResult<Value> {
    let mut out = Vec::new();
    for pair in pairs {
        let text = pair
            .get("ip_address")
            .and_then(Value::as_str)
            .ok_or_else(|| NeutronError::invalid_input("Allowed address pair needs ip_address"))?;
        let net = IpNet::from_str(text)
            .or_else(|_| IpAddr::from_str(text).map(IpNet::from))
            .map_err(|_| NeutronError::invalid_input(format!("Invalid ip_address {text}")))?;
        let mut entry = Map::new();
        entry.insert(
            "ip".into(),
            json!({ "ip_prefix": net.network().to_string(), "ip_prefix_len": net.prefix_len() }),
        );
        if let Some(mac) = pair.get("mac_address").and_then(Value::as_str) {
            let mac = normalize_mac(mac).map_err(|_| NeutronError::invalid_input(format!("Invalid mac {mac}")))?;
            entry.insert("mac".into(), json!(mac));
        }
        entry.insert("address_mode".into(), json!("active-standby"));
        out.push(Value::Object(entry));
    }
    Ok(json!({ "allowed_address_pair": out }))
}

fn address_pairs_view(vmi: &Map<String, Value>, mac: Option<&str>) -> Vec<Value> {
    vmi.get("virtual_machine_interface_allowed_address_pairs")
        .and_then(|v| v.get("allowed_address_pair"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|pair| {
            let prefix = pair.pointer("/ip/ip_prefix").and_then(Value::as_str).unwrap_or_default();
            let len = pair.pointer("/ip/ip_prefix_len").and_then(Value::as_u64).unwrap_or(32);
            let full = if prefix.contains(':') { 128 } else { 32 };
            let ip = if len == full {
                prefix.to_string()
            } else {
                format!("{prefix}/{len}")
            };
            json!({
                "ip_address": ip,
                "mac_address": pair.get("mac").and_then(Value::as_str).or(mac),
            })
        })
        .collect()
}

fn dhcp_options_from(opts: &[Value]) -> Value {
    let options: Vec<Value> = opts
        .iter()
        .map(|o| json!({ "dhcp_option_name": o.get("opt_name"), "dhcp_option_value": o.get("opt_value") }))
        .collect();
    json!({ "dhcp_option": options })
}

fn dhcp_options_view(vmi: &Map<String, Value>) -> Vec<Value> {
    vmi.get("virtual_machine_interface_dhcp_option_list")
        .and_then(|v| v.get("dhcp_option"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|o| json!({ "opt_name": o.get("dhcp_option_name"), "opt_value": o.get("dhcp_option_value") }))
        .collect()
}

pub(crate) fn refs_of(uuids: &[Uuid]) -> Value {
    Value::Array(uuids.iter().map(|u| json!({ "uuid": u.to_string() })).collect())
}

/// Whether an instance ip is one Neutron reports as a fixed ip.
fn is_fixed_ip(iip: &Map<String, Value>) -> bool {
    ["instance_ip_secondary", "service_instance_ip", "service_health_check_ip"]
        .iter()
        .all(|flag| !iip.get(*flag).and_then(Value::as_bool).unwrap_or(false))
}

pub(crate) fn ip_error(e: ApiError, net_id: &Uuid, addr: Option<&str>) -> NeutronError {
    match e {
        ApiError::Conflict(msg) if msg.contains("in use") => NeutronError::IpAddressInUse {
            net_id: net_id.to_string(),
            ip_address: addr.unwrap_or_default().to_string(),
        },
        ApiError::OverQuota { resource, .. } => NeutronError::OverQuota { overs: resource },
        e => {
            debug!("Address allocation in {net_id} failed: {e}");
            NeutronError::IpAddressGenerationFailure {
                net_id: net_id.to_string(),
            }
        }
    }
}

fn port_error(e: ApiError) -> NeutronError {
    match e {
        ApiError::Validation(msg) | ApiError::PreconditionFailed(msg) => {
            NeutronError::bad_request("port", msg)
        }
        e => e.into(),
    }
}

impl NeutronPlugin {
    pub(crate) async fn port_request(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        match req.operation() {
            Operation::Create => {
                let tenant = self.tenant_for_create(req)?;
                let uuid = self.create_port(req, &tenant, req.resource()).await?;
                Ok(Value::Object(self.port_render(&uuid)?))
            }
            Operation::Read => {
                let uuid = req.id()?;
                self.port_visible(req, &uuid)?;
                let view = self.port_render(&uuid)?;
                Ok(project_fields(view, req.data.fields.as_ref()))
            }
            Operation::Update => {
                let uuid = self.port_update(req).await?;
                Ok(Value::Object(self.port_render(&uuid)?))
            }
            Operation::Delete => {
                let uuid = req.id()?;
                let port = self.port_visible(req, &uuid)?;
                self.delete_port(req, &uuid, &port).await?;
                Ok(json!({}))
            }
            Operation::ReadAll | Operation::ReadCount => Ok(list_reply(req, self.port_list(req))),
            op => Err(Self::unsupported("port", op)),
        }
    }

    /// A port of the caller's tenant, or any port for an admin.
    pub(crate) fn port_visible(&self, req: &NeutronRequest, uuid: &Uuid) -> NeutronResult<Map<String, Value>> {
        let port = self
            .read_typed("virtual-machine-interface", uuid)
            .filter(|p| Self::visible(req, &tenant_of(p), false))
            .ok_or_else(|| NeutronError::PortNotFound {
                port_id: uuid.to_string(),
            })?;
        Ok(port)
    }

    pub(crate) fn port_render(&self, uuid: &Uuid) -> NeutronResult<Map<String, Value>> {
        let port = self
            .read_typed("virtual-machine-interface", uuid)
            .ok_or_else(|| NeutronError::PortNotFound {
                port_id: uuid.to_string(),
            })?;
        Ok(self.port_view(&port, &mut PortMemo::default()))
    }

    /// Instance ips of a port as `(uuid, body)`.
    pub(crate) fn port_ips(&self, port: &Map<String, Value>) -> Vec<(Uuid, Map<String, Value>)> {
        ref_uuids(port, "instance_ip_back_refs")
            .into_iter()
            .filter_map(|u| {
                let body = self.api().db().read(&u, &ReadOptions::shallow()).ok()?;
                Some((u, body))
            })
            .collect()
    }

    /// `[{subnet_id, ip_address}]` of a port.
    pub(crate) fn fixed_ips(&self, port: &Map<String, Value>, memo: &mut PortMemo) -> Vec<Value> {
        let vn = ref_uuids(port, "virtual_network_refs").first().copied();
        let mut out = Vec::new();
        for (_, iip) in self.port_ips(port) {
            if !is_fixed_ip(&iip) {
                continue;
            }
            let Some(addr) = iip.get("instance_ip_address").and_then(Value::as_str) else {
                continue;
            };
            let subnet = iip
                .get("subnet_uuid")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    let ip = IpAddr::from_str(addr).ok()?;
                    let network = memo.network(self, vn.as_ref()?)?;
                    Self::subnet_of_addr(network, ip)
                });
            out.push(json!({ "subnet_id": subnet, "ip_address": addr }));
        }
        out
    }

    pub(crate) fn port_view(&self, port: &Map<String, Value>, memo: &mut PortMemo) -> Map<String, Value> {
        let no_rule = self
            .api()
            .db()
            .uuid_of("security-group", &FqName::from(NO_RULE_SG))
            .ok();
        let routers = ref_uuids(port, "logical_router_back_refs");
        let vms = ref_uuids(port, "virtual_machine_refs");
        let device_id = match (routers.first(), vms.first()) {
            (Some(router), _) => router.to_string(),
            (None, Some(vm)) => self
                .api()
                .db()
                .fq_name(vm)
                .map(|fq| fq.name().to_string())
                .unwrap_or_else(|_| vm.to_string()),
            (None, None) => String::new(),
        };
        let mac = mac_of(port);
        let tenant = tenant_of(port);
        let bindings = kvps(port);
        let binding = |key: &str| {
            bindings
                .iter()
                .find(|(k, _)| k == key)
                .map_or(Value::Null, |(_, v)| v.clone())
        };
        let security_groups: Vec<Value> = ref_uuids(port, "security_group_refs")
            .into_iter()
            .filter(|sg| Some(*sg) != no_rule)
            .map(|sg| json!(sg.to_string()))
            .collect();

        let mut out = Map::new();
        out.insert("id".into(), port.get("uuid").cloned().unwrap_or(Value::Null));
        out.insert("name".into(), json!(port.get("display_name").and_then(Value::as_str).unwrap_or_default()));
        out.insert("tenant_id".into(), json!(tenant));
        out.insert("project_id".into(), json!(tenant));
        out.insert(
            "network_id".into(),
            json!(ref_uuids(port, "virtual_network_refs").first().map(Uuid::to_string)),
        );
        out.insert("mac_address".into(), json!(mac));
        out.insert("admin_state_up".into(), json!(id_perms_enable(port)));
        out.insert(
            "status".into(),
            json!(if device_id.is_empty() { "DOWN" } else { "ACTIVE" }),
        );
        out.insert("fixed_ips".into(), Value::Array(self.fixed_ips(port, memo)));
        out.insert("security_groups".into(), Value::Array(security_groups));
        out.insert("device_id".into(), json!(device_id));
        out.insert("device_owner".into(), json!(device_owner(port)));
        out.insert(
            "port_security_enabled".into(),
            json!(port.get("port_security_enabled").and_then(Value::as_bool).unwrap_or(true)),
        );
        out.insert(
            "allowed_address_pairs".into(),
            Value::Array(address_pairs_view(port, mac.as_deref())),
        );
        out.insert("extra_dhcp_opts".into(), Value::Array(dhcp_options_view(port)));
        out.insert("binding:host_id".into(), binding("host_id"));
        out.insert("binding:vnic_type".into(), binding("vnic_type"));
        out.insert("binding:vif_type".into(), binding("vif_type"));
        out.insert("binding:vif_details".into(), binding("vif_details"));
        out.insert("binding:profile".into(), binding("profile"));
        out.insert("description".into(), description_of(port));
        timestamps(port, &mut out);
        out
    }

    /// Fail with `MacAddressInUse` when another interface of the network holds `mac`.
    fn check_mac_free(&self, net: &Uuid, mac: &str, except: Option<&Uuid>) -> NeutronResult<()> {
        let taken = self
            .list_uuids("virtual-machine-interface", None, Some(vec![*net]))
            .into_iter()
            .filter(|u| Some(u) != except)
            .filter_map(|u| self.api().db().read(&u, &ReadOptions::shallow()).ok())
            .any(|vmi| mac_of(&vmi).as_deref() == Some(mac));
        if taken {
            return Err(NeutronError::MacAddressInUse {
                net_id: net.to_string(),
                mac: mac.to_string(),
            });
        }
        Ok(())
    }

    fn security_group_refs(
        &self,
        req: &NeutronRequest,
        given: &[Value],
    ) -> NeutronResult<Vec<Uuid>> {
        let mut out = Vec::new();
        for sg in given {
            let text = sg.as_str().unwrap_or_default();
            let uuid = id::parse_lenient(text)
                .ok()
                .filter(|u| self.read_typed("security-group", u).is_some())
                .ok_or_else(|| NeutronError::SecurityGroupNotFound { id: text.to_string() })?;
            if !req.is_admin()
                && let Some(sg) = self.read_typed("security-group", &uuid)
                && !Self::visible(req, &tenant_of(&sg), false)
            {
                return Err(NeutronError::SecurityGroupNotFound { id: text.to_string() });
            }
            out.push(uuid);
        }
        Ok(out)
    }

    fn no_rule_sg(&self) -> NeutronResult<Uuid> {
        Ok(self.api().db().uuid_of("security-group", &FqName::from(NO_RULE_SG))?)
    }

    /// The virtual machine a `device_id` names, created when missing.
    async fn ensure_vm(
        &self,
        req: &NeutronRequest,
        tenant: &Uuid,
        device_id: &str,
        created: &mut Created,
    ) -> NeutronResult<Uuid> {
        let fq = FqName::new([device_id]);
        if let Ok(vm) = self.api().db().uuid_of("virtual-machine", &fq) {
            return Ok(vm);
        }
        let mut body = Map::new();
        body.insert("fq_name".into(), json!(fq));
        if let Ok(uuid) = id::parse_lenient(device_id) {
            body.insert("uuid".into(), json!(uuid.to_string()));
        }
        body.insert(
            "perms2".into(),
            json!({ "owner": id::undashed(tenant), "owner_access": perms::PERMS_RWX }),
        );
        let vm = self.core_create(req, "virtual-machine", body).await?;
        created.0.push(("virtual-machine", vm));
        Ok(vm)
    }

    async fn create_ip(
        &self,
        req: &NeutronRequest,
        vn: &Uuid,
        vmi: &Uuid,
        addr: Option<IpAddr>,
        subnet: Option<String>,
        family: Option<&str>,
    ) -> NeutronResult<Uuid> {
        let uuid = Uuid::new_v4();
        let mut body = Map::new();
        body.insert("uuid".into(), json!(uuid.to_string()));
        body.insert("fq_name".into(), json!([uuid.to_string()]));
        body.insert("virtual_network_refs".into(), refs_of(&[*vn]));
        body.insert("virtual_machine_interface_refs".into(), refs_of(&[*vmi]));
        if let Some(addr) = addr {
            body.insert("instance_ip_address".into(), json!(addr.to_string()));
        }
        if let Some(subnet) = subnet {
            body.insert("subnet_uuid".into(), json!(subnet));
        }
        if let Some(family) = family {
            body.insert("instance_ip_family".into(), json!(family));
        }
        let text = addr.map(|a| a.to_string());
        self.core_create(req, "instance-ip", body)
            .await
            .map_err(|e| ip_error(e, vn, text.as_deref()))
    }

    async fn rollback(&self, req: &NeutronRequest, created: Created) {
        for (ty, uuid) in created.0.into_iter().rev() {
            if let Err(e) = self.core_delete(req, ty, &uuid).await {
                warn!("Rollback of {ty} {uuid} failed: {e}");
            }
        }
    }

    /// Create a port for `tenant` from a Neutron port body. Every resource created on the way
    /// is removed again when a later step fails.
    pub(crate) async fn create_port(
        &self,
        req: &NeutronRequest,
        tenant: &Uuid,
        res: &Map<String, Value>,
    ) -> NeutronResult<Uuid> {
        let mut created = Created::default();
        match self.create_port_steps(req, tenant, res, &mut created).await {
            Ok(uuid) => Ok(uuid),
            Err(e) => {
                self.rollback(req, created).await;
                Err(e)
            }
        }
    }

    async fn create_port_steps(
        &self,
        req: &NeutronRequest,
        tenant: &Uuid,
        res: &Map<String, Value>,
        created: &mut Created,
    ) -> NeutronResult<Uuid> {
        let net_text = res
            .get("network_id")
            .and_then(Value::as_str)
            .ok_or_else(|| NeutronError::bad_request("port", "network_id is required"))?;
        let net = id::parse_lenient(net_text).map_err(|_| NeutronError::NetworkNotFound {
            net_id: net_text.to_string(),
        })?;
        let vn = self.network_visible(req, &net)?;
        let project = self.project_fq(tenant)?;
        let uuid = Uuid::new_v4();

        let mut body = Map::new();
        body.insert("uuid".into(), json!(uuid.to_string()));
        body.insert("fq_name".into(), json!(project.child(uuid.to_string())));
        body.insert("parent_type".into(), json!("project"));
        body.insert(
            "display_name".into(),
            json!(res.get("name").and_then(Value::as_str).unwrap_or_default()),
        );
        body.insert("virtual_network_refs".into(), refs_of(&[net]));

        if let Some(mac) = res.get("mac_address").and_then(Value::as_str) {
            let mac = normalize_mac(mac).map_err(|_| NeutronError::invalid_input(format!("Invalid mac {mac}")))?;
            self.check_mac_free(&net, &mac, None)?;
            body.insert(
                "virtual_machine_interface_mac_addresses".into(),
                json!({ "mac_address": [mac] }),
            );
        }

        let port_security = res
            .get("port_security_enabled")
            .and_then(Value::as_bool)
            .or_else(|| vn.get("port_security_enabled").and_then(Value::as_bool))
            .unwrap_or(true);
        body.insert("port_security_enabled".into(), json!(port_security));

        let groups = match res.get("security_groups").and_then(Value::as_array) {
            Some(given) if !given.is_empty() && !port_security => {
                return Err(NeutronError::PortSecurityPortHasSecurityGroup {
                    port_id: uuid.to_string(),
                });
            }
            Some(given) if !given.is_empty() => self.security_group_refs(req, given)?,
            Some(_) if port_security => vec![self.no_rule_sg()?],
            None if port_security => vec![self.ensure_default_sg(req, tenant).await?],
            _ => Vec::new(),
        };
        body.insert("security_group_refs".into(), refs_of(&groups));

        if let Some(pairs) = res.get("allowed_address_pairs").and_then(Value::as_array)
            && !pairs.is_empty()
        {
            if !port_security {
                return Err(NeutronError::AddressPairAndPortSecurityRequired);
            }
            body.insert(
                "virtual_machine_interface_allowed_address_pairs".into(),
                address_pairs_from(pairs)?,
            );
        }
        if let Some(opts) = res.get("extra_dhcp_opts").and_then(Value::as_array) {
            body.insert(
                "virtual_machine_interface_dhcp_option_list".into(),
                dhcp_options_from(opts),
            );
        }
        if let Some(bindings) = bindings_from(res, Vec::new()) {
            body.insert("virtual_machine_interface_bindings".into(), bindings);
        }
        let owner = res.get("device_owner").and_then(Value::as_str).unwrap_or_default();
        if !owner.is_empty() {
            body.insert("virtual_machine_interface_device_owner".into(), json!(owner));
        }
        if let Some(id_perms) = id_perms_from(res, None) {
            body.insert("id_perms".into(), id_perms);
        }
        let device = res.get("device_id").and_then(Value::as_str).unwrap_or_default();
        if !device.is_empty() && owner != ROUTER_INTERFACE {
            let vm = self.ensure_vm(req, tenant, device, created).await?;
            body.insert("virtual_machine_refs".into(), refs_of(&[vm]));
        }

        let vmi = self
            .core_create(req, "virtual-machine-interface", body)
            .await
            .map_err(port_error)?;
        created.0.push(("virtual-machine-interface", vmi));

        match res.get("fixed_ips").and_then(Value::as_array) {
            Some(fixed) if !fixed.is_empty() => {
                for ip in fixed {
                    let (addr, subnet) = self.fixed_ip_request(&vn, ip)?;
                    let iip = self.create_ip(req, &net, &vmi, addr, subnet, None).await?;
                    created.0.push(("instance-ip", iip));
                }
            }
            _ => {
                let families = Self::network_families(&vn);
                let mut failure = None;
                let mut any = false;
                for family in &families {
                    match self.create_ip(req, &net, &vmi, None, None, Some(family)).await {
                        Ok(iip) => {
                            created.0.push(("instance-ip", iip));
                            any = true;
                        }
                        Err(e) => failure = Some(e),
                    }
                }
                if let (false, Some(e)) = (any, failure) {
                    return Err(e);
                }
            }
        }
        if self.api().config().apply_subnet_host_routes {
            let addrs: Vec<IpAddr> = created
                .0
                .iter()
                .filter(|(ty, _)| *ty == "instance-ip")
                .filter_map(|(_, iip)| self.api().db().read(iip, &ReadOptions::shallow()).ok())
                .filter_map(|b| b.get("instance_ip_address")?.as_str()?.parse().ok())
                .collect();
            let mut tables = Vec::new();
            let planted = self
                .add_port_route_tables(req, &vn, &project, &vmi, &addrs, &mut tables)
                .await;
            // the port references the tables, so they go after it on rollback
            let at = created
                .0
                .iter()
                .position(|(ty, _)| *ty == "virtual-machine-interface")
                .unwrap_or_default();
            for table in tables {
                created.0.insert(at, ("interface-route-table", table));
            }
            planted?;
        }
        info!("Port {vmi} created in network {net}");
        Ok(vmi)
    }

    /// The address and subnet a `fixed_ips` entry asks for.
    fn fixed_ip_request(
        &self,
        vn: &Map<String, Value>,
        ip: &Value,
    ) -> NeutronResult<(Option<IpAddr>, Option<String>)> {
        let addr = ip
            .get("ip_address")
            .and_then(Value::as_str)
            .map(|a| {
                IpAddr::from_str(a).map_err(|_| NeutronError::invalid_input(format!("Invalid ip address {a}")))
            })
            .transpose()?;
        let subnet = ip.get("subnet_id").and_then(Value::as_str).map(str::to_string);
        if let Some(subnet) = &subnet
            && !subnet_ids(vn).contains(subnet)
        {
            return Err(NeutronError::SubnetNotFound {
                subnet_id: subnet.clone(),
            });
        }
        let subnet = match (subnet, addr) {
            (Some(s), _) => Some(s),
            (None, Some(a)) => Some(Self::subnet_of_addr(vn, a).ok_or_else(|| {
                NeutronError::invalid_input(format!("IP address {a} is not in any subnet of the network"))
            })?),
            (None, None) => None,
        };
        Ok((addr, subnet))
    }

    async fn port_update(&self, req: &NeutronRequest) -> NeutronResult<Uuid> {
        let uuid = req.id()?;
        let port = self.port_visible(req, &uuid)?;
        let res = req.resource();
        if res.contains_key("fixed_ips") {
            return Err(NeutronError::bad_request(
                "port",
                "Fixed ip cannot be updated on a port",
            ));
        }
        let net = ref_uuids(&port, "virtual_network_refs").first().copied();
        let mut patch = Map::new();
        if let Some(name) = res.get("name").and_then(Value::as_str) {
            patch.insert("display_name".into(), json!(name));
        }
        if let Some(id_perms) = id_perms_from(res, Some(&port)) {
            patch.insert("id_perms".into(), id_perms);
        }
        if let Some(mac) = res.get("mac_address").and_then(Value::as_str) {
            let mac = normalize_mac(mac).map_err(|_| NeutronError::invalid_input(format!("Invalid mac {mac}")))?;
            if mac_of(&port).as_deref() != Some(mac.as_str()) {
                if let Some(net) = net {
                    self.check_mac_free(&net, &mac, Some(&uuid))?;
                }
                patch.insert(
                    "virtual_machine_interface_mac_addresses".into(),
                    json!({ "mac_address": [mac] }),
                );
            }
        }

        let port_security = res
            .get("port_security_enabled")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| port.get("port_security_enabled").and_then(Value::as_bool).unwrap_or(true));
        if let Some(enabled) = res.get("port_security_enabled").and_then(Value::as_bool) {
            patch.insert("port_security_enabled".into(), json!(enabled));
        }
        let no_rule = self.no_rule_sg().ok();
        match res.get("security_groups").and_then(Value::as_array) {
            Some(given) if !given.is_empty() => {
                if !port_security {
                    return Err(NeutronError::PortSecurityAndIPRequiredForSecurityGroups);
                }
                let groups = self.security_group_refs(req, given)?;
                patch.insert("security_group_refs".into(), refs_of(&groups));
            }
            Some(_) => {
                let groups: Vec<Uuid> = if port_security { no_rule.into_iter().collect() } else { Vec::new() };
                patch.insert("security_group_refs".into(), refs_of(&groups));
            }
            None if !port_security => {
                let has_groups = ref_uuids(&port, "security_group_refs")
                    .iter()
                    .any(|sg| Some(*sg) != no_rule);
                if has_groups {
                    return Err(NeutronError::PortSecurityPortHasSecurityGroup {
                        port_id: uuid.to_string(),
                    });
                }
                patch.insert("security_group_refs".into(), json!([]));
            }
            None => {}
        }

        if let Some(pairs) = res.get("allowed_address_pairs").and_then(Value::as_array) {
            if !pairs.is_empty() && !port_security {
                return Err(NeutronError::AddressPairAndPortSecurityRequired);
            }
            patch.insert(
                "virtual_machine_interface_allowed_address_pairs".into(),
                address_pairs_from(pairs)?,
            );
        }
        if let Some(opts) = res.get("extra_dhcp_opts").and_then(Value::as_array) {
            patch.insert(
                "virtual_machine_interface_dhcp_option_list".into(),
                dhcp_options_from(opts),
            );
        }
        if let Some(bindings) = bindings_from(res, kvps(&port)) {
            patch.insert("virtual_machine_interface_bindings".into(), bindings);
        }
        if let Some(owner) = res.get("device_owner").and_then(Value::as_str) {
            patch.insert("virtual_machine_interface_device_owner".into(), json!(owner));
        }
        let mut created = Created::default();
        if let Some(device) = res.get("device_id").and_then(Value::as_str) {
            let owner = res
                .get("device_owner")
                .and_then(Value::as_str)
                .map_or_else(|| device_owner(&port), str::to_string);
            if device.is_empty() || owner == ROUTER_INTERFACE {
                patch.insert("virtual_machine_refs".into(), json!([]));
            } else {
                let tenant = id::parse_lenient(&tenant_of(&port))
                    .map_err(|e| NeutronError::Internal { msg: e.to_string() })?;
                let vm = self.ensure_vm(req, &tenant, device, &mut created).await?;
                patch.insert("virtual_machine_refs".into(), refs_of(&[vm]));
            }
        }

        if let Err(e) = self.core_update(req, "virtual-machine-interface", &uuid, patch).await {
            self.rollback(req, created).await;
            return Err(port_error(e));
        }
        debug!("Port {uuid} updated");
        Ok(uuid)
    }

    /// Remove a port with its addresses; floating ips on it are released, an instance ip
    /// shared with other ports only loses the reference.
    pub(crate) async fn delete_port(
        &self,
        req: &NeutronRequest,
        uuid: &Uuid,
        port: &Map<String, Value>,
    ) -> NeutronResult<()> {
        if !ref_uuids(port, "logical_router_back_refs").is_empty() {
            return Err(NeutronError::L3PortInUse {
                port_id: uuid.to_string(),
                device_owner: device_owner(port),
            });
        }
        for fip in ref_uuids(port, "floating_ip_back_refs") {
            let mut patch = Map::new();
            patch.insert("virtual_machine_interface_refs".into(), json!([]));
            patch.insert("floating_ip_fixed_ip_address".into(), Value::Null);
            self.core_update(req, "floating-ip", &fip, patch).await?;
        }
        for (iip, body) in self.port_ips(port) {
            let shared = ref_uuids(&body, "virtual_machine_interface_refs").len() > 1;
            let done = if shared {
                self.core_ref(
                    req,
                    "instance-ip",
                    &iip,
                    "virtual-machine-interface",
                    uuid,
                    RefOperation::Delete,
                    None,
                )
                .await
            } else {
                self.core_delete(req, "instance-ip", &iip).await
            };
            match done {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        match self.core_delete(req, "virtual-machine-interface", uuid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(port_error(e)),
        }
        self.remove_port_route_tables(req, port, uuid).await;
        for vm in ref_uuids(port, "virtual_machine_refs") {
            let ports_left = self.api().db().backrefs(&vm).is_ok_and(|b| {
                b.iter().any(|b| b.from_type == "virtual-machine-interface")
            });
            if !ports_left
                && let Err(e) = self.core_delete(req, "virtual-machine", &vm).await
            {
                warn!("Virtual machine {vm} left behind: {e}");
            }
        }
        info!("Port {uuid} deleted");
        Ok(())
    }

    fn port_list(&self, req: &NeutronRequest) -> Vec<Map<String, Value>> {
        let filters = req.filters();
        let mut uuids: Vec<Uuid> = if filters.has("network_id") {
            let nets: Vec<Uuid> = filters
                .strings("network_id")
                .iter()
                .filter_map(|n| id::parse_lenient(n).ok())
                .collect();
            self.list_uuids("virtual-machine-interface", None, Some(nets))
        } else {
            self.list_uuids("virtual-machine-interface", self.listing_projects(req), None)
        };
        if filters.has("device_id") {
            // router interfaces answer to the router id
            let devices = filters.strings("device_id");
            let routers: Vec<Uuid> = devices.iter().filter_map(|d| id::parse_lenient(d).ok()).collect();
            for router in routers {
                if let Some(lr) = self.read_typed("logical-router", &router) {
                    uuids.extend(ref_uuids(&lr, "virtual_machine_interface_refs"));
                }
            }
            uuids.sort();
            uuids.dedup();
        }

        let mut memo = PortMemo::default();
        let mut out = Vec::new();
        for uuid in uuids {
            let Some(port) = self.read_typed("virtual-machine-interface", &uuid) else {
                continue;
            };
            if !Self::visible(req, &tenant_of(&port), false) {
                continue;
            }
            let view = self.port_view(&port, &mut memo);
            let keep = filters.accepts_all(
                &view,
                &["id", "name", "mac_address", "device_owner", "device_id", "status", "admin_state_up"],
            ) && (!filters.has("tenant_id") || filters.accepts("tenant_id", &json!(tenant_of(&port))))
                && self.fixed_ips_match(req, &view);
            if keep {
                out.push(view);
            }
        }
        out
    }

    /// `fixed_ips` filters: `ip_address=x` and `subnet_id=y` entries.
    fn fixed_ips_match(&self, req: &NeutronRequest, view: &Map<String, Value>) -> bool {
        let wanted = req.filters().strings("fixed_ips");
        if wanted.is_empty() {
            return true;
        }
        let have = view.get("fixed_ips").and_then(Value::as_array).cloned().unwrap_or_default();
        wanted.iter().any(|w| {
            let (key, value) = w.split_once('=').unwrap_or(("ip_address", w.as_str()));
            have.iter()
                .any(|ip| ip.get(key).and_then(Value::as_str) == Some(value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn bindings_merge_over_current() {
        let res = obj(json!({"binding:host_id": "compute-1", "binding:profile": {"a": 1}}));
        let current = vec![
            ("host_id".to_string(), json!("old")),
            ("vnic_type".to_string(), json!("normal")),
        ];
        let merged = bindings_from(&res, current).unwrap();
        assert_eq!(
            merged,
            json!({"key_value_pair": [
                {"key": "vnic_type", "value": "normal"},
                {"key": "host_id", "value": "compute-1"},
                {"key": "profile", "value": "{\"a\":1}"}
            ]})
        );
        assert!(bindings_from(&obj(json!({"name": "p"})), Vec::new()).is_none());
    }

    #[test]
    fn address_pairs_render_host_addresses_bare() {
        let pairs = address_pairs_from(&[
            json!({"ip_address": "10.0.0.5"}),
            json!({"ip_address": "10.0.1.0/24", "mac_address": "00:11:22:33:44:55"}),
        ])
        .unwrap();
        let vmi = obj(json!({"virtual_machine_interface_allowed_address_pairs": pairs}));
        assert_eq!(
            address_pairs_view(&vmi, Some("02:00:00:00:00:01")),
            vec![
                json!({"ip_address": "10.0.0.5", "mac_address": "02:00:00:00:00:01"}),
                json!({"ip_address": "10.0.1.0/24", "mac_address": "00:11:22:33:44:55"}),
            ]
        );
        assert!(address_pairs_from(&[json!({"ip_address": "nope"})]).is_err());
    }

    #[test]
    fn dhcp_options_translate_both_ways() {
        let opts = [json!({"opt_name": "67", "opt_value": "pxelinux.0"})];
        let vmi = obj(json!({"virtual_machine_interface_dhcp_option_list": dhcp_options_from(&opts)}));
        assert_eq!(dhcp_options_view(&vmi), opts.to_vec());
    }

    #[test]
    fn secondary_addresses_are_not_fixed_ips() {
        assert!(is_fixed_ip(&obj(json!({"instance_ip_address": "10.0.0.3"}))));
        assert!(!is_fixed_ip(&obj(json!({"instance_ip_secondary": true}))));
        assert!(!is_fixed_ip(&obj(json!({"service_health_check_ip": true}))));
    }

    #[test]
    fn address_conflicts_name_the_address() {
        let net = Uuid::new_v4();
        let err = ip_error(
            ApiError::Conflict("Ip address already in use".into()),
            &net,
            Some("10.0.0.9"),
        );
        assert_eq!(err.name(), "IpAddressInUse");
        let err = ip_error(ApiError::Conflict("Subnet exhausted".into()), &net, None);
        assert_eq!(err.name(), "IpAddressGenerationFailure");
    }
}
