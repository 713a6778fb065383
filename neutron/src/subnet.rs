// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Subnets. A subnet has no resource of its own: it is an entry in the ipam subnets of a
//! network's ipam reference, written under a per-network lock. The subnet to network mapping
//! is kept in the user-agent store.

use crate::errors::{NeutronError, NeutronResult};
use crate::network::is_shared;
use crate::plugin::{NeutronPlugin, list_reply, project_fields, tenant_of, uuid_of};
use crate::request::{NeutronRequest, Operation};
use config::{ApiError, FqName};
use coord::LockGuard;
use id::Uuid;
use ipnet::IpNet;
use serde_json::{Map, Value, json};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const DNS_OPTION: &str = "6";

/// A subnet and where it lives.
pub(crate) struct Located {
    pub vn: Map<String, Value>,
    pub vn_uuid: Uuid,
    pub ipam: Uuid,
    pub subnet: Map<String, Value>,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub(crate) fn cidr_of(subnet: &Map<String, Value>) -> Option<IpNet> {
    let s = subnet.get("subnet")?;
    let prefix = s.get("ip_prefix")?.as_str()?;
    let len = s.get("ip_prefix_len")?.as_u64()?;
    IpNet::from_str(&format!("{prefix}/{len}")).ok()
}

fn unset_gateway(addr: &str) -> bool {
    matches!(addr, "0.0.0.0" | "::")
}

fn first_host(net: &IpNet, offset: u32) -> IpAddr {
    match net.network() {
        IpAddr::V4(base) => IpAddr::V4((u32::from(base).wrapping_add(offset)).into()),
        IpAddr::V6(base) => IpAddr::V6((u128::from(base).wrapping_add(u128::from(offset))).into()),
    }
}

/// The pool Neutron reports when none was configured: every host but the gateway.
fn default_pool(net: &IpNet, gateway: Option<IpAddr>) -> Value {
    let start = if gateway == Some(first_host(net, 1)) {
        first_host(net, 2)
    } else {
        first_host(net, 1)
    };
    let end = match net {
        IpNet::V4(v4) => IpAddr::V4((u32::from(v4.broadcast()).saturating_sub(1)).into()),
        IpNet::V6(v6) => IpAddr::V6(v6.broadcast()),
    };
    json!([{ "start": start.to_string(), "end": end.to_string() }])
}

fn dns_nameservers(subnet: &Map<String, Value>) -> Vec<Value> {
    if let Some(list) = subnet.get("dns_nameservers").and_then(Value::as_array) {
        return list.clone();
    }
    subnet
        .get("dhcp_option_list")
        .and_then(|v| v.get("dhcp_option"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|o| o.get("dhcp_option_name").and_then(Value::as_str) == Some(DNS_OPTION))
        .filter_map(|o| o.get("dhcp_option_value").and_then(Value::as_str))
        .flat_map(|v| v.split_whitespace().map(|s| json!(s)).collect::<Vec<_>>())
        .collect()
}

fn host_routes_view(subnet: &Map<String, Value>) -> Vec<Value> {
    subnet
        .get("host_routes")
        .and_then(|v| v.get("route"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|r| json!({ "destination": r.get("prefix"), "nexthop": r.get("next_hop") }))
        .collect()
}

fn host_routes_from(routes: &[Value]) -> Value {
    let routes: Vec<Value> = routes
        .iter()
        .map(|r| json!({ "prefix": r.get("destination"), "next_hop": r.get("nexthop") }))
        .collect();
    json!({ "route": routes })
}

fn dhcp_options_from(servers: &[Value]) -> Value {
    let joined = servers
        .iter()
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    json!({ "dhcp_option": [{ "dhcp_option_name": DNS_OPTION, "dhcp_option_value": joined }] })
}

pub(crate) fn subnet_view(vn: &Map<String, Value>, subnet: &Map<String, Value>) -> Map<String, Value> {
    let net = cidr_of(subnet);
    let gateway = subnet
        .get("default_gateway")
        .and_then(Value::as_str)
        .filter(|g| !unset_gateway(g));
    let pools = match subnet.get("allocation_pools").and_then(Value::as_array) {
        Some(pools) if !pools.is_empty() => Value::Array(
            pools
                .iter()
                .map(|p| json!({ "start": p.get("start"), "end": p.get("end") }))
                .collect(),
        ),
        _ => net.map_or_else(
            || json!([]),
            |net| default_pool(&net, gateway.and_then(|g| IpAddr::from_str(g).ok())),
        ),
    };
    let tenant = tenant_of(vn);
    let mut out = Map::new();
    out.insert("id".into(), subnet.get("subnet_uuid").cloned().unwrap_or(Value::Null));
    out.insert(
        "name".into(),
        subnet.get("subnet_name").cloned().unwrap_or_else(|| json!("")),
    );
    out.insert("tenant_id".into(), json!(tenant));
    out.insert("project_id".into(), json!(tenant));
    out.insert("network_id".into(), vn.get("uuid").cloned().unwrap_or(Value::Null));
    out.insert("cidr".into(), json!(net.map(|n| n.to_string())));
    out.insert(
        "ip_version".into(),
        json!(match net {
            Some(IpNet::V6(_)) => 6,
            _ => 4,
        }),
    );
    out.insert("gateway_ip".into(), json!(gateway));
    out.insert("allocation_pools".into(), pools);
    out.insert(
        "enable_dhcp".into(),
        json!(subnet.get("enable_dhcp").and_then(Value::as_bool).unwrap_or(true)),
    );
    out.insert("dns_nameservers".into(), Value::Array(dns_nameservers(subnet)));
    out.insert("host_routes".into(), Value::Array(host_routes_view(subnet)));
    out.insert("shared".into(), json!(is_shared(vn)));
    out.insert("ipv6_ra_mode".into(), Value::Null);
    out.insert("ipv6_address_mode".into(), Value::Null);
    out.insert("description".into(), json!(""));
    out.insert("created_at".into(), subnet.get("created").cloned().unwrap_or(Value::Null));
    out.insert(
        "updated_at".into(),
        subnet.get("last_modified").cloned().unwrap_or(Value::Null),
    );
    out
}

/// `(ipam, subnet)` of every ipam subnet of a network.
pub(crate) fn subnets_of(vn: &Map<String, Value>) -> Vec<(Uuid, Map<String, Value>)> {
    let mut out = Vec::new();
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
        for subnet in edge
            .pointer("/attr/ipam_subnets")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
        {
            out.push((ipam, subnet.clone()));
        }
    }
    out
}

/// The ipam references of a network, rewritten by `edit` on the subnets of one ipam.
fn rewrite_ipam_refs(
    vn: &Map<String, Value>,
    ipam: &Uuid,
    edit: impl FnOnce(&mut Vec<Value>),
) -> Value {
    let mut edges: Vec<Value> = vn
        .get("network_ipam_refs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|edge| json!({ "uuid": edge.get("uuid"), "attr": edge.get("attr") }))
        .collect();
    let position = edges
        .iter()
        .position(|e| e.get("uuid").and_then(Value::as_str) == Some(ipam.to_string().as_str()));
    let index = if let Some(i) = position {
        i
    } else {
        edges.push(json!({ "uuid": ipam.to_string(), "attr": { "ipam_subnets": [] } }));
        edges.len() - 1
    };
    let mut subnets: Vec<Value> = edges[index]
        .pointer("/attr/ipam_subnets")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    edit(&mut subnets);
    if subnets.is_empty() {
        edges.remove(index);
    } else {
        edges[index] = json!({ "uuid": ipam.to_string(), "attr": { "ipam_subnets": subnets } });
    }
    Value::Array(edges)
}

impl NeutronPlugin {
    pub(crate) async fn subnet_request(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        match req.operation() {
            Operation::Create => Ok(Value::Object(self.subnet_create(req).await?)),
            Operation::Read => {
                let found = self.subnet_visible(req, &req.id_str())?;
                let view = subnet_view(&found.vn, &found.subnet);
                Ok(project_fields(view, req.data.fields.as_ref()))
            }
            Operation::Update => Ok(Value::Object(self.subnet_update(req).await?)),
            Operation::Delete => {
                self.subnet_delete(req).await?;
                Ok(json!({}))
            }
            Operation::ReadAll | Operation::ReadCount => Ok(list_reply(req, self.subnet_list(req))),
            op => Err(Self::unsupported("subnet", op)),
        }
    }

    /// Serialize writes to the subnets of one network.
    pub(crate) async fn network_lock(&self, vn: &Uuid) -> NeutronResult<LockGuard> {
        let config = self.api().config();
        let path = format!("{}/lock/virtual_network/{vn}", config.cluster_prefix());
        let timeout = Duration::from_secs(config.zk_lock_timeout_secs);
        self.api()
            .coord()
            .lock(&path, timeout)
            .await
            .map_err(|e| NeutronError::ServiceUnavailable { msg: e.to_string() })
    }

    /// Locate a subnet through the user-agent mapping, else by scanning every network.
    pub(crate) fn subnet_locate(&self, subnet_id: &str) -> Option<Located> {
        let mapped = self
            .api()
            .useragent()
            .retrieve(subnet_id)
            .ok()
            .and_then(|v| v.split_whitespace().next().map(str::to_string))
            .and_then(|vn| Uuid::parse_str(&vn).ok());
        let candidates: Vec<Uuid> = match mapped {
            Some(vn) => vec![vn],
            None => self.list_uuids("virtual-network", None, None),
        };
        for vn_uuid in candidates {
            let Some(vn) = self.read_typed("virtual-network", &vn_uuid) else {
                continue;
            };
            if let Some((ipam, subnet)) = subnets_of(&vn)
                .into_iter()
                .find(|(_, s)| s.get("subnet_uuid").and_then(Value::as_str) == Some(subnet_id))
            {
                return Some(Located {
                    vn,
                    vn_uuid,
                    ipam,
                    subnet,
                });
            }
        }
        if mapped.is_some() {
            warn!("Stale mapping of subnet {subnet_id}");
            self.api().useragent().delete(subnet_id);
            return self.subnet_locate(subnet_id);
        }
        None
    }

    pub(crate) fn subnet_visible(&self, req: &NeutronRequest, subnet_id: &str) -> NeutronResult<Located> {
        let not_found = || NeutronError::SubnetNotFound {
            subnet_id: subnet_id.to_string(),
        };
        let found = self.subnet_locate(subnet_id).ok_or_else(not_found)?;
        if !Self::visible(req, &tenant_of(&found.vn), is_shared(&found.vn)) {
            return Err(not_found());
        }
        Ok(found)
    }

    /// The ipam a new subnet goes to: the named one, the project default, the global default.
    fn subnet_ipam(&self, req: &NeutronRequest, vn: &Map<String, Value>) -> NeutronResult<Uuid> {
        let db = self.api().db();
        if let Some(fq) = req.resource().get("ipam_fq_name").filter(|v| !v.is_null()) {
            let fq: FqName = serde_json::from_value(fq.clone())
                .map_err(|_| NeutronError::invalid_input("Invalid ipam_fq_name"))?;
            return db.uuid_of("network-ipam", &fq).map_err(|_| NeutronError::NotFound {
                msg: format!("Network ipam {fq} could not be found"),
            });
        }
        let project = vn
            .get("fq_name")
            .cloned()
            .and_then(|f| serde_json::from_value::<FqName>(f).ok())
            .map(|f| f.parent());
        if let Some(project) = project
            && let Ok(ipam) = db.uuid_of("network-ipam", &project.child("default-network-ipam"))
        {
            return Ok(ipam);
        }
        Ok(db.uuid_of("network-ipam", &FqName::from(mgmt::seed::DEFAULT_IPAM))?)
    }

    async fn subnet_create(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let res = req.resource();
        let net_id = res
            .get("network_id")
            .and_then(Value::as_str)
            .ok_or_else(|| NeutronError::bad_request("subnet", "network_id is required"))?;
        let vn_uuid = id::parse_lenient(net_id).map_err(|_| NeutronError::NetworkNotFound {
            net_id: net_id.to_string(),
        })?;
        let cidr_text = res
            .get("cidr")
            .and_then(Value::as_str)
            .ok_or_else(|| NeutronError::bad_request("subnet", "cidr is required"))?;
        let cidr = IpNet::from_str(cidr_text)
            .map_err(|_| NeutronError::invalid_input(format!("Invalid CIDR {cidr_text}")))?
            .trunc();
        let version = match cidr {
            IpNet::V4(_) => 4,
            IpNet::V6(_) => 6,
        };
        if let Some(asked) = res.get("ip_version").and_then(Value::as_u64)
            && asked != version
        {
            return Err(NeutronError::invalid_input(format!(
                "Cidr {cidr_text} does not match ip_version {asked}"
            )));
        }

        let _lock = self.network_lock(&vn_uuid).await?;
        let vn = self.network_visible(req, &vn_uuid)?;
        if !req.is_admin() && !Self::visible(req, &tenant_of(&vn), false) {
            return Err(NeutronError::NetworkNotFound {
                net_id: net_id.to_string(),
            });
        }
        let ipam = self.subnet_ipam(req, &vn)?;

        let gateway = match res.get("gateway_ip") {
            None => first_host(&cidr, 1).to_string(),
            Some(Value::Null) => match cidr {
                IpNet::V4(_) => "0.0.0.0".to_string(),
                IpNet::V6(_) => "::".to_string(),
            },
            Some(Value::String(g)) => {
                let addr = IpAddr::from_str(g)
                    .map_err(|_| NeutronError::invalid_input(format!("Invalid gateway_ip {g}")))?;
                if !cidr.contains(&addr) {
                    return Err(NeutronError::invalid_input(format!(
                        "Gateway {g} is not in subnet {cidr}"
                    )));
                }
                g.clone()
            }
            Some(other) => {
                return Err(NeutronError::invalid_input(format!("Invalid gateway_ip {other}")));
            }
        };

        let subnet_id = Uuid::new_v4().to_string();
        let stamp = now();
        let mut subnet = Map::new();
        subnet.insert(
            "subnet".into(),
            json!({ "ip_prefix": cidr.network().to_string(), "ip_prefix_len": cidr.prefix_len() }),
        );
        subnet.insert("subnet_uuid".into(), json!(subnet_id));
        subnet.insert("default_gateway".into(), json!(gateway));
        subnet.insert(
            "enable_dhcp".into(),
            json!(res.get("enable_dhcp").and_then(Value::as_bool).unwrap_or(true)),
        );
        subnet.insert("addr_from_start".into(), json!(true));
        subnet.insert("created".into(), json!(stamp));
        subnet.insert("last_modified".into(), json!(stamp));
        if let Some(name) = res.get("name").and_then(Value::as_str) {
            subnet.insert("subnet_name".into(), json!(name));
        }
        if let Some(pools) = res.get("allocation_pools").and_then(Value::as_array) {
            let pools: Vec<Value> = pools
                .iter()
                .map(|p| json!({ "start": p.get("start"), "end": p.get("end") }))
                .collect();
            subnet.insert("allocation_pools".into(), json!(pools));
        }
        if let Some(servers) = res.get("dns_nameservers").and_then(Value::as_array)
            && !servers.is_empty()
        {
            subnet.insert("dns_nameservers".into(), json!(servers));
            subnet.insert("dhcp_option_list".into(), dhcp_options_from(servers));
            if let Some(first) = servers.first() {
                subnet.insert("dns_server_address".into(), first.clone());
            }
        }
        if let Some(routes) = res.get("host_routes").and_then(Value::as_array)
            && !routes.is_empty()
        {
            subnet.insert("host_routes".into(), host_routes_from(routes));
        }

        let duplicate = subnets_of(&vn)
            .iter()
            .any(|(i, s)| *i == ipam && cidr_of(s) == Some(cidr));
        if duplicate {
            return Err(NeutronError::bad_request(
                "subnet",
                format!("Cidr {cidr} overlaps with another subnet"),
            ));
        }

        let refs = rewrite_ipam_refs(&vn, &ipam, |subnets| subnets.push(Value::Object(subnet)));
        let mut patch = Map::new();
        patch.insert("network_ipam_refs".into(), refs);
        self.core_update(req, "virtual-network", &vn_uuid, patch)
            .await
            .map_err(|e| match e {
                ApiError::OverQuota { resource, .. } => NeutronError::OverQuota { overs: resource },
                ApiError::Validation(msg) | ApiError::Conflict(msg) => {
                    NeutronError::bad_request("subnet", msg)
                }
                e => e.into(),
            })?;
        self.api()
            .useragent()
            .store(&subnet_id, &format!("{vn_uuid} {cidr}"));
        debug!("Subnet {subnet_id} ({cidr}) added to network {vn_uuid}");

        let found = self.subnet_locate(&subnet_id).ok_or(NeutronError::SubnetNotFound {
            subnet_id: subnet_id.clone(),
        })?;
        Ok(subnet_view(&found.vn, &found.subnet))
    }

    async fn subnet_update(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let subnet_id = req.id_str();
        let res = req.resource();
        for frozen in ["gateway_ip", "allocation_pools"] {
            if res.get(frozen).is_some_and(|v| !v.is_null()) {
                return Err(NeutronError::bad_request(
                    "subnet",
                    format!("update of {frozen} is not supported"),
                ));
            }
        }
        let located = self.subnet_visible(req, &subnet_id)?;
        let lock = self.network_lock(&located.vn_uuid).await?;
        // read again under the lock
        let found = self.subnet_visible(req, &subnet_id)?;
        if !Self::visible(req, &tenant_of(&found.vn), false) {
            return Err(NeutronError::SubnetNotFound { subnet_id });
        }

        let mut subnet = found.subnet.clone();
        if let Some(name) = res.get("name").and_then(Value::as_str) {
            subnet.insert("subnet_name".into(), json!(name));
        }
        if let Some(dhcp) = res.get("enable_dhcp").and_then(Value::as_bool) {
            subnet.insert("enable_dhcp".into(), json!(dhcp));
        }
        if let Some(servers) = res.get("dns_nameservers").and_then(Value::as_array) {
            subnet.insert("dns_nameservers".into(), json!(servers));
            if servers.is_empty() {
                subnet.remove("dhcp_option_list");
                subnet.remove("dns_server_address");
            } else {
                subnet.insert("dhcp_option_list".into(), dhcp_options_from(servers));
            }
        }
        if let Some(routes) = res.get("host_routes").and_then(Value::as_array) {
            subnet.insert("host_routes".into(), host_routes_from(routes));
        }
        subnet.insert("last_modified".into(), json!(now()));

        let refs = rewrite_ipam_refs(&found.vn, &found.ipam, |subnets| {
            for entry in subnets.iter_mut() {
                if entry.get("subnet_uuid").and_then(Value::as_str) == Some(subnet_id.as_str()) {
                    *entry = Value::Object(subnet.clone());
                }
            }
        });
        let mut patch = Map::new();
        patch.insert("network_ipam_refs".into(), refs);
        self.core_update(req, "virtual-network", &found.vn_uuid, patch)
            .await
            .map_err(|e| match e {
                ApiError::Validation(msg) => NeutronError::bad_request("subnet", msg),
                e => e.into(),
            })?;
        drop(lock);
        if self.api().config().apply_subnet_host_routes && res.get("host_routes").is_some() {
            self.refresh_port_route_tables(req, &found.vn_uuid).await?;
        }
        let found = self
            .subnet_locate(&subnet_id)
            .ok_or(NeutronError::SubnetNotFound { subnet_id })?;
        Ok(subnet_view(&found.vn, &found.subnet))
    }

    async fn subnet_delete(&self, req: &NeutronRequest) -> NeutronResult<()> {
        let subnet_id = req.id_str();
        let located = self.subnet_visible(req, &subnet_id)?;
        let _lock = self.network_lock(&located.vn_uuid).await?;
        let found = self.subnet_visible(req, &subnet_id)?;
        if !Self::visible(req, &tenant_of(&found.vn), false) {
            return Err(NeutronError::SubnetNotFound { subnet_id });
        }
        let refs = rewrite_ipam_refs(&found.vn, &found.ipam, |subnets| {
            subnets.retain(|s| s.get("subnet_uuid").and_then(Value::as_str) != Some(subnet_id.as_str()));
        });
        let mut patch = Map::new();
        patch.insert("network_ipam_refs".into(), refs);
        self.core_update(req, "virtual-network", &found.vn_uuid, patch)
            .await
            .map_err(|e| match e {
                ApiError::Conflict(_) | ApiError::RefsExist(_) | ApiError::Validation(_) => {
                    NeutronError::SubnetInUse {
                        subnet_id: subnet_id.clone(),
                    }
                }
                e => e.into(),
            })?;
        self.api().useragent().delete(&subnet_id);
        debug!("Subnet {subnet_id} removed from network {}", found.vn_uuid);
        Ok(())
    }

    fn subnet_list(&self, req: &NeutronRequest) -> Vec<Map<String, Value>> {
        let filters = req.filters();
        let mut out = Vec::new();
        for vn in self.visible_networks(req) {
            let Some(vn_uuid) = uuid_of(&vn) else {
                continue;
            };
            if !filters.accepts("network_id", &json!(vn_uuid.to_string())) {
                continue;
            }
            for (_, subnet) in subnets_of(&vn) {
                let view = subnet_view(&vn, &subnet);
                if filters.accepts_all(&view, &["id", "name", "cidr", "ip_version", "shared", "enable_dhcp"]) {
                    out.push(view);
                }
            }
        }
        out
    }

    /// Which of the network's subnets holds `addr`.
    pub(crate) fn subnet_of_addr(vn: &Map<String, Value>, addr: IpAddr) -> Option<String> {
        subnets_of(vn).into_iter().find_map(|(_, s)| {
            cidr_of(&s)
                .filter(|net| net.contains(&addr))
                .and(s.get("subnet_uuid").and_then(Value::as_str).map(str::to_string))
        })
    }

    /// Families a network has subnets in, IPv4 first.
    pub(crate) fn network_families(vn: &Map<String, Value>) -> Vec<&'static str> {
        let nets: Vec<IpNet> = subnets_of(vn).iter().filter_map(|(_, s)| cidr_of(s)).collect();
        let mut out = Vec::new();
        if nets.iter().any(|n| matches!(n, IpNet::V4(_))) {
            out.push("v4");
        }
        if nets.iter().any(|n| matches!(n, IpNet::V6(_))) {
            out.push("v6");
        }
        out
    }

    /// The gateway of a subnet, when it has one.
    pub(crate) fn subnet_gateway(subnet: &Map<String, Value>) -> Option<String> {
        subnet
            .get("default_gateway")
            .and_then(Value::as_str)
            .filter(|g| !unset_gateway(g))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn subnet(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn default_pool_skips_the_gateway() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(
            default_pool(&net, Some("10.0.0.1".parse().unwrap())),
            json!([{"start": "10.0.0.2", "end": "10.0.0.254"}])
        );
        assert_eq!(
            default_pool(&net, None),
            json!([{"start": "10.0.0.1", "end": "10.0.0.254"}])
        );
    }

    #[test]
    fn view_hides_unset_gateway() {
        let vn = subnet(json!({"uuid": "n", "perms2": {"owner": "t"}}));
        let s = subnet(json!({
            "subnet": {"ip_prefix": "10.1.0.0", "ip_prefix_len": 16},
            "subnet_uuid": "s",
            "default_gateway": "0.0.0.0",
            "dhcp_option_list": {"dhcp_option": [
                {"dhcp_option_name": "6", "dhcp_option_value": "8.8.8.8 1.1.1.1"}
            ]},
            "host_routes": {"route": [{"prefix": "1.0.0.0/8", "next_hop": "10.1.0.9"}]}
        }));
        let view = subnet_view(&vn, &s);
        assert_eq!(view["gateway_ip"], Value::Null);
        assert_eq!(view["cidr"], "10.1.0.0/16");
        assert_eq!(view["ip_version"], 4);
        assert_eq!(view["dns_nameservers"], json!(["8.8.8.8", "1.1.1.1"]));
        assert_eq!(
            view["host_routes"],
            json!([{"destination": "1.0.0.0/8", "nexthop": "10.1.0.9"}])
        );
    }

    #[test]
    fn removing_the_last_subnet_drops_the_edge() {
        let ipam = Uuid::new_v4();
        let vn = subnet(json!({"network_ipam_refs": [
            {"uuid": ipam.to_string(), "to": ["x"], "attr": {"ipam_subnets": [{"subnet_uuid": "a"}]}}
        ]}));
        let refs = rewrite_ipam_refs(&vn, &ipam, |s| s.clear());
        assert_eq!(refs, json!([]));
        let refs = rewrite_ipam_refs(&vn, &ipam, |s| s.push(json!({"subnet_uuid": "b"})));
        assert_eq!(
            refs,
            json!([{"uuid": ipam.to_string(), "attr": {"ipam_subnets": [
                {"subnet_uuid": "a"}, {"subnet_uuid": "b"}
            ]}}])
        );
    }
}
