// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Subnet host routes applied to ports as interface route tables, when enabled by
//! `apply_subnet_host_routes`.

use crate::errors::NeutronResult;
use crate::plugin::{NeutronPlugin, ref_uuids};
use crate::port::refs_of;
use crate::request::NeutronRequest;
use crate::subnet::{cidr_of, subnets_of};
use config::FqName;
use id::Uuid;
use ipnet::IpNet;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::net::IpAddr;
use store::ReadOptions;
use tracing::{debug, warn};

const ROUTE_TABLE_PREFIX: &str = "NEUTRON_IFACE_RT";

fn route_table_name(subnet: &str, port: &Uuid) -> String {
    format!("{ROUTE_TABLE_PREFIX}_{subnet}_{port}")
}

/// Host route prefixes grouped by a next hop inside `subnet`. A route whose next hop lies in
/// a prefix already reached through some next hop is reached through that next hop as well.
pub(crate) fn host_prefixes(routes: &[Value], subnet: &IpNet) -> BTreeMap<IpAddr, Vec<IpNet>> {
    let mut pending: Vec<(IpNet, IpAddr)> = routes
        .iter()
        .filter_map(|r| {
            let prefix = r.get("prefix")?.as_str()?.parse().ok()?;
            let hop = r.get("next_hop")?.as_str()?.parse().ok()?;
            Some((prefix, hop))
        })
        .collect();
    let mut out: BTreeMap<IpAddr, Vec<IpNet>> = BTreeMap::new();
    pending.retain(|(prefix, hop)| {
        if subnet.contains(hop) {
            out.entry(*hop).or_default().push(*prefix);
            false
        } else {
            true
        }
    });
    for prefixes in out.values_mut() {
        while let Some(pos) = pending
            .iter()
            .position(|(_, hop)| prefixes.iter().any(|p| p.contains(hop)))
        {
            prefixes.push(pending.remove(pos).0);
        }
    }
    out
}

impl NeutronPlugin {
    /// Plant one route table per subnet whose host routes go through an address of the port,
    /// and reference them from the port. `tables` collects what was created, also on failure.
    pub(crate) async fn add_port_route_tables(
        &self,
        req: &NeutronRequest,
        vn: &Map<String, Value>,
        project: &FqName,
        port: &Uuid,
        addrs: &[IpAddr],
        tables: &mut Vec<Uuid>,
    ) -> NeutronResult<()> {
        for (_, subnet) in subnets_of(vn) {
            let (Some(cidr), Some(id)) = (
                cidr_of(&subnet),
                subnet.get("subnet_uuid").and_then(Value::as_str),
            ) else {
                continue;
            };
            let Some(routes) = subnet
                .get("host_routes")
                .and_then(|v| v.get("route"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            let reached = host_prefixes(routes, &cidr);
            let prefixes: Vec<Value> = addrs
                .iter()
                .filter_map(|a| reached.get(a))
                .flatten()
                .map(|p| json!({ "prefix": p.to_string() }))
                .collect();
            if prefixes.is_empty() {
                continue;
            }
            let mut body = Map::new();
            body.insert("fq_name".into(), json!(project.child(route_table_name(id, port))));
            body.insert("parent_type".into(), json!("project"));
            body.insert(
                "interface_route_table_routes".into(),
                json!({ "route": prefixes }),
            );
            tables.push(self.core_create(req, "interface-route-table", body).await?);
        }
        if !tables.is_empty() {
            debug!("Port {port} gets {} host route table(s)", tables.len());
            let mut all = self
                .read_typed("virtual-machine-interface", port)
                .map(|b| ref_uuids(&b, "interface_route_table_refs"))
                .unwrap_or_default();
            all.extend(tables.iter().copied());
            let mut patch = Map::new();
            patch.insert("interface_route_table_refs".into(), refs_of(&all));
            self.core_update(req, "virtual-machine-interface", port, patch).await?;
        }
        Ok(())
    }

    /// Delete the host route tables planted for a port that is gone.
    pub(crate) async fn remove_port_route_tables(
        &self,
        req: &NeutronRequest,
        port_body: &Map<String, Value>,
        port: &Uuid,
    ) {
        for table in self.planted_route_tables(port_body, port) {
            if let Err(e) = self.core_delete(req, "interface-route-table", &table).await
                && !e.is_not_found()
            {
                warn!("Route table {table} of port {port} left behind: {e}");
            }
        }
    }

    fn planted_route_tables(&self, port_body: &Map<String, Value>, port: &Uuid) -> Vec<Uuid> {
        let suffix = format!("_{port}");
        ref_uuids(port_body, "interface_route_table_refs")
            .into_iter()
            .filter(|table| {
                self.api().db().fq_name(table).is_ok_and(|fq| {
                    fq.name().starts_with(ROUTE_TABLE_PREFIX) && fq.name().ends_with(&suffix)
                })
            })
            .collect()
    }

    /// Replant the host route tables of every port of a network after its subnets changed.
    pub(crate) async fn refresh_port_route_tables(
        &self,
        req: &NeutronRequest,
        vn_uuid: &Uuid,
    ) -> NeutronResult<()> {
        let vn = self.api().db().read(vn_uuid, &ReadOptions::default())?;
        let ports: Vec<Uuid> = self
            .api()
            .db()
            .backrefs(vn_uuid)?
            .into_iter()
            .filter(|b| b.from_type == "virtual-machine-interface")
            .map(|b| b.uuid)
            .collect();
        for port in ports {
            let Some(body) = self.read_typed("virtual-machine-interface", &port) else {
                continue;
            };
            let planted = self.planted_route_tables(&body, &port);
            if !planted.is_empty() {
                let kept: Vec<Uuid> = ref_uuids(&body, "interface_route_table_refs")
                    .into_iter()
                    .filter(|t| !planted.contains(t))
                    .collect();
                let mut patch = Map::new();
                patch.insert("interface_route_table_refs".into(), refs_of(&kept));
                self.core_update(req, "virtual-machine-interface", &port, patch).await?;
                self.remove_port_route_tables(req, &body, &port).await;
            }
            let addrs: Vec<IpAddr> = self
                .port_ips(&body)
                .iter()
                .filter_map(|(_, ip)| ip.get("instance_ip_address")?.as_str()?.parse().ok())
                .collect();
            let project = self.api().db().fq_name(&port)?.parent();
            let mut tables = Vec::new();
            self.add_port_route_tables(req, &vn, &project, &port, &addrs, &mut tables)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn indirect_routes_follow_their_next_hop() {
        let routes = vec![
            json!({"prefix": "10.0.0.0/24", "next_hop": "8.0.0.2"}),
            json!({"prefix": "12.0.0.0/24", "next_hop": "10.0.0.4"}),
            json!({"prefix": "14.0.0.0/24", "next_hop": "12.0.0.23"}),
            json!({"prefix": "16.0.0.0/24", "next_hop": "8.0.0.4"}),
            json!({"prefix": "15.0.0.0/24", "next_hop": "16.0.0.2"}),
            json!({"prefix": "20.0.0.0/24", "next_hop": "8.0.0.12"}),
            json!({"prefix": "30.0.0.0/24", "next_hop": "99.0.0.1"}),
        ];
        let reached = host_prefixes(&routes, &net("8.0.0.0/24"));
        assert_eq!(reached.len(), 3);
        assert_eq!(
            reached[&"8.0.0.2".parse::<IpAddr>().unwrap()],
            vec![net("10.0.0.0/24"), net("12.0.0.0/24"), net("14.0.0.0/24")]
        );
        assert_eq!(
            reached[&"8.0.0.4".parse::<IpAddr>().unwrap()],
            vec![net("16.0.0.0/24"), net("15.0.0.0/24")]
        );
        assert_eq!(
            reached[&"8.0.0.12".parse::<IpAddr>().unwrap()],
            vec![net("20.0.0.0/24")]
        );
    }

    #[test]
    fn table_name_carries_subnet_and_port() {
        let port = Uuid::nil();
        assert_eq!(
            route_table_name("s1", &port),
            format!("NEUTRON_IFACE_RT_s1_{port}")
        );
    }
}
