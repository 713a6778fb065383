// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network policies become security groups attached to the interfaces of the pods they select.

use super::{PolicyInfo, Reflector, obj};
use crate::errors::KubeResult;
use crate::event::{EventType, Kind, KubeEvent};
use id::Uuid;
use ipnet::IpNet;
use mgmt::refs::RefOperation;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use tracing::{debug, info};

const ANY_PORT: (u64, u64) = (0, 65535);

/// Whether a label selector matches `labels`. An empty selector matches everything.
#[must_use]
pub fn selects(selector: &Value, labels: &Map<String, Value>) -> bool {
    let by_label = selector
        .get("matchLabels")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .all(|(key, value)| labels.get(key) == Some(value));
    let by_expression = selector
        .get("matchExpressions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .all(|expr| {
            let key = expr.get("key").and_then(Value::as_str).unwrap_or_default();
            let values: Vec<&Value> = expr
                .get("values")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .collect();
            let have = labels.get(key);
            match expr.get("operator").and_then(Value::as_str) {
                Some("In") => have.is_some_and(|v| values.contains(&v)),
                Some("NotIn") => have.is_none_or(|v| !values.contains(&v)),
                Some("Exists") => have.is_some(),
                Some("DoesNotExist") => have.is_none(),
                _ => false,
            }
        });
    by_label && by_expression
}

fn address_of(peer: &Value) -> Value {
    match peer
        .pointer("/ipBlock/cidr")
        .and_then(Value::as_str)
        .and_then(|c| c.parse::<IpNet>().ok())
    {
        Some(net) => json!({
            "subnet": { "ip_prefix": net.network().to_string(), "ip_prefix_len": net.prefix_len() }
        }),
        None => json!({ "subnet": { "ip_prefix": "0.0.0.0", "ip_prefix_len": 0 } }),
    }
}

fn ports_of(rule: &Value) -> Vec<(String, (u64, u64))> {
    let ports: Vec<(String, (u64, u64))> = rule
        .get("ports")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|p| {
            let protocol = p
                .get("protocol")
                .and_then(Value::as_str)
                .unwrap_or("TCP")
                .to_ascii_lowercase();
            let range = match p.get("port").and_then(Value::as_u64) {
                Some(port) => {
                    let end = p.get("endPort").and_then(Value::as_u64).unwrap_or(port);
                    (port, end)
                }
                None => ANY_PORT,
            };
            (protocol, range)
        })
        .collect();
    if ports.is_empty() {
        vec![("any".to_string(), ANY_PORT)]
    } else {
        ports
    }
}

fn rule(ingress: bool, peer: Value, protocol: &str, ports: (u64, u64)) -> Value {
    let local = json!({ "security_group": "local" });
    let v6 = peer
        .pointer("/subnet/ip_prefix")
        .and_then(Value::as_str)
        .is_some_and(|p| p.contains(':'));
    let (src, dst) = if ingress { (peer, local) } else { (local, peer) };
    json!({
        "direction": ">",
        "protocol": protocol,
        "ethertype": if v6 { "IPv6" } else { "IPv4" },
        "src_addresses": [src],
        "src_ports": [{ "start_port": ANY_PORT.0, "end_port": ANY_PORT.1 }],
        "dst_addresses": [dst],
        "dst_ports": [{ "start_port": ports.0, "end_port": ports.1 }],
    })
}

/// Rules of one direction. Egress is open unless the policy restricts it.
fn direction_rules(spec: &Value, ingress: bool) -> Vec<Value> {
    let (field, peers, kind) = if ingress {
        ("ingress", "from", "Ingress")
    } else {
        ("egress", "to", "Egress")
    };
    let restricted = spec
        .get("policyTypes")
        .and_then(Value::as_array)
        .map_or(ingress || spec.get(field).is_some(), |types| types.iter().any(|t| t.as_str() == Some(kind)));
    if !restricted {
        return vec![rule(ingress, address_of(&Value::Null), "any", ANY_PORT)];
    }
    let mut rules = Vec::new();
    for entry in spec.get(field).and_then(Value::as_array).into_iter().flatten() {
        let addresses: Vec<Value> = match entry.get(peers).and_then(Value::as_array) {
            Some(list) if !list.is_empty() => list.iter().map(address_of).collect(),
            _ => vec![address_of(&Value::Null)],
        };
        for (protocol, range) in ports_of(entry) {
            for address in &addresses {
                rules.push(rule(ingress, address.clone(), &protocol, range));
            }
        }
    }
    rules
}

/// The security group entries a policy spec translates to.
pub(super) fn policy_rules(spec: &Value) -> Vec<Value> {
    let mut rules = direction_rules(spec, true);
    rules.extend(direction_rules(spec, false));
    rules
}

impl Reflector {
    pub(super) async fn policy_event(&mut self, event: &KubeEvent) -> KubeResult<()> {
        let namespace = event.require_namespace()?.to_string();
        let name = event.require_name()?.to_string();
        let key = (namespace.clone(), name.clone());
        let fq = self.names.policy_group(&namespace, &name);

        if event.event_type == EventType::Deleted {
            let group = self
                .policies
                .remove(&key)
                .map(|p| p.group)
                .or_else(|| self.existing("security-group", &fq));
            if let Some(group) = group {
                for vmi in self.referrers(&group, "virtual-machine-interface") {
                    self.set_ref(
                        "virtual-machine-interface",
                        &vmi,
                        "security-group",
                        &group,
                        RefOperation::Delete,
                    )
                    .await?;
                }
                if self.owned(&group) {
                    self.remove("security-group", &group).await?;
                }
                info!("Policy {namespace}/{name} removed");
            }
            return Ok(());
        }

        self.ensure_project(&namespace).await?;
        let spec = event.spec();
        let entries = json!({ "policy_rule": policy_rules(spec) });
        let group = match self.existing("security-group", &fq) {
            Some(group) => {
                let mut patch = Map::new();
                patch.insert("security_group_entries".into(), entries);
                self.patch("security-group", &group, patch).await?;
                group
            }
            None => {
                self.ensure(
                    "security-group",
                    &fq,
                    Some("project"),
                    obj(json!({
                        "display_name": name,
                        "security_group_entries": entries,
                        "annotations": self.names.annotations(&namespace, Kind::NetworkPolicy, &name),
                    })),
                )
                .await?
            }
        };
        let selector = spec.get("podSelector").cloned().unwrap_or(Value::Null);
        self.policies.insert(key, PolicyInfo { group, selector });
        debug!("Policy {namespace}/{name} is group {group}");

        let interfaces: Vec<Uuid> = self
            .pods
            .iter()
            .filter(|((ns, _), _)| *ns == namespace)
            .flat_map(|(_, pod)| pod.interfaces.iter().copied())
            .collect();
        for vmi in &interfaces {
            self.sync_groups(vmi).await?;
        }
        Ok(())
    }

    /// Make a pod interface carry exactly the groups of the policies selecting its pod.
    /// Groups not reflecting a policy are left alone.
    pub(super) async fn sync_groups(&self, vmi: &Uuid) -> KubeResult<()> {
        let Some(((namespace, _), pod)) = self
            .pods
            .iter()
            .find(|(_, pod)| pod.interfaces.contains(vmi))
        else {
            return Ok(());
        };
        let ours: BTreeSet<Uuid> = self.policies.values().map(|p| p.group).collect();
        let wanted: BTreeSet<Uuid> = self
            .policies
            .iter()
            .filter(|((ns, _), p)| ns == namespace && selects(&p.selector, &pod.labels))
            .map(|(_, p)| p.group)
            .collect();
        let have: BTreeSet<Uuid> = self
            .referenced(vmi, "security-group")
            .into_iter()
            .filter(|g| ours.contains(g))
            .collect();
        for group in wanted.difference(&have) {
            self.set_ref(
                "virtual-machine-interface",
                vmi,
                "security-group",
                group,
                RefOperation::Add,
            )
            .await?;
        }
        for group in have.difference(&wanted) {
            self.set_ref(
                "virtual-machine-interface",
                vmi,
                "security-group",
                group,
                RefOperation::Delete,
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(value: Value) -> Map<String, Value> {
        obj(value)
    }

    #[test]
    fn selector_matching() {
        let web = labels(json!({"app": "web", "tier": "front"}));
        assert!(selects(&json!({}), &web));
        assert!(selects(&Value::Null, &web));
        assert!(selects(&json!({"matchLabels": {"app": "web"}}), &web));
        assert!(!selects(&json!({"matchLabels": {"app": "db"}}), &web));
        let expr = |op: &str, values: Value| {
            json!({"matchExpressions": [{"key": "tier", "operator": op, "values": values}]})
        };
        assert!(selects(&expr("In", json!(["front", "mid"])), &web));
        assert!(!selects(&expr("NotIn", json!(["front"])), &web));
        assert!(selects(&expr("Exists", Value::Null), &web));
        assert!(!selects(&expr("DoesNotExist", Value::Null), &web));
        assert!(!selects(&expr("Bogus", Value::Null), &web));
    }

    #[test]
    fn ingress_only_policy_keeps_egress_open() {
        let spec = json!({
            "podSelector": {},
            "ingress": [{
                "from": [{"ipBlock": {"cidr": "10.1.0.0/16"}}],
                "ports": [{"protocol": "TCP", "port": 80}, {"protocol": "UDP", "port": 53}]
            }]
        });
        let rules = policy_rules(&spec);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0]["protocol"], "tcp");
        assert_eq!(rules[0]["src_addresses"][0]["subnet"]["ip_prefix_len"], 16);
        assert_eq!(rules[0]["dst_ports"][0], json!({"start_port": 80, "end_port": 80}));
        assert_eq!(rules[1]["protocol"], "udp");
        assert_eq!(rules[2]["dst_addresses"][0]["subnet"]["ip_prefix_len"], 0);
        assert_eq!(rules[2]["src_addresses"][0]["security_group"], "local");
    }

    #[test]
    fn deny_all_ingress() {
        let spec = json!({"podSelector": {}, "policyTypes": ["Ingress", "Egress"]});
        assert!(policy_rules(&spec).is_empty());
    }
}
