// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Security groups and their rules. Rules are entries of the group's policy rule list, so
//! every rule write is a read-modify-write of the group under the group lock.

use crate::errors::{NeutronError, NeutronResult, RULE_PROTOCOLS};
use crate::plugin::{
    NeutronPlugin, description_of, list_reply, name_of, project_fields, tenant_of, timestamps,
    uuid_of,
};
use crate::request::{NeutronRequest, Operation};
use config::{ApiError, FqName};
use coord::LockGuard;
use id::Uuid;
use ipnet::IpNet;
use serde_json::{Map, Value, json};
use std::str::FromStr;
use tracing::{debug, info};

pub(crate) const DEFAULT_SG: &str = "default";
const LOCAL: &str = "local";
const ANY_PORT: (i64, i64) = (0, 65535);

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn endpoint_subnet(net: &IpNet) -> Value {
    json!({ "subnet": { "ip_prefix": net.network().to_string(), "ip_prefix_len": net.prefix_len() } })
}

fn everything(ethertype: &str) -> IpNet {
    if ethertype == "IPv6" {
        IpNet::V6(ipnet::Ipv6Net::default())
    } else {
        IpNet::V4(ipnet::Ipv4Net::default())
    }
}

fn port_range(ports: (i64, i64)) -> Value {
    json!([{ "start_port": ports.0, "end_port": ports.1 }])
}

/// A policy rule from `remote` into the group (ingress) or out of it (egress).
fn policy_rule(ingress: bool, remote: Value, protocol: &str, ethertype: &str, ports: (i64, i64)) -> Value {
    let local = json!({ "security_group": LOCAL });
    let (src, dst) = if ingress { (remote, local) } else { (local, remote) };
    let stamp = now();
    json!({
        "rule_uuid": Uuid::new_v4().to_string(),
        "direction": ">",
        "protocol": protocol,
        "ethertype": ethertype,
        "src_addresses": [src],
        "src_ports": port_range(ANY_PORT),
        "dst_addresses": [dst],
        "dst_ports": port_range(ports),
        "created": stamp,
        "last_modified": stamp,
    })
}

/// The rules a new group starts with: egress anywhere for both families, plus ingress from
/// members of `peer` when given.
fn initial_rules(peer: Option<&FqName>) -> Vec<Value> {
    let mut rules = Vec::new();
    for ethertype in ["IPv4", "IPv6"] {
        if let Some(peer) = peer {
            rules.push(policy_rule(
                true,
                json!({ "security_group": peer.to_string() }),
                "any",
                ethertype,
                ANY_PORT,
            ));
        }
        rules.push(policy_rule(
            false,
            endpoint_subnet(&everything(ethertype)),
            "any",
            ethertype,
            ANY_PORT,
        ));
    }
    rules
}

fn rules_of(sg: &Map<String, Value>) -> Vec<Map<String, Value>> {
    sg.get("security_group_entries")
        .and_then(|v| v.get("policy_rule"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .cloned()
        .collect()
}

/// Rule fields that make two rules the same rule.
fn rule_content(rule: &Map<String, Value>) -> Map<String, Value> {
    let mut content = rule.clone();
    content.retain(|k, v| !matches!(k.as_str(), "rule_uuid" | "created" | "last_modified") && !v.is_null());
    content
}

fn address_is_local(addr: Option<&Value>) -> bool {
    addr.and_then(|a| a.get("security_group")).and_then(Value::as_str) == Some(LOCAL)
}

fn protocol_ok(protocol: &str) -> bool {
    RULE_PROTOCOLS.contains(&protocol) || protocol.parse::<u16>().is_ok_and(|p| p <= 255)
}

fn is_icmp(protocol: &str) -> bool {
    matches!(protocol, "icmp" | "1" | "icmp6" | "58")
}

fn is_tcp_or_udp(protocol: &str) -> bool {
    matches!(protocol, "tcp" | "udp" | "6" | "17")
}

/// The destination ports a rule body asks for.
fn rule_ports(protocol: &str, min: Option<i64>, max: Option<i64>) -> NeutronResult<(i64, i64)> {
    for port in [min, max].into_iter().flatten() {
        let limit = if is_icmp(protocol) { 255 } else { 65535 };
        if !(0..=limit).contains(&port) {
            return Err(NeutronError::SecurityGroupInvalidPortValue { port: port.to_string() });
        }
    }
    if min.is_none() && max.is_none() {
        return Ok(if is_icmp(protocol) { (-1, -1) } else { ANY_PORT });
    }
    if is_tcp_or_udp(protocol) {
        return match (min, max) {
            (Some(min), Some(max)) if min <= max => Ok((min, max)),
            _ => Err(NeutronError::SecurityGroupInvalidPortRange),
        };
    }
    if is_icmp(protocol) {
        return match (min, max) {
            (Some(min), max) => Ok((min, max.unwrap_or(-1))),
            (None, _) => Err(NeutronError::SecurityGroupInvalidPortRange),
        };
    }
    Ok((min.unwrap_or(ANY_PORT.0), max.unwrap_or(ANY_PORT.1)))
}

impl NeutronPlugin {
    pub(crate) async fn security_group_request(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        match req.operation() {
            Operation::Create => Ok(Value::Object(self.sg_create(req).await?)),
            Operation::Read => {
                let sg = self.sg_visible(req, &req.id_str())?;
                Ok(project_fields(self.sg_view(&sg), req.data.fields.as_ref()))
            }
            Operation::Update => Ok(Value::Object(self.sg_update(req).await?)),
            Operation::Delete => {
                self.sg_delete(req).await?;
                Ok(json!({}))
            }
            Operation::ReadAll | Operation::ReadCount => Ok(list_reply(req, self.sg_list(req).await?)),
            op => Err(Self::unsupported("security_group", op)),
        }
    }

    pub(crate) async fn security_group_rule_request(
        &self,
        req: &NeutronRequest,
    ) -> NeutronResult<Value> {
        match req.operation() {
            Operation::Create => Ok(Value::Object(self.rule_create(req).await?)),
            Operation::Read => {
                let id = req.id_str();
                let (sg, rule) = self.rule_find(req, &id).ok_or_else(|| {
                    NeutronError::SecurityGroupRuleNotFound { id: id.clone() }
                })?;
                let view = self
                    .rule_view(&sg, &rule)
                    .ok_or(NeutronError::SecurityGroupRuleNotFound { id })?;
                Ok(project_fields(view, req.data.fields.as_ref()))
            }
            Operation::Delete => {
                self.rule_delete(req).await?;
                Ok(json!({}))
            }
            Operation::ReadAll | Operation::ReadCount => Ok(list_reply(req, self.rule_list(req))),
            op => Err(Self::unsupported("security_group_rule", op)),
        }
    }

    fn sg_visible(&self, req: &NeutronRequest, id: &str) -> NeutronResult<Map<String, Value>> {
        id::parse_lenient(id)
            .ok()
            .and_then(|u| self.read_typed("security-group", &u))
            .filter(|sg| Self::visible(req, &tenant_of(sg), false))
            .ok_or_else(|| NeutronError::SecurityGroupNotFound { id: id.to_string() })
    }

    /// The `default` group of a tenant, created with its rules on first use.
    pub(crate) async fn ensure_default_sg(&self, req: &NeutronRequest, tenant: &Uuid) -> NeutronResult<Uuid> {
        let project = self.project_fq(tenant)?;
        let fq = project.child(DEFAULT_SG);
        if let Ok(sg) = self.api().db().uuid_of("security-group", &fq) {
            return Ok(sg);
        }
        let mut body = Map::new();
        body.insert("fq_name".into(), json!(fq));
        body.insert("parent_type".into(), json!("project"));
        body.insert(
            "id_perms".into(),
            json!({ "description": "Default security group" }),
        );
        body.insert(
            "security_group_entries".into(),
            json!({ "policy_rule": initial_rules(Some(&fq)) }),
        );
        let sg = self
            .api()
            .get_or_create(&req.core_ctx(), "security-group", body)
            .await?;
        info!("Default security group {sg} ready for project {project}");
        Ok(sg)
    }

    pub(crate) fn sg_view(&self, sg: &Map<String, Value>) -> Map<String, Value> {
        let tenant = tenant_of(sg);
        let rules: Vec<Value> = rules_of(sg)
            .iter()
            .filter_map(|rule| self.rule_view(sg, rule))
            .map(Value::Object)
            .collect();
        let mut out = Map::new();
        out.insert("id".into(), sg.get("uuid").cloned().unwrap_or(Value::Null));
        out.insert("name".into(), json!(name_of(sg)));
        out.insert("tenant_id".into(), json!(tenant));
        out.insert("project_id".into(), json!(tenant));
        out.insert("description".into(), description_of(sg));
        out.insert("security_group_rules".into(), Value::Array(rules));
        timestamps(sg, &mut out);
        out
    }

    /// The Neutron form of a rule, or nothing when its remote group is gone.
    fn rule_view(&self, sg: &Map<String, Value>, rule: &Map<String, Value>) -> Option<Map<String, Value>> {
        let src = rule.get("src_addresses").and_then(Value::as_array).and_then(|a| a.first());
        let dst = rule.get("dst_addresses").and_then(Value::as_array).and_then(|a| a.first());
        let (direction, remote) = if address_is_local(src) {
            ("egress", dst)
        } else if address_is_local(dst) {
            ("ingress", src)
        } else {
            return None;
        };
        let own_fq = sg.get("fq_name").cloned().and_then(|f| serde_json::from_value::<FqName>(f).ok());
        let mut remote_cidr = Value::Null;
        let mut remote_group = Value::Null;
        if let Some(subnet) = remote.and_then(|r| r.get("subnet")).filter(|s| !s.is_null()) {
            remote_cidr = json!(format!(
                "{}/{}",
                subnet.get("ip_prefix").and_then(Value::as_str).unwrap_or_default(),
                subnet.get("ip_prefix_len").and_then(Value::as_u64).unwrap_or_default()
            ));
        } else if let Some(group) = remote
            .and_then(|r| r.get("security_group"))
            .and_then(Value::as_str)
            .filter(|g| !matches!(*g, "any" | LOCAL))
        {
            let fq = FqName::parse(group, None);
            if Some(&fq) == own_fq.as_ref() {
                remote_group = sg.get("uuid").cloned().unwrap_or(Value::Null);
            } else {
                let uuid = self.api().db().uuid_of("security-group", &fq).ok()?;
                remote_group = json!(uuid.to_string());
            }
        }
        let ports = rule
            .get("dst_ports")
            .and_then(Value::as_array)
            .and_then(|p| p.first())
            .map(|p| {
                (
                    p.get("start_port").and_then(Value::as_i64).unwrap_or(ANY_PORT.0),
                    p.get("end_port").and_then(Value::as_i64).unwrap_or(ANY_PORT.1),
                )
            })
            .unwrap_or(ANY_PORT);
        let port = |p: i64| if p < 0 { Value::Null } else { json!(p) };
        let protocol = rule.get("protocol").and_then(Value::as_str).unwrap_or("any");

        let tenant = tenant_of(sg);
        let mut out = Map::new();
        out.insert("id".into(), rule.get("rule_uuid").cloned().unwrap_or(Value::Null));
        out.insert("tenant_id".into(), json!(tenant));
        out.insert("project_id".into(), json!(tenant));
        out.insert("security_group_id".into(), sg.get("uuid").cloned().unwrap_or(Value::Null));
        out.insert("direction".into(), json!(direction));
        out.insert("ethertype".into(), rule.get("ethertype").cloned().unwrap_or(json!("IPv4")));
        out.insert(
            "protocol".into(),
            if protocol == "any" { Value::Null } else { json!(protocol) },
        );
        out.insert("port_range_min".into(), port(ports.0));
        out.insert("port_range_max".into(), port(ports.1));
        out.insert("remote_ip_prefix".into(), remote_cidr);
        out.insert("remote_group_id".into(), remote_group);
        out.insert("created_at".into(), rule.get("created").cloned().unwrap_or(Value::Null));
        out.insert("updated_at".into(), rule.get("last_modified").cloned().unwrap_or(Value::Null));
        Some(out)
    }

    async fn sg_create(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let tenant = self.tenant_for_create(req)?;
        let project = self.project_fq(&tenant)?;
        let res = req.resource();
        let name = res.get("name").and_then(Value::as_str).unwrap_or_default();
        self.ensure_default_sg(req, &tenant).await?;
        if name == DEFAULT_SG {
            return Err(NeutronError::SecurityGroupAlreadyExists);
        }
        let uuid = Uuid::new_v4();
        let mut body = Map::new();
        body.insert("uuid".into(), json!(uuid.to_string()));
        body.insert("fq_name".into(), json!(project.child(uuid.to_string())));
        body.insert("parent_type".into(), json!("project"));
        body.insert("display_name".into(), json!(name));
        if let Some(description) = res.get("description").filter(|d| !d.is_null()) {
            body.insert("id_perms".into(), json!({ "description": description }));
        }
        body.insert(
            "security_group_entries".into(),
            json!({ "policy_rule": initial_rules(None) }),
        );
        let uuid = self
            .core_create(req, "security-group", body)
            .await
            .map_err(|e| match e {
                ApiError::Validation(msg) => NeutronError::bad_request("security_group", msg),
                e => e.into(),
            })?;
        info!("Security group {uuid} created");
        let sg = self.sg_visible(req, &uuid.to_string())?;
        Ok(self.sg_view(&sg))
    }

    async fn sg_update(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let sg = self.sg_visible(req, &req.id_str())?;
        let uuid = uuid_of(&sg).ok_or_else(|| NeutronError::SecurityGroupNotFound { id: req.id_str() })?;
        if name_of(&sg) == DEFAULT_SG {
            return Err(NeutronError::SecurityGroupCannotUpdateDefault);
        }
        let res = req.resource();
        let mut patch = Map::new();
        if let Some(name) = res.get("name").and_then(Value::as_str) {
            if name == DEFAULT_SG {
                return Err(NeutronError::SecurityGroupCannotUpdateDefault);
            }
            patch.insert("display_name".into(), json!(name));
        }
        if let Some(description) = res.get("description").filter(|d| !d.is_null()) {
            let mut id_perms = sg.get("id_perms").and_then(Value::as_object).cloned().unwrap_or_default();
            id_perms.insert("description".into(), description.clone());
            patch.insert("id_perms".into(), Value::Object(id_perms));
        }
        if !patch.is_empty() {
            self.core_update(req, "security-group", &uuid, patch).await?;
        }
        let sg = self.sg_visible(req, &uuid.to_string())?;
        Ok(self.sg_view(&sg))
    }

    async fn sg_delete(&self, req: &NeutronRequest) -> NeutronResult<()> {
        let id = req.id_str();
        let Ok(sg) = self.sg_visible(req, &id) else {
            return Ok(());
        };
        let uuid = uuid_of(&sg).ok_or_else(|| NeutronError::SecurityGroupNotFound { id: id.clone() })?;
        let owner = req
            .tenant()
            .is_some_and(|t| id::undashed(&t) == tenant_of(&sg));
        if name_of(&sg) == DEFAULT_SG && owner {
            return Err(NeutronError::SecurityGroupCannotRemoveDefault);
        }
        match self.core_delete(req, "security-group", &uuid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(ApiError::RefsExist(_) | ApiError::Conflict(_)) => {
                return Err(NeutronError::SecurityGroupInUse { id });
            }
            Err(e) => return Err(e.into()),
        }
        info!("Security group {uuid} deleted");
        Ok(())
    }

    async fn sg_list(&self, req: &NeutronRequest) -> NeutronResult<Vec<Map<String, Value>>> {
        // listing creates the default group of the caller, as Neutron expects it to exist
        if !req.is_admin()
            && let Some(tenant) = req.tenant()
            && self.project_fq(&tenant).is_ok()
        {
            self.ensure_default_sg(req, &tenant).await?;
        }
        let filters = req.filters();
        Ok(self
            .list_typed("security-group", self.listing_projects(req))
            .iter()
            .filter(|sg| {
                sg.get("id_perms")
                    .and_then(|p| p.get("user_visible"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true)
            })
            .map(|sg| self.sg_view(sg))
            .filter(|view| filters.accepts_all(view, &["id", "name", "description"]))
            .collect())
    }

    /// The group holding rule `id`, among the caller's groups or every group for an admin.
    fn rule_find(&self, req: &NeutronRequest, id: &str) -> Option<(Map<String, Value>, Map<String, Value>)> {
        let projects = if req.is_admin() { None } else { Some(req.tenant().into_iter().collect()) };
        self.list_typed("security-group", projects)
            .into_iter()
            .find_map(|sg| {
                let rule = rules_of(&sg)
                    .into_iter()
                    .find(|r| r.get("rule_uuid").and_then(Value::as_str) == Some(id))?;
                Some((sg, rule))
            })
    }

    async fn rule_create(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let res = req.resource();
        let sg_id = res
            .get("security_group_id")
            .and_then(Value::as_str)
            .ok_or_else(|| NeutronError::bad_request("security_group_rule", "security_group_id is required"))?;
        let sg = self.sg_visible(req, sg_id)?;
        let sg_uuid = uuid_of(&sg).ok_or_else(|| NeutronError::SecurityGroupNotFound { id: sg_id.to_string() })?;

        let remote_prefix = res.get("remote_ip_prefix").and_then(Value::as_str).filter(|p| !p.is_empty());
        let remote_group = res.get("remote_group_id").and_then(Value::as_str).filter(|g| !g.is_empty());
        if remote_prefix.is_some() && remote_group.is_some() {
            return Err(NeutronError::SecurityGroupRemoteGroupAndRemoteIpPrefix);
        }
        let ethertype = res
            .get("ethertype")
            .and_then(Value::as_str)
            .unwrap_or("IPv4")
            .to_string();
        let remote = match (remote_prefix, remote_group) {
            (Some(prefix), _) => {
                let net = IpNet::from_str(prefix)
                    .or_else(|_| std::net::IpAddr::from_str(prefix).map(IpNet::from))
                    .map_err(|_| NeutronError::invalid_input(format!("Invalid remote_ip_prefix {prefix}")))?;
                let matches = matches!((&net, ethertype.as_str()), (IpNet::V4(_), "IPv4") | (IpNet::V6(_), "IPv6"));
                if !matches {
                    return Err(NeutronError::SecurityGroupRuleParameterConflict {
                        ethertype,
                        cidr: prefix.to_string(),
                    });
                }
                endpoint_subnet(&net)
            }
            (None, Some(group)) => {
                let fq = id::parse_lenient(group)
                    .ok()
                    .filter(|u| self.read_typed("security-group", u).is_some())
                    .and_then(|u| self.api().db().fq_name(&u).ok())
                    .ok_or_else(|| NeutronError::SecurityGroupNotFound { id: group.to_string() })?;
                json!({ "security_group": fq.to_string() })
            }
            (None, None) => endpoint_subnet(&everything(&ethertype)),
        };

        let protocol = match res.get("protocol") {
            None | Some(Value::Null) => "any".to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if s.is_empty() => "any".to_string(),
            Some(Value::String(s)) => s.to_lowercase(),
            Some(other) => other.to_string(),
        };
        if !protocol_ok(&protocol) {
            return Err(NeutronError::SecurityGroupRuleInvalidProtocol {
                protocol,
                values: RULE_PROTOCOLS.join(", "),
            });
        }
        let min = res.get("port_range_min").and_then(Value::as_i64);
        let max = res.get("port_range_max").and_then(Value::as_i64);
        let ports = rule_ports(&protocol, min, max)?;
        let ingress = match res.get("direction").and_then(Value::as_str) {
            Some("ingress") => true,
            Some("egress") => false,
            other => {
                return Err(NeutronError::invalid_input(format!(
                    "Invalid direction {}",
                    other.unwrap_or("null")
                )));
            }
        };
        let rule = policy_rule(ingress, remote, &protocol, &ethertype, ports);
        let rule = rule.as_object().cloned().unwrap_or_default();
        let rule_id = rule.get("rule_uuid").and_then(Value::as_str).unwrap_or_default().to_string();

        let _lock = self.rule_lock(&sg_uuid, "created").await?;
        // read again under the lock
        let sg = self.sg_visible(req, sg_id)?;
        let mut rules = rules_of(&sg);
        let content = rule_content(&rule);
        if let Some(existing) = rules.iter().find(|r| rule_content(r) == content) {
            return Err(NeutronError::SecurityGroupRuleExists {
                id: existing.get("rule_uuid").and_then(Value::as_str).unwrap_or_default().to_string(),
            });
        }
        rules.push(rule.clone());
        let mut patch = Map::new();
        patch.insert("security_group_entries".into(), json!({ "policy_rule": rules }));
        self.core_update(req, "security-group", &sg_uuid, patch)
            .await
            .map_err(|e| match e {
                ApiError::Conflict(_) | ApiError::RefsExist(_) => {
                    NeutronError::SecurityGroupRuleExists { id: rule_id.clone() }
                }
                ApiError::Validation(msg) => NeutronError::bad_request("security_group_rule", msg),
                ApiError::OverQuota { .. } => NeutronError::OverQuota {
                    overs: "security_group_rule".to_string(),
                },
                e => e.into(),
            })?;
        debug!("Rule {rule_id} added to security group {sg_uuid}");
        let sg = self.sg_visible(req, sg_id)?;
        self.rule_view(&sg, &rule)
            .ok_or(NeutronError::SecurityGroupRuleNotFound { id: rule_id })
    }

    /// Serialize rule edits of a group. A busy group is reported as a bad request that the
    /// caller may retry.
    async fn rule_lock(&self, sg_uuid: &Uuid, action: &str) -> NeutronResult<LockGuard> {
        self.api().security_group_lock(sg_uuid).await.map_err(|e| {
            NeutronError::bad_request(
                "security_group_rule",
                format!("Security Group Rule could not be {action}, Try again.. {e}"),
            )
        })
    }

    async fn rule_delete(&self, req: &NeutronRequest) -> NeutronResult<()> {
        let id = req.id_str();
        let not_found = || NeutronError::SecurityGroupRuleNotFound { id: id.clone() };
        let (sg, _) = self.rule_find(req, &id).ok_or_else(not_found)?;
        let sg_uuid = uuid_of(&sg).ok_or_else(not_found)?;
        let _lock = self.rule_lock(&sg_uuid, "deleted").await?;
        let sg = self.read_typed("security-group", &sg_uuid).ok_or_else(not_found)?;
        let before = rules_of(&sg);
        let rules: Vec<Map<String, Value>> = before
            .iter()
            .filter(|r| r.get("rule_uuid").and_then(Value::as_str) != Some(id.as_str()))
            .cloned()
            .collect();
        if rules.len() == before.len() {
            return Err(not_found());
        }
        let mut patch = Map::new();
        patch.insert("security_group_entries".into(), json!({ "policy_rule": rules }));
        self.core_update(req, "security-group", &sg_uuid, patch).await?;
        debug!("Rule {id} removed from security group {sg_uuid}");
        Ok(())
    }

    fn rule_list(&self, req: &NeutronRequest) -> Vec<Map<String, Value>> {
        let filters = req.filters();
        let mut out = Vec::new();
        for sg in self.list_typed("security-group", self.listing_projects(req)) {
            for rule in rules_of(&sg) {
                if let Some(view) = self.rule_view(&sg, &rule)
                    && filters.accepts_all(
                        &view,
                        &["id", "security_group_id", "direction", "ethertype", "protocol", "remote_group_id"],
                    )
                {
                    out.push(view);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_rules_cover_both_families() {
        let fq = FqName::new(["default-domain", "demo", "default"]);
        let rules = initial_rules(Some(&fq));
        assert_eq!(rules.len(), 4);
        let ingress: Vec<&Value> = rules
            .iter()
            .filter(|r| r["dst_addresses"][0]["security_group"] == "local")
            .collect();
        assert_eq!(ingress.len(), 2);
        assert_eq!(ingress[0]["src_addresses"][0]["security_group"], "default-domain:demo:default");
        let egress_v6 = rules
            .iter()
            .find(|r| r["src_addresses"][0]["security_group"] == "local" && r["ethertype"] == "IPv6")
            .unwrap();
        assert_eq!(
            egress_v6["dst_addresses"][0]["subnet"],
            json!({"ip_prefix": "::", "ip_prefix_len": 0})
        );
    }

    #[test]
    fn port_ranges() {
        assert_eq!(rule_ports("tcp", None, None).unwrap(), (0, 65535));
        assert_eq!(rule_ports("tcp", Some(22), Some(22)).unwrap(), (22, 22));
        assert_eq!(
            rule_ports("tcp", Some(80), Some(22)).unwrap_err().name(),
            "SecurityGroupInvalidPortRange"
        );
        assert_eq!(
            rule_ports("udp", Some(0), Some(70000)).unwrap_err().name(),
            "SecurityGroupInvalidPortValue"
        );
        assert_eq!(rule_ports("icmp", None, None).unwrap(), (-1, -1));
        assert_eq!(rule_ports("icmp", Some(8), None).unwrap(), (8, -1));
    }

    #[test]
    fn protocols() {
        assert!(protocol_ok("tcp"));
        assert!(protocol_ok("any"));
        assert!(protocol_ok("47"));
        assert!(!protocol_ok("256"));
        assert!(!protocol_ok("gre"));
    }

    #[test]
    fn identical_rules_compare_equal() {
        let a = policy_rule(true, json!({"security_group": "a:b:c"}), "tcp", "IPv4", (22, 22));
        let b = policy_rule(true, json!({"security_group": "a:b:c"}), "tcp", "IPv4", (22, 22));
        assert_ne!(a["rule_uuid"], b["rule_uuid"]);
        assert_eq!(
            rule_content(a.as_object().unwrap()),
            rule_content(b.as_object().unwrap())
        );
    }
}
