// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The reflector: turns orchestrator events into configuration objects.
//!
//! Every write goes through the API server in-process with system privileges, so the same
//! hooks and invariants apply as for any other client. Objects are found again through their
//! fq-name or their annotated fq-name; the local mirror tracks what the bus reported and
//! drives re-evaluation of linked records.

mod balancer;
mod namespace;
mod network;
mod pod;
mod policy;

pub use policy::selects;

use crate::errors::{KubeError, KubeResult};
use crate::event::{Kind, KubeEvent};
use crate::localdb::LocalDb;
use crate::naming::{ClusterNames, IP_FABRIC_NETWORK, SYSTEM_NAMESPACES};
use crate::vlan::VlanSpaces;
use args::KubernetesConfig;
use config::FqName;
use id::Uuid;
use ipnet::IpNet;
use mgmt::refs::{RefOperation, RefUpdate};
use mgmt::{ApiServer, RequestContext};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use store::{ReadOptions, annotated_fq_name};
use tracing::{debug, info, warn};

use tracectl::trace_target;
trace_target!("kube", LevelFilter::INFO, &["kube"]);

/// What a namespace contributes to the pods it holds.
#[derive(Debug, Clone, Default)]
struct NamespaceInfo {
    /// Network of the namespace's pods when not the cluster pod network.
    network: Option<FqName>,
}

#[derive(Debug, Clone)]
struct PodInfo {
    uid: String,
    labels: Map<String, Value>,
    interfaces: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct PolicyInfo {
    group: Uuid,
    selector: Value,
}

pub(crate) fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn ref_to(fq: &FqName) -> Value {
    json!([{ "to": fq }])
}

fn ref_uuid(uuid: &Uuid) -> Value {
    json!([{ "uuid": uuid.to_string() }])
}

fn ref_uuids(body: &Map<String, Value>, field: &str) -> Vec<Uuid> {
    body.get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("uuid").and_then(Value::as_str))
        .filter_map(|u| Uuid::parse_str(u).ok())
        .collect()
}

/// A value of the `annotations` key-value list.
fn annotation_value<'a>(body: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    body.get("annotations")?
        .get("key_value_pair")?
        .as_array()?
        .iter()
        .find(|kv| kv.get("key").and_then(Value::as_str) == Some(key))?
        .get("value")?
        .as_str()
}

fn subnet(net: &IpNet) -> Value {
    json!({ "subnet": { "ip_prefix": net.network().to_string(), "ip_prefix_len": net.prefix_len() } })
}

pub struct Reflector {
    api: Arc<ApiServer>,
    config: KubernetesConfig,
    names: ClusterNames,
    local: LocalDb,
    vlans: VlanSpaces,
    namespaces: HashMap<String, NamespaceInfo>,
    networks: HashMap<(String, String), FqName>,
    pods: HashMap<(String, String), PodInfo>,
    policies: HashMap<(String, String), PolicyInfo>,
}

impl Reflector {
    #[must_use]
    pub fn new(api: Arc<ApiServer>) -> Self {
        let config = api.config().kubernetes.clone();
        Self {
            names: ClusterNames::new(&config),
            config,
            api,
            local: LocalDb::new(),
            vlans: VlanSpaces::default(),
            namespaces: HashMap::new(),
            networks: HashMap::new(),
            pods: HashMap::new(),
            policies: HashMap::new(),
        }
    }

    #[must_use]
    pub fn names(&self) -> &ClusterNames {
        &self.names
    }

    #[must_use]
    pub fn local(&self) -> &LocalDb {
        &self.local
    }

    fn ctx() -> RequestContext {
        RequestContext::internal().with_request_id(format!("kube-{}", Uuid::new_v4()))
    }

    /// Reflect one event.
    pub async fn reflect(&mut self, event: &KubeEvent) -> KubeResult<()> {
        debug!("Reflecting {} {}", event.event_type, event.describe());
        match event.kind()? {
            Kind::Namespace => self.namespace_event(event).await,
            Kind::Network => self.network_event(event).await,
            Kind::Pod => self.pod_event(event).await,
            Kind::Service => self.service_event(event).await,
            Kind::Endpoints => self.endpoints_event(event).await,
            Kind::Ingress => self.ingress_event(event).await,
            Kind::NetworkPolicy => self.policy_event(event).await,
        }
    }

    /// Rebuild the local mirror from the store.
    pub fn rebuild(&mut self) {
        let bus = self.api.db().bus().clone();
        let (published, _) = bus.subscribe(self.local.last_seq());
        let last_seq = published.last().map_or(self.local.last_seq(), |r| r.seq);
        self.local.sync(self.api.db(), last_seq);
        self.vlans.clear();
    }

    /// Fold in the notifications published since the last one seen. Falls back to a rebuild
    /// when the retained log no longer reaches back that far.
    pub fn catch_up(&mut self) {
        let bus = self.api.db().bus().clone();
        let last_seq = self.local.last_seq();
        let (records, _) = bus.subscribe(last_seq);
        if let Some(first) = records.first()
            && last_seq > 0
            && first.seq > last_seq + 1
        {
            warn!("Missed notifications {}..{}, rebuilding", last_seq + 1, first.seq);
            self.rebuild();
            return;
        }
        for record in &records {
            self.local.apply(self.api.db(), record);
        }
    }

    pub fn clear_dirty(&mut self) {
        self.local.clear_dirty();
    }

    /// Re-evaluate the records the last notifications marked dirty.
    pub async fn reevaluate(&mut self) {
        for (ty, uuid) in self.local.take_dirty() {
            let result = match ty {
                "virtual-machine-interface" => self.sync_groups(&uuid).await,
                "loadbalancer" => self.sync_vip(&uuid).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!("Re-evaluating {ty} {uuid} failed: {e}");
            }
        }
    }

    /// Plant the cluster-wide objects: system namespace projects, the flat ipams and the pod
    /// and service networks.
    pub async fn provision(&mut self) -> KubeResult<()> {
        self.ensure(
            "domain",
            &FqName::new([self.config.cluster_domain.clone()]),
            None,
            Map::new(),
        )
        .await?;
        for ns in SYSTEM_NAMESPACES {
            self.ensure_project(ns).await?;
        }
        let pod_ipam = self.names.pod_ipam();
        let service_ipam = self.names.service_ipam();
        self.ensure_ipam(&pod_ipam, &self.config.pod_subnets).await?;
        self.ensure_ipam(&service_ipam, &self.config.service_subnets)
            .await?;
        if !self.config.ip_fabric_subnets.is_empty() {
            self.ensure_ipam(&self.names.ip_fabric_ipam(), &self.config.ip_fabric_subnets)
                .await?;
        }

        let mut pod_network = obj(json!({
            "network_ipam_refs": ref_to(&pod_ipam),
            "address_allocation_mode": "flat-subnet-only",
        }));
        if self.config.ip_fabric_forwarding {
            pod_network.insert(
                "virtual_network_refs".into(),
                ref_to(&FqName::new(IP_FABRIC_NETWORK.iter().copied())),
            );
        }
        self.ensure(
            "virtual-network",
            &self.names.pod_network(),
            Some("project"),
            pod_network,
        )
        .await?;
        self.ensure(
            "virtual-network",
            &self.names.service_network(),
            Some("project"),
            obj(json!({
                "network_ipam_refs": ref_to(&service_ipam),
                "address_allocation_mode": "flat-subnet-only",
            })),
        )
        .await?;
        info!("Cluster {} provisioned", self.names.cluster());
        Ok(())
    }

    async fn ensure_ipam(&self, fq: &FqName, subnets: &[IpNet]) -> KubeResult<Uuid> {
        let subnets: Vec<Value> = subnets.iter().map(subnet).collect();
        self.ensure(
            "network-ipam",
            fq,
            Some("project"),
            obj(json!({
                "ipam_subnet_method": "flat-subnet",
                "ipam_subnets": { "subnets": subnets },
            })),
        )
        .await
    }

    /// The project of a namespace, created when missing.
    async fn ensure_project(&self, namespace: &str) -> KubeResult<Uuid> {
        let fq = self.names.project(namespace);
        if let Some(uuid) = self.existing("project", &fq) {
            return Ok(uuid);
        }
        let mut body = Map::new();
        if self.config.cluster_project.is_none() {
            body.insert(
                "annotations".into(),
                self.names.annotations(namespace, Kind::Namespace, namespace),
            );
        }
        self.ensure("project", &fq, Some("domain"), body).await
    }

    /// Create unless an object of that type and fq-name exists; the id either way.
    async fn ensure(
        &self,
        resource_type: &'static str,
        fq: &FqName,
        parent_type: Option<&str>,
        mut body: Map<String, Value>,
    ) -> KubeResult<Uuid> {
        body.insert("fq_name".into(), json!(fq));
        if let Some(parent_type) = parent_type {
            body.insert("parent_type".into(), json!(parent_type));
        }
        Ok(self
            .api
            .get_or_create(&Self::ctx(), resource_type, body)
            .await?)
    }

    async fn patch(
        &self,
        resource_type: &'static str,
        uuid: &Uuid,
        patch: Map<String, Value>,
    ) -> KubeResult<()> {
        self.api
            .update(&Self::ctx(), resource_type, uuid, patch)
            .await?;
        Ok(())
    }

    /// Delete an object; one already gone is not an error.
    async fn remove(&self, resource_type: &'static str, uuid: &Uuid) -> KubeResult<()> {
        match self.api.delete(&Self::ctx(), resource_type, uuid).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(KubeError::Api(e)),
        }
    }

    async fn set_ref(
        &self,
        resource_type: &str,
        uuid: &Uuid,
        ref_type: &str,
        ref_uuid: &Uuid,
        op: RefOperation,
    ) -> KubeResult<()> {
        let update = RefUpdate::new(resource_type, uuid, ref_type, ref_uuid, op);
        self.api.ref_update(&Self::ctx(), &update).await?;
        Ok(())
    }

    fn existing(&self, resource_type: &str, fq: &FqName) -> Option<Uuid> {
        self.local
            .find_by_fq_name(resource_type, fq)
            .map(|r| r.uuid)
            .or_else(|| self.api.db().uuid_of(resource_type, fq).ok())
    }

    /// An object reflecting `kind/name` of `namespace`, found through its annotated fq-name.
    fn lookup(&self, resource_type: &str, namespace: &str, kind: Kind, name: &str) -> Option<Uuid> {
        let key = self.names.annotated(namespace, kind, name);
        self.local
            .find_by_annotation(resource_type, &key)
            .map(|r| r.uuid)
            .filter(|uuid| self.api.db().exists(uuid))
            .or_else(|| self.api.db().uuid_by_annotation(resource_type, &key))
    }

    fn body(&self, uuid: &Uuid) -> KubeResult<Map<String, Value>> {
        Ok(self.api.db().read(uuid, &ReadOptions::shallow())?)
    }

    /// Whether an object was created by this cluster's adapter.
    fn owned(&self, uuid: &Uuid) -> bool {
        self.body(uuid)
            .ok()
            .and_then(|body| annotated_fq_name(&body))
            .is_some_and(|key| {
                key.get(1).map(String::as_str) == Some(self.names.cluster())
                    && key.get(2).map(String::as_str) == Some(self.names.owner())
            })
    }

    /// Objects of `resource_type` referring to `uuid`.
    fn referrers(&self, uuid: &Uuid, resource_type: &str) -> Vec<Uuid> {
        self.api
            .db()
            .backrefs(uuid)
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.from_type == resource_type)
            .map(|b| b.uuid)
            .collect()
    }

    fn children(&self, uuid: &Uuid, resource_type: &str) -> Vec<Uuid> {
        self.api
            .db()
            .children(uuid)
            .unwrap_or_default()
            .into_iter()
            .filter(|(ty, _)| *ty == resource_type)
            .map(|(_, u)| u)
            .collect()
    }

    /// Peers of `uuid`'s references of `resource_type`.
    fn referenced(&self, uuid: &Uuid, resource_type: &str) -> Vec<Uuid> {
        self.api
            .db()
            .refs(uuid)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.to_type == resource_type)
            .map(|e| e.uuid)
            .collect()
    }

    /// Point a balancer's vip at the address of its interface.
    async fn sync_vip(&self, lb: &Uuid) -> KubeResult<()> {
        let body = self.body(lb)?;
        let Some(vmi) = ref_uuids(&body, "virtual_machine_interface_refs").first().copied() else {
            return Ok(());
        };
        let Some(address) = self
            .referrers(&vmi, "instance-ip")
            .iter()
            .filter_map(|iip| self.body(iip).ok())
            .find_map(|iip| {
                iip.get("instance_ip_address")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
        else {
            return Ok(());
        };
        let mut props = body
            .get("loadbalancer_properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if props.get("vip_address").and_then(Value::as_str) == Some(address.as_str()) {
            return Ok(());
        }
        debug!("Balancer {lb} vip is now {address}");
        props.insert("vip_address".into(), json!(address));
        let mut patch = Map::new();
        patch.insert("loadbalancer_properties".into(), Value::Object(props));
        self.patch("loadbalancer", lb, patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn annotation_values() {
        let body = obj(json!({"annotations": {"key_value_pair": [
            {"key": "namespace", "value": "prod"},
            {"key": "port_name", "value": "http"},
        ]}}));
        assert_eq!(annotation_value(&body, "port_name"), Some("http"));
        assert_eq!(annotation_value(&body, "kind"), None);
    }

    #[test]
    fn ipam_subnet_shape() {
        let net: IpNet = "10.32.0.0/12".parse().unwrap();
        assert_eq!(
            subnet(&net),
            json!({"subnet": {"ip_prefix": "10.32.0.0", "ip_prefix_len": 12}})
        );
    }
}
