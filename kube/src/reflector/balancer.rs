// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Services and ingresses become load balancers; endpoints become their pool members.
//!
//! A balancer owns an interface and instance ip in the cluster service network holding its
//! vip. Each service port is a listener with one pool; an ingress listens on 80, and on 443
//! when it terminates TLS, with one pool per backend service.

use super::{Reflector, annotation_value, obj, ref_to, ref_uuid};
use crate::errors::KubeResult;
use crate::event::{EventType, Kind, KubeEvent};
use crate::naming::ClusterNames;
use config::FqName;
use id::Uuid;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Annotation key carrying the service port name a pool serves.
const PORT_NAME: &str = "port_name";

#[derive(Debug, Clone, PartialEq)]
pub(super) struct PoolSpec {
    /// Last fq-name segment after the balancer name.
    pub segment: String,
    pub protocol: &'static str,
    pub port_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct ListenerSpec {
    pub segment: String,
    pub protocol: &'static str,
    pub port: u64,
    pub pools: Vec<PoolSpec>,
}

fn service_protocol(port: &Value) -> &'static str {
    match port.get("protocol").and_then(Value::as_str) {
        Some("UDP") => "UDP",
        _ => "TCP",
    }
}

/// One listener with one pool per service port.
pub(super) fn service_listeners(spec: &Value) -> Vec<ListenerSpec> {
    spec.get("ports")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|port| {
            let number = port.get("port").and_then(Value::as_u64)?;
            let protocol = service_protocol(port);
            let segment = format!("{}-{number}", protocol.to_ascii_lowercase());
            Some(ListenerSpec {
                segment: segment.clone(),
                protocol,
                port: number,
                pools: vec![PoolSpec {
                    segment: format!("{segment}-pool"),
                    protocol,
                    port_name: port
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }],
            })
        })
        .collect()
}

/// A backend as `(service, port)`. Ports given by name are not resolved.
fn backend_of(backend: &Value) -> Option<(String, u64)> {
    if let Some(service) = backend.get("service") {
        let name = service.get("name").and_then(Value::as_str)?;
        let port = service.pointer("/port/number").and_then(Value::as_u64)?;
        return Some((name.to_string(), port));
    }
    let name = backend.get("serviceName").and_then(Value::as_str)?;
    let port = backend.get("servicePort").and_then(Value::as_u64)?;
    Some((name.to_string(), port))
}

/// Distinct backends of an ingress, the default one first.
pub(super) fn ingress_backends(spec: &Value) -> Vec<(String, u64)> {
    let default = spec
        .get("defaultBackend")
        .or_else(|| spec.get("backend"))
        .and_then(backend_of);
    let by_rule = spec
        .get("rules")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.pointer("/http/paths").and_then(Value::as_array))
        .flatten()
        .filter_map(|p| p.get("backend").and_then(backend_of));
    let mut backends = Vec::new();
    for backend in default.into_iter().chain(by_rule) {
        if !backends.contains(&backend) {
            backends.push(backend);
        }
    }
    backends
}

pub(super) fn ingress_listeners(spec: &Value) -> Vec<ListenerSpec> {
    let backends = ingress_backends(spec);
    let tls = spec
        .get("tls")
        .and_then(Value::as_array)
        .is_some_and(|t| !t.is_empty());
    let mut listeners = vec![("http", "HTTP", 80)];
    if tls {
        listeners.push(("https", "TERMINATED_HTTPS", 443));
    }
    listeners
        .into_iter()
        .map(|(segment, protocol, port)| ListenerSpec {
            segment: segment.to_string(),
            protocol,
            port,
            pools: backends
                .iter()
                .map(|(service, port)| PoolSpec {
                    segment: format!("{segment}-{service}-{port}"),
                    protocol: "HTTP",
                    port_name: format!("{service}:{port}"),
                })
                .collect(),
        })
        .collect()
}

/// Members wanted by an endpoints object: `(port name, address, port)`.
pub(super) fn endpoint_members(object: &Value) -> Vec<(String, String, u64)> {
    let mut members = Vec::new();
    for subset in object
        .get("subsets")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let addresses: Vec<&str> = subset
            .get("addresses")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|a| a.get("ip").and_then(Value::as_str))
            .collect();
        for port in subset.get("ports").and_then(Value::as_array).into_iter().flatten() {
            let Some(number) = port.get("port").and_then(Value::as_u64) else {
                continue;
            };
            let name = port.get("name").and_then(Value::as_str).unwrap_or_default();
            for address in &addresses {
                members.push((name.to_string(), (*address).to_string(), number));
            }
        }
    }
    members
}

fn member_segment(address: &str, port: u64) -> String {
    format!("{}-{port}", address.replace(':', "."))
}

impl Reflector {
    pub(super) async fn service_event(&mut self, event: &KubeEvent) -> KubeResult<()> {
        let namespace = event.require_namespace()?.to_string();
        let name = event.require_name()?.to_string();
        if event.event_type == EventType::Deleted {
            if let Some(lb) = self.lookup("loadbalancer", &namespace, Kind::Service, &name) {
                self.remove_balancer(&lb).await?;
                info!("Service {namespace}/{name} removed");
            }
            return Ok(());
        }
        let spec = event.spec();
        let cluster_ip = spec.get("clusterIP").and_then(Value::as_str);
        if cluster_ip == Some("None") || spec.get("type").and_then(Value::as_str) == Some("ExternalName") {
            debug!("Service {namespace}/{name} has no virtual ip");
            return Ok(());
        }
        let lb_name = ClusterNames::instance(&name, event.require_uid()?);
        let lb = self
            .ensure_balancer(&namespace, Kind::Service, &name, &lb_name, cluster_ip)
            .await?;
        self.sync_listeners(&namespace, &lb, &lb_name, &service_listeners(spec))
            .await?;
        Ok(())
    }

    pub(super) async fn endpoints_event(&mut self, event: &KubeEvent) -> KubeResult<()> {
        let namespace = event.require_namespace()?.to_string();
        let name = event.require_name()?.to_string();
        let Some(lb) = self.lookup("loadbalancer", &namespace, Kind::Service, &name) else {
            debug!("Endpoints {namespace}/{name} have no balancer");
            return Ok(());
        };
        let wanted = if event.event_type == EventType::Deleted {
            Vec::new()
        } else {
            endpoint_members(&event.object)
        };
        for listener in self.referrers(&lb, "loadbalancer-listener") {
            for pool in self.referrers(&listener, "loadbalancer-pool") {
                let body = self.body(&pool)?;
                let port_name = annotation_value(&body, PORT_NAME).unwrap_or_default();
                let members: Vec<(String, u64)> = wanted
                    .iter()
                    .filter(|(name, _, _)| name == port_name)
                    .map(|(_, address, port)| (address.clone(), *port))
                    .collect();
                self.sync_members(&pool, &members).await?;
            }
        }
        Ok(())
    }

    pub(super) async fn ingress_event(&mut self, event: &KubeEvent) -> KubeResult<()> {
        let namespace = event.require_namespace()?.to_string();
        let name = event.require_name()?.to_string();
        if event.event_type == EventType::Deleted {
            if let Some(lb) = self.lookup("loadbalancer", &namespace, Kind::Ingress, &name) {
                self.remove_balancer(&lb).await?;
                info!("Ingress {namespace}/{name} removed");
            }
            return Ok(());
        }
        let lb_name = ClusterNames::instance(&name, event.require_uid()?);
        let lb = self
            .ensure_balancer(&namespace, Kind::Ingress, &name, &lb_name, None)
            .await?;
        let listeners = ingress_listeners(event.spec());
        let pools = self
            .sync_listeners(&namespace, &lb, &lb_name, &listeners)
            .await?;
        // members are the virtual ips of the backend services
        for (pool, spec) in pools {
            let Some((service, port)) = spec.port_name.rsplit_once(':') else {
                continue;
            };
            let port: u64 = port.parse().unwrap_or_default();
            let vip = self
                .lookup("loadbalancer", &namespace, Kind::Service, service)
                .and_then(|svc| self.body(&svc).ok())
                .and_then(|body| {
                    body.get("loadbalancer_properties")
                        .and_then(|v| v.get("vip_address"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            let members: Vec<(String, u64)> = vip.into_iter().map(|vip| (vip, port)).collect();
            self.sync_members(&pool, &members).await?;
        }
        Ok(())
    }

    /// The balancer named `lb_name` with its interface and vip, created when missing.
    async fn ensure_balancer(
        &self,
        namespace: &str,
        kind: Kind,
        name: &str,
        lb_name: &str,
        vip: Option<&str>,
    ) -> KubeResult<Uuid> {
        self.ensure_project(namespace).await?;
        let project = self.names.project(namespace);
        let fq = project.child(lb_name);
        if let Some(lb) = self.existing("loadbalancer", &fq) {
            return Ok(lb);
        }
        let network = self.names.service_network();
        let annotations = self.names.annotations(namespace, kind, name);
        let vmi = self
            .ensure(
                "virtual-machine-interface",
                &fq,
                Some("project"),
                obj(json!({
                    "display_name": name,
                    "annotations": annotations,
                    "virtual_network_refs": ref_to(&network),
                })),
            )
            .await?;
        let mut iip = obj(json!({
            "annotations": annotations,
            "virtual_network_refs": ref_to(&network),
            "virtual_machine_interface_refs": ref_uuid(&vmi),
        }));
        if let Some(vip) = vip.filter(|v| !v.is_empty()) {
            iip.insert("instance_ip_address".into(), json!(vip));
        }
        let iip = self
            .ensure("instance-ip", &FqName::new([lb_name]), None, iip)
            .await?;
        let iip = self.body(&iip)?;
        let lb = self
            .ensure(
                "loadbalancer",
                &fq,
                Some("project"),
                obj(json!({
                    "display_name": name,
                    "annotations": annotations,
                    "loadbalancer_provider": "native",
                    "loadbalancer_properties": {
                        "vip_address": iip.get("instance_ip_address"),
                        "vip_subnet_id": iip.get("subnet_uuid"),
                        "provisioning_status": "ACTIVE",
                        "operating_status": "ONLINE",
                        "admin_state": true,
                    },
                    "virtual_machine_interface_refs": ref_uuid(&vmi),
                })),
            )
            .await?;
        info!("{kind} {namespace}/{name} balanced by {lb}");
        Ok(lb)
    }

    /// Make a balancer's listeners and pools those of `wanted`. Returns the pools with their
    /// specs.
    async fn sync_listeners(
        &self,
        namespace: &str,
        lb: &Uuid,
        lb_name: &str,
        wanted: &[ListenerSpec],
    ) -> KubeResult<Vec<(Uuid, PoolSpec)>> {
        let project = self.names.project(namespace);
        let annotations = self.body(lb)?.get("annotations").cloned();
        let mut kept = Vec::new();
        let mut pools = Vec::new();
        for spec in wanted {
            let fq = project.child(format!("{lb_name}-{}", spec.segment));
            let props = json!({
                "protocol": spec.protocol,
                "protocol_port": spec.port,
                "admin_state": true,
            });
            let listener = match self.existing("loadbalancer-listener", &fq) {
                Some(listener) => {
                    let body = self.body(&listener)?;
                    if body.get("loadbalancer_listener_properties") != Some(&props) {
                        let mut patch = Map::new();
                        patch.insert("loadbalancer_listener_properties".into(), props);
                        self.patch("loadbalancer-listener", &listener, patch).await?;
                    }
                    listener
                }
                None => {
                    self.ensure(
                        "loadbalancer-listener",
                        &fq,
                        Some("project"),
                        obj(json!({
                            "annotations": annotations,
                            "loadbalancer_listener_properties": props,
                            "loadbalancer_refs": ref_uuid(lb),
                        })),
                    )
                    .await?
                }
            };
            kept.push(listener);

            let mut kept_pools = Vec::new();
            for pool_spec in &spec.pools {
                let mut pool_annotations = annotations
                    .as_ref()
                    .and_then(|a| a.get("key_value_pair"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                pool_annotations.push(json!({ "key": PORT_NAME, "value": pool_spec.port_name }));
                let pool = self
                    .ensure(
                        "loadbalancer-pool",
                        &project.child(format!("{lb_name}-{}", pool_spec.segment)),
                        Some("project"),
                        obj(json!({
                            "annotations": { "key_value_pair": pool_annotations },
                            "loadbalancer_pool_properties": {
                                "protocol": pool_spec.protocol,
                                "loadbalancer_method": "ROUND_ROBIN",
                                "admin_state": true,
                            },
                            "loadbalancer_listener_refs": ref_uuid(&listener),
                        })),
                    )
                    .await?;
                kept_pools.push(pool);
                pools.push((pool, pool_spec.clone()));
            }
            for stale in self.referrers(&listener, "loadbalancer-pool") {
                if !kept_pools.contains(&stale) {
                    self.remove_pool(&stale).await?;
                }
            }
        }
        for stale in self.referrers(lb, "loadbalancer-listener") {
            if !kept.contains(&stale) {
                self.remove_listener(&stale).await?;
            }
        }
        Ok(pools)
    }

    /// Make a pool's members exactly `wanted`, as `(address, port)`.
    async fn sync_members(&self, pool: &Uuid, wanted: &[(String, u64)]) -> KubeResult<()> {
        let pool_fq = self.api.db().fq_name(pool)?;
        let mut existing: BTreeMap<String, Uuid> = self
            .children(pool, "loadbalancer-member")
            .into_iter()
            .filter_map(|m| Some((self.api.db().fq_name(&m).ok()?.name().to_string(), m)))
            .collect();
        for (address, port) in wanted {
            let segment = member_segment(address, *port);
            if existing.remove(&segment).is_some() {
                continue;
            }
            self.ensure(
                "loadbalancer-member",
                &pool_fq.child(segment),
                Some("loadbalancer-pool"),
                obj(json!({
                    "loadbalancer_member_properties": {
                        "address": address,
                        "protocol_port": port,
                        "weight": 1,
                        "admin_state": true,
                    },
                })),
            )
            .await?;
        }
        for (segment, member) in existing {
            debug!("Pool {pool} drops member {segment}");
            self.remove("loadbalancer-member", &member).await?;
        }
        Ok(())
    }

    async fn remove_pool(&self, pool: &Uuid) -> KubeResult<()> {
        for member in self.children(pool, "loadbalancer-member") {
            self.remove("loadbalancer-member", &member).await?;
        }
        self.remove("loadbalancer-pool", pool).await
    }

    async fn remove_listener(&self, listener: &Uuid) -> KubeResult<()> {
        for pool in self.referrers(listener, "loadbalancer-pool") {
            self.remove_pool(&pool).await?;
        }
        self.remove("loadbalancer-listener", listener).await
    }

    /// Remove a balancer with its listeners, pools, members, interface and vip.
    async fn remove_balancer(&mut self, lb: &Uuid) -> KubeResult<()> {
        if !self.owned(lb) {
            return Ok(());
        }
        for listener in self.referrers(lb, "loadbalancer-listener") {
            self.remove_listener(&listener).await?;
        }
        let interfaces = self.referenced(lb, "virtual-machine-interface");
        self.remove("loadbalancer", lb).await?;
        for vmi in interfaces {
            self.remove_interface(&vmi).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn listeners_per_service_port() {
        let spec = json!({"ports": [
            {"name": "http", "port": 80, "protocol": "TCP", "targetPort": 8080},
            {"name": "dns", "port": 53, "protocol": "UDP"},
        ]});
        let listeners = service_listeners(&spec);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].segment, "tcp-80");
        assert_eq!(listeners[0].pools[0].port_name, "http");
        assert_eq!(listeners[1].protocol, "UDP");
        assert_eq!(listeners[1].pools[0].segment, "udp-53-pool");
    }

    #[test]
    fn ingress_backends_are_distinct() {
        let spec = json!({
            "defaultBackend": {"service": {"name": "web", "port": {"number": 80}}},
            "rules": [{"http": {"paths": [
                {"path": "/", "backend": {"service": {"name": "web", "port": {"number": 80}}}},
                {"path": "/api", "backend": {"service": {"name": "api", "port": {"number": 8080}}}},
                {"path": "/named", "backend": {"service": {"name": "api", "port": {"name": "http"}}}},
            ]}}],
            "tls": [{"hosts": ["example.org"]}],
        });
        assert_eq!(
            ingress_backends(&spec),
            vec![("web".to_string(), 80), ("api".to_string(), 8080)]
        );
        let listeners = ingress_listeners(&spec);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[1].protocol, "TERMINATED_HTTPS");
        assert_eq!(listeners[1].pools[1].segment, "https-api-8080");
        assert_eq!(listeners[1].pools[1].port_name, "api:8080");
    }

    #[test]
    fn members_from_subsets() {
        let endpoints = json!({"subsets": [{
            "addresses": [{"ip": "10.32.0.4"}, {"ip": "10.32.0.5"}],
            "ports": [{"name": "http", "port": 8080}],
        }]});
        assert_eq!(
            endpoint_members(&endpoints),
            vec![
                ("http".to_string(), "10.32.0.4".to_string(), 8080),
                ("http".to_string(), "10.32.0.5".to_string(), 8080),
            ]
        );
        assert_eq!(member_segment("fd00::5", 80), "fd00..5-80");
    }
}
