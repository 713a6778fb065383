// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pods become a virtual machine with one interface and instance ip per network.
//!
//! In nested mode the pod's interfaces are sub-interfaces of the interface its node owns,
//! each with a vlan of the parent's space.

use super::network::{NETWORKS_ANNOTATION, requested_networks};
use super::{PodInfo, Reflector, obj, ref_to, ref_uuid, ref_uuids};
use crate::errors::{KubeError, KubeResult};
use crate::event::{EventType, Kind, KubeEvent};
use crate::naming::ClusterNames;
use config::FqName;
use id::Uuid;
use serde_json::{Value, json};
use store::ListQuery;
use tracing::{debug, info, warn};

fn vlan_tag(body: &serde_json::Map<String, Value>) -> u32 {
    body.get("virtual_machine_interface_properties")
        .and_then(|v| v.get("sub_interface_vlan_tag"))
        .and_then(Value::as_u64)
        .and_then(|t| u32::try_from(t).ok())
        .unwrap_or(0)
}

impl Reflector {
    pub(super) async fn pod_event(&mut self, event: &KubeEvent) -> KubeResult<()> {
        let namespace = event.require_namespace()?.to_string();
        let name = event.require_name()?.to_string();
        if event.event_type == EventType::Deleted {
            return self.pod_delete(&namespace, &name, event.uid()).await;
        }
        if event.spec().get("hostNetwork").and_then(Value::as_bool) == Some(true) {
            debug!("Pod {namespace}/{name} uses the host network");
            return Ok(());
        }
        let uid = event.require_uid()?.to_string();
        let key = (namespace.clone(), name.clone());

        if let Some(known) = self.pods.get_mut(&key) {
            if known.uid == uid {
                known.labels = event.labels();
                let interfaces = known.interfaces.clone();
                for vmi in &interfaces {
                    self.sync_groups(vmi).await?;
                }
                return Ok(());
            }
            let stale = known.uid.clone();
            debug!("Pod {namespace}/{name} was recreated");
            self.pod_delete(&namespace, &name, Some(&stale)).await?;
        }

        self.ensure_project(&namespace).await?;
        let instance = ClusterNames::instance(&name, &uid);
        let vm = self
            .ensure(
                "virtual-machine",
                &FqName::new([instance.clone()]),
                None,
                obj(json!({
                    "display_name": name,
                    "server_type": "container",
                    "annotations": self.names.annotations(&namespace, Kind::Pod, &name),
                })),
            )
            .await?;
        let parent = if self.config.nested_mode {
            Some(self.parent_interface(event)?)
        } else {
            None
        };

        let network = self.pod_network_of(&namespace);
        let mut interfaces = vec![
            self.pod_interface(&namespace, &name, &instance, &vm, &network, parent)
                .await?,
        ];
        if let Some(requested) = event.annotation(NETWORKS_ANNOTATION) {
            for (ns, net) in requested_networks(&namespace, requested) {
                let Some(network) = self.networks.get(&(ns.clone(), net.clone())).cloned() else {
                    warn!("Pod {namespace}/{name} asks for unknown network {ns}/{net}");
                    continue;
                };
                let iface = format!("{instance}-{net}");
                interfaces.push(
                    self.pod_interface(&namespace, &name, &iface, &vm, &network, parent)
                        .await?,
                );
            }
        }
        info!("Pod {namespace}/{name} reflected with {} interfaces", interfaces.len());
        self.pods.insert(
            key,
            PodInfo {
                uid,
                labels: event.labels(),
                interfaces: interfaces.clone(),
            },
        );
        for vmi in &interfaces {
            self.sync_groups(vmi).await?;
        }
        Ok(())
    }

    /// One interface of a pod and its instance ip, both named `iface`.
    async fn pod_interface(
        &mut self,
        namespace: &str,
        pod: &str,
        iface: &str,
        vm: &Uuid,
        network: &FqName,
        parent: Option<Uuid>,
    ) -> KubeResult<Uuid> {
        let fq = self.names.project(namespace).child(iface);
        let annotations = self.names.annotations(namespace, Kind::Pod, pod);
        let vmi = if let Some(vmi) = self.existing("virtual-machine-interface", &fq) {
            if let Some(parent) = parent {
                let tag = vlan_tag(&self.body(&vmi)?);
                if tag > 0 {
                    self.vlans.set(&parent, tag)?;
                }
            }
            vmi
        } else {
            let mut body = obj(json!({
                "display_name": pod,
                "annotations": annotations,
                "virtual_network_refs": ref_to(network),
                "virtual_machine_refs": ref_uuid(vm),
            }));
            let mut vlan = None;
            if let Some(parent) = parent {
                self.learn_vlans(&parent)?;
                let tag = self.vlans.alloc(&parent)?;
                body.insert(
                    "virtual_machine_interface_properties".into(),
                    json!({ "sub_interface_vlan_tag": tag }),
                );
                body.insert("virtual_machine_interface_refs".into(), ref_uuid(&parent));
                vlan = Some((parent, tag));
            }
            match self
                .ensure("virtual-machine-interface", &fq, Some("project"), body)
                .await
            {
                Ok(vmi) => vmi,
                Err(e) => {
                    if let Some((parent, tag)) = vlan {
                        self.vlans.reset(&parent, tag);
                    }
                    return Err(e);
                }
            }
        };
        self.ensure(
            "instance-ip",
            &FqName::new([iface]),
            None,
            obj(json!({
                "annotations": self.names.annotations(namespace, Kind::Pod, pod),
                "virtual_network_refs": ref_to(network),
                "virtual_machine_interface_refs": ref_uuid(&vmi),
            })),
        )
        .await?;
        Ok(vmi)
    }

    /// The interface of the node a nested pod runs on: the one holding the node's address.
    fn parent_interface(&self, event: &KubeEvent) -> KubeResult<Uuid> {
        let host_ip = event
            .object
            .pointer("/status/hostIP")
            .and_then(Value::as_str)
            .ok_or_else(|| KubeError::Malformed(event.describe(), "status.hostIP"))?;
        let query = ListQuery {
            resource_type: "instance-ip".to_string(),
            filters: vec![("instance_ip_address".to_string(), vec![json!(host_ip)])],
            ..ListQuery::default()
        };
        self.api
            .db()
            .list(&query)?
            .uuids
            .iter()
            .flat_map(|iip| self.referenced(iip, "virtual-machine-interface"))
            .find(|vmi| self.body(vmi).is_ok_and(|body| vlan_tag(&body) == 0))
            .ok_or_else(|| KubeError::Malformed(event.describe(), "a node interface for status.hostIP"))
    }

    /// Mark the vlans of a parent's existing sub-interfaces taken.
    fn learn_vlans(&mut self, parent: &Uuid) -> KubeResult<()> {
        for sub in self.referrers(parent, "virtual-machine-interface") {
            let tag = vlan_tag(&self.body(&sub)?);
            if tag > 0 {
                self.vlans.set(parent, tag)?;
            }
        }
        Ok(())
    }

    async fn pod_delete(&mut self, namespace: &str, name: &str, uid: Option<&str>) -> KubeResult<()> {
        let key = (namespace.to_string(), name.to_string());
        if self.pods.get(&key).is_some_and(|p| uid.is_none_or(|u| p.uid == u)) {
            self.pods.remove(&key);
        }
        let vm = uid
            .and_then(|uid| {
                self.existing(
                    "virtual-machine",
                    &FqName::new([ClusterNames::instance(name, uid)]),
                )
            })
            .or_else(|| self.lookup("virtual-machine", namespace, Kind::Pod, name));
        let Some(vm) = vm else {
            debug!("Pod {namespace}/{name} has nothing to remove");
            return Ok(());
        };
        if !self.owned(&vm) {
            return Ok(());
        }
        for vmi in self.referrers(&vm, "virtual-machine-interface") {
            self.remove_interface(&vmi).await?;
        }
        self.remove("virtual-machine", &vm).await?;
        info!("Pod {namespace}/{name} removed");
        Ok(())
    }

    /// Remove an interface with its instance ips, releasing its vlan.
    pub(super) async fn remove_interface(&mut self, vmi: &Uuid) -> KubeResult<()> {
        for iip in self.referrers(vmi, "instance-ip") {
            self.remove("instance-ip", &iip).await?;
        }
        if let Ok(body) = self.body(vmi) {
            let tag = vlan_tag(&body);
            if let Some(parent) = ref_uuids(&body, "virtual_machine_interface_refs").first()
                && tag > 0
            {
                self.vlans.reset(parent, tag);
            }
        }
        self.remove("virtual-machine-interface", vmi).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn vlan_tag_of_interface() {
        let body = obj(json!({
            "virtual_machine_interface_properties": {"sub_interface_vlan_tag": 12}
        }));
        assert_eq!(vlan_tag(&body), 12);
        assert_eq!(vlan_tag(&serde_json::Map::new()), 0);
    }
}
