// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Namespaces become projects; isolated namespaces also get a pod network of their own.

use super::{NamespaceInfo, Reflector, obj, ref_to};
use crate::errors::KubeResult;
use crate::event::{EventType, Kind, KubeEvent};
use crate::naming::SYSTEM_NAMESPACES;
use config::FqName;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

pub(super) const ISOLATION_ANNOTATION: &str = "opencontrail.org/isolation";
pub(super) const NETWORK_ANNOTATION: &str = "opencontrail.org/network";

/// A network named by annotation, as `{"domain": .., "project": .., "name": ..}`.
fn custom_network(value: &str) -> Option<FqName> {
    let value: Value = serde_json::from_str(value).ok()?;
    let part = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    Some(FqName::new([part("domain")?, part("project")?, part("name")?]))
}

impl Reflector {
    pub(super) async fn namespace_event(&mut self, event: &KubeEvent) -> KubeResult<()> {
        let name = event.require_name()?.to_string();
        if event.event_type == EventType::Deleted {
            return self.namespace_delete(&name).await;
        }
        self.ensure_project(&name).await?;

        let network = if let Some(custom) = event.annotation(NETWORK_ANNOTATION) {
            let fq = custom_network(custom);
            if fq.is_none() {
                warn!("Namespace {name}: ignoring malformed {NETWORK_ANNOTATION} {custom}");
            }
            fq
        } else if event.annotation(ISOLATION_ANNOTATION) == Some("true") {
            let fq = self.names.namespace_pod_network(&name);
            self.ensure(
                "virtual-network",
                &fq,
                Some("project"),
                obj(json!({
                    "display_name": format!("{name}-pod-network"),
                    "network_ipam_refs": ref_to(&self.names.pod_ipam()),
                    "address_allocation_mode": "flat-subnet-only",
                    "annotations": self.names.annotations(&name, Kind::Namespace, &name),
                })),
            )
            .await?;
            Some(fq)
        } else {
            None
        };
        if let Some(network) = &network {
            debug!("Pods of namespace {name} attach to {network}");
        }
        self.namespaces.insert(name, NamespaceInfo { network });
        Ok(())
    }

    async fn namespace_delete(&mut self, name: &str) -> KubeResult<()> {
        self.namespaces.remove(name);
        let isolated = self.names.namespace_pod_network(name);
        if let Some(vn) = self.existing("virtual-network", &isolated)
            && self.owned(&vn)
        {
            self.remove("virtual-network", &vn).await?;
        }
        if self.config.cluster_project.is_some() || SYSTEM_NAMESPACES.contains(&name) {
            return Ok(());
        }
        let Some(project) = self.existing("project", &self.names.project(name)) else {
            return Ok(());
        };
        if !self.owned(&project) {
            debug!("Namespace {name}: project is not ours, keeping it");
            return Ok(());
        }
        match self.remove("project", &project).await {
            Ok(()) => info!("Namespace {name} removed"),
            Err(e) => warn!("Namespace {name}: keeping its project: {e}"),
        }
        Ok(())
    }

    /// The network pods of `namespace` attach to.
    pub(super) fn pod_network_of(&self, namespace: &str) -> FqName {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.network.clone())
            .unwrap_or_else(|| self.names.pod_network())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn custom_network_annotation() {
        assert_eq!(
            custom_network(r#"{"domain": "d", "project": "p", "name": "vn"}"#),
            Some(FqName::new(["d", "p", "vn"]))
        );
        assert_eq!(custom_network(r#"{"domain": "d", "name": "vn"}"#), None);
        assert_eq!(custom_network("vn"), None);
    }
}
