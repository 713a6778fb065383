// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network attachment definitions become networks pods may attach extra interfaces to.

use super::{Reflector, obj, subnet};
use crate::errors::{KubeError, KubeResult};
use crate::event::{EventType, Kind, KubeEvent};
use config::FqName;
use ipnet::IpNet;
use serde_json::json;
use tracing::debug;

pub(super) const CIDR_ANNOTATION: &str = "opencontrail.org/cidr";

/// Networks a pod asks for: `name` or `namespace/name`, comma separated.
pub(super) const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// The default ipam, which carries user-defined subnets.
const DEFAULT_IPAM: &[&str] = &["default-domain", "default-project", "default-network-ipam"];

/// Parse the networks a pod asks for, relative to its namespace.
pub(super) fn requested_networks(namespace: &str, value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| match n.split_once('/') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (namespace.to_string(), n.to_string()),
        })
        .collect()
}

impl Reflector {
    pub(super) async fn network_event(&mut self, event: &KubeEvent) -> KubeResult<()> {
        let namespace = event.require_namespace()?.to_string();
        let name = event.require_name()?.to_string();
        let fq = self.names.attachment_network(&namespace, &name);
        if event.event_type == EventType::Deleted {
            self.networks.remove(&(namespace, name));
            if let Some(vn) = self.existing("virtual-network", &fq)
                && self.owned(&vn)
            {
                self.remove("virtual-network", &vn).await?;
            }
            return Ok(());
        }

        let cidr: IpNet = event
            .annotation(CIDR_ANNOTATION)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| KubeError::Malformed(event.describe(), "a valid opencontrail.org/cidr"))?;
        self.ensure_project(&namespace).await?;
        self.ensure(
            "virtual-network",
            &fq,
            Some("project"),
            obj(json!({
                "display_name": name,
                "network_ipam_refs": [{
                    "to": FqName::new(DEFAULT_IPAM.iter().copied()),
                    "attr": { "ipam_subnets": [subnet(&cidr)] },
                }],
                "annotations": self.names.annotations(&namespace, Kind::Network, &name),
            })),
        )
        .await?;
        debug!("Attachment network {fq} on {cidr}");
        self.networks.insert((namespace, name), fq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn requested_networks_are_namespaced() {
        assert_eq!(
            requested_networks("prod", "blue, infra/red,"),
            vec![
                ("prod".to_string(), "blue".to_string()),
                ("infra".to_string(), "red".to_string())
            ]
        );
    }
}
