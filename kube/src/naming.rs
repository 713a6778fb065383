// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Names of everything the adapter creates, derived from the cluster configuration.

use crate::event::Kind;
use args::KubernetesConfig;
use config::FqName;
use serde_json::{Value, json};
use store::ANNOTATION_KEYS;

/// Network of the underlay.
pub const IP_FABRIC_NETWORK: &[&str] = &["default-domain", "default-project", "ip-fabric"];

/// Namespaces provisioned before any event arrives.
pub const SYSTEM_NAMESPACES: &[&str] = &["default", "kube-system"];

#[derive(Debug, Clone)]
pub struct ClusterNames {
    domain: String,
    cluster: String,
    owner: String,
    project: Option<String>,
    network: Option<FqName>,
}

impl ClusterNames {
    #[must_use]
    pub fn new(config: &KubernetesConfig) -> Self {
        Self {
            domain: config.cluster_domain.clone(),
            cluster: config.cluster_name.clone(),
            owner: config.cluster_owner.clone(),
            project: config.cluster_project.clone().filter(|p| !p.is_empty()),
            network: config
                .cluster_network
                .as_deref()
                .filter(|n| !n.is_empty())
                .map(|n| FqName::parse(n, None)),
        }
    }

    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Project name of a namespace: the configured cluster project if any, else one per
    /// namespace.
    #[must_use]
    pub fn project_name(&self, namespace: &str) -> String {
        match &self.project {
            Some(project) => project.clone(),
            None => format!("{}-{namespace}", self.cluster),
        }
    }

    #[must_use]
    pub fn project(&self, namespace: &str) -> FqName {
        FqName::new([self.domain.clone(), self.project_name(namespace)])
    }

    /// The project holding the cluster-wide networks and ipams.
    #[must_use]
    pub fn cluster_project(&self) -> FqName {
        self.project("default")
    }

    fn in_cluster_project(&self, suffix: &str) -> FqName {
        self.cluster_project().child(format!("{}-{suffix}", self.cluster).as_str())
    }

    #[must_use]
    pub fn pod_ipam(&self) -> FqName {
        self.in_cluster_project("pod-ipam")
    }

    #[must_use]
    pub fn service_ipam(&self) -> FqName {
        self.in_cluster_project("service-ipam")
    }

    #[must_use]
    pub fn ip_fabric_ipam(&self) -> FqName {
        self.in_cluster_project("ip-fabric-ipam")
    }

    #[must_use]
    pub fn pod_network(&self) -> FqName {
        self.in_cluster_project("default-pod-network")
    }

    #[must_use]
    pub fn service_network(&self) -> FqName {
        self.in_cluster_project("default-service-network")
    }

    /// The network pods of a nested cluster reach the underlay through, when configured.
    #[must_use]
    pub fn cluster_network(&self) -> Option<&FqName> {
        self.network.as_ref()
    }

    /// Pod network of an isolated namespace.
    #[must_use]
    pub fn namespace_pod_network(&self, namespace: &str) -> FqName {
        self.project(namespace)
            .child(format!("{}-{namespace}-pod-network", self.cluster).as_str())
    }

    /// Network reflecting a network attachment definition.
    #[must_use]
    pub fn attachment_network(&self, namespace: &str, name: &str) -> FqName {
        self.project(namespace)
            .child(format!("{}-{namespace}-{name}", self.cluster).as_str())
    }

    /// Name of the objects reflecting one pod or service instance.
    #[must_use]
    pub fn instance(name: &str, uid: &str) -> String {
        format!("{name}__{uid}")
    }

    /// Security group reflecting a network policy.
    #[must_use]
    pub fn policy_group(&self, namespace: &str, policy: &str) -> FqName {
        self.project(namespace)
            .child(format!("{}-{namespace}-{policy}", self.cluster).as_str())
    }

    /// The annotated fq-name of a reflected object, in [`ANNOTATION_KEYS`] order.
    #[must_use]
    pub fn annotated(&self, namespace: &str, kind: Kind, name: &str) -> Vec<String> {
        ANNOTATION_KEYS
            .iter()
            .map(|key| match *key {
                "project" => self.project_name(namespace),
                "cluster" => self.cluster.clone(),
                "owner" => self.owner.clone(),
                "kind" => kind.to_string(),
                _ => name.to_string(),
            })
            .collect()
    }

    /// The `annotations` property of a reflected object: its annotated fq-name plus the
    /// namespace.
    #[must_use]
    pub fn annotations(&self, namespace: &str, kind: Kind, name: &str) -> Value {
        let mut pairs: Vec<Value> = ANNOTATION_KEYS
            .iter()
            .zip(self.annotated(namespace, kind, name))
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        pairs.push(json!({ "key": "namespace", "value": namespace }));
        json!({ "key_value_pair": pairs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn names() -> ClusterNames {
        ClusterNames::new(&KubernetesConfig {
            cluster_name: "k8s".to_string(),
            ..KubernetesConfig::default()
        })
    }

    #[test]
    fn per_namespace_projects() {
        let names = names();
        assert_eq!(names.project("prod").to_string(), "default-domain:k8s-prod");
        assert_eq!(
            names.pod_network().to_string(),
            "default-domain:k8s-default:k8s-default-pod-network"
        );
        assert_eq!(
            names.service_ipam().to_string(),
            "default-domain:k8s-default:k8s-service-ipam"
        );
    }

    #[test]
    fn configured_project_holds_every_namespace() {
        let names = ClusterNames::new(&KubernetesConfig {
            cluster_project: Some("shared".to_string()),
            ..KubernetesConfig::default()
        });
        assert_eq!(names.project("a"), names.project("b"));
        assert_eq!(names.project("a").to_string(), "default-domain:shared");
    }

    #[test]
    fn annotations_index_like_the_store() {
        let names = names();
        let mut body = Map::new();
        body.insert("annotations".into(), names.annotations("prod", Kind::Pod, "web"));
        assert_eq!(
            store::annotated_fq_name(&body),
            Some(names.annotated("prod", Kind::Pod, "web"))
        );
    }
}
