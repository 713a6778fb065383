// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};
use thiserror::Error;

/// How requests are authorized.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AaaMode {
    #[default]
    NoAuth,
    CloudAdmin,
    Rbac,
}

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Cannot read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Cannot parse configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Parameters of the container orchestrator adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Run the adapter at all.
    pub enabled: bool,
    pub api_server: String,
    pub api_port: u16,
    pub service_subnets: Vec<IpNet>,
    pub pod_subnets: Vec<IpNet>,
    pub ip_fabric_subnets: Vec<IpNet>,
    pub cluster_domain: String,
    pub cluster_owner: String,
    pub cluster_name: String,
    pub cluster_project: Option<String>,
    pub cluster_network: Option<String>,
    pub nested_mode: bool,
    pub ip_fabric_forwarding: bool,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_server: "localhost".to_string(),
            api_port: 8080,
            service_subnets: Vec::new(),
            pod_subnets: Vec::new(),
            ip_fabric_subnets: Vec::new(),
            cluster_domain: "default-domain".to_string(),
            cluster_owner: "k8s".to_string(),
            cluster_name: "k8s".to_string(),
            cluster_project: None,
            cluster_network: None,
            nested_mode: false,
            ip_fabric_forwarding: false,
        }
    }
}

/// The server configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerConfig {
    pub listen_ip_addr: IpAddr,
    pub listen_port: u16,
    pub max_request_size: usize,
    pub rabbit_server: String,
    pub rabbit_port: u16,
    pub rabbit_vhost: String,
    pub rabbit_max_pending_updates: usize,
    pub cassandra_server_list: Vec<String>,
    pub db_engine: String,
    pub zk_server_ip: String,
    pub cluster_id: String,
    pub aaa_mode: AaaMode,
    pub cloud_admin_role: String,
    pub global_read_only_role: Option<String>,
    pub object_cache_entries: usize,
    pub object_cache_exclude_types: Vec<String>,
    pub max_requests: u64,
    pub enable_fabric_ansible: bool,
    pub fabric_ansible_conf_file: Vec<String>,
    pub fabric_ansible_dir: String,
    pub paginate_count: usize,
    pub acl_direction_comp: bool,
    pub logical_routers_enabled: bool,
    pub apply_subnet_host_routes: bool,
    pub strict_compliance: bool,
    pub neutron_shared_compat: bool,
    pub zk_lock_timeout_secs: u64,
    pub auth_token_cache_secs: u64,
    pub bgpaas_port_start: u16,
    pub bgpaas_port_end: u16,
    pub worker_id: u32,
    pub kubernetes: KubernetesConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 8082,
            max_request_size: 1024 * 1024,
            rabbit_server: "localhost".to_string(),
            rabbit_port: 5672,
            rabbit_vhost: "/".to_string(),
            rabbit_max_pending_updates: 4096,
            cassandra_server_list: vec!["127.0.0.1:9160".to_string()],
            db_engine: "cassandra".to_string(),
            zk_server_ip: "127.0.0.1:2181".to_string(),
            cluster_id: String::new(),
            aaa_mode: AaaMode::NoAuth,
            cloud_admin_role: "admin".to_string(),
            global_read_only_role: None,
            object_cache_entries: 10_000,
            object_cache_exclude_types: Vec::new(),
            max_requests: 1024,
            enable_fabric_ansible: false,
            fabric_ansible_conf_file: Vec::new(),
            fabric_ansible_dir: "/opt/contrail/fabric_ansible_playbooks".to_string(),
            paginate_count: 256,
            acl_direction_comp: true,
            logical_routers_enabled: true,
            apply_subnet_host_routes: false,
            strict_compliance: false,
            neutron_shared_compat: false,
            zk_lock_timeout_secs: 5,
            auth_token_cache_secs: 10,
            bgpaas_port_start: 50_000,
            bgpaas_port_end: 50_512,
            worker_id: 0,
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigFileError::Io(path.to_path_buf(), e))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigFileError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigFileError> {
        if self.listen_port == 0 {
            return Err(ConfigFileError::Invalid(
                "listen_port",
                "port 0 is not allowed".to_string(),
            ));
        }
        if self.bgpaas_port_start > self.bgpaas_port_end {
            return Err(ConfigFileError::Invalid(
                "bgpaas_port_start",
                format!(
                    "start {} is above end {}",
                    self.bgpaas_port_start, self.bgpaas_port_end
                ),
            ));
        }
        if self.paginate_count == 0 {
            return Err(ConfigFileError::Invalid(
                "paginate_count",
                "must be positive".to_string(),
            ));
        }
        if self.max_request_size == 0 {
            return Err(ConfigFileError::Invalid(
                "max_request_size",
                "must be positive".to_string(),
            ));
        }
        if self.rabbit_max_pending_updates == 0 {
            return Err(ConfigFileError::Invalid(
                "rabbit_max_pending_updates",
                "must be positive".to_string(),
            ));
        }
        let k8s = &self.kubernetes;
        for (name, subnets) in [
            ("kubernetes.service_subnets", &k8s.service_subnets),
            ("kubernetes.pod_subnets", &k8s.pod_subnets),
            ("kubernetes.ip_fabric_subnets", &k8s.ip_fabric_subnets),
        ] {
            if let Some(net) = subnets.iter().find(|net| net.trunc() != **net) {
                return Err(ConfigFileError::Invalid(
                    name,
                    format!("{net} has host bits set"),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip_addr, self.listen_port)
    }

    /// Prefix of every coordination service path.
    #[must_use]
    pub fn cluster_prefix(&self) -> String {
        if self.cluster_id.is_empty() {
            String::new()
        } else {
            format!("/{}", self.cluster_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn defaults() {
        let config = ServerConfig::from_yaml_str("").expect("Should parse");
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_port, 8082);
        assert_eq!(config.aaa_mode, AaaMode::NoAuth);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file() {
        let yaml = "
listen_port: 9000
aaa_mode: cloud-admin
strict_compliance: true
kubernetes:
  cluster_name: prod
  pod_subnets: [10.32.0.0/12]
";
        let config = ServerConfig::from_yaml_str(yaml).expect("Should parse");
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.aaa_mode, AaaMode::CloudAdmin);
        assert!(config.strict_compliance);
        assert_eq!(config.kubernetes.cluster_name, "prod");
        assert_eq!(config.kubernetes.cluster_owner, "k8s");
        assert_eq!(config.kubernetes.pod_subnets.len(), 1);
        assert_eq!(config.paginate_count, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_values() {
        let config = ServerConfig::from_yaml_str("bgpaas_port_start: 60000\nbgpaas_port_end: 50000")
            .expect("Should parse");
        assert!(matches!(
            config.validate(),
            Err(ConfigFileError::Invalid("bgpaas_port_start", _))
        ));
        let config = ServerConfig::from_yaml_str("paginate_count: 0").expect("Should parse");
        assert!(config.validate().is_err());
        let config = ServerConfig::from_yaml_str("kubernetes:\n  service_subnets: [10.96.0.1/12]")
            .expect("Should parse");
        assert!(config.validate().is_err());
        assert!(ServerConfig::from_yaml_str("listen_port: nope").is_err());
        assert!(ServerConfig::from_yaml_str("aaa_mode: everyone").is_err());
    }

    #[test]
    fn aaa_mode_names() {
        assert_eq!(AaaMode::from_str("rbac"), Ok(AaaMode::Rbac));
        assert_eq!(AaaMode::CloudAdmin.to_string(), "cloud-admin");
        assert!(AaaMode::from_str("admin").is_err());
    }
}
