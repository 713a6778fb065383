// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command line and configuration file of the API server.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

mod server;

pub use clap::Parser;
pub use server::{AaaMode, ConfigFileError, KubernetesConfig, ServerConfig};

use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "vnc-api-server")]
#[command(version = "1.0")]
#[command(about = "Configuration API server of the virtual network controller", long_about = None)]
#[allow(clippy::struct_excessive_bools)]
pub struct CmdArgs {
    #[arg(
        long,
        value_name = "YAML file",
        help = "Server configuration file; built-in defaults apply when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "IP:PORT",
        help = "Address to listen for REST requests, overriding listen_ip_addr and listen_port"
    )]
    listen: Option<SocketAddr>,

    #[arg(
        long,
        value_name = "N",
        help = "Worker id of this process; worker 0 seeds default resources"
    )]
    worker_id: Option<u32>,

    /// Prometheus metrics server bind address
    #[arg(
        long,
        value_name = "Metrics Address and Port",
        default_value_t = SocketAddr::from(([127, 0, 0, 1], 9090)),
        help = "Bind address and port for Prometheus metrics HTTP endpoint"
    )]
    metrics_address: SocketAddr,

    #[arg(
        long,
        default_value_t = false,
        help = "Show the available tracing tags and exit"
    )]
    show_tracing_tags: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Show configurable tracing targets and exit"
    )]
    show_tracing_targets: bool,

    #[arg(long, help = "generate tracing configuration as a string and exit")]
    tracing_config_generate: bool,

    #[arg(
        long,
        value_name = "tracing configuration",
        help = "Tracing config string as comma-separated sequence of tag=level, with level one in [off,error,warn,info,debug,trace].
Passing default=level sets the default log-level.
Passing all=level allows setting the log-level of all targets to level.
E.g. default=error,all=info,pipeline=debug will set the default target to error, and all the registered targets to info, but enable debug for the request pipeline"
    )]
    tracing: Option<String>,
}

impl CmdArgs {
    pub fn show_tracing_tags(&self) -> bool {
        self.show_tracing_tags
    }
    pub fn show_tracing_targets(&self) -> bool {
        self.show_tracing_targets
    }
    pub fn tracing_config_generate(&self) -> bool {
        self.tracing_config_generate
    }
    pub fn tracing(&self) -> Option<&String> {
        self.tracing.as_ref()
    }
    pub fn metrics_address(&self) -> SocketAddr {
        self.metrics_address
    }

    /// Load the configuration file, apply command line overrides and validate the result.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigFileError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_ip_addr = listen.ip();
            config.listen_port = listen.port();
        }
        if let Some(worker_id) = self.worker_id {
            config.worker_id = worker_id;
        }
        config.validate()?;
        debug!("Server configuration: {config:?}");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn listen_override() {
        let args = CmdArgs::try_parse_from([
            "vnc-api-server",
            "--listen",
            "127.0.0.1:9100",
            "--worker-id",
            "3",
        ])
        .expect("Should parse");
        let config = args.server_config().expect("Should be valid");
        assert_eq!(config.listen_addr(), SocketAddr::from(([127, 0, 0, 1], 9100)));
        assert_eq!(config.worker_id, 3);
    }

    #[test]
    fn missing_config_file() {
        let args = CmdArgs::try_parse_from(["vnc-api-server", "--config", "/nonexistent.yaml"])
            .expect("Should parse");
        assert!(matches!(
            args.server_config(),
            Err(ConfigFileError::Io(_, _))
        ));
    }
}
