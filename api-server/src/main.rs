// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]
#![allow(rustdoc::missing_crate_level_docs)]

mod statistics;

use crate::statistics::MetricsServer;

use args::{CmdArgs, Parser};
use color_eyre::eyre::{WrapErr, eyre};
use mgmt::launch::{LaunchExtras, start_api};
use mgmt::{ApiServer, ApiServerParamsBuilder};
use neutron::NeutronPlugin;
use std::sync::Arc;
use tracectl::{custom_target, get_trace_ctl, install_error_reporting, trace_target};
use tracing::{error, info, level_filters::LevelFilter};

trace_target!("api-server", LevelFilter::INFO, &[]);

fn init_logging() {
    let tctl = get_trace_ctl();
    tctl.set_default_level(LevelFilter::INFO);
    custom_target!("hyper", LevelFilter::ERROR, &[]);
    custom_target!("reqwest", LevelFilter::ERROR, &[]);
}

fn main() -> color_eyre::Result<()> {
    install_error_reporting()?;
    let args = CmdArgs::parse();
    init_logging();
    if let Some(tracing) = args.tracing() {
        get_trace_ctl()
            .setup_from_string(tracing)
            .wrap_err("Invalid tracing configuration")?;
    }
    if args.show_tracing_tags() {
        get_trace_ctl().dump_targets_by_tag();
        std::process::exit(0);
    }
    if args.show_tracing_targets() {
        get_trace_ctl().dump();
        std::process::exit(0);
    }
    if args.tracing_config_generate() {
        info!("{}", get_trace_ctl().as_config_string());
        std::process::exit(0);
    }

    let config = args
        .server_config()
        .wrap_err("Bad server configuration")?;
    info!(
        "Starting API server worker {} on {}",
        config.worker_id,
        config.listen_addr()
    );

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        if stop_tx.send(()).is_err() {
            error!("Stop signal dropped");
        }
    })
    .wrap_err("Failed to set the signal handler")?;

    MetricsServer::new(args.metrics_address()).wrap_err("Failed to start the metrics server")?;

    let params = ApiServerParamsBuilder::default()
        .config(config)
        .build()
        .map_err(|e| eyre!("Bad server parameters: {e}"))?;
    let api = ApiServer::new(params);

    let mut extras = LaunchExtras {
        routes: Some(neutron::router(Arc::new(NeutronPlugin::new(api.clone())))),
        tasks: Vec::new(),
    };
    if api.config().kubernetes.enabled {
        info!(
            "Reflecting orchestrator {}:{}",
            api.config().kubernetes.api_server,
            api.config().kubernetes.api_port
        );
        extras.tasks = kube::tasks(api.clone()).wrap_err("Orchestrator adapter setup failed")?;
    }
    start_api(api, extras).wrap_err("Failed to start the API server")?;

    stop_rx.recv().wrap_err("Failed to receive the stop signal")?;
    info!("Shutting down API server");
    Ok(())
}
