// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::thread::JoinHandle;
use tracing::{error, info};

use tracectl::trace_target;
trace_target!("stats-server", LevelFilter::INFO, &[]);

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}

/// Serves the request counters of the API server on `/metrics`.
#[derive(Debug)]
pub struct MetricsServer {
    #[allow(unused)]
    handle: JoinHandle<()>,
}

impl MetricsServer {
    /// Install the recorder and start the exporter thread.
    pub fn new(addr: SocketAddr) -> std::io::Result<Self> {
        let recorder = PrometheusBuilder::new()
            .install_recorder()
            .map_err(std::io::Error::other)?;
        let handle = std::thread::Builder::new()
            .name("metrics-server".to_string())
            .spawn(move || {
                info!("Starting metrics server thread");
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Runtime creation failed for metrics server: {e}");
                        return;
                    }
                };
                rt.block_on(Self::run(addr, recorder));
            })?;
        Ok(Self { handle })
    }

    async fn run(addr: SocketAddr, recorder: PrometheusHandle) {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(recorder);
        info!("Metrics server listening on {addr}");
        if let Err(e) = axum_server::bind(addr).serve(app.into_make_service()).await {
            error!("Metrics server error: {e}");
        }
    }
}
