// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Start the API server in its own thread.

use crate::rest;
use crate::server::ApiServer;
use axum::Router;
use futures::future::BoxFuture;
use std::io::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::spawn;
use tracing::{debug, error, info};

/// What runs next to the REST listener.
#[derive(Default)]
pub struct LaunchExtras {
    /// Routes merged into the core ones, e.g. an adapter's.
    pub routes: Option<Router>,
    /// Long-lived tasks spawned once the server is ready.
    pub tasks: Vec<BoxFuture<'static, ()>>,
}

fn app(api: &Arc<ApiServer>, routes: Option<Router>) -> Router {
    let app = rest::router(api.clone());
    match routes {
        Some(routes) => app.merge(routes),
        None => app,
    }
}

/// Serve on an already bound listener until it fails. Used by the test server.
pub async fn serve(api: Arc<ApiServer>, listener: TcpListener, routes: Option<Router>) -> Result<(), Error> {
    let addr = listener.local_addr()?;
    api.set_base_url(&format!("http://{addr}"));
    info!("API server listening on {addr}");
    axum::serve(listener, app(&api, routes)).await
}

async fn run(api: Arc<ApiServer>, addr: SocketAddr, extras: LaunchExtras) -> Result<(), Error> {
    let bus = api.db().bus().clone();
    spawn(async move { bus.run_publisher().await });
    if let Err(e) = api.startup().await {
        error!("API server startup failed: {e}");
        return Err(Error::other(e.to_string()));
    }
    for task in extras.tasks {
        spawn(task);
    }
    info!("API server listening on {addr}");
    axum_server::bind(addr)
        .serve(app(&api, extras.routes).into_make_service())
        .await
}

/// Start the API thread: a single-threaded runtime running the message bus publisher, the
/// startup sequence, the extra tasks and the REST listener.
pub fn start_api(
    api: Arc<ApiServer>,
    extras: LaunchExtras,
) -> Result<std::thread::JoinHandle<()>, Error> {
    let addr = api.config().listen_addr();
    debug!("Will start REST listener on {addr}");
    std::thread::Builder::new()
        .name("api".to_string())
        .spawn(move || {
            debug!("Starting API server thread");
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Tokio runtime creation failed: {e}");
                    return;
                }
            };
            if let Err(e) = rt.block_on(run(api, addr, extras)) {
                error!("API server stopped: {e}");
            }
        })
}
