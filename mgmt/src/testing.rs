// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! An in-process server for tests: in-memory store, coordinator and address manager, no
//! authentication, default resources seeded.

use crate::context::RequestContext;
use crate::pipeline::Outcome;
use crate::server::{ApiServer, ApiServerParamsBuilder};
use args::ServerConfig;
use config::{ApiError, ApiResult};
use coord::Coordinator;
use id::Uuid;
use serde_json::{Map, Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use store::Backend;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub api: Arc<ApiServer>,
    publisher: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.publisher.abort();
    }
}

impl TestServer {
    /// A seeded server with the default configuration. Must be called within a tokio runtime.
    pub async fn new() -> ApiResult<Self> {
        Self::with_config(ServerConfig::default()).await
    }

    pub async fn with_config(config: ServerConfig) -> ApiResult<Self> {
        Self::start(ApiServerParamsBuilder::default().config(config)).await
    }

    /// A server over existing coordination and row state, as after a restart.
    pub async fn restarted(
        coord: Arc<dyn Coordinator>,
        backend: Arc<dyn Backend>,
    ) -> ApiResult<Self> {
        Self::start(
            ApiServerParamsBuilder::default()
                .coord(coord)
                .backend(backend),
        )
        .await
    }

    async fn start(params: ApiServerParamsBuilder) -> ApiResult<Self> {
        let params = params
            .build()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let api = ApiServer::new(params);
        let bus = api.db().bus().clone();
        let publisher = tokio::spawn(async move { bus.run_publisher().await });
        api.startup().await?;
        Ok(Self { api, publisher })
    }

    /// Serve the REST surface on an ephemeral local port.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::launch::serve(api, listener, None).await {
                tracing::error!("Test listener stopped: {e}");
            }
        });
        Ok(addr)
    }

    /// A context with system privileges.
    #[must_use]
    pub fn ctx(&self) -> RequestContext {
        RequestContext::internal().with_request_id("test")
    }

    /// Create `resource_type` from a body given as JSON, returning the new id.
    pub async fn create(&self, resource_type: &str, body: Value) -> ApiResult<Uuid> {
        let Value::Object(body) = body else {
            return Err(ApiError::bad_request("body must be an object"));
        };
        let outcome: Outcome = self.api.create(&self.ctx(), resource_type, body).await?;
        outcome
            .uuid()
            .ok_or_else(|| ApiError::Internal("create returned no id".to_string()))
    }

    /// A project under the default domain.
    pub async fn project(&self, name: &str) -> ApiResult<Uuid> {
        self.create(
            "project",
            json!({ "fq_name": ["default-domain", name], "parent_type": "domain" }),
        )
        .await
    }

    /// A network in `project` with one IPv4 subnet on the default ipam.
    pub async fn network(&self, project: &str, name: &str, cidr: &str) -> ApiResult<Uuid> {
        let (prefix, len) = cidr
            .split_once('/')
            .ok_or_else(|| ApiError::bad_request(format!("{cidr} is not a prefix")))?;
        let len: u32 = len
            .parse()
            .map_err(|_| ApiError::bad_request(format!("{cidr} is not a prefix")))?;
        self.create(
            "virtual-network",
            json!({
                "fq_name": ["default-domain", project, name],
                "parent_type": "project",
                "network_ipam_refs": [{
                    "to": ["default-domain", "default-project", "default-network-ipam"],
                    "attr": {"ipam_subnets": [{"subnet": {"ip_prefix": prefix, "ip_prefix_len": len}}]}
                }]
            }),
        )
        .await
    }

    /// The stored body of a resource.
    pub fn body(&self, uuid: &Uuid) -> ApiResult<Map<String, Value>> {
        self.api.db().read(uuid, &store::ReadOptions::shallow())
    }
}
