// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The API server object: every collaborator a request may touch.

use crate::addrmgr::AddressManager;
use crate::cache::ObjectCache;
use crate::context::RequestContext;
use crate::hooks::{HookTable, TypeHooks};
use crate::pipeline::undo::IdPool;
use args::ServerConfig;
use config::{ApiError, ApiResult, FqName, registry};
use coord::{Coordinator, MemCoordinator};
use derive_builder::Builder;
use id::Uuid;
use idalloc::{AllocError, IdAllocator, IdAllocators, SG_RESERVED_OWNER};
use parking_lot::RwLock;
use perms::{AuthService, Identity, PermEngine, QuotaCounters, RbacRule};
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use store::{Backend, ConfigDb, ListQuery, MemBackend, MessageBus, ReadOptions, UserAgentKv};
use tracing::{info, warn};

/// Parameters of an [`ApiServer`]. N.B. we derive a builder type `ApiServerParamsBuilder`.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ApiServerParams {
    #[builder(default)]
    pub config: ServerConfig,

    /// Coordination service; an in-memory one when not given.
    #[builder(setter(strip_option), default)]
    pub coord: Option<Arc<dyn Coordinator>>,

    /// Row persistence; in-memory when not given. Stored rows are loaded by `startup`.
    #[builder(setter(strip_option), default)]
    pub backend: Option<Arc<dyn Backend>>,

    /// Token validation; required when the auth mode is not no-auth.
    #[builder(setter(strip_option), default)]
    pub auth: Option<Arc<dyn AuthService>>,

    /// Prefix of every href, e.g. `http://10.0.0.1:8082`.
    #[builder(setter(into), default = "http://127.0.0.1:8082".to_string())]
    pub base_url: String,
}

/// An allocator picked from an [`IdPool`].
pub enum PoolRef<'a> {
    Fixed(&'a IdAllocator),
    Shared(Arc<IdAllocator>),
}

impl Deref for PoolRef<'_> {
    type Target = IdAllocator;
    fn deref(&self) -> &IdAllocator {
        match self {
            PoolRef::Fixed(a) => a,
            PoolRef::Shared(a) => a,
        }
    }
}

pub struct ApiServer {
    config: ServerConfig,
    db: Arc<ConfigDb>,
    coord: Arc<dyn Coordinator>,
    ids: IdAllocators,
    perms: PermEngine,
    quota: QuotaCounters,
    auth: Option<Arc<dyn AuthService>>,
    addrmgr: AddressManager,
    cache: ObjectCache,
    useragent: UserAgentKv,
    hooks: HookTable,
    base_url: RwLock<String>,
    jobs: AtomicU64,
    requests: AtomicU64,
}

impl ApiServer {
    #[must_use]
    pub fn new(params: ApiServerParams) -> Arc<Self> {
        let config = params.config;
        let coord = params
            .coord
            .unwrap_or_else(|| Arc::new(MemCoordinator::new()));
        let prefix = config.cluster_prefix();
        let bus = Arc::new(MessageBus::new(config.rabbit_max_pending_updates * 4));
        let backend = params
            .backend
            .unwrap_or_else(|| Arc::new(MemBackend::new()));
        Arc::new(Self {
            db: Arc::new(ConfigDb::with_backend(bus, backend)),
            ids: IdAllocators::new(
                coord.clone(),
                &prefix,
                (config.bgpaas_port_start, config.bgpaas_port_end),
            ),
            perms: PermEngine::new(
                config.aaa_mode,
                config.cloud_admin_role.clone(),
                config.global_read_only_role.clone(),
            ),
            quota: QuotaCounters::new(
                coord.clone(),
                &prefix,
                Duration::from_secs(config.zk_lock_timeout_secs),
            ),
            auth: params.auth,
            addrmgr: AddressManager::new(),
            cache: ObjectCache::new(
                config.object_cache_entries,
                &config.object_cache_exclude_types,
            ),
            useragent: UserAgentKv::new(),
            hooks: HookTable::new(),
            base_url: RwLock::new(params.base_url.trim_end_matches('/').to_string()),
            jobs: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            coord,
            config,
        })
    }

    /// Load the stored resources and rebuild allocator state. Worker 0 also reclaims ids whose
    /// owner is gone and plants the default resources.
    pub async fn startup(&self) -> ApiResult<()> {
        self.db.load()?;
        self.ids.resync().await?;
        if self.config.worker_id == 0 {
            self.reclaim_stale_ids().await?;
            crate::seed::run(self).await?;
        }
        info!(
            "API server ready ({} resources, aaa-mode {})",
            self.db.len(),
            self.perms.mode()
        );
        Ok(())
    }

    /// Free the ids of the fixed spaces held by resources that do not exist anymore.
    async fn reclaim_stale_ids(&self) -> Result<(), AllocError> {
        let spaces: [(&IdAllocator, &[&str]); 6] = [
            (&self.ids.vn, &["virtual-network"]),
            (&self.ids.sg, &["security-group"]),
            (&self.ids.route_target, &["routing-instance", "logical-router"]),
            (&self.ids.tag_type, &["tag-type"]),
            (&self.ids.vpg, &["virtual-port-group"]),
            (&self.ids.bgpaas_port, &["bgp-as-a-service"]),
        ];
        for (allocator, owner_types) in spaces {
            let reclaimed = allocator
                .prune(|owner| {
                    let fq = FqName::parse(owner, None);
                    owner == SG_RESERVED_OWNER
                        || owner_types
                            .iter()
                            .any(|ty| self.db.uuid_of(ty, &fq).is_ok())
                })
                .await?;
            if !reclaimed.is_empty() {
                info!("Reclaimed {} stale id(s) of {}", reclaimed.len(), allocator.what());
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
    #[must_use]
    pub fn db(&self) -> &Arc<ConfigDb> {
        &self.db
    }
    #[must_use]
    pub fn coord(&self) -> &Arc<dyn Coordinator> {
        &self.coord
    }
    #[must_use]
    pub fn ids(&self) -> &IdAllocators {
        &self.ids
    }
    #[must_use]
    pub fn perms(&self) -> &PermEngine {
        &self.perms
    }
    #[must_use]
    pub fn quota(&self) -> &QuotaCounters {
        &self.quota
    }
    #[must_use]
    pub fn auth(&self) -> Option<&Arc<dyn AuthService>> {
        self.auth.as_ref()
    }
    #[must_use]
    pub fn addrmgr(&self) -> &AddressManager {
        &self.addrmgr
    }
    #[must_use]
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }
    #[must_use]
    pub fn useragent(&self) -> &UserAgentKv {
        &self.useragent
    }
    #[must_use]
    pub fn hooks(&self, resource_type: &str) -> &dyn TypeHooks {
        self.hooks.get(resource_type)
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url.read().clone()
    }

    /// Change the href prefix, e.g. once the listener knows its port.
    pub fn set_base_url(&self, base_url: &str) {
        *self.base_url.write() = base_url.trim_end_matches('/').to_string();
    }

    #[must_use]
    pub fn href(&self, resource_type: &str, uuid: &Uuid) -> String {
        format!("{}/{resource_type}/{uuid}", self.base_url.read())
    }

    /// How long to wait for a named lock of the coordination service.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.config.zk_lock_timeout_secs)
    }

    #[must_use]
    pub fn next_job_id(&self) -> u64 {
        self.jobs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a served request, warning once the recycle threshold is crossed.
    pub fn note_request(&self) -> u64 {
        let served = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if served == self.config.max_requests {
            warn!("Served {served} requests, worker is due for recycling");
        }
        served
    }

    /// Refuse state changes while the bus is backed up or the coordination service is gone.
    pub fn check_backpressure(&self) -> ApiResult<()> {
        let pending = self.db.pending();
        if pending >= self.config.rabbit_max_pending_updates {
            return Err(ApiError::Internal(format!(
                "Too many pending updates to RabbitMQ: {pending}"
            )));
        }
        if !self.coord.is_connected() {
            return Err(ApiError::Backpressure(
                "Coordination service is not connected".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn pool(&self, pool: &IdPool) -> Result<PoolRef<'_>, AllocError> {
        Ok(match pool {
            IdPool::VirtualNetwork => PoolRef::Fixed(&self.ids.vn),
            IdPool::SecurityGroup => PoolRef::Fixed(&self.ids.sg),
            IdPool::RouteTarget => PoolRef::Fixed(&self.ids.route_target),
            IdPool::TagType => PoolRef::Fixed(&self.ids.tag_type),
            IdPool::VirtualPortGroup => PoolRef::Fixed(&self.ids.vpg),
            IdPool::BgpaasPort => PoolRef::Fixed(&self.ids.bgpaas_port),
            IdPool::TagValue(tag_type) => PoolRef::Shared(self.ids.tag_values(tag_type).await?),
            IdPool::VmVlan(vm) => PoolRef::Shared(self.ids.vm_vlans(vm).await?),
        })
    }

    pub async fn free_id(&self, pool: &IdPool, id: u32) -> Result<(), AllocError> {
        self.pool(pool).await?.free(id).await
    }

    pub async fn reserve_id(&self, pool: &IdPool, id: u32, owner: &str) -> Result<u32, AllocError> {
        self.pool(pool).await?.reserve(id, owner).await
    }

    /// The project a resource belongs to, walking up its parents.
    pub fn project_of(&self, uuid: &Uuid) -> ApiResult<Option<Uuid>> {
        let mut current = *uuid;
        loop {
            if self.db.resource_type(&current)? == "project" {
                return Ok(Some(current));
            }
            match self.db.parent(&current)? {
                Some(parent) => current = parent.uuid,
                None => return Ok(None),
            }
        }
    }

    /// Resolve `fq_name` of `resource_type` to an id.
    pub fn uuid_of(&self, resource_type: &str, fq_name: &FqName) -> ApiResult<Uuid> {
        self.db.uuid_of(resource_type, fq_name)
    }

    /// Role based access rules applying to `who`: global ones, then domain and project ones.
    #[must_use]
    pub fn rbac_rules(&self, who: &Identity) -> Vec<RbacRule> {
        let Ok(page) = self.db.list(&ListQuery {
            resource_type: "api-access-list".to_string(),
            ..ListQuery::default()
        }) else {
            return Vec::new();
        };
        let mut rules = Vec::new();
        for uuid in page.uuids {
            let Ok(Some(parent)) = self.db.parent(&uuid) else {
                continue;
            };
            let undashed = id::undashed(&parent.uuid);
            let applies = match parent.resource_type {
                "global-system-config" => true,
                "domain" => who.domain_id.as_deref() == Some(undashed.as_str()),
                "project" => who.owns(&undashed),
                _ => false,
            };
            if !applies {
                continue;
            }
            if let Ok(body) = self.db.read(&uuid, &ReadOptions::shallow())
                && let Some(entries) = body.get("api_access_list_entries")
            {
                rules.extend(RbacRule::from_entries(entries));
            }
        }
        rules
    }

    /// Role based check of an operation, using the rules applying to the caller.
    pub fn check_rbac(
        &self,
        ctx: &RequestContext,
        object: &str,
        fields: &[&str],
        op: perms::Crud,
    ) -> ApiResult<()> {
        if !self.perms.is_rbac() || self.perms.is_admin(&ctx.identity) {
            return Ok(());
        }
        let rules = self.rbac_rules(&ctx.identity);
        self.perms
            .check_rbac(&ctx.identity, &rules, object, fields, op)
    }

    /// Resolve a type name given in hyphen or underscore form.
    pub fn resource_type(name: &str) -> ApiResult<&'static str> {
        registry()
            .lookup(name)
            .map(config::ResourceDesc::name)
            .ok_or_else(|| ApiError::NotFound(format!("Unknown resource type {name}")))
    }

    /// The id_perms of a resource body, for etags.
    #[must_use]
    pub fn last_modified(body: &serde_json::Map<String, Value>) -> Option<String> {
        body.get("id_perms")
            .and_then(|p| p.get("last_modified"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}
