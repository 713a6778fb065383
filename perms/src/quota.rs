// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-project resource counters held by the coordination service.

use config::{ApiError, ApiResult};
use coord::{CoordError, Coordinator};
use id::Uuid;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The limit a project sets for a type, or `None` when unlimited.
///
/// The type-specific entry wins over `defaults`; a negative limit means unlimited.
#[must_use]
pub fn quota_limit(project: &Map<String, Value>, object_type: &str) -> Option<i64> {
    let quota = project.get("quota")?;
    quota
        .get(object_type)
        .and_then(Value::as_i64)
        .or_else(|| quota.get("defaults").and_then(Value::as_i64))
        .filter(|limit| *limit >= 0)
}

/// A counted create, to be given back if the create does not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTicket {
    pub path: String,
}

pub struct QuotaCounters {
    coord: Arc<dyn Coordinator>,
    prefix: String,
    lock_prefix: String,
    lock_timeout: Duration,
}

impl QuotaCounters {
    /// Counters live under `<prefix>/quota-counter/`, their locks under `<prefix>/lock/quota/`.
    #[must_use]
    pub fn new(coord: Arc<dyn Coordinator>, prefix: &str, lock_timeout: Duration) -> Self {
        Self {
            coord,
            prefix: format!("{prefix}/quota-counter/"),
            lock_prefix: format!("{prefix}/lock/quota/"),
            lock_timeout,
        }
    }

    #[must_use]
    pub fn path(&self, project: &Uuid, object_type: &str) -> String {
        format!("{}{project}/{object_type}", self.prefix)
    }

    /// Whether the counter exists.
    pub async fn is_initialized(&self, project: &Uuid, object_type: &str) -> ApiResult<bool> {
        Ok(self
            .coord
            .counter_get(&self.path(project, object_type))
            .await?
            .is_some())
    }

    /// (Re)start a counter at the number of live resources.
    pub async fn init(&self, project: &Uuid, object_type: &str, live: usize) -> ApiResult<()> {
        let path = self.path(project, object_type);
        let live = i64::try_from(live).map_err(|e| ApiError::Internal(e.to_string()))?;
        debug!("Quota counter {path} starts at {live}");
        Ok(self.coord.counter_set(&path, live).await?)
    }

    /// Count one more resource, refusing to go above `limit`.
    pub async fn acquire(
        &self,
        project: &Uuid,
        object_type: &str,
        limit: i64,
    ) -> ApiResult<QuotaTicket> {
        let path = self.path(project, object_type);
        match self.coord.counter_add(&path, 1, Some(limit)).await {
            Ok(_) => Ok(QuotaTicket { path }),
            Err(CoordError::LimitExceeded { .. }) => Err(ApiError::OverQuota {
                limit,
                resource: object_type.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Count one more resource of a project, starting the counter at `live()` when it does not
    /// exist yet. Start and increment happen under the lock of the counter.
    pub async fn acquire_counted(
        &self,
        project: &Uuid,
        object_type: &str,
        limit: i64,
        live: impl FnOnce() -> usize + Send,
    ) -> ApiResult<QuotaTicket> {
        let lock = format!("{}{project}/{object_type}", self.lock_prefix);
        let _guard = self.coord.lock(&lock, self.lock_timeout).await?;
        if !self.is_initialized(project, object_type).await? {
            self.init(project, object_type, live()).await?;
        }
        self.acquire(project, object_type, limit).await
    }

    /// Give back a ticket.
    pub async fn release(&self, ticket: &QuotaTicket) {
        if let Err(e) = self.coord.counter_add(&ticket.path, -1, None).await {
            warn!("Failed to give back quota on {}: {e}", ticket.path);
        }
    }

    /// Count one resource less after a delete.
    pub async fn decrement(&self, project: &Uuid, object_type: &str) {
        let path = self.path(project, object_type);
        if matches!(self.coord.counter_get(&path).await, Ok(Some(_))) {
            self.release(&QuotaTicket { path }).await;
        }
    }

    /// Drop every counter of a deleted project.
    pub async fn forget_project(&self, project: &Uuid, object_types: &[String]) {
        for object_type in object_types {
            let path = self.path(project, object_type);
            if let Err(e) = self.coord.counter_delete(&path).await
                && !matches!(e, CoordError::NoNode(_))
            {
                warn!("Failed to drop quota counter {path}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord::MemCoordinator;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn limits() {
        let Value::Object(project) =
            json!({"quota": {"defaults": -1, "virtual_network": 2, "floating_ip": 0}})
        else {
            unreachable!()
        };
        assert_eq!(quota_limit(&project, "virtual_network"), Some(2));
        assert_eq!(quota_limit(&project, "floating_ip"), Some(0));
        assert_eq!(quota_limit(&project, "subnet"), None);
        assert_eq!(quota_limit(&Map::new(), "subnet"), None);
    }

    #[tokio::test]
    async fn counting_respects_limit() {
        let counters =
            QuotaCounters::new(Arc::new(MemCoordinator::new()), "", Duration::from_secs(5));
        let project = Uuid::new_v4();
        counters
            .init(&project, "virtual_network", 1)
            .await
            .expect("Should init");
        let ticket = counters
            .acquire(&project, "virtual_network", 2)
            .await
            .expect("Should fit");
        let err = counters
            .acquire(&project, "virtual_network", 2)
            .await
            .expect_err("Should exceed");
        assert_eq!(err.kind_name(), "OverQuota");
        assert_eq!(err.status(), 412);
        counters.release(&ticket).await;
        assert!(counters.acquire(&project, "virtual_network", 2).await.is_ok());
        assert!(counters.is_initialized(&project, "virtual_network").await.expect("Should read"));
        assert!(!counters.is_initialized(&project, "subnet").await.expect("Should read"));
    }

    #[tokio::test]
    async fn first_count_waits_for_the_counter_lock() {
        let coord = Arc::new(MemCoordinator::new());
        let counters = QuotaCounters::new(coord.clone(), "/c1", Duration::from_millis(20));
        let project = Uuid::new_v4();
        let held = coord
            .lock(&format!("/c1/lock/quota/{project}/virtual_network"), Duration::from_secs(1))
            .await
            .expect("Should lock");
        let err = counters
            .acquire_counted(&project, "virtual_network", 2, || 0)
            .await
            .expect_err("Should wait for the lock");
        assert_eq!(err.status(), 503);
        assert!(!counters.is_initialized(&project, "virtual_network").await.expect("Should read"));
        drop(held);

        counters
            .acquire_counted(&project, "virtual_network", 2, || 1)
            .await
            .expect("Should fit");
        // the live count only seeds a missing counter
        let err = counters
            .acquire_counted(&project, "virtual_network", 2, || 0)
            .await
            .expect_err("Should exceed");
        assert_eq!(err.status(), 412);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_counter_drop_is_logged() {
        let coord = Arc::new(MemCoordinator::new());
        let counters = QuotaCounters::new(coord.clone(), "", Duration::from_secs(5));
        let project = Uuid::new_v4();
        counters
            .init(&project, "virtual_network", 3)
            .await
            .expect("Should init");
        coord.expire_session();
        counters
            .forget_project(&project, &["virtual_network".to_string()])
            .await;
        assert!(logs_contain("Failed to drop quota counter"));
    }
}
