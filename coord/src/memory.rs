// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{CoordError, Coordinator, Leadership, LockGuard};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Election {
    leader: Option<String>,
    lost: Option<watch::Sender<bool>>,
}

/// In-process coordination service.
pub struct MemCoordinator {
    connected: AtomicBool,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    nodes: Mutex<BTreeMap<String, String>>,
    counters: Mutex<HashMap<String, i64>>,
    elections: Mutex<HashMap<String, Election>>,
    election_change: Notify,
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            locks: DashMap::new(),
            nodes: Mutex::new(BTreeMap::new()),
            counters: Mutex::new(HashMap::new()),
            elections: Mutex::new(HashMap::new()),
            election_change: Notify::new(),
        }
    }

    /// Drop the session: leaders lose their leadership and every call fails until
    /// [`MemCoordinator::reconnect`].
    pub fn expire_session(&self) {
        warn!("Coordination session expired");
        self.connected.store(false, Ordering::SeqCst);
        let mut elections = self.elections.lock();
        for election in elections.values_mut() {
            election.leader = None;
            if let Some(lost) = election.lost.take() {
                let _ = lost.send(true);
            }
        }
        drop(elections);
        self.election_change.notify_waiters();
    }

    pub fn reconnect(&self) {
        info!("Coordination session re-established");
        self.connected.store(true, Ordering::SeqCst);
        self.election_change.notify_waiters();
    }

    fn check(&self) -> Result<(), CoordError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CoordError::Disconnected)
        }
    }
}

fn child_name<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

#[async_trait]
impl Coordinator for MemCoordinator {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn lock(&self, path: &str, timeout: Duration) -> Result<LockGuard, CoordError> {
        self.check()?;
        let mutex = self
            .locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired lock {path}");
                Ok(LockGuard {
                    path: path.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => {
                warn!("Timed out after {timeout:?} waiting for lock {path}");
                Err(CoordError::LockTimeout(path.to_string()))
            }
        }
    }

    async fn create_node(&self, path: &str, value: &str) -> Result<(), CoordError> {
        self.check()?;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        nodes.insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn read_node(&self, path: &str) -> Result<Option<String>, CoordError> {
        self.check()?;
        Ok(self.nodes.lock().get(path).cloned())
    }

    async fn delete_node(&self, path: &str) -> Result<(), CoordError> {
        self.check()?;
        self.nodes
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<(String, String)>, CoordError> {
        self.check()?;
        let nodes = self.nodes.lock();
        Ok(nodes
            .range(path.to_string()..)
            .take_while(|(key, _)| key.starts_with(path))
            .filter_map(|(key, value)| {
                child_name(path, key).map(|name| (name.to_string(), value.clone()))
            })
            .collect())
    }

    async fn counter_get(&self, path: &str) -> Result<Option<i64>, CoordError> {
        self.check()?;
        Ok(self.counters.lock().get(path).copied())
    }

    async fn counter_set(&self, path: &str, value: i64) -> Result<(), CoordError> {
        self.check()?;
        self.counters.lock().insert(path.to_string(), value);
        Ok(())
    }

    async fn counter_add(
        &self,
        path: &str,
        delta: i64,
        limit: Option<i64>,
    ) -> Result<i64, CoordError> {
        self.check()?;
        let mut counters = self.counters.lock();
        let current = counters.get(path).copied().unwrap_or(0);
        let next = current.saturating_add(delta);
        if let Some(limit) = limit {
            if delta > 0 && next > limit {
                return Err(CoordError::LimitExceeded {
                    path: path.to_string(),
                    limit,
                });
            }
        }
        counters.insert(path.to_string(), next);
        Ok(next)
    }

    async fn counter_delete(&self, path: &str) -> Result<(), CoordError> {
        self.check()?;
        self.counters.lock().remove(path);
        Ok(())
    }

    async fn campaign(&self, path: &str, candidate: &str) -> Result<Leadership, CoordError> {
        loop {
            let changed = self.election_change.notified();
            if self.is_connected() {
                let mut elections = self.elections.lock();
                let election = elections.entry(path.to_string()).or_default();
                if election.leader.is_none() {
                    let (tx, rx) = watch::channel(false);
                    election.leader = Some(candidate.to_string());
                    election.lost = Some(tx);
                    info!("{candidate} leads election {path}");
                    return Ok(Leadership {
                        path: path.to_string(),
                        candidate: candidate.to_string(),
                        lost: rx,
                    });
                }
            }
            changed.await;
        }
    }

    async fn resign(&self, leadership: Leadership) {
        let mut elections = self.elections.lock();
        if let Some(election) = elections.get_mut(&leadership.path) {
            if election.leader.as_deref() == Some(leadership.candidate.as_str()) {
                info!("{} resigns from election {}", leadership.candidate, leadership.path);
                election.leader = None;
                election.lost = None;
            }
        }
        drop(elections);
        self.election_change.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_is_exclusive_with_timeout() {
        let coord = MemCoordinator::new();
        let held = coord
            .lock("/lock/security/project/a:b", Duration::from_millis(10))
            .await
            .expect("Should lock");
        assert_eq!(held.path(), "/lock/security/project/a:b");
        let err = coord
            .lock("/lock/security/project/a:b", Duration::from_millis(10))
            .await
            .expect_err("Should time out");
        assert!(matches!(err, CoordError::LockTimeout(_)));
        drop(held);
        assert!(
            coord
                .lock("/lock/security/project/a:b", Duration::from_millis(10))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn nodes_and_children() {
        let coord = MemCoordinator::new();
        coord.create_node("/id/vn/0000000001", "d:p:a").await.expect("Should create");
        coord.create_node("/id/vn/0000000002", "d:p:b").await.expect("Should create");
        coord.create_node("/id/vn2/0000000001", "x").await.expect("Should create");
        assert_eq!(
            coord.create_node("/id/vn/0000000001", "d:p:c").await,
            Err(CoordError::NodeExists("/id/vn/0000000001".to_string()))
        );
        let children = coord.list_children("/id/vn").await.expect("Should list");
        assert_eq!(
            children,
            vec![
                ("0000000001".to_string(), "d:p:a".to_string()),
                ("0000000002".to_string(), "d:p:b".to_string()),
            ]
        );
        coord.delete_node("/id/vn/0000000001").await.expect("Should delete");
        assert_eq!(coord.read_node("/id/vn/0000000001").await, Ok(None));
    }

    #[tokio::test]
    async fn bounded_counter() {
        let coord = MemCoordinator::new();
        assert_eq!(coord.counter_add("/quota/p/vn", 1, Some(2)).await, Ok(1));
        assert_eq!(coord.counter_add("/quota/p/vn", 1, Some(2)).await, Ok(2));
        assert!(matches!(
            coord.counter_add("/quota/p/vn", 1, Some(2)).await,
            Err(CoordError::LimitExceeded { limit: 2, .. })
        ));
        assert_eq!(coord.counter_get("/quota/p/vn").await, Ok(Some(2)));
        assert_eq!(coord.counter_add("/quota/p/vn", -1, Some(2)).await, Ok(1));
    }

    #[tokio::test]
    async fn disconnected_refuses() {
        let coord = MemCoordinator::new();
        coord.expire_session();
        assert!(!coord.is_connected());
        assert_eq!(
            coord.counter_get("/x").await,
            Err(CoordError::Disconnected)
        );
        coord.reconnect();
        assert_eq!(coord.counter_get("/x").await, Ok(None));
    }

    #[tokio::test]
    async fn election_and_session_loss() {
        let coord = Arc::new(MemCoordinator::new());
        let first = coord.campaign("/election/kube", "w0").await.expect("Should lead");
        assert!(!first.is_lost());

        let contender = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.campaign("/election/kube", "w1").await })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        coord.expire_session();
        assert!(first.is_lost());
        coord.reconnect();
        let second = contender
            .await
            .expect("Should join")
            .expect("Should lead");
        assert_eq!(second.candidate, "w1");
        coord.resign(second).await;
        let third = coord.campaign("/election/kube", "w0").await.expect("Should lead");
        assert_eq!(third.candidate, "w0");
    }
}
