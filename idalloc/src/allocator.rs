// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::AllocError;
use coord::{CoordError, Coordinator};
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct State {
    used: RoaringBitmap,
    owners: HashMap<u32, String>,
    by_name: HashMap<String, u32>,
}

impl State {
    fn mark(&mut self, id: u32, owner: &str) {
        self.used.insert(id);
        self.owners.insert(id, owner.to_string());
        self.by_name.insert(owner.to_string(), id);
    }
    fn unmark(&mut self, id: u32) -> Option<String> {
        self.used.remove(id);
        let owner = self.owners.remove(&id)?;
        if self.by_name.get(&owner) == Some(&id) {
            self.by_name.remove(&owner);
        }
        Some(owner)
    }
    fn first_free(&self, start: u32, end: u32) -> Option<u32> {
        (start..=end).find(|id| !self.used.contains(*id))
    }
}

/// Allocator of the integers in `[start, end]` persisted under one coordination path.
pub struct IdAllocator {
    coord: Arc<dyn Coordinator>,
    what: String,
    path: String,
    start: u32,
    end: u32,
    state: Mutex<State>,
}

impl IdAllocator {
    /// `path` ends with '/'; nodes are named after the zero-padded id.
    pub fn new(
        coord: Arc<dyn Coordinator>,
        what: impl Into<String>,
        path: impl Into<String>,
        start: u32,
        end: u32,
    ) -> Self {
        Self {
            coord,
            what: what.into(),
            path: path.into(),
            start,
            end,
            state: Mutex::new(State::default()),
        }
    }

    fn node(&self, id: u32) -> String {
        format!("{}{id:010}", self.path)
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// What the ids identify, for messages.
    #[must_use]
    pub fn what(&self) -> &str {
        &self.what
    }

    #[must_use]
    pub fn range(&self) -> (u32, u32) {
        (self.start, self.end)
    }

    /// Rebuild the in-memory state from the persisted mapping.
    pub async fn resync(&self) -> Result<usize, AllocError> {
        let base = self.path.trim_end_matches('/');
        let children = self.coord.list_children(base).await?;
        let mut state = self.state.lock();
        *state = State::default();
        for (name, owner) in &children {
            match name.parse::<u32>() {
                Ok(id) => state.mark(id, owner),
                Err(_) => warn!("Ignoring malformed allocation node {base}/{name}"),
            }
        }
        info!("{}: resynced {} allocations", self.what, children.len());
        Ok(children.len())
    }

    /// Allocate an identifier for `owner`. An owner already holding one gets it back.
    pub async fn alloc(&self, owner: &str) -> Result<u32, AllocError> {
        loop {
            let candidate = {
                let state = self.state.lock();
                if let Some(id) = state.by_name.get(owner) {
                    return Ok(*id);
                }
                state.first_free(self.start, self.end)
            };
            let Some(id) = candidate else {
                return Err(AllocError::Exhausted(self.what.clone()));
            };
            match self.coord.create_node(&self.node(id), owner).await {
                Ok(()) => {
                    self.state.lock().mark(id, owner);
                    debug!("{}: allocated {id} to {owner}", self.what);
                    return Ok(id);
                }
                Err(CoordError::NodeExists(_)) => {
                    // taken by another server; learn it and try the next one
                    let taken = self.coord.read_node(&self.node(id)).await?;
                    self.state
                        .lock()
                        .mark(id, taken.as_deref().unwrap_or_default());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reserve a specific identifier for `owner`.
    ///
    /// Reserving an id already held by the same owner succeeds.
    pub async fn reserve(&self, id: u32, owner: &str) -> Result<u32, AllocError> {
        if id < self.start || id > self.end {
            return Err(AllocError::OutOfRange {
                id,
                start: self.start,
                end: self.end,
            });
        }
        if let Some(current) = self.state.lock().owners.get(&id) {
            if current == owner {
                return Ok(id);
            }
            return Err(AllocError::InUse {
                id,
                owner: current.clone(),
            });
        }
        match self.coord.create_node(&self.node(id), owner).await {
            Ok(()) => {
                self.state.lock().mark(id, owner);
                Ok(id)
            }
            Err(CoordError::NodeExists(_)) => {
                let current = self
                    .coord
                    .read_node(&self.node(id))
                    .await?
                    .unwrap_or_default();
                self.state.lock().mark(id, &current);
                if current == owner {
                    Ok(id)
                } else {
                    Err(AllocError::InUse { id, owner: current })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release an identifier. Releasing a free identifier is a no-op.
    pub async fn free(&self, id: u32) -> Result<(), AllocError> {
        match self.coord.delete_node(&self.node(id)).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(owner) = self.state.lock().unmark(id) {
            debug!("{}: freed {id} held by {owner}", self.what);
        }
        Ok(())
    }

    /// Release the identifier held by `owner`, if any.
    pub async fn free_owner(&self, owner: &str) -> Result<Option<u32>, AllocError> {
        let id = self.state.lock().by_name.get(owner).copied();
        if let Some(id) = id {
            self.free(id).await?;
        }
        Ok(id)
    }

    #[must_use]
    pub fn owner(&self, id: u32) -> Option<String> {
        self.state.lock().owners.get(&id).cloned()
    }

    #[must_use]
    pub fn id_of(&self, owner: &str) -> Option<u32> {
        self.state.lock().by_name.get(owner).copied()
    }

    #[must_use]
    pub fn is_allocated(&self, id: u32) -> bool {
        self.state.lock().used.contains(id)
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.state.lock().used.len()
    }

    /// Free every allocation whose owner is not live anymore. Returns the reclaimed ids.
    pub async fn prune(&self, is_live: impl Fn(&str) -> bool) -> Result<Vec<u32>, AllocError> {
        let stale: Vec<u32> = self
            .state
            .lock()
            .owners
            .iter()
            .filter(|(_, owner)| !is_live(owner))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            warn!("{}: reclaiming stale id {id}", self.what);
            self.free(*id).await?;
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord::MemCoordinator;
    use pretty_assertions::assert_eq;

    fn allocator(coord: &Arc<MemCoordinator>, start: u32, end: u32) -> IdAllocator {
        IdAllocator::new(coord.clone(), "test", "/id/test/", start, end)
    }

    #[tokio::test]
    async fn alloc_is_idempotent_per_owner() {
        let coord = Arc::new(MemCoordinator::new());
        let ids = allocator(&coord, 1, 10);
        assert_eq!(ids.alloc("a").await, Ok(1));
        assert_eq!(ids.alloc("b").await, Ok(2));
        assert_eq!(ids.alloc("a").await, Ok(1));
        assert_eq!(
            coord.read_node("/id/test/0000000001").await,
            Ok(Some("a".to_string()))
        );
    }

    #[tokio::test]
    async fn exhaustion_and_free() {
        let coord = Arc::new(MemCoordinator::new());
        let ids = allocator(&coord, 5, 6);
        ids.alloc("a").await.expect("Should allocate");
        ids.alloc("b").await.expect("Should allocate");
        assert_eq!(
            ids.alloc("c").await,
            Err(AllocError::Exhausted("test".to_string()))
        );
        ids.free(5).await.expect("Should free");
        ids.free(5).await.expect("Should be a no-op");
        assert_eq!(ids.alloc("c").await, Ok(5));
    }

    #[tokio::test]
    async fn reserve_specific() {
        let coord = Arc::new(MemCoordinator::new());
        let ids = allocator(&coord, 1, 100);
        assert_eq!(ids.reserve(42, "a").await, Ok(42));
        assert_eq!(ids.reserve(42, "a").await, Ok(42));
        assert!(matches!(
            ids.reserve(42, "b").await,
            Err(AllocError::InUse { id: 42, .. })
        ));
        assert!(matches!(
            ids.reserve(101, "b").await,
            Err(AllocError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn restart_rebuilds_and_prunes() {
        let coord = Arc::new(MemCoordinator::new());
        let ids = allocator(&coord, 1, 100);
        ids.alloc("d:p:vn1").await.expect("Should allocate");
        ids.alloc("d:p:vn2").await.expect("Should allocate");

        let restarted = allocator(&coord, 1, 100);
        assert_eq!(restarted.resync().await, Ok(2));
        assert_eq!(restarted.id_of("d:p:vn2"), Some(2));
        assert_eq!(restarted.alloc("d:p:vn2").await, Ok(2));

        let reclaimed = restarted
            .prune(|owner| owner == "d:p:vn1")
            .await
            .expect("Should prune");
        assert_eq!(reclaimed, vec![2]);
        assert_eq!(coord.read_node("/id/test/0000000002").await, Ok(None));
    }

    #[tokio::test]
    async fn concurrent_servers_skip_taken_ids() {
        let coord = Arc::new(MemCoordinator::new());
        let one = allocator(&coord, 1, 100);
        let two = allocator(&coord, 1, 100);
        assert_eq!(one.alloc("a").await, Ok(1));
        assert_eq!(two.alloc("b").await, Ok(2));
        assert_eq!(two.owner(1), Some("a".to_string()));
    }
}
