// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{AllocError, IdAllocator};
use coord::Coordinator;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

pub const VN_ID_MAX: u32 = (1 << 24) - 1;
/// Security group ids below this value are reserved for configured ids.
pub const SG_ID_MIN_ALLOC: u32 = 8_000_000;
pub const ROUTE_TARGET_MIN: u32 = 8_000_000;
const ROUTE_TARGET_MAX: u32 = (1 << 31) - 1;
const TAG_ID_MAX: u32 = 0xFFFF;
/// Type ids below this value belong to the predefined tag types.
pub const TAG_TYPE_USER_MIN: u32 = 256;
const VPG_ID_MAX: u32 = 0xFFFF;
const VLAN_MAX: u32 = 4095;
pub const BGPAAS_PORT_PATH: &str = "/id/bgpaas/port/";
/// Owner of the security-group id that is never handed out.
pub const SG_RESERVED_OWNER: &str = "__reserved__";

/// Every allocator the server uses.
pub struct IdAllocators {
    coord: Arc<dyn Coordinator>,
    prefix: String,
    pub vn: IdAllocator,
    pub sg: IdAllocator,
    pub route_target: IdAllocator,
    pub tag_type: IdAllocator,
    pub vpg: IdAllocator,
    pub bgpaas_port: IdAllocator,
    tag_values: DashMap<String, Arc<IdAllocator>>,
    vm_vlans: DashMap<String, Arc<IdAllocator>>,
}

impl IdAllocators {
    /// `prefix` is prepended to every coordination path, see `ServerConfig::cluster_prefix`.
    pub fn new(
        coord: Arc<dyn Coordinator>,
        prefix: &str,
        bgpaas_ports: (u16, u16),
    ) -> Self {
        let path = |p: &str| format!("{prefix}{p}");
        Self {
            vn: IdAllocator::new(
                coord.clone(),
                "virtual-network id",
                path("/id/virtual-networks/"),
                1,
                VN_ID_MAX,
            ),
            sg: IdAllocator::new(
                coord.clone(),
                "security-group id",
                path("/id/security-groups/id/"),
                0,
                u32::MAX,
            ),
            route_target: IdAllocator::new(
                coord.clone(),
                "route-target",
                path("/id/bgp/route-targets/"),
                ROUTE_TARGET_MIN,
                ROUTE_TARGET_MAX,
            ),
            tag_type: IdAllocator::new(
                coord.clone(),
                "tag-type id",
                path("/id/tags/types/"),
                0,
                TAG_ID_MAX,
            ),
            vpg: IdAllocator::new(
                coord.clone(),
                "virtual-port-group id",
                path("/id/virtual-port-group/"),
                0,
                VPG_ID_MAX,
            ),
            bgpaas_port: IdAllocator::new(
                coord.clone(),
                "BGPaaS port",
                path(BGPAAS_PORT_PATH),
                u32::from(bgpaas_ports.0),
                u32::from(bgpaas_ports.1),
            ),
            tag_values: DashMap::new(),
            vm_vlans: DashMap::new(),
            prefix: prefix.to_string(),
            coord,
        }
    }

    /// Rebuild every allocator from the coordination service and reserve fixed ids.
    pub async fn resync(&self) -> Result<(), AllocError> {
        for allocator in [
            &self.vn,
            &self.sg,
            &self.route_target,
            &self.tag_type,
            &self.vpg,
            &self.bgpaas_port,
        ] {
            allocator.resync().await?;
        }
        // security-group id 0 is never handed out
        self.sg.reserve(0, SG_RESERVED_OWNER).await?;
        info!("Allocators resynced");
        Ok(())
    }

    /// Allocate a security-group id above the configured-id range.
    pub async fn alloc_sg_id(&self, owner: &str) -> Result<u32, AllocError> {
        if let Some(id) = self.sg.id_of(owner) {
            return Ok(id);
        }
        let range = IdAllocator::new(
            self.coord.clone(),
            "security-group id",
            self.sg.path().to_string(),
            SG_ID_MIN_ALLOC,
            u32::MAX,
        );
        // share the persisted state: learn what is used before picking
        range.resync().await?;
        let id = range.alloc(owner).await?;
        self.sg.reserve(id, owner).await
    }

    /// Allocate a user tag-type id, above the predefined ones.
    pub async fn alloc_tag_type_id(&self, owner: &str) -> Result<u32, AllocError> {
        if let Some(id) = self.tag_type.id_of(owner) {
            return Ok(id);
        }
        let range = IdAllocator::new(
            self.coord.clone(),
            "tag-type id",
            self.tag_type.path().to_string(),
            TAG_TYPE_USER_MIN,
            TAG_ID_MAX,
        );
        range.resync().await?;
        let id = range.alloc(owner).await?;
        self.tag_type.reserve(id, owner).await
    }

    /// Allocator of the tag value ids of one tag type.
    pub async fn tag_values(&self, tag_type: &str) -> Result<Arc<IdAllocator>, AllocError> {
        if let Some(existing) = self.tag_values.get(tag_type) {
            return Ok(existing.clone());
        }
        let allocator = Arc::new(IdAllocator::new(
            self.coord.clone(),
            format!("{tag_type} tag id"),
            format!("{}/id/tags/values/{tag_type}/", self.prefix),
            0,
            TAG_ID_MAX,
        ));
        allocator.resync().await?;
        Ok(self
            .tag_values
            .entry(tag_type.to_string())
            .or_insert(allocator)
            .clone())
    }

    /// Service chain VLAN allocator of one virtual machine, in `[1, 4095]`.
    pub async fn vm_vlans(&self, vm_uuid: &str) -> Result<Arc<IdAllocator>, AllocError> {
        if let Some(existing) = self.vm_vlans.get(vm_uuid) {
            return Ok(existing.clone());
        }
        let allocator = Arc::new(IdAllocator::new(
            self.coord.clone(),
            format!("{vm_uuid} service chain vlan"),
            format!("{}/id/service-chain/vlan/{vm_uuid}/", self.prefix),
            1,
            VLAN_MAX,
        ));
        allocator.resync().await?;
        Ok(self
            .vm_vlans
            .entry(vm_uuid.to_string())
            .or_insert(allocator)
            .clone())
    }

    /// Drop the VLAN space of a deleted virtual machine.
    pub async fn drop_vm_vlans(&self, vm_uuid: &str) -> Result<(), AllocError> {
        let allocator = self.vm_vlans(vm_uuid).await?;
        let ids: Vec<u32> = (1..=VLAN_MAX).filter(|id| allocator.is_allocated(*id)).collect();
        for id in ids {
            allocator.free(id).await?;
        }
        self.vm_vlans.remove(vm_uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord::MemCoordinator;
    use pretty_assertions::assert_eq;

    async fn allocators() -> IdAllocators {
        let coord = Arc::new(MemCoordinator::new());
        let ids = IdAllocators::new(coord, "/c1", (50_000, 50_001));
        ids.resync().await.expect("Should resync");
        ids
    }

    #[tokio::test]
    async fn sg_ids_above_configured_range() {
        let ids = allocators().await;
        assert!(ids.sg.is_allocated(0));
        assert_eq!(ids.alloc_sg_id("d:p:default").await, Ok(SG_ID_MIN_ALLOC));
        assert_eq!(ids.alloc_sg_id("d:p:web").await, Ok(SG_ID_MIN_ALLOC + 1));
        assert_eq!(ids.alloc_sg_id("d:p:default").await, Ok(SG_ID_MIN_ALLOC));
        assert_eq!(ids.sg.reserve(17, "d:p:configured").await, Ok(17));
    }

    #[tokio::test]
    async fn bgpaas_port_exhaustion() {
        let ids = allocators().await;
        assert_eq!(ids.bgpaas_port.alloc("a").await, Ok(50_000));
        assert_eq!(ids.bgpaas_port.alloc("b").await, Ok(50_001));
        assert_eq!(
            ids.bgpaas_port.alloc("c").await,
            Err(AllocError::Exhausted("BGPaaS port".to_string()))
        );
    }

    #[tokio::test]
    async fn per_vm_vlans() {
        let ids = allocators().await;
        let vm1 = ids.vm_vlans("vm1").await.expect("Should exist");
        let vm2 = ids.vm_vlans("vm2").await.expect("Should exist");
        assert_eq!(vm1.alloc("chain-a").await, Ok(1));
        assert_eq!(vm1.alloc("chain-b").await, Ok(2));
        assert_eq!(vm2.alloc("chain-a").await, Ok(1));
        ids.drop_vm_vlans("vm1").await.expect("Should drop");
        let vm1 = ids.vm_vlans("vm1").await.expect("Should exist");
        assert_eq!(vm1.count(), 0);
    }

    #[tokio::test]
    async fn tag_type_ids() {
        let ids = allocators().await;
        assert_eq!(ids.tag_type.reserve(1, "application").await, Ok(1));
        assert_eq!(ids.alloc_tag_type_id("custom").await, Ok(TAG_TYPE_USER_MIN));
        let values = ids.tag_values("application").await.expect("Should exist");
        assert_eq!(values.alloc("application=web").await, Ok(0));
    }
}
