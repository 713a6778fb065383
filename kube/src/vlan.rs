// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Sub-interface vlans of nested pods, one id space per parent interface.

use crate::errors::{KubeError, KubeResult};
use id::Uuid;
use roaring::RoaringBitmap;
use std::collections::HashMap;

pub const MIN_VLAN: u32 = 1;
pub const MAX_VLAN: u32 = 4095;

#[derive(Debug, Default)]
pub struct VlanSpaces {
    used: HashMap<Uuid, RoaringBitmap>,
}

fn check(vlan: u32) -> KubeResult<()> {
    if (MIN_VLAN..=MAX_VLAN).contains(&vlan) {
        Ok(())
    } else {
        Err(KubeError::VlanRange(vlan))
    }
}

impl VlanSpaces {
    /// Mark a vlan taken, e.g. when learning an existing sub-interface.
    pub fn set(&mut self, parent: &Uuid, vlan: u32) -> KubeResult<()> {
        check(vlan)?;
        self.used.entry(*parent).or_default().insert(vlan);
        Ok(())
    }

    pub fn reset(&mut self, parent: &Uuid, vlan: u32) {
        if let Some(used) = self.used.get_mut(parent) {
            used.remove(vlan);
            if used.is_empty() {
                self.used.remove(parent);
            }
        }
    }

    /// The lowest free vlan under `parent`, marked taken.
    pub fn alloc(&mut self, parent: &Uuid) -> KubeResult<u32> {
        let used = self.used.entry(*parent).or_default();
        let free = (MIN_VLAN..=MAX_VLAN)
            .find(|v| !used.contains(*v))
            .ok_or(KubeError::VlanExhausted(*parent))?;
        used.insert(free);
        Ok(free)
    }

    #[must_use]
    pub fn in_use(&self, parent: &Uuid) -> u64 {
        self.used.get(parent).map_or(0, RoaringBitmap::len)
    }

    pub fn clear(&mut self) {
        self.used.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lowest_free_first() {
        let mut spaces = VlanSpaces::default();
        let parent = Uuid::new_v4();
        spaces.set(&parent, 1).unwrap();
        spaces.set(&parent, 3).unwrap();
        assert_eq!(spaces.alloc(&parent).unwrap(), 2);
        assert_eq!(spaces.alloc(&parent).unwrap(), 4);
        spaces.reset(&parent, 1);
        assert_eq!(spaces.alloc(&parent).unwrap(), 1);
        assert_eq!(spaces.alloc(&Uuid::new_v4()).unwrap(), 1);
    }

    #[test]
    fn space_holds_4095_vlans() {
        let mut spaces = VlanSpaces::default();
        let parent = Uuid::new_v4();
        for _ in MIN_VLAN..=MAX_VLAN {
            spaces.alloc(&parent).unwrap();
        }
        assert_eq!(spaces.in_use(&parent), 4095);
        assert!(matches!(spaces.alloc(&parent), Err(KubeError::VlanExhausted(p)) if p == parent));
    }

    #[test]
    fn out_of_range() {
        let mut spaces = VlanSpaces::default();
        assert!(spaces.set(&Uuid::new_v4(), 0).is_err());
        assert!(spaces.set(&Uuid::new_v4(), 4096).is_err());
    }
}
