// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The adapter's mirror of the core objects it reflects into.
//!
//! Records are refreshed from the store whenever the message bus reports a change, so the
//! mirror never holds a body older than the last notification it saw. A change marks the
//! linked records of the kinds the reaction map names as dirty; the reflector re-evaluates
//! them once the event at hand is done.

use id::Uuid;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use store::{ChangeOper, ChangeRecord, ConfigDb, ListQuery, ReadOptions, annotated_fq_name};
use config::FqName;
use tracing::debug;

/// Resource types mirrored locally.
pub const MIRRORED: &[&str] = &[
    "project",
    "network-ipam",
    "virtual-network",
    "virtual-machine",
    "virtual-machine-interface",
    "instance-ip",
    "floating-ip",
    "security-group",
    "loadbalancer",
    "loadbalancer-listener",
    "loadbalancer-pool",
    "loadbalancer-member",
];

/// For each type, the linked types to re-evaluate when a record of it changes.
pub const REACTION_MAP: &[(&str, &[&str])] = &[
    ("project", &["virtual-network", "security-group"]),
    ("virtual-network", &["virtual-machine-interface", "instance-ip"]),
    (
        "virtual-machine-interface",
        &[
            "virtual-machine",
            "instance-ip",
            "floating-ip",
            "virtual-network",
            "loadbalancer",
        ],
    ),
    ("virtual-machine", &["virtual-machine-interface"]),
    ("instance-ip", &["virtual-machine-interface"]),
    ("floating-ip", &["virtual-machine-interface"]),
    ("security-group", &["virtual-machine-interface"]),
    ("loadbalancer", &["loadbalancer-listener", "virtual-machine-interface"]),
    ("loadbalancer-listener", &["loadbalancer", "loadbalancer-pool"]),
    ("loadbalancer-pool", &["loadbalancer-listener", "loadbalancer-member"]),
    ("loadbalancer-member", &["loadbalancer-pool"]),
];

#[must_use]
pub fn reactions(resource_type: &str) -> &'static [&'static str] {
    REACTION_MAP
        .iter()
        .find(|(ty, _)| *ty == resource_type)
        .map_or(&[], |(_, deps)| *deps)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub resource_type: &'static str,
    pub uuid: Uuid,
    pub fq_name: FqName,
    pub body: Map<String, Value>,
    pub annotated: Option<Vec<String>>,
    /// Parent, children, references and back-references, as `(type, id)`.
    pub links: Vec<(&'static str, Uuid)>,
}

#[derive(Debug, Default)]
pub struct LocalDb {
    records: HashMap<Uuid, LocalRecord>,
    by_annotation: HashMap<(&'static str, Vec<String>), Uuid>,
    by_fq_name: HashMap<(&'static str, FqName), Uuid>,
    dirty: BTreeSet<(&'static str, Uuid)>,
    last_seq: u64,
}

fn mirrored(resource_type: &str) -> Option<&'static str> {
    let resource_type = resource_type.replace('_', "-");
    MIRRORED.iter().copied().find(|t| *t == resource_type)
}

fn links_of(db: &ConfigDb, uuid: &Uuid) -> Vec<(&'static str, Uuid)> {
    let mut links = Vec::new();
    if let Ok(Some(parent)) = db.parent(uuid) {
        links.push((parent.resource_type, parent.uuid));
    }
    if let Ok(children) = db.children(uuid) {
        links.extend(children);
    }
    if let Ok(refs) = db.refs(uuid) {
        links.extend(refs.into_iter().map(|e| (e.to_type, e.uuid)));
    }
    if let Ok(backrefs) = db.backrefs(uuid) {
        links.extend(backrefs.into_iter().map(|b| (b.from_type, b.uuid)));
    }
    links
}

impl LocalDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything, e.g. before a rebuild.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Rebuild from the store, keeping `last_seq` as the notification the store state covers.
    pub fn sync(&mut self, db: &ConfigDb, last_seq: u64) {
        self.clear();
        for ty in MIRRORED {
            let query = ListQuery {
                resource_type: (*ty).to_string(),
                ..ListQuery::default()
            };
            let uuids = db.list(&query).map(|page| page.uuids).unwrap_or_default();
            for uuid in uuids {
                self.refresh(db, ty, &uuid);
            }
        }
        self.dirty.clear();
        self.last_seq = last_seq;
        debug!("Local db rebuilt with {} records", self.records.len());
    }

    /// Re-read one record from the store; it is forgotten when the store no longer has it.
    /// Returns the links of the old and new versions.
    pub fn refresh(
        &mut self,
        db: &ConfigDb,
        resource_type: &'static str,
        uuid: &Uuid,
    ) -> Vec<(&'static str, Uuid)> {
        let mut links = self.forget(uuid).map(|r| r.links).unwrap_or_default();
        let Ok(body) = db.read(uuid, &ReadOptions::shallow()) else {
            return links;
        };
        let Ok(fq_name) = db.fq_name(uuid) else {
            return links;
        };
        let annotated = annotated_fq_name(&body);
        let record = LocalRecord {
            resource_type,
            uuid: *uuid,
            fq_name: fq_name.clone(),
            body,
            annotated: annotated.clone(),
            links: links_of(db, uuid),
        };
        links.extend(record.links.iter().copied());
        if let Some(key) = annotated {
            self.by_annotation.insert((resource_type, key), *uuid);
        }
        self.by_fq_name.insert((resource_type, fq_name), *uuid);
        self.records.insert(*uuid, record);
        links
    }

    fn forget(&mut self, uuid: &Uuid) -> Option<LocalRecord> {
        let record = self.records.remove(uuid)?;
        if let Some(key) = &record.annotated {
            let key = (record.resource_type, key.clone());
            if self.by_annotation.get(&key) == Some(uuid) {
                self.by_annotation.remove(&key);
            }
        }
        let key = (record.resource_type, record.fq_name.clone());
        if self.by_fq_name.get(&key) == Some(uuid) {
            self.by_fq_name.remove(&key);
        }
        self.dirty.remove(&(record.resource_type, *uuid));
        Some(record)
    }

    /// Fold a change notification in. Records already covered by a rebuild are skipped.
    pub fn apply(&mut self, db: &ConfigDb, record: &ChangeRecord) {
        if record.seq <= self.last_seq {
            return;
        }
        self.last_seq = record.seq;
        let Some(ty) = mirrored(&record.resource_type) else {
            return;
        };
        let links = match record.oper {
            ChangeOper::Delete => self.forget(&record.uuid).map(|r| r.links).unwrap_or_default(),
            ChangeOper::Create | ChangeOper::Update => self.refresh(db, ty, &record.uuid),
        };
        let deps = reactions(ty);
        for (link_ty, uuid) in links {
            if deps.contains(&link_ty) && self.records.contains_key(&uuid) {
                self.dirty.insert((link_ty, uuid));
            }
        }
    }

    /// Take the dirty set.
    pub fn take_dirty(&mut self) -> Vec<(&'static str, Uuid)> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<&LocalRecord> {
        self.records.get(uuid)
    }

    #[must_use]
    pub fn find_by_annotation(&self, resource_type: &str, key: &[String]) -> Option<&LocalRecord> {
        let ty = mirrored(resource_type)?;
        let uuid = self.by_annotation.get(&(ty, key.to_vec()))?;
        self.records.get(uuid)
    }

    #[must_use]
    pub fn find_by_fq_name(&self, resource_type: &str, fq_name: &FqName) -> Option<&LocalRecord> {
        let ty = mirrored(resource_type)?;
        let uuid = self.by_fq_name.get(&(ty, fq_name.clone()))?;
        self.records.get(uuid)
    }

    /// Records of one type.
    pub fn of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a LocalRecord> + 'a {
        self.records
            .values()
            .filter(move |r| r.resource_type == resource_type)
    }

    /// Ids of the records of `resource_type` linked to `uuid`.
    #[must_use]
    pub fn linked(&self, uuid: &Uuid, resource_type: &str) -> Vec<Uuid> {
        self.records
            .get(uuid)
            .map(|r| {
                r.links
                    .iter()
                    .filter(|(ty, _)| *ty == resource_type)
                    .map(|(_, u)| *u)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use store::{MessageBus, NewRow, Parent};

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn create(
        db: &ConfigDb,
        ty: &'static str,
        fq: &[&str],
        parent: Option<(&'static str, Uuid)>,
        body: Value,
    ) -> Uuid {
        let fq = FqName::new(fq.iter().copied());
        let uuid = db.alloc(ty, &fq, None).unwrap();
        db.create(NewRow {
            resource_type: ty,
            uuid,
            fq_name: fq,
            parent: parent.map(|(resource_type, uuid)| Parent { resource_type, uuid }),
            body: obj(body),
        })
        .unwrap();
        uuid
    }

    #[test]
    fn reactions_mark_linked_records() {
        let db = ConfigDb::new(Arc::new(MessageBus::new(64)));
        let vm = create(&db, "virtual-machine", &["pod"], None, json!({}));
        let mut local = LocalDb::new();
        local.sync(&db, 0);
        assert_eq!(local.len(), 1);

        // a new interface pointing at the vm dirties it
        let domain = create(&db, "domain", &["d"], None, json!({}));
        let project = create(&db, "project", &["d", "p"], Some(("domain", domain)), json!({}));
        let vmi = create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "port"],
            Some(("project", project)),
            json!({"virtual_machine_refs": [{"uuid": vm.to_string()}]}),
        );
        db.bus().drain();
        let (records, _) = db.bus().subscribe(0);
        for record in &records {
            local.apply(&db, record);
        }
        assert!(local.get(&vmi).is_some());
        assert_eq!(local.linked(&vmi, "virtual-machine"), vec![vm]);
        assert_eq!(local.take_dirty(), vec![("virtual-machine", vm)]);

        // replaying the same records changes nothing
        for record in &records {
            local.apply(&db, record);
        }
        assert_eq!(local.dirty_len(), 0);

        db.delete(&vmi).unwrap();
        db.bus().drain();
        let (records, _) = db.bus().subscribe(local.last_seq());
        for record in &records {
            local.apply(&db, record);
        }
        assert!(local.get(&vmi).is_none());
        assert_eq!(local.take_dirty(), vec![("virtual-machine", vm)]);
    }

    #[test]
    fn annotated_lookup() {
        let db = ConfigDb::new(Arc::new(MessageBus::new(64)));
        let annotations = json!({"annotations": {"key_value_pair": [
            {"key": "project", "value": "k8s-prod"},
            {"key": "cluster", "value": "k8s"},
            {"key": "owner", "value": "k8s"},
            {"key": "kind", "value": "Pod"},
            {"key": "name", "value": "web"},
        ]}});
        let vm = create(&db, "virtual-machine", &["web__1"], None, annotations);
        let mut local = LocalDb::new();
        local.sync(&db, 0);
        let key: Vec<String> = ["k8s-prod", "k8s", "k8s", "Pod", "web"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        assert_eq!(local.find_by_annotation("virtual_machine", &key).map(|r| r.uuid), Some(vm));
        assert_eq!(
            local
                .find_by_fq_name("virtual-machine", &FqName::new(["web__1"]))
                .map(|r| r.uuid),
            Some(vm)
        );
    }
}
