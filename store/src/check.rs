// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Consistency report and raw dump of the resource table.

use crate::db::{ConfigDb, ReadOptions};
use crate::row::fq_key;
use serde_json::Value;
use tracing::warn;

impl ConfigDb {
    /// Inconsistencies between rows and indices, one line each. Empty when healthy.
    #[must_use]
    pub fn check(&self) -> Vec<String> {
        let state = self.state.read();
        let mut report = Vec::new();
        for row in state.rows.iter_by_uuid() {
            if row.fq_key != fq_key(row.ty, &row.fq_name) {
                report.push(format!(
                    "fq-name index mismatch: {} {} indexed as {}",
                    row.ty, row.uuid, row.fq_key
                ));
            }
            if let Some(parent) = &row.parent_uuid {
                match state.rows.get_by_uuid(parent) {
                    None => report.push(format!(
                        "orphan child: {} {} has missing parent {parent}",
                        row.ty, row.uuid
                    )),
                    Some(p) if p.fq_name != row.fq_name.parent() => report.push(format!(
                        "parent mismatch: {} {} is not under {}",
                        row.ty, row.fq_name, p.fq_name
                    )),
                    Some(_) => {}
                }
            }
            for edge in &row.refs {
                if state.rows.get_by_uuid(&edge.uuid).is_none() {
                    report.push(format!(
                        "dangling reference: {} {} -> {} {}",
                        row.ty, row.uuid, edge.to_type, edge.uuid
                    ));
                }
                if !state
                    .backrefs
                    .get(&edge.uuid)
                    .is_some_and(|s| s.contains(&row.uuid))
                {
                    report.push(format!(
                        "missing back-reference: {} {} -> {}",
                        row.ty, row.uuid, edge.uuid
                    ));
                }
            }
        }
        for (target, referrers) in &state.backrefs {
            for from in referrers {
                let holds = state
                    .rows
                    .get_by_uuid(from)
                    .is_some_and(|r| r.refs.iter().any(|e| e.uuid == *target));
                if !holds {
                    report.push(format!("stale back-reference: {from} -> {target}"));
                }
            }
        }
        for line in &report {
            warn!("db-check: {line}");
        }
        report
    }

    /// Every row rendered with its references, sorted by id.
    #[must_use]
    pub fn dump(&self) -> Vec<Value> {
        let state = self.state.read();
        let uuids: Vec<_> = state.rows.iter_by_uuid().map(|r| r.uuid).collect();
        drop(state);
        uuids
            .iter()
            .filter_map(|uuid| self.read(uuid, &ReadOptions::shallow()).ok())
            .map(Value::Object)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::MessageBus;
    use crate::db::{ConfigDb, NewRow};
    use crate::row::{Edge, Parent};
    use config::FqName;
    use id::Uuid;
    use pretty_assertions::assert_eq;
    use serde_json::Map;
    use std::sync::Arc;

    fn add(db: &ConfigDb, ty: &'static str, fq: &[&str], parent: Option<Parent>) -> Uuid {
        let fq_name = FqName::from(fq);
        let uuid = db.alloc(ty, &fq_name, None).expect("Should alloc");
        db.create(NewRow {
            resource_type: ty,
            uuid,
            fq_name,
            parent,
            body: Map::new(),
        })
        .expect("Should create");
        uuid
    }

    #[test]
    fn healthy_then_dangling() {
        let db = ConfigDb::new(Arc::new(MessageBus::new(16)));
        let domain = add(&db, "domain", &["d"], None);
        add(
            &db,
            "project",
            &["d", "p"],
            Some(Parent {
                resource_type: "domain",
                uuid: domain,
            }),
        );
        assert!(db.check().is_empty());
        assert_eq!(db.dump().len(), 2);

        // break the table behind the indices' back
        let ghost = Uuid::new_v4();
        {
            let mut state = db.state.write();
            let mut row = state.rows.remove_by_uuid(&domain).expect("Should exist");
            row.refs.push(Edge {
                to_type: "virtual-network",
                uuid: ghost,
                attr: None,
                relaxed: false,
            });
            state.rows.insert(row);
        }
        let report = db.check();
        assert_eq!(report.len(), 2);
        assert!(report[0].starts_with("dangling reference"));
        assert!(report[1].starts_with("missing back-reference"));
    }
}
