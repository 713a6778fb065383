// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Row persistence under the resource table.
//!
//! [`ConfigDb`](crate::ConfigDb) keeps its indices in memory and writes every row through a
//! [`Backend`]; a server opened on a backend holding rows rebuilds its indices from them.

use crate::row::{Collection, Edge, Position, Row, fq_key};
use config::registry::registry;
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::Bound;

const ROW_PREFIX: &str = "row/";

/// A key-value store holding the persisted rows.
pub trait Backend: Send + Sync {
    fn get(&self, key: &str) -> ApiResult<Option<Value>>;
    fn put(&self, key: &str, value: Value) -> ApiResult<()>;
    fn delete(&self, key: &str) -> ApiResult<()>;
    /// Entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> ApiResult<Vec<(String, Value)>>;
    /// Write `value` only if the current value is `expected`. Returns whether it was written.
    fn compare_and_swap(&self, key: &str, expected: Option<&Value>, value: Value)
    -> ApiResult<bool>;
}

/// A [`Backend`] living in process memory.
#[derive(Debug, Default)]
pub struct MemBackend {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemBackend {
    fn get(&self, key: &str) -> ApiResult<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> ApiResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> ApiResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> ApiResult<Vec<(String, Value)>> {
        Ok(self
            .entries
            .read()
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        value: Value,
    ) -> ApiResult<bool> {
        let mut entries = self.entries.write();
        if entries.get(key) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}

pub(crate) fn row_key(uuid: &Uuid) -> String {
    format!("{ROW_PREFIX}{uuid}")
}

#[derive(Serialize, Deserialize)]
struct StoredEdge {
    to_type: String,
    uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attr: Option<Value>,
    #[serde(default)]
    relaxed: bool,
}

/// The persisted form of a row.
#[derive(Serialize, Deserialize)]
struct StoredRow {
    uuid: Uuid,
    resource_type: String,
    fq_name: Vec<String>,
    #[serde(default)]
    parent: Option<(String, Uuid)>,
    #[serde(default)]
    props: Map<String, Value>,
    #[serde(default)]
    collections: BTreeMap<String, Vec<(String, Value)>>,
    #[serde(default)]
    refs: Vec<StoredEdge>,
}

fn corrupt(key: &str, what: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(format!("Stored row {key} is invalid: {what}"))
}

pub(crate) fn encode(row: &Row) -> ApiResult<Value> {
    let stored = StoredRow {
        uuid: row.uuid,
        resource_type: row.ty.to_string(),
        fq_name: row.fq_name.segments().to_vec(),
        parent: row.parent_type.zip(row.parent_uuid).map(|(t, u)| (t.to_string(), u)),
        props: row.props.clone(),
        collections: row
            .collections
            .iter()
            .map(|(name, elems)| {
                let elems = elems.iter().map(|(p, v)| (p.0.clone(), v.clone())).collect();
                ((*name).to_string(), elems)
            })
            .collect(),
        refs: row
            .refs
            .iter()
            .map(|e| StoredEdge {
                to_type: e.to_type.to_string(),
                uuid: e.uuid,
                attr: e.attr.clone(),
                relaxed: e.relaxed,
            })
            .collect(),
    };
    serde_json::to_value(stored).map_err(|e| ApiError::Internal(e.to_string()))
}

pub(crate) fn decode(key: &str, value: Value) -> ApiResult<Row> {
    let stored: StoredRow = serde_json::from_value(value).map_err(|e| corrupt(key, e))?;
    let desc = registry()
        .get(&stored.resource_type)
        .map_err(|e| corrupt(key, e))?;
    let static_type = |name: &str| {
        registry()
            .lookup(name)
            .map(config::ResourceDesc::name)
            .ok_or_else(|| corrupt(key, format!("unknown type {name}")))
    };
    let parent_type = stored
        .parent
        .as_ref()
        .map(|(t, _)| static_type(t))
        .transpose()?;
    let mut collections = BTreeMap::new();
    for (name, elems) in stored.collections {
        let prop = desc
            .prop(&name)
            .ok_or_else(|| corrupt(key, format!("unknown property {name}")))?;
        let elems: Collection = elems.into_iter().map(|(p, v)| (Position(p), v)).collect();
        collections.insert(prop.name, elems);
    }
    let refs = stored
        .refs
        .into_iter()
        .map(|e| {
            Ok(Edge {
                to_type: static_type(&e.to_type)?,
                uuid: e.uuid,
                attr: e.attr,
                relaxed: e.relaxed,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;
    let fq_name = FqName::new(stored.fq_name);
    Ok(Row {
        uuid: stored.uuid,
        fq_key: fq_key(desc.name(), &fq_name),
        resource_type: desc.name().to_string(),
        parent_uuid: stored.parent.map(|(_, u)| u),
        ty: desc.name(),
        parent_type,
        fq_name,
        props: stored.props,
        collections,
        refs,
    })
}

/// Every persisted row.
pub(crate) fn load(backend: &dyn Backend) -> ApiResult<Vec<Row>> {
    backend
        .scan(ROW_PREFIX)?
        .into_iter()
        .map(|(key, value)| decode(&key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn scan_stays_within_prefix() {
        let backend = MemBackend::new();
        backend.put("row/b", json!(2)).expect("Should put");
        backend.put("row/a", json!(1)).expect("Should put");
        backend.put("rows", json!(3)).expect("Should put");
        backend.put("other/a", json!(4)).expect("Should put");
        let keys: Vec<String> = backend
            .scan("row/")
            .expect("Should scan")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["row/a".to_string(), "row/b".to_string()]);
    }

    #[test]
    fn swap_only_from_expected_value() {
        let backend = MemBackend::new();
        assert!(backend.compare_and_swap("k", None, json!(1)).expect("Should swap"));
        assert!(!backend.compare_and_swap("k", None, json!(2)).expect("Should not swap"));
        assert!(
            backend
                .compare_and_swap("k", Some(&json!(1)), json!(2))
                .expect("Should swap")
        );
        assert_eq!(backend.get("k").expect("Should get"), Some(json!(2)));
        backend.delete("k").expect("Should delete");
        assert_eq!(backend.get("k").expect("Should get"), None);
    }

    #[test]
    fn undecodable_row_is_reported() {
        let err = decode("row/x", json!({"uuid": "x"})).expect_err("Should fail");
        assert!(err.to_string().contains("row/x"));
    }
}
