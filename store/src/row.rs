// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use config::FqName;
use id::Uuid;
use multi_index_map::MultiIndexMap;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Annotation keys forming the annotated fq-name of a reflected resource, in order.
pub const ANNOTATION_KEYS: &[&str] = &["project", "cluster", "owner", "kind", "name"];

/// The annotated fq-name of a resource body, if its annotations carry every key.
#[must_use]
pub fn annotated_fq_name(body: &Map<String, Value>) -> Option<Vec<String>> {
    let pairs = body
        .get("annotations")?
        .get("key_value_pair")?
        .as_array()?;
    ANNOTATION_KEYS
        .iter()
        .map(|key| {
            pairs
                .iter()
                .find(|kvp| kvp.get("key").and_then(Value::as_str) == Some(key))
                .and_then(|kvp| kvp.get("value"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parent {
    pub resource_type: &'static str,
    pub uuid: Uuid,
}

/// An outgoing reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub to_type: &'static str,
    pub uuid: Uuid,
    pub attr: Option<Value>,
    /// The peer may be deleted while this edge exists.
    pub relaxed: bool,
}

/// Position of an element of a list property. Numeric positions sort numerically and before
/// any other position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Position(pub(crate) String);

impl Position {
    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Elements of a list or map property, keyed by position (lists) or key (maps).
pub(crate) type Collection = BTreeMap<Position, Value>;

#[derive(Clone, Debug, MultiIndexMap)]
#[multi_index_derive(Debug, Clone, Default)]
pub(crate) struct Row {
    #[multi_index(ordered_unique)]
    pub(crate) uuid: Uuid,
    /// `<type>:<fq-name>`
    #[multi_index(hashed_unique)]
    pub(crate) fq_key: String,
    #[multi_index(hashed_non_unique)]
    pub(crate) resource_type: String,
    #[multi_index(hashed_non_unique)]
    pub(crate) parent_uuid: Option<Uuid>,
    pub(crate) ty: &'static str,
    pub(crate) parent_type: Option<&'static str>,
    pub(crate) fq_name: FqName,
    pub(crate) props: Map<String, Value>,
    pub(crate) collections: BTreeMap<&'static str, Collection>,
    pub(crate) refs: Vec<Edge>,
}

pub(crate) fn fq_key(resource_type: &str, fq_name: &FqName) -> String {
    format!("{resource_type}:{fq_name}")
}

impl Row {
    pub(crate) fn last_modified(&self) -> Option<&str> {
        self.props
            .get("id_perms")
            .and_then(|p| p.get("last_modified"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn positions_sort_numerically_first() {
        let mut positions: Vec<Position> = ["10", "2", "abc", "1"]
            .iter()
            .map(|p| Position((*p).to_string()))
            .collect();
        positions.sort();
        let sorted: Vec<&str> = positions.iter().map(|p| p.0.as_str()).collect();
        assert_eq!(sorted, vec!["1", "2", "10", "abc"]);
    }

    #[test]
    fn annotated_names() {
        let body = json!({"annotations": {"key_value_pair": [
            {"key": "name", "value": "web"},
            {"key": "kind", "value": "Pod"},
            {"key": "owner", "value": "k8s"},
            {"key": "cluster", "value": "c1"},
            {"key": "project", "value": "default"},
        ]}});
        let Value::Object(body) = body else {
            unreachable!()
        };
        assert_eq!(
            annotated_fq_name(&body),
            Some(vec![
                "default".to_string(),
                "c1".to_string(),
                "k8s".to_string(),
                "Pod".to_string(),
                "web".to_string()
            ])
        );
        let partial = json!({"annotations": {"key_value_pair": [{"key": "name", "value": "web"}]}});
        let Value::Object(partial) = partial else {
            unreachable!()
        };
        assert_eq!(annotated_fq_name(&partial), None);
    }
}
