// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Element-wise updates of list and map properties.

use crate::row::{Collection, Position};
use config::schema::Collection as Kind;
use config::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{Value, json};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CollectionOperation {
    Add,
    Modify,
    Delete,
    Set,
}

/// One operation of a prop-collection-update request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CollectionOp {
    pub field: String,
    pub operation: CollectionOperation,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, deserialize_with = "position_string")]
    pub position: Option<String>,
}

/// Positions may be given as numbers or strings.
fn position_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl CollectionOp {
    /// Check that the operation fits the kind of property and carries what it needs.
    pub fn check(&self, kind: Kind) -> ApiResult<()> {
        let request = || serde_json::to_string(&json!({
            "field": self.field,
            "operation": self.operation.to_string(),
            "value": self.value,
            "position": self.position,
        }))
        .unwrap_or_default();
        let allowed: &[CollectionOperation] = match kind {
            Kind::List { .. } => &[
                CollectionOperation::Add,
                CollectionOperation::Modify,
                CollectionOperation::Delete,
            ],
            Kind::Map { .. } => &[CollectionOperation::Set, CollectionOperation::Delete],
            Kind::None => {
                return Err(ApiError::bad_request(format!(
                    "{} neither \"ListProperty\" nor \"MapProperty\"",
                    self.field
                )));
            }
        };
        if !allowed.contains(&self.operation) {
            return Err(ApiError::bad_request(format!(
                "Unsupported operation {} in request {}",
                self.operation,
                request()
            )));
        }
        let missing = match self.operation {
            CollectionOperation::Add | CollectionOperation::Set if self.value.is_none() => {
                Some(format!("{} needs field value", self.operation))
            }
            CollectionOperation::Modify if self.value.is_none() || self.position.is_none() => {
                Some("Modify needs field value and position".to_string())
            }
            CollectionOperation::Delete if self.position.is_none() => {
                Some("Delete needs field position".to_string())
            }
            _ => None,
        };
        match missing {
            Some(msg) => Err(ApiError::bad_request(format!("{msg} in request {}", request()))),
            None => Ok(()),
        }
    }
}

/// Apply one checked operation to the elements of a property.
pub(crate) fn apply(kind: Kind, elems: &mut Collection, op: &CollectionOp) -> ApiResult<()> {
    match (kind, op.operation) {
        (Kind::List { .. }, CollectionOperation::Add) => {
            let position = match &op.position {
                Some(position) => position.clone(),
                None => next_position(elems),
            };
            elems.insert(Position(position), op.value.clone().unwrap_or(Value::Null));
        }
        (Kind::List { .. }, CollectionOperation::Modify) => {
            let position = op.position.clone().unwrap_or_default();
            elems.insert(Position(position), op.value.clone().unwrap_or(Value::Null));
        }
        (Kind::Map { key, .. }, CollectionOperation::Set) => {
            let value = op.value.clone().unwrap_or(Value::Null);
            let Some(position) = value.get(key).and_then(Value::as_str).map(str::to_string)
            else {
                return Err(ApiError::bad_request(format!(
                    "Set on {} needs the {key} field in value",
                    op.field
                )));
            };
            elems.insert(Position(position), value);
        }
        (_, CollectionOperation::Delete) => {
            if let Some(position) = &op.position {
                elems.remove(&Position(position.clone()));
            }
        }
        _ => {
            return Err(ApiError::bad_request(format!(
                "Unsupported operation {} on {}",
                op.operation, op.field
            )));
        }
    }
    Ok(())
}

fn next_position(elems: &Collection) -> String {
    elems
        .keys()
        .filter_map(|p| p.0.parse::<u64>().ok())
        .max()
        .map_or(0, |max| max + 1)
        .to_string()
}

/// Split a whole property value `{wrapper: [elem, ...]}` into positioned elements.
pub(crate) fn explode(kind: Kind, value: &Value) -> Collection {
    let (wrapper, key) = match kind {
        Kind::List { wrapper } => (wrapper, None),
        Kind::Map { wrapper, key } => (wrapper, Some(key)),
        Kind::None => return Collection::new(),
    };
    let Some(items) = value.get(wrapper).and_then(Value::as_array) else {
        return Collection::new();
    };
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let position = key
                .and_then(|key| item.get(key))
                .and_then(Value::as_str)
                .map_or_else(|| idx.to_string(), str::to_string);
            (Position(position), item.clone())
        })
        .collect()
}

/// Rebuild the whole property value from its elements.
pub(crate) fn implode(kind: Kind, elems: &Collection) -> Value {
    match kind {
        Kind::List { wrapper } | Kind::Map { wrapper, .. } => {
            json!({ wrapper: elems.values().cloned().collect::<Vec<_>>() })
        }
        Kind::None => Value::Null,
    }
}

/// `[[elem, position], ...]` as returned by prop-collection-get.
pub(crate) fn positioned(elems: &Collection, position: Option<&str>) -> Value {
    Value::Array(
        elems
            .iter()
            .filter(|(p, _)| position.is_none_or(|wanted| p.0 == wanted))
            .map(|(p, elem)| json!([elem, p.0]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LIST: Kind = Kind::List {
        wrapper: "fat_flow_protocol",
    };
    const MAP: Kind = Kind::Map {
        wrapper: "key_value_pair",
        key: "key",
    };

    fn op(operation: CollectionOperation, value: Option<Value>, position: Option<&str>) -> CollectionOp {
        CollectionOp {
            field: "f".to_string(),
            operation,
            value,
            position: position.map(str::to_string),
        }
    }

    #[test]
    fn list_add_modify_delete() {
        let mut elems = explode(LIST, &json!({"fat_flow_protocol": [{"port": 1}, {"port": 2}]}));
        apply(LIST, &mut elems, &op(CollectionOperation::Add, Some(json!({"port": 3})), None))
            .expect("Should add");
        apply(LIST, &mut elems, &op(CollectionOperation::Modify, Some(json!({"port": 20})), Some("1")))
            .expect("Should modify");
        apply(LIST, &mut elems, &op(CollectionOperation::Delete, None, Some("0")))
            .expect("Should delete");
        assert_eq!(
            implode(LIST, &elems),
            json!({"fat_flow_protocol": [{"port": 20}, {"port": 3}]})
        );
        assert_eq!(
            positioned(&elems, Some("2")),
            json!([[{"port": 3}, "2"]])
        );
    }

    #[test]
    fn map_set_then_delete() {
        let mut elems = Collection::new();
        apply(MAP, &mut elems, &op(CollectionOperation::Set, Some(json!({"key": "k", "value": "v"})), None))
            .expect("Should set");
        apply(MAP, &mut elems, &op(CollectionOperation::Set, Some(json!({"key": "k", "value": "w"})), None))
            .expect("Should set");
        assert_eq!(implode(MAP, &elems), json!({"key_value_pair": [{"key": "k", "value": "w"}]}));
        apply(MAP, &mut elems, &op(CollectionOperation::Delete, None, Some("k")))
            .expect("Should delete");
        assert_eq!(implode(MAP, &elems), json!({"key_value_pair": []}));
    }

    #[test]
    fn checks() {
        assert!(op(CollectionOperation::Set, Some(json!({})), None).check(LIST).is_err());
        assert!(op(CollectionOperation::Add, None, None).check(LIST).is_err());
        assert!(op(CollectionOperation::Modify, Some(json!({})), None).check(LIST).is_err());
        assert!(op(CollectionOperation::Delete, None, None).check(MAP).is_err());
        assert!(op(CollectionOperation::Delete, None, Some("k")).check(MAP).is_ok());
        assert!(op(CollectionOperation::Add, Some(json!({})), None).check(Kind::None).is_err());
        let parsed: CollectionOp = serde_json::from_value(
            json!({"field": "f", "operation": "delete", "position": 3}),
        )
        .expect("Should parse");
        assert_eq!(parsed.position.as_deref(), Some("3"));
    }
}
