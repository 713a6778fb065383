// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! set-tag: attach and detach tags by type and value.

use crate::context::RequestContext;
use crate::hooks::{TAG_TYPES_NOT_UNIQUE_PER_OBJECT, TAG_TYPES_ON_ADDRESS_GROUP, tag_fq};
use crate::server::ApiServer;
use config::{ApiError, ApiResult, FqName};
use perms::Perms2;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use store::ReadOptions;
use tracing::debug;

/// One tag type entry of a set-tag body. A null entry removes every tag of the type.
#[derive(Debug, Default)]
struct TagChange {
    is_global: bool,
    value: Option<String>,
    add_values: BTreeSet<String>,
    delete_values: BTreeSet<String>,
}

impl TagChange {
    fn parse(tag_type: &str, attrs: &Value) -> ApiResult<Self> {
        let strings = |key: &str| -> BTreeSet<String> {
            attrs
                .get(key)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        };
        let value = match attrs.get("value") {
            None | Some(Value::Null) => None,
            Some(Value::String(v)) => Some(v.clone()),
            Some(_) => {
                return Err(ApiError::bad_request(format!(
                    "No valid value provided for tag type {tag_type}"
                )));
            }
        };
        Ok(Self {
            is_global: attrs.get("is_global").and_then(Value::as_bool).unwrap_or(false),
            value,
            add_values: strings("add_values"),
            delete_values: strings("delete_values"),
        })
    }
}

/// `(type, value)` of a tag reference, read from its fq-name.
fn ref_tag(edge: &Value) -> Option<(String, String)> {
    let name = edge.get("to")?.as_array()?.last()?.as_str()?;
    let (ty, value) = name.split_once('=')?;
    Some((ty.to_string(), value.to_string()))
}

impl ApiServer {
    /// Where a non-global tag attached to `obj` lives.
    fn tag_scope(
        &self,
        obj_type: &str,
        obj: &Map<String, Value>,
        fq: &FqName,
    ) -> ApiResult<FqName> {
        if obj_type == "project" {
            return Ok(fq.clone());
        }
        if obj.get("parent_type").and_then(Value::as_str) == Some("project") {
            return Ok(fq.parent());
        }
        let owner = Perms2::of(obj).owner;
        if let Ok(project) = id::parse_lenient(&owner) {
            return self
                .db()
                .fq_name(&project)
                .map_err(|_| ApiError::NotFound(format!("Cannot find {obj_type} {fq} owner")));
        }
        Err(ApiError::NotFound(format!(
            "Not able to determine the scope of the tag on {fq}"
        )))
    }

    fn locate_tag(
        &self,
        scope: Option<&FqName>,
        tag_type: &str,
        value: &str,
    ) -> ApiResult<Value> {
        let fq = tag_fq(scope, tag_type, value);
        let uuid = self
            .db()
            .uuid_of("tag", &fq)
            .map_err(|_| ApiError::NotFound(format!("Tag with FQName {fq} not found")))?;
        Ok(json!({ "uuid": uuid.to_string(), "to": fq, "attr": null }))
    }

    pub async fn set_tag(&self, ctx: &RequestContext, body: &Value) -> ApiResult<Value> {
        let mut req = body
            .as_object()
            .cloned()
            .ok_or_else(|| ApiError::bad_request("Bad Request, set-tag body must be an object"))?;
        let obj_type = req.remove("obj_type");
        let obj_uuid = req.remove("obj_uuid");
        let (Some(obj_type), Some(obj_uuid)) = (
            obj_type.as_ref().and_then(Value::as_str),
            obj_uuid.as_ref().and_then(Value::as_str),
        ) else {
            return Err(ApiError::bad_request(
                "Object type and UUID must be specified",
            ));
        };
        let ty = Self::resource_type(obj_type)?;
        let uuid = id::parse_lenient(obj_uuid)?;
        let obj = self.db().read(&uuid, &ReadOptions::shallow())?;
        let fq = self.db().fq_name(&uuid)?;

        let mut refs: Vec<Value> = obj
            .get("tag_refs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut changed = false;

        for (tag_type, attrs) in &req {
            let tag_type = tag_type.to_lowercase();
            let held: Vec<String> = refs
                .iter()
                .filter_map(ref_tag)
                .filter(|(t, _)| *t == tag_type)
                .map(|(_, v)| v)
                .collect();
            if attrs.is_null() {
                changed |= !held.is_empty();
                refs.retain(|r| ref_tag(r).is_none_or(|(t, _)| t != tag_type));
                continue;
            }
            let change = TagChange::parse(&tag_type, attrs)?;
            let multi = TAG_TYPES_NOT_UNIQUE_PER_OBJECT.contains(&tag_type.as_str());
            if !multi && !(change.add_values.is_empty() && change.delete_values.is_empty()) {
                return Err(ApiError::bad_request(format!(
                    "Tag type {tag_type} cannot be set multiple times on a same object."
                )));
            }
            if ty == "address-group" && !TAG_TYPES_ON_ADDRESS_GROUP.contains(&tag_type.as_str()) {
                return Err(ApiError::bad_request(format!(
                    "Invalid tag type {tag_type} for object type {ty}"
                )));
            }
            let scope = if change.is_global {
                None
            } else {
                Some(self.tag_scope(ty, &obj, &fq)?)
            };

            if multi {
                let mut add = change.add_values.clone();
                add.extend(change.value.clone());
                for value in add.iter().filter(|v| !held.contains(v)) {
                    refs.push(self.locate_tag(scope.as_ref(), &tag_type, value)?);
                    changed = true;
                }
                for value in change.delete_values.iter().filter(|v| held.contains(v)) {
                    refs.retain(|r| ref_tag(r) != Some((tag_type.clone(), value.clone())));
                    changed = true;
                }
            } else {
                let Some(value) = change.value else {
                    return Err(ApiError::bad_request(format!(
                        "No valid value provided for tag type {tag_type}"
                    )));
                };
                if held.contains(&value) {
                    continue;
                }
                refs.retain(|r| ref_tag(r).is_none_or(|(t, _)| t != tag_type));
                refs.push(self.locate_tag(scope.as_ref(), &tag_type, &value)?);
                changed = true;
            }
        }

        if changed {
            let mut patch = Map::new();
            patch.insert("tag_refs".into(), Value::Array(refs));
            self.update(ctx, ty, &uuid, patch).await?;
            debug!("Tags of {ty} {uuid} updated");
        }
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_refs_name_type_and_value() {
        let edge = json!({"to": ["default-domain", "p", "application=web"], "uuid": "x"});
        assert_eq!(
            ref_tag(&edge),
            Some(("application".to_string(), "web".to_string()))
        );
        assert_eq!(ref_tag(&json!({"to": ["plain"]})), None);
    }

    #[test]
    fn change_entries_parse() {
        let change = TagChange::parse(
            "label",
            &json!({"add_values": ["a", "b"], "delete_values": ["c"], "is_global": true}),
        )
        .unwrap();
        assert!(change.is_global);
        assert_eq!(change.add_values.len(), 2);
        assert!(TagChange::parse("tier", &json!({"value": ["x"]})).is_err());
    }
}
