// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tags and tag types.
//!
//! A tag id is 32 bits: the type id in the upper half and a per-type value id in the lower one,
//! rendered `0xTTTTVVVV`.

use super::{TypeHooks, fq_of, uuid_of};
use crate::context::RequestContext;
use crate::pipeline::undo::{Compensation, CompensationList, IdPool};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName};
use serde_json::{Map, Value, json};
use tracing::debug;

/// Tag types known to every cluster, with their fixed ids.
pub const PREDEFINED_TAG_TYPES: &[(&str, u32)] = &[
    ("label", 0),
    ("application", 1),
    ("tier", 2),
    ("deployment", 3),
    ("site", 4),
    ("namespace", 5),
];

/// Tag types an object may carry several values of.
pub const TAG_TYPES_NOT_UNIQUE_PER_OBJECT: &[&str] = &["label"];

/// Tag types an address group may carry.
pub const TAG_TYPES_ON_ADDRESS_GROUP: &[&str] = &["label"];

fn predefined_id(type_name: &str) -> Option<u32> {
    PREDEFINED_TAG_TYPES
        .iter()
        .find(|(name, _)| *name == type_name)
        .map(|(_, id)| *id)
}

fn parse_hex(value: &str) -> Option<u32> {
    u32::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

/// `0xTTTT` of a type id.
#[must_use]
pub fn type_id_string(id: u32) -> String {
    format!("0x{id:04x}")
}

/// Compose a tag id from the type id string and a value id.
#[must_use]
pub fn tag_id_string(type_id: &str, value_id: u32) -> String {
    format!("{type_id}{value_id:04x}")
}

/// The fq-name a tag of `type_name=value` gets in a scope, `None` meaning global.
#[must_use]
pub fn tag_fq(scope: Option<&FqName>, type_name: &str, value: &str) -> FqName {
    let name = format!("{}={value}", type_name.to_lowercase());
    match scope {
        Some(project) => project.child(name),
        None => FqName::new([name]),
    }
}

pub struct TagTypeHooks;

#[async_trait]
impl TypeHooks for TagTypeHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if obj.get("tag_type_id").is_some_and(|v| !v.is_null()) {
            return Err(ApiError::bad_request("Tag Type ID is not setable"));
        }
        let name = fq_of(obj)?.name().to_string();
        obj.insert("display_name".into(), json!(name));
        let id = match predefined_id(&name) {
            Some(id) => api.ids().tag_type.reserve(id, &name).await?,
            None => api.ids().alloc_tag_type_id(&name).await?,
        };
        undo.push(Compensation::FreeId {
            pool: IdPool::TagType,
            id,
        });
        obj.insert("tag_type_id".into(), json!(type_id_string(id)));
        Ok(())
    }

    async fn pre_update(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if ["display_name", "tag_type_id"]
            .iter()
            .any(|k| patch.get(*k).is_some_and(|v| !v.is_null()))
        {
            return Err(ApiError::bad_request(
                "Tag Type value or ID cannot be updated",
            ));
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        if let Some(id) = current
            .get("tag_type_id")
            .and_then(Value::as_str)
            .and_then(parse_hex)
        {
            api.ids().tag_type.free(id).await?;
        }
        Ok(())
    }
}

pub struct TagHooks;

#[async_trait]
impl TypeHooks for TagHooks {
    async fn pre_alloc(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
    ) -> ApiResult<()> {
        let (Some(type_name), Some(value)) = (
            obj.get("tag_type_name").and_then(Value::as_str),
            obj.get("tag_value").and_then(Value::as_str),
        ) else {
            return Err(ApiError::bad_request(
                "Tag must be created with a type and a value",
            ));
        };
        let type_name = type_name.to_lowercase();
        let value = value.to_string();
        let fq = fq_of(obj)?;
        let scope = (fq.len() > 1).then(|| fq.parent());
        let fq = tag_fq(scope.as_ref(), &type_name, &value);
        obj.insert("name".into(), json!(fq.name()));
        obj.insert("display_name".into(), json!(fq.name()));
        obj.insert("fq_name".into(), json!(fq));
        obj.insert("tag_type_name".into(), json!(type_name));
        obj.insert("tag_value".into(), json!(value));
        Ok(())
    }

    async fn pre_create(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if obj.get("tag_id").is_some_and(|v| !v.is_null()) {
            return Err(ApiError::bad_request("Tag ID is not setable"));
        }
        if obj.get("tag_type_refs").is_some_and(|v| !v.is_null()) {
            return Err(ApiError::bad_request("Tag Type reference is not setable"));
        }
        let type_name = obj
            .get("tag_type_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let type_fq = FqName::new([type_name.as_str()]);
        let existed = api.db().uuid_of("tag-type", &type_fq).is_ok();
        let mut body = Map::new();
        body.insert("fq_name".into(), json!(type_fq));
        body.insert("id_perms".into(), json!({"user_visible": false}));
        let tag_type = api
            .get_or_create(&ctx.as_internal(), "tag-type", body)
            .await?;
        if !existed {
            undo.push(Compensation::DeleteResource {
                resource_type: "tag-type",
                uuid: tag_type,
            });
        }
        let type_id = api
            .db()
            .read(&tag_type, &store::ReadOptions::shallow())?
            .get("tag_type_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Internal(format!("Tag type {type_name} has no id")))?;
        obj.insert(
            "tag_type_refs".into(),
            json!([{ "uuid": tag_type.to_string(), "to": type_fq }]),
        );

        let fq = fq_of(obj)?;
        let pool = IdPool::TagValue(type_name.clone());
        let value_id = api.pool(&pool).await?.alloc(&fq.to_string()).await?;
        undo.push(Compensation::FreeId {
            pool,
            id: value_id,
        });
        let tag_id = tag_id_string(&type_id, value_id);
        debug!("Tag {fq} gets id {tag_id}");
        obj.insert("tag_id".into(), json!(tag_id));
        Ok(())
    }

    async fn pre_update(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        _current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if ["display_name", "tag_type_name", "tag_value", "tag_id"]
            .iter()
            .any(|k| patch.get(*k).is_some_and(|v| !v.is_null()))
        {
            return Err(ApiError::bad_request(
                "Tag name, type, value or ID cannot be updated",
            ));
        }
        if patch.get("tag_type_refs").is_some_and(|v| !v.is_null()) {
            return Err(ApiError::bad_request("Tag-type reference cannot be updated"));
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        let type_name = current
            .get("tag_type_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(value_id) = current
            .get("tag_id")
            .and_then(Value::as_str)
            .and_then(parse_hex)
            .map(|id| id & 0xffff)
        {
            api.free_id(&IdPool::TagValue(type_name.clone()), value_id)
                .await?;
        }
        if predefined_id(&type_name).is_some() {
            return Ok(());
        }
        // the type goes with its last tag
        if let Ok(tag_type) = api.db().uuid_of("tag-type", &FqName::new([type_name.as_str()])) {
            match api.delete_if_exists(ctx, "tag-type", tag_type).await {
                Ok(()) => {}
                Err(e) if e.status() == 409 => {
                    debug!("Tag type {type_name} still in use by {}", uuid_of(current)?);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_ids_compose() {
        assert_eq!(type_id_string(1), "0x0001");
        assert_eq!(tag_id_string("0x0001", 0x2a), "0x0001002a");
        assert_eq!(parse_hex("0x0001002a").map(|id| id & 0xffff), Some(0x2a));
    }

    #[test]
    fn tag_names_are_lowercase_type() {
        let project = FqName::from(&["default-domain", "p"][..]);
        assert_eq!(
            tag_fq(Some(&project), "Application", "Web").to_string(),
            "default-domain:p:application=Web"
        );
        assert_eq!(tag_fq(None, "label", "red").to_string(), "label=red");
    }

    #[test]
    fn predefined_types_have_fixed_ids() {
        assert_eq!(predefined_id("label"), Some(0));
        assert_eq!(predefined_id("tier"), Some(2));
        assert_eq!(predefined_id("color"), None);
    }
}
