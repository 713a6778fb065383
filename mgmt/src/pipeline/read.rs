// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::{Outcome, resource_desc};
use crate::context::RequestContext;
use crate::server::ApiServer;
use config::{ApiError, ApiResult, ResourceDesc};
use id::Uuid;
use perms::{Crud, Perms2};
use serde_json::{Map, Value, json};
use store::ReadOptions;

/// Options of a single read.
#[derive(Debug, Clone, Default)]
pub struct ReadParams {
    pub fields: Option<Vec<String>>,
    pub exclude_back_refs: bool,
    pub exclude_children: bool,
    pub exclude_hrefs: bool,
    /// Value of `If-None-Match`.
    pub if_none_match: Option<String>,
}

const ALWAYS_SHOWN: &[&str] = &[
    "uuid",
    "fq_name",
    "name",
    "parent_type",
    "parent_uuid",
    "id_perms",
    "perms2",
];

impl ApiServer {
    pub fn read(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        uuid: &Uuid,
        params: &ReadParams,
    ) -> ApiResult<Outcome> {
        let desc = resource_desc(resource_type)?;
        let ty = desc.name();
        if self.db().resource_type(uuid)? != ty {
            return Err(ApiError::no_id(uuid));
        }
        self.check_rbac(ctx, ty, &[], Crud::Read)?;
        if let Some(etag) = params.if_none_match.as_deref() {
            let etag = etag.trim_matches('"');
            if self.db().is_latest(uuid, etag)? {
                return Ok(Outcome::not_modified(etag.to_string()));
            }
        }
        let mut obj = self.shallow(ty, uuid)?;
        if !self.perms().is_admin(&ctx.identity) {
            self.perms()
                .check_read(&ctx.identity, &Perms2::of(&obj))?;
            let visible = obj
                .get("id_perms")
                .and_then(|p| p.get("user_visible"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if !visible {
                return Err(ApiError::no_id(uuid));
            }
        }
        if let Some(fields) = &params.fields {
            obj.retain(|k, _| ALWAYS_SHOWN.contains(&k.as_str()) || fields.contains(k));
        }
        if !(params.exclude_children && params.exclude_back_refs) {
            let fresh = self.db().read(
                uuid,
                &ReadOptions {
                    fields: params.fields.clone(),
                    exclude_children: params.exclude_children,
                    exclude_backrefs: params.exclude_back_refs,
                },
            )?;
            for (key, value) in fresh {
                let wanted = desc.children.iter().any(|c| c.field == key)
                    || desc.backrefs.iter().any(|b| b.field == key);
                if wanted {
                    obj.insert(key, value);
                }
            }
        }
        self.view(ctx, desc, &mut obj, !params.exclude_hrefs);
        let etag = Self::last_modified(&obj);
        Ok(Outcome {
            etag,
            ..Outcome::ok(json!({ ty: obj }))
        })
    }

    /// Properties and references of a resource, from the cache when possible.
    pub(crate) fn shallow(&self, ty: &'static str, uuid: &Uuid) -> ApiResult<Map<String, Value>> {
        if let Some(body) = self.cache().get(uuid) {
            return Ok(body);
        }
        let body = self.db().read(uuid, &ReadOptions::shallow())?;
        self.cache().insert(ty, *uuid, body.clone());
        Ok(body)
    }

    /// Shape a body for the caller: drop peers it cannot read and add hrefs.
    pub(crate) fn view(
        &self,
        ctx: &RequestContext,
        desc: &ResourceDesc,
        obj: &mut Map<String, Value>,
        hrefs: bool,
    ) {
        let ty = desc.name();
        let admin = self.perms().is_admin(&ctx.identity);
        let mut peers: Vec<(&str, &'static str)> = Vec::new();
        peers.extend(desc.refs.iter().map(|r| (r.field.as_str(), r.desc.to)));
        peers.extend(desc.children.iter().map(|c| (c.field.as_str(), c.child_type)));
        peers.extend(desc.backrefs.iter().map(|b| (b.field.as_str(), b.from_type)));
        for (field, peer_type) in peers {
            let Some(Value::Array(items)) = obj.get_mut(field) else {
                continue;
            };
            if !admin {
                items.retain(|item| {
                    item.get("uuid")
                        .and_then(Value::as_str)
                        .and_then(|u| Uuid::parse_str(u).ok())
                        .and_then(|u| self.db().read(&u, &ReadOptions::shallow()).ok())
                        .is_some_and(|peer| {
                            self.perms()
                                .check_read(&ctx.identity, &Perms2::of(&peer))
                                .is_ok()
                        })
                });
            }
            if hrefs {
                for item in items.iter_mut() {
                    let Some(item) = item.as_object_mut() else {
                        continue;
                    };
                    if let Some(u) = item.get("uuid").and_then(Value::as_str) {
                        let href = format!("{}/{peer_type}/{u}", self.base_url());
                        item.insert("href".into(), json!(href));
                    }
                }
            }
        }
        if hrefs {
            if let Some(u) = obj.get("uuid").and_then(Value::as_str) {
                let href = format!("{}/{ty}/{u}", self.base_url());
                obj.insert("href".into(), json!(href));
            }
            if let (Some(pt), Some(pu)) = (
                obj.get("parent_type").and_then(Value::as_str),
                obj.get("parent_uuid").and_then(Value::as_str),
            ) {
                let href = format!("{}/{pt}/{pu}", self.base_url());
                obj.insert("parent_href".into(), json!(href));
            }
        }
    }
}
