// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::read::ReadParams;
use super::{Outcome, resource_desc};
use crate::context::RequestContext;
use crate::server::ApiServer;
use config::{ApiError, ApiResult, FqName, ResourceDesc};
use id::Uuid;
use perms::{Crud, PERMS_R, Perms2};
use serde_json::{Map, Value, json};
use store::{ListQuery, ReadOptions};

/// Options of a collection read, as given on a query string or in a bulk-list body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListParams {
    pub parent_id: Vec<String>,
    pub parent_fq_name_str: Option<String>,
    pub parent_type: Option<String>,
    pub back_ref_id: Vec<String>,
    pub obj_uuids: Vec<String>,
    pub fq_names: Vec<FqName>,
    pub fields: Option<Vec<String>>,
    pub detail: bool,
    pub count: bool,
    /// Also show what is shared with the caller.
    pub shared: bool,
    pub exclude_hrefs: bool,
    pub exclude_back_refs: bool,
    pub exclude_children: bool,
    pub page_marker: Option<String>,
    pub page_limit: Option<i64>,
    /// `field == one of values`.
    pub filters: Vec<(String, Vec<Value>)>,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// `a==1,b==x` into `[(a, [1]), (b, ["x"])]`, grouping repeated fields.
fn parse_filters(value: &str) -> ApiResult<Vec<(String, Vec<Value>)>> {
    let mut filters: Vec<(String, Vec<Value>)> = Vec::new();
    for clause in split_list(value) {
        let (field, wanted) = clause
            .split_once("==")
            .ok_or_else(|| ApiError::bad_request(format!("Invalid filter {clause}")))?;
        let wanted =
            serde_json::from_str::<Value>(wanted).unwrap_or_else(|_| Value::from(wanted));
        match filters.iter_mut().find(|(f, _)| f == field) {
            Some((_, values)) => values.push(wanted),
            None => filters.push((field.to_string(), vec![wanted])),
        }
    }
    Ok(filters)
}

impl ListParams {
    /// Parse query-string pairs. Unknown keys are ignored.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> ApiResult<Self> {
        let mut params = Self::default();
        for (key, value) in pairs {
            params.set(key, value)?;
        }
        Ok(params)
    }

    /// Parse a list-bulk-collection body, whose values may be strings, lists or booleans.
    pub fn from_json(body: &Map<String, Value>) -> ApiResult<Self> {
        let mut params = Self::default();
        for (key, value) in body {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Array(items) if key == "fq_names" => {
                    for fq in items {
                        params.fq_names.push(serde_json::from_value(fq.clone()).map_err(|_| {
                            ApiError::bad_request("Bad Request, fq_names must be lists of strings")
                        })?);
                    }
                    continue;
                }
                Value::Array(items) => items
                    .iter()
                    .map(|i| i.as_str().map_or_else(|| i.to_string(), str::to_string))
                    .collect::<Vec<_>>()
                    .join(","),
                Value::Object(filters) if key == "filters" => {
                    for (field, wanted) in filters {
                        let values = match wanted {
                            Value::Array(values) => values.clone(),
                            other => vec![other.clone()],
                        };
                        params.filters.push((field.clone(), values));
                    }
                    continue;
                }
                Value::Null => continue,
                other => other.to_string(),
            };
            params.set(key, &text)?;
        }
        Ok(params)
    }

    fn set(&mut self, key: &str, value: &str) -> ApiResult<()> {
        match key {
            "parent_id" => self.parent_id = split_list(value),
            "parent_fq_name_str" => self.parent_fq_name_str = Some(value.to_string()),
            "parent_type" => self.parent_type = Some(value.replace('_', "-")),
            "back_ref_id" => self.back_ref_id = split_list(value),
            "obj_uuids" => self.obj_uuids = split_list(value),
            "fq_names" => {
                self.fq_names = split_list(value)
                    .iter()
                    .map(|fq| FqName::parse(fq, None))
                    .collect();
            }
            "fields" => self.fields = Some(split_list(value)),
            "detail" => self.detail = truthy(value),
            "count" => self.count = truthy(value),
            "shared" => self.shared = truthy(value),
            "exclude_hrefs" => self.exclude_hrefs = truthy(value),
            "exclude_back_refs" => self.exclude_back_refs = truthy(value),
            "exclude_children" => self.exclude_children = truthy(value),
            "page_marker" => self.page_marker = Some(value.to_string()),
            "page_limit" => {
                self.page_limit = Some(value.parse().map_err(|_| {
                    ApiError::bad_request(format!("Invalid page_limit {value}"))
                })?);
            }
            "filters" => self.filters.extend(parse_filters(value)?),
            _ => {}
        }
        Ok(())
    }

    /// The id after which the page starts. `none` starts from the beginning.
    fn marker(&self) -> ApiResult<Option<Uuid>> {
        match self.page_marker.as_deref() {
            None => Ok(None),
            Some(m) if m.eq_ignore_ascii_case("none") => Ok(None),
            Some(m) => {
                let tail = m
                    .len()
                    .checked_sub(36)
                    .and_then(|start| m.get(start..))
                    .ok_or_else(|| ApiError::bad_request(format!("Invalid page_marker {m}")))?;
                id::parse_canonical(tail)
                    .map(Some)
                    .map_err(|_| ApiError::bad_request(format!("Invalid page_marker {m}")))
            }
        }
    }

    fn limit(&self, default: usize) -> ApiResult<Option<usize>> {
        match self.page_limit {
            Some(n) if n <= 0 => Err(ApiError::bad_request(format!("Invalid page_limit {n}"))),
            Some(n) => Ok(usize::try_from(n).ok()),
            None if self.page_marker.is_some() => Ok(Some(default)),
            None => Ok(None),
        }
    }
}

fn parse_ids(ids: &[String]) -> ApiResult<Vec<Uuid>> {
    ids.iter()
        .map(|u| id::parse_lenient(u).map_err(ApiError::from))
        .collect()
}

impl ApiServer {
    pub fn list(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        params: &ListParams,
    ) -> ApiResult<Outcome> {
        let desc = resource_desc(resource_type)?;
        let ty = desc.name();
        self.check_rbac(ctx, ty, &[], Crud::Read)?;
        let query = self.list_query(desc, params)?;
        let page = self.db().list(&query)?;
        let admin = self.perms().is_admin(&ctx.identity);
        let mut visible = Vec::with_capacity(page.uuids.len());
        for uuid in &page.uuids {
            let body = self.shallow(ty, uuid)?;
            if admin || self.listable(ctx, &body, params.shared) {
                visible.push((*uuid, body));
            }
        }
        let plural = desc.plural.as_str();
        if params.count {
            return Ok(Outcome::ok(
                json!({ plural: { "count": visible.len() } }),
            ));
        }
        let mut items = Vec::with_capacity(visible.len());
        for (uuid, body) in visible {
            if params.detail {
                let read = ReadParams {
                    fields: params.fields.clone(),
                    exclude_back_refs: params.exclude_back_refs,
                    exclude_children: params.exclude_children,
                    exclude_hrefs: params.exclude_hrefs,
                    if_none_match: None,
                };
                let outcome = self.read(&ctx.as_internal(), ty, &uuid, &read)?;
                if let Some(obj) = outcome.object() {
                    let mut obj = obj.clone();
                    self.view(ctx, desc, &mut obj, !params.exclude_hrefs);
                    items.push(json!({ ty: obj }));
                }
                continue;
            }
            let mut item = Map::new();
            item.insert("uuid".into(), json!(uuid.to_string()));
            item.insert(
                "fq_name".into(),
                body.get("fq_name").cloned().unwrap_or(Value::Null),
            );
            if !params.exclude_hrefs {
                item.insert("href".into(), json!(self.href(ty, &uuid)));
            }
            for field in params.fields.iter().flatten() {
                if let Some(value) = body.get(field) {
                    item.insert(field.clone(), value.clone());
                }
            }
            items.push(Value::Object(item));
        }
        let mut out = Map::new();
        out.insert(plural.to_string(), Value::Array(items));
        if query.limit.is_some() {
            out.insert(
                "marker".into(),
                json!(page.marker.map(|m| format!("{m}"))),
            );
        }
        Ok(Outcome::ok(Value::Object(out)))
    }

    fn list_query(&self, desc: &ResourceDesc, params: &ListParams) -> ApiResult<ListQuery> {
        let mut parents = parse_ids(&params.parent_id)?;
        if let Some(fq) = &params.parent_fq_name_str {
            let fq = FqName::parse(fq, None);
            let ptype = match &params.parent_type {
                Some(t) => t.clone(),
                None => desc
                    .parent_types()
                    .next()
                    .ok_or_else(|| {
                        ApiError::bad_request("Bad Request, parent_type is required")
                    })?
                    .to_string(),
            };
            parents.push(self.db().uuid_of(&ptype, &fq)?);
        }
        let mut obj_uuids = parse_ids(&params.obj_uuids)?;
        for fq in &params.fq_names {
            if let Ok(uuid) = self.db().uuid_of(desc.name(), fq) {
                obj_uuids.push(uuid);
            }
        }
        let has_objs = !params.obj_uuids.is_empty() || !params.fq_names.is_empty();
        let backrefs = parse_ids(&params.back_ref_id)?;
        Ok(ListQuery {
            resource_type: desc.name().to_string(),
            parent_uuids: (!parents.is_empty()).then_some(parents),
            backref_uuids: (!backrefs.is_empty()).then_some(backrefs),
            obj_uuids: has_objs.then_some(obj_uuids),
            filters: params.filters.clone(),
            marker: params.marker()?,
            limit: params.limit(self.config().paginate_count)?,
        })
    }

    /// Whether a non-admin caller sees a resource in a collection.
    fn listable(&self, ctx: &RequestContext, body: &Map<String, Value>, shared: bool) -> bool {
        let visible = body
            .get("id_perms")
            .and_then(|p| p.get("user_visible"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !visible {
            return false;
        }
        let perms = Perms2::of(body);
        if ctx.identity.owns(&perms.owner) {
            return true;
        }
        shared && self.perms().access(&ctx.identity, &perms) & PERMS_R != 0
    }

    /// Read shallow bodies by id, for the bulk and adapter paths.
    pub fn read_many(&self, uuids: &[Uuid]) -> Vec<Map<String, Value>> {
        uuids
            .iter()
            .filter_map(|u| self.db().read(u, &ReadOptions::shallow()).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn query_parsing() {
        let params = ListParams::from_pairs([
            ("detail", "True"),
            ("fields", "a,b"),
            ("filters", "is_shared==true,name==x,name==y"),
            ("page_limit", "5"),
        ])
        .unwrap();
        assert!(params.detail);
        assert_eq!(params.fields, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(
            params.filters,
            vec![
                ("is_shared".to_string(), vec![json!(true)]),
                ("name".to_string(), vec![json!("x"), json!("y")]),
            ]
        );
        assert_eq!(params.limit(256).unwrap(), Some(5));
    }

    #[test]
    fn page_marker_forms() {
        let mut params = ListParams {
            page_marker: Some("none".to_string()),
            ..ListParams::default()
        };
        assert_eq!(params.marker().unwrap(), None);
        let uuid = Uuid::new_v4();
        params.page_marker = Some(format!("default-domain:p:{uuid}"));
        assert_eq!(params.marker().unwrap(), Some(uuid));
        params.page_marker = Some("bogus".to_string());
        assert!(params.marker().is_err());
        params.page_limit = Some(0);
        assert!(params.limit(10).is_err());
    }
}
