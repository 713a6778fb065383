// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-type verbs: `/<plural>` for list and create, `/<type>/<id>` for read, update and delete.

use super::identity::request_context;
use super::reply::RestResult;
use super::{RequestBody, json_object};
use crate::pipeline::{ListParams, Outcome, ReadParams};
use crate::server::ApiServer;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use config::{ApiError, ApiResult, ResourceDesc, registry};
use serde_json::{Map, Value};
use std::sync::Arc;

type Pairs = Query<Vec<(String, String)>>;

fn collection(plural: &str) -> ApiResult<&'static ResourceDesc> {
    registry()
        .from_plural(plural)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown collection {plural}")))
}

/// The `{<type>: {...}}` payload of a create or update, keyed by either spelling of the type.
fn resource_payload(desc: &ResourceDesc, body: Map<String, Value>) -> ApiResult<Map<String, Value>> {
    let mut body = body;
    let inner = body
        .remove(desc.name())
        .or_else(|| body.remove(&desc.object_type))
        .ok_or_else(|| {
            ApiError::bad_request(format!("Bad Request, body must carry {}", desc.name()))
        })?;
    match inner {
        Value::Object(obj) => Ok(obj),
        _ => Err(ApiError::bad_request(format!(
            "Bad Request, {} must be an object",
            desc.name()
        ))),
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn read_params(pairs: &[(String, String)], headers: &HeaderMap) -> ReadParams {
    let mut params = ReadParams {
        if_none_match: headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..ReadParams::default()
    };
    for (key, value) in pairs {
        match key.as_str() {
            "fields" => {
                params.fields = Some(
                    value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect(),
                );
            }
            "exclude_back_refs" => params.exclude_back_refs = truthy(value),
            "exclude_children" => params.exclude_children = truthy(value),
            "exclude_hrefs" => params.exclude_hrefs = truthy(value),
            _ => {}
        }
    }
    params
}

pub(super) async fn list(
    State(api): State<Arc<ApiServer>>,
    Path(plural): Path<String>,
    Query(pairs): Pairs,
    headers: HeaderMap,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let desc = collection(&plural)?;
    let params = ListParams::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    Ok(api.list(&ctx, desc.name(), &params)?)
}

pub(super) async fn create(
    State(api): State<Arc<ApiServer>>,
    Path(plural): Path<String>,
    headers: HeaderMap,
    body: RequestBody,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let desc = collection(&plural)?;
    let obj = resource_payload(desc, json_object(body)?)?;
    Ok(api.create(&ctx, desc.name(), obj).await?)
}

pub(super) async fn read(
    State(api): State<Arc<ApiServer>>,
    Path((ty, uuid)): Path<(String, String)>,
    Query(pairs): Pairs,
    headers: HeaderMap,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let ty = ApiServer::resource_type(&ty)?;
    let uuid = id::parse_lenient(&uuid)?;
    Ok(api.read(&ctx, ty, &uuid, &read_params(&pairs, &headers))?)
}

pub(super) async fn update(
    State(api): State<Arc<ApiServer>>,
    Path((ty, uuid)): Path<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let desc = registry().get(&ty)?;
    let uuid = id::parse_lenient(&uuid)?;
    let patch = resource_payload(desc, json_object(body)?)?;
    Ok(api.update(&ctx, desc.name(), &uuid, patch).await?)
}

pub(super) async fn delete(
    State(api): State<Arc<ApiServer>>,
    Path((ty, uuid)): Path<(String, String)>,
    headers: HeaderMap,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let ty = ApiServer::resource_type(&ty)?;
    let uuid = id::parse_lenient(&uuid)?;
    let outcome: Outcome = api.delete(&ctx, ty, &uuid).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_accepts_both_spellings() {
        let desc = registry().get("virtual-network").unwrap();
        let body = json!({"virtual_network": {"display_name": "x"}});
        let obj = resource_payload(desc, body.as_object().unwrap().clone()).unwrap();
        assert_eq!(obj.get("display_name"), Some(&json!("x")));
        let body = json!({"network-ipam": {}});
        assert!(resource_payload(desc, body.as_object().unwrap().clone()).is_err());
    }

    #[test]
    fn read_options_from_query() {
        let pairs = vec![
            ("fields".to_string(), "a,b".to_string()),
            ("exclude_back_refs".to_string(), "True".to_string()),
        ];
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, "\"stamp\"".parse().unwrap());
        let params = read_params(&pairs, &headers);
        assert_eq!(params.fields, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(params.exclude_back_refs);
        assert!(!params.exclude_children);
        assert_eq!(params.if_none_match.as_deref(), Some("\"stamp\""));
    }
}
