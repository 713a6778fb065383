// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Action endpoints. Each handler decodes its request and hands it to the matching
//! [`ApiServer`] operation.

use super::identity::request_context;
use super::reply::RestResult;
use super::{RequestBody, json_body};
use crate::actions::{
    Chmod, Chown, DraftAction, ExecuteJob, FqNameToId, IdToFqName, IpAlloc, IpFree,
    ObjCacheQuery, PropCollectionGet, PropCollectionUpdate, SubnetIpCount, UserAgentKvRequest,
    decode,
};
use crate::pipeline::Outcome;
use crate::refs::{RefRelax, RefUpdate};
use crate::server::ApiServer;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use config::ApiError;
use serde_json::{Map, Value, json};
use std::sync::Arc;

type Api = State<Arc<ApiServer>>;
type Pairs = Query<Vec<(String, String)>>;

/// Query pairs as a JSON object, so query-driven actions decode like body-driven ones.
fn query_object(pairs: Vec<(String, String)>) -> Value {
    Value::Object(
        pairs
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<String, Value>>(),
    )
}

pub(super) async fn prop_collection_get(
    State(api): Api,
    Query(pairs): Pairs,
    headers: HeaderMap,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: PropCollectionGet = decode("prop-collection-get", query_object(pairs))?;
    Ok(Outcome::ok(api.prop_collection_get(&ctx, &req)?))
}

pub(super) async fn prop_collection_update(
    State(api): Api,
    headers: HeaderMap,
    body: RequestBody,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: PropCollectionUpdate = decode("prop-collection-update", json_body(body)?)?;
    Ok(Outcome::ok(api.prop_collection_update(&ctx, &req)?))
}

pub(super) async fn ref_update(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: RefUpdate = decode("ref-update", json_body(body)?)?;
    let uuid = api.ref_update(&ctx, &req).await?;
    Ok(Outcome::ok(json!({ "uuid": uuid.to_string() })))
}

pub(super) async fn ref_relax_for_delete(
    State(api): Api,
    headers: HeaderMap,
    body: RequestBody,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: RefRelax = decode("ref-relax-for-delete", json_body(body)?)?;
    let uuid = api.ref_relax_for_delete(&ctx, &req)?;
    Ok(Outcome::ok(json!({ "uuid": uuid.to_string() })))
}

pub(super) async fn fqname_to_id(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: FqNameToId = decode("fqname-to-id", json_body(body)?)?;
    Ok(Outcome::ok(api.fqname_to_id(&ctx, &req)?))
}

pub(super) async fn id_to_fqname(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: IdToFqName = decode("id-to-fqname", json_body(body)?)?;
    Ok(Outcome::ok(api.id_to_fqname(&ctx, &req)?))
}

pub(super) async fn useragent_kv(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: UserAgentKvRequest = decode("useragent-kv", json_body(body)?)?;
    Ok(Outcome::ok(api.useragent_kv(&ctx, &req)?))
}

pub(super) async fn db_check(State(api): Api, headers: HeaderMap) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    Ok(Outcome::ok(api.db_check(&ctx)?))
}

pub(super) async fn fetch_records(State(api): Api, headers: HeaderMap) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    Ok(Outcome::ok(api.fetch_records(&ctx)?))
}

pub(super) async fn list_bulk_collection(
    State(api): Api,
    headers: HeaderMap,
    body: RequestBody,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    Ok(Outcome::ok(api.list_bulk_collection(&ctx, &json_body(body)?)?))
}

pub(super) async fn obj_perms(State(api): Api, Query(pairs): Pairs, headers: HeaderMap) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let uuid = pairs.iter().find(|(k, _)| k == "uuid").map(|(_, v)| v.as_str());
    Ok(Outcome::ok(api.obj_perms(&ctx, uuid)?))
}

pub(super) async fn chown(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: Chown = decode("chown", json_body(body)?)?;
    Ok(Outcome::ok(api.chown(&ctx, &req)?))
}

pub(super) async fn chmod(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: Chmod = decode("chmod", json_body(body)?)?;
    Ok(Outcome::ok(api.chmod(&ctx, &req)?))
}

pub(super) async fn get_aaa_mode(State(api): Api, headers: HeaderMap) -> RestResult {
    request_context(&api, &headers).await?;
    Ok(Outcome::ok(api.aaa_mode()))
}

pub(super) async fn put_aaa_mode(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    Ok(Outcome::ok(api.set_aaa_mode(&ctx, &json_body(body)?).await?))
}

pub(super) async fn obj_cache_stats(State(api): Api, headers: HeaderMap) -> RestResult {
    request_context(&api, &headers).await?;
    Ok(Outcome::ok(api.obj_cache_stats()))
}

pub(super) async fn obj_cache_dump(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: ObjCacheQuery = decode("obj-cache", json_body(body)?)?;
    Ok(Outcome::ok(api.obj_cache_dump(&ctx, &req)?))
}

pub(super) async fn execute_job(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: ExecuteJob = decode("execute-job", json_body(body)?)?;
    Ok(Outcome::ok(api.execute_job(&ctx, &req)?))
}

pub(super) async fn set_tag(State(api): Api, headers: HeaderMap, body: RequestBody) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    Ok(Outcome::ok(api.set_tag(&ctx, &json_body(body)?).await?))
}

pub(super) async fn security_policy_draft(
    State(api): Api,
    headers: HeaderMap,
    body: RequestBody,
) -> RestResult {
    let ctx = request_context(&api, &headers).await?;
    let req: DraftAction = decode("security-policy-draft", json_body(body)?)?;
    Ok(Outcome::ok(api.security_policy_draft(&ctx, &req).await?))
}

/// `/virtual-network/<id>/<action>`: the address management actions of a network.
pub(super) async fn network_action(
    State(api): Api,
    Path((resource, vn, action)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: RequestBody,
) -> RestResult {
    if resource != "virtual-network" {
        return Err(ApiError::NotFound(format!("No action {action} on {resource}")).into());
    }
    let ctx = request_context(&api, &headers).await?;
    let vn = id::parse_lenient(&vn)?;
    let body = json_body(body)?;
    let result = match action.as_str() {
        "ip-alloc" => api.ip_alloc(&ctx, &vn, &decode::<IpAlloc>("ip-alloc", body)?)?,
        "ip-free" => api.ip_free(&ctx, &vn, &decode::<IpFree>("ip-free", body)?)?,
        "subnet-ip-count" => api.subnet_ip_count(
            &ctx,
            &vn,
            &decode::<SubnetIpCount>("subnet-ip-count", body)?,
        )?,
        _ => {
            return Err(ApiError::NotFound(format!("No action {action} on {resource}")).into());
        }
    };
    Ok(Outcome::ok(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_decode_as_objects() {
        let req: PropCollectionGet = decode(
            "prop-collection-get",
            query_object(vec![
                ("uuid".to_string(), "x".to_string()),
                ("fields".to_string(), "a,b".to_string()),
            ]),
        )
        .unwrap();
        assert_eq!(req.uuid.as_deref(), Some("x"));
        assert_eq!(req.fields.as_deref(), Some("a,b"));
        assert!(req.position.is_none());
    }
}
