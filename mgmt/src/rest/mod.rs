// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The REST surface of the API server.

mod actions;
mod crud;
mod identity;
mod reply;

pub use reply::{RestError, RestResult};

use crate::server::ApiServer;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use config::{ApiError, ApiResult, registry};
use serde_json::{Map, Value, json};
use std::sync::Arc;

use tracectl::trace_target;
trace_target!("rest", LevelFilter::INFO, &["rest"]);

/// A raw request body, or why it could not be read (e.g. it exceeds `max_request_size`).
pub type RequestBody = Result<Bytes, BytesRejection>;

/// Endpoints listed on the home page besides the per-type ones: uri, link name, method.
const ACTION_LINKS: &[(&str, &str, &str)] = &[
    ("/prop-collection-get", "prop-collection-get", "GET"),
    ("/prop-collection-update", "prop-collection-update", "POST"),
    ("/ref-update", "ref-update", "POST"),
    ("/ref-relax-for-delete", "ref-relax-for-delete", "POST"),
    ("/fqname-to-id", "name-to-id", "POST"),
    ("/id-to-fqname", "id-to-name", "POST"),
    ("/useragent-kv", "useragent-keyvalue", "POST"),
    ("/db-check", "database-check", "POST"),
    ("/fetch-records", "fetch-records", "POST"),
    ("/list-bulk-collection", "list-bulk-collection", "POST"),
    ("/obj-perms", "obj-perms", "GET"),
    ("/chown", "chown", "POST"),
    ("/chmod", "chmod", "POST"),
    ("/aaa-mode", "aaa-mode", "PUT"),
    ("/obj-cache", "obj-cache", "POST"),
    ("/execute-job", "execute-job", "POST"),
    ("/set-tag", "set-tag", "POST"),
    ("/security-policy-draft", "security-policy-draft", "POST"),
];

/// The JSON document of a request. An empty body reads as an empty object.
pub fn json_body(body: RequestBody) -> ApiResult<Value> {
    let bytes = body.map_err(|e| ApiError::bad_request(format!("Bad Request, {e}")))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::bad_request(format!("Bad Request, invalid JSON body: {e}")))
}

pub fn json_object(body: RequestBody) -> ApiResult<Map<String, Value>> {
    match json_body(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("Bad Request, body must be a JSON object")),
    }
}

fn link(base: &str, rel: &str, uri: &str, name: &str, method: Option<&str>) -> Value {
    json!({ "link": {
        "rel": rel,
        "href": format!("{base}{uri}"),
        "name": name,
        "method": method,
    }})
}

/// The link directory served on `/`.
#[must_use]
pub fn home_page(base: &str) -> Value {
    let mut types: Vec<_> = registry().iter().collect();
    types.sort_by_key(|d| d.name());
    let mut links = vec![link(base, "root", "/config-root", "config-root", None)];
    for desc in &types {
        links.push(link(base, "collection", &format!("/{}", desc.plural), desc.name(), None));
    }
    for desc in &types {
        links.push(link(base, "resource-base", &format!("/{}", desc.name()), desc.name(), None));
    }
    for (uri, name, method) in ACTION_LINKS {
        links.push(link(base, "action", uri, name, Some(method)));
    }
    json!({ "href": base, "links": links })
}

async fn home(State(api): State<Arc<ApiServer>>) -> RestResult {
    Ok(crate::pipeline::Outcome::ok(home_page(&api.base_url())))
}

/// Every route of the server, with `api` as shared state.
pub fn router(api: Arc<ApiServer>) -> Router {
    let body_limit = api.config().max_request_size;
    Router::new()
        .route("/", get(home))
        .route(
            "/prop-collection-get",
            get(actions::prop_collection_get),
        )
        .route(
            "/prop-collection-update",
            post(actions::prop_collection_update),
        )
        .route("/ref-update", post(actions::ref_update))
        .route("/ref-relax-for-delete", post(actions::ref_relax_for_delete))
        .route("/fqname-to-id", post(actions::fqname_to_id))
        .route("/id-to-fqname", post(actions::id_to_fqname))
        .route("/useragent-kv", post(actions::useragent_kv))
        .route("/db-check", post(actions::db_check).get(actions::db_check))
        .route(
            "/fetch-records",
            post(actions::fetch_records).get(actions::fetch_records),
        )
        .route("/list-bulk-collection", post(actions::list_bulk_collection))
        .route("/obj-perms", get(actions::obj_perms))
        .route("/chown", post(actions::chown))
        .route("/chmod", post(actions::chmod))
        .route(
            "/aaa-mode",
            get(actions::get_aaa_mode).put(actions::put_aaa_mode),
        )
        .route(
            "/obj-cache",
            get(actions::obj_cache_stats).post(actions::obj_cache_dump),
        )
        .route("/execute-job", post(actions::execute_job))
        .route("/set-tag", post(actions::set_tag))
        .route(
            "/security-policy-draft",
            post(actions::security_policy_draft),
        )
        .route("/{name}/{id}/{action}", post(actions::network_action))
        .route("/{name}", get(crud::list).post(crud::create))
        .route(
            "/{name}/{id}",
            get(crud::read).put(crud::update).delete(crud::delete),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(api)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_page_links_collections_and_actions() {
        let page = home_page("http://h:1");
        let links = page["links"].as_array().unwrap();
        let hrefs: Vec<&str> = links
            .iter()
            .filter_map(|l| l["link"]["href"].as_str())
            .collect();
        assert!(hrefs.contains(&"http://h:1/virtual-networks"));
        assert!(hrefs.contains(&"http://h:1/virtual-network"));
        assert!(hrefs.contains(&"http://h:1/ref-update"));
        assert_eq!(page["href"], "http://h:1");
    }

    #[test]
    fn empty_bodies_read_as_objects() {
        assert_eq!(json_body(Ok(Bytes::from_static(b" "))).unwrap(), json!({}));
        assert!(json_body(Ok(Bytes::from_static(b"{"))).is_err());
        assert!(json_object(Ok(Bytes::from_static(b"[1]"))).is_err());
    }
}
