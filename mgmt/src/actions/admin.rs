// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Operator facing actions: user-agent store, consistency checks, cache inspection, bulk
//! listing and the job executor.

use crate::context::RequestContext;
use crate::pipeline::{ListParams, audit};
use crate::server::ApiServer;
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use perms::Crud;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentKvRequest {
    pub operation: Option<String>,
    pub key: Option<Value>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Body of an obj-cache POST.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjCacheQuery {
    #[serde(default)]
    pub uuids: Option<Vec<String>>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteJob {
    #[serde(default)]
    pub job_template_id: Option<String>,
    #[serde(default)]
    pub job_template_fq_name: Option<FqName>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl ApiServer {
    pub fn useragent_kv(&self, ctx: &RequestContext, req: &UserAgentKvRequest) -> ApiResult<Value> {
        self.check_rbac(ctx, "useragent-kv", &[], Crud::Create)?;
        let oper = req.operation.as_deref().ok_or_else(|| {
            ApiError::bad_request("Error: Key/value store API needs 'operation' parameter")
        })?;
        let key = req.key.as_ref().ok_or_else(|| {
            ApiError::bad_request("Error: Key/value store API needs 'key' parameter")
        })?;
        match (oper, key) {
            ("STORE", Value::String(key)) => {
                self.useragent()
                    .store(key, req.value.as_deref().unwrap_or_default());
                Ok(json!({}))
            }
            ("RETRIEVE", Value::String(key)) => {
                let value = self
                    .useragent()
                    .retrieve(key)
                    .map_err(|_| ApiError::NotFound(format!("Unknown User-Agent key {key}")))?;
                Ok(json!({ "value": value }))
            }
            ("RETRIEVE", Value::Array(keys)) => {
                let keys: Vec<String> = keys
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                let found: Vec<Value> = self
                    .useragent()
                    .retrieve_many(&keys)
                    .into_iter()
                    .map(|(key, value)| json!({ "key": key, "value": value }))
                    .collect();
                Ok(json!({ "value": found }))
            }
            ("DELETE", Value::String(key)) => {
                self.useragent().delete(key);
                Ok(json!({}))
            }
            ("STORE" | "RETRIEVE" | "DELETE", _) => {
                Err(ApiError::bad_request("Error: Key/value store API key must be a string"))
            }
            (oper, _) => Err(ApiError::NotFound(format!("Invalid Operation {oper}"))),
        }
    }

    /// Inconsistencies of the resource table. Nothing is changed.
    pub fn db_check(&self, ctx: &RequestContext) -> ApiResult<Value> {
        self.require_admin(ctx)?;
        let report = self.db().check();
        for line in &report {
            warn!("db-check: {line}");
        }
        Ok(json!({ "results": report }))
    }

    pub fn fetch_records(&self, ctx: &RequestContext) -> ApiResult<Value> {
        self.require_admin(ctx)?;
        Ok(json!({ "results": self.db().dump() }))
    }

    #[must_use]
    pub fn obj_cache_stats(&self) -> Value {
        self.cache().stats_value()
    }

    /// Cached entries, restricted to the given ids, at most `count` of them (10 by default).
    pub fn obj_cache_dump(&self, ctx: &RequestContext, query: &ObjCacheQuery) -> ApiResult<Value> {
        self.require_admin(ctx)?;
        let mut wanted: Vec<Uuid> = Vec::new();
        for u in query.uuids.iter().flatten().chain(query.uuid.iter()) {
            wanted.push(id::parse_lenient(u)?);
        }
        let entries = if wanted.is_empty() {
            self.cache().dump(None, Some(query.count.unwrap_or(10)))
        } else {
            self.cache().dump(Some(&wanted), query.count)
        };
        Ok(Value::Array(entries))
    }

    /// A list request whose options travel in the body, for lists too long for a query string.
    pub fn list_bulk_collection(&self, ctx: &RequestContext, body: &Value) -> ApiResult<Value> {
        let mut body = body
            .as_object()
            .cloned()
            .ok_or_else(|| ApiError::bad_request("Bad Request, body must be an object"))?;
        let ty = body
            .remove("type")
            .and_then(|t| t.as_str().map(str::to_string))
            .ok_or_else(|| ApiError::bad_request("Bad Request, type needed"))?;
        let params = ListParams::from_json(&body)?;
        Ok(self.list(ctx, &ty, &params)?.body)
    }

    /// Hand a job to the external executor. Refused unless the executor is enabled.
    pub fn execute_job(&self, ctx: &RequestContext, req: &ExecuteJob) -> ApiResult<Value> {
        if !self.config().enable_fabric_ansible {
            return Err(ApiError::MethodNotAllowed(
                "Fabric ansible job manager is not enabled".to_string(),
            ));
        }
        self.check_rbac(ctx, "execute-job", &[], Crud::Create)?;
        let template = match (&req.job_template_id, &req.job_template_fq_name) {
            (Some(uuid), _) => {
                let uuid = id::parse_lenient(uuid)?;
                if self.db().resource_type(&uuid)? != "job-template" {
                    return Err(ApiError::bad_request(format!(
                        "Bad Request, {uuid} is not a job template"
                    )));
                }
                uuid
            }
            (None, Some(fq)) => self.db().uuid_of("job-template", fq)?,
            (None, None) => {
                return Err(ApiError::bad_request(
                    "Bad Request, job_template_id or job_template_fq_name needed",
                ));
            }
        };
        if req.input.as_ref().is_some_and(|i| !i.is_object()) {
            return Err(ApiError::bad_request("Bad Request, job input must be an object"));
        }
        let execution = format!(
            "{}_{}",
            chrono::Utc::now().timestamp_millis(),
            self.next_job_id()
        );
        info!(
            "Job {execution} of template {template} handed to {}",
            self.config().fabric_ansible_dir
        );
        audit(ctx, "execute-job", "job-template", Some(&template), Ok(()));
        Ok(json!({ "job_execution_id": execution }))
    }

    fn require_admin(&self, ctx: &RequestContext) -> ApiResult<()> {
        if self.perms().is_admin(&ctx.identity) {
            Ok(())
        } else {
            Err(ApiError::Permission(" Permission denied".to_string()))
        }
    }
}
