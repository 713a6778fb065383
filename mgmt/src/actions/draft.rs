// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! security-policy-draft: commit or discard the staged security resources of a scope.

use crate::context::RequestContext;
use crate::hooks::{commit_draft, discard_draft, draft_scope_by_id};
use crate::pipeline::audit;
use crate::server::ApiServer;
use config::{ApiError, ApiResult};
use perms::{Crud, Perms2};
use serde::Deserialize;
use serde_json::{Value, json};
use store::ReadOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct DraftAction {
    pub scope_uuid: Option<String>,
    pub action: Option<String>,
}

impl ApiServer {
    pub async fn security_policy_draft(
        &self,
        ctx: &RequestContext,
        req: &DraftAction,
    ) -> ApiResult<Value> {
        let scope_uuid = req
            .scope_uuid
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Bad Request, scope_uuid needed"))?;
        let scope_uuid = id::parse_lenient(scope_uuid)?;
        let action = req.action.as_deref().unwrap_or_default();
        if !matches!(action, "commit" | "discard") {
            return Err(ApiError::bad_request(format!(
                "Bad Request, unknown security draft action {action:?}, use commit or discard"
            )));
        }
        self.check_rbac(ctx, "security-policy-draft", &[], Crud::Update)?;
        if !self.perms().is_admin(&ctx.identity) {
            let body = self.db().read(&scope_uuid, &ReadOptions::shallow())?;
            self.perms()
                .check_write(&ctx.identity, &Perms2::of(&body))?;
        }
        self.check_backpressure()?;
        let scope = draft_scope_by_id(self, &scope_uuid)?;
        let result = if action == "commit" {
            commit_draft(self, ctx, &scope).await
        } else {
            discard_draft(self, ctx, &scope).await
        };
        let oper = format!("security-policy-draft {action}");
        audit(ctx, &oper, "policy-management", Some(&scope.scope_uuid), result.as_ref().map(|()| ()));
        result?;
        Ok(json!({}))
    }
}
