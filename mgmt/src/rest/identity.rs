// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Who is calling: the request context built from the request headers.

use crate::context::RequestContext;
use crate::server::ApiServer;
use axum::http::HeaderMap;
use config::{ApiError, ApiResult};
use perms::{AuthError, Identity};

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn roles(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// The identity a caller claims through plain headers. Only trusted when authentication is off.
fn claimed_identity(headers: &HeaderMap) -> Identity {
    let mut identity = Identity {
        user: header(headers, "x-user-name"),
        user_id: header(headers, "x-user-id"),
        project: header(headers, "x-project-name"),
        domain: header(headers, "x-domain-name"),
        roles: header(headers, "x-role").as_deref().map(roles).unwrap_or_default(),
        ..Identity::default()
    };
    if let Some(project_id) = header(headers, "x-project-id") {
        identity = identity.with_project_id(&project_id);
    }
    identity
}

pub(crate) async fn request_context(
    api: &ApiServer,
    headers: &HeaderMap,
) -> ApiResult<RequestContext> {
    api.note_request();
    let identity = if api.perms().is_auth_needed() {
        let token = header(headers, "x-auth-token").ok_or(AuthError::MissingToken)?;
        let auth = api
            .auth()
            .ok_or_else(|| ApiError::Internal("No identity service configured".to_string()))?;
        let info = auth.validate_token(&token).await?;
        let mut identity = Identity::from_token(&info);
        // an administrator may act with a narrower set of roles
        if let Some(api_roles) = header(headers, "x-api-role")
            && api.perms().is_admin(&identity)
        {
            identity.roles = roles(&api_roles);
        }
        identity
    } else {
        claimed_identity(headers)
    };
    let mut ctx = RequestContext::new(identity);
    if let Some(request_id) = header(headers, "x-request-id") {
        ctx = ctx.with_request_id(request_id);
    }
    ctx.user_agent = header(headers, "x-contrail-useragent");
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn headers_name_the_caller() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-name", HeaderValue::from_static("alice"));
        headers.insert("x-role", HeaderValue::from_static("member, reader"));
        headers.insert(
            "x-project-id",
            HeaderValue::from_static("4f5b2d2a-8ab4-4d0b-bb9b-4b0a3c6a7f10"),
        );
        let identity = claimed_identity(&headers);
        assert_eq!(identity.user.as_deref(), Some("alice"));
        assert_eq!(identity.roles, vec!["member".to_string(), "reader".to_string()]);
        assert!(identity.owns("4f5b2d2a8ab44d0bbb9b4b0a3c6a7f10"));
        assert!(!identity.internal);
    }
}
