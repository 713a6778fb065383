// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::auth::TokenInfo;

/// Who issued a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: Option<String>,
    pub user_id: Option<String>,
    pub project: Option<String>,
    /// Tenant id, undashed.
    pub project_id: Option<String>,
    pub domain: Option<String>,
    /// Domain id, undashed.
    pub domain_id: Option<String>,
    pub roles: Vec<String>,
    /// Requests issued by the server itself or by an adapter on its behalf.
    pub internal: bool,
}

fn normalize_id(id: &str) -> String {
    id.replace('-', "").to_ascii_lowercase()
}

impl Identity {
    /// The identity of requests the server issues to itself.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user: Some("system".to_string()),
            roles: vec!["admin".to_string()],
            internal: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_token(token: &TokenInfo) -> Self {
        Self {
            user: token.user.clone(),
            user_id: token.user_id.clone(),
            project: token.project.clone(),
            project_id: token.project_id.as_deref().map(normalize_id),
            domain: token.domain.clone(),
            domain_id: token.domain_id.as_deref().map(normalize_id),
            roles: token.roles.clone(),
            internal: false,
        }
    }

    #[must_use]
    pub fn with_project_id(mut self, project_id: &str) -> Self {
        self.project_id = Some(normalize_id(project_id));
        self
    }

    /// Case-insensitive role membership.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// Whether `owner` (dashed or not) is the caller's tenant.
    #[must_use]
    pub fn owns(&self, owner: &str) -> bool {
        self.project_id
            .as_deref()
            .is_some_and(|p| p == normalize_id(owner))
    }

    #[must_use]
    pub fn user_name(&self) -> &str {
        self.user.as_deref().unwrap_or("-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_ignores_dashes() {
        let me = Identity::default().with_project_id("4F5B2D2A-8ab4-4d0b-bb9b-4b0a3c6a7f10");
        assert!(me.owns("4f5b2d2a8ab44d0bbb9b4b0a3c6a7f10"));
        assert!(me.owns("4f5b2d2a-8ab4-4d0b-bb9b-4b0a3c6a7f10"));
        assert!(!me.owns("cloud-admin"));
        assert!(Identity::system().has_role("ADMIN"));
    }
}
