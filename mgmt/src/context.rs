// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-request context threaded through the pipeline.

use id::Uuid;
use perms::Identity;

/// Who issued a request and how to correlate its logs.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub identity: Identity,
    pub user_agent: Option<String>,
    /// Set while a security draft is being committed: writes go to the live scope.
    pub draft_commit: bool,
}

impl RequestContext {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            request_id: format!("req-{}", Uuid::new_v4()),
            identity,
            user_agent: None,
            draft_commit: false,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// A context for requests the server issues on its own.
    #[must_use]
    pub fn internal() -> Self {
        Self::new(Identity::system())
    }

    /// The context of a request issued on behalf of this one, with system privileges.
    ///
    /// The caller keeps its own context; the derived one only lives for the internal call.
    #[must_use]
    pub fn as_internal(&self) -> Self {
        let mut identity = Identity::system();
        identity.project_id.clone_from(&self.identity.project_id);
        identity.project.clone_from(&self.identity.project);
        Self {
            request_id: self.request_id.clone(),
            identity,
            user_agent: self.user_agent.clone(),
            draft_commit: self.draft_commit,
        }
    }

    /// The internal context used to apply a committed security draft.
    #[must_use]
    pub fn for_draft_commit(&self) -> Self {
        Self {
            draft_commit: true,
            ..self.as_internal()
        }
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.identity.internal
    }
}
