// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Token validation, delegated to an external identity service.

use async_trait::async_trait;
use config::ApiError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// What the identity service tells about a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub user: Option<String>,
    pub user_id: Option<String>,
    pub project: Option<String>,
    pub project_id: Option<String>,
    pub domain: Option<String>,
    pub domain_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Identity service unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        ApiError::Unauthorized(value.to_string())
    }
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<TokenInfo, AuthError>;
}

/// Remembers validated tokens for a short while.
pub struct CachedAuth {
    inner: Arc<dyn AuthService>,
    ttl: Duration,
    cache: DashMap<String, (Instant, TokenInfo)>,
}

impl CachedAuth {
    #[must_use]
    pub fn new(inner: Arc<dyn AuthService>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Forget a token, e.g. after it was revoked.
    pub fn invalidate(&self, token: &str) {
        self.cache.remove(token);
    }
}

#[async_trait]
impl AuthService for CachedAuth {
    async fn validate_token(&self, token: &str) -> Result<TokenInfo, AuthError> {
        if let Some(entry) = self.cache.get(token) {
            let (at, info) = entry.value();
            if at.elapsed() < self.ttl {
                return Ok(info.clone());
            }
        }
        let info = self.inner.validate_token(token).await?;
        debug!("Token validated for user {:?}", info.user);
        self.cache
            .insert(token.to_string(), (Instant::now(), info.clone()));
        Ok(info)
    }
}

/// A fixed table of tokens.
#[derive(Default)]
pub struct StaticAuth {
    tokens: DashMap<String, TokenInfo>,
    lookups: std::sync::atomic::AtomicUsize,
}

impl StaticAuth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, info: TokenInfo) {
        self.tokens.insert(token.to_string(), info);
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Number of validations served.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl AuthService for StaticAuth {
    async fn validate_token(&self, token: &str) -> Result<TokenInfo, AuthError> {
        self.lookups
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tokens
            .get(token)
            .map(|info| info.value().clone())
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn cache_expires() {
        let backend = Arc::new(StaticAuth::new());
        backend.insert(
            "t1",
            TokenInfo {
                user: Some("alice".to_string()),
                roles: vec!["member".to_string()],
                ..TokenInfo::default()
            },
        );
        let auth = CachedAuth::new(backend.clone(), Duration::from_secs(10));
        let info = auth.validate_token("t1").await.expect("Should validate");
        assert_eq!(info.user.as_deref(), Some("alice"));
        backend.revoke("t1");
        // still cached
        assert!(auth.validate_token("t1").await.is_ok());
        assert_eq!(backend.lookups(), 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            auth.validate_token("t1").await,
            Err(AuthError::InvalidToken)
        );
        let err: ApiError = AuthError::InvalidToken.into();
        assert_eq!(err.status(), 401);
    }
}
