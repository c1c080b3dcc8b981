// src/gateway/auth.rs
//! Caller authentication

use crate::utils::config::AuthConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Who is calling, and which project their sessions live under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub project: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: Option<&str>) -> Result<Principal>;
}

/// Fixed token table loaded from configuration
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|(token, grant)| {
                (
                    token.clone(),
                    Principal {
                        user_id: grant.user_id.clone(),
                        project: grant.project.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: Option<&str>) -> Result<Principal> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::Unauthorized("missing token".into()))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| EngineError::Unauthorized("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::TokenGrant;
    use crate::utils::errors::ErrorCode;

    fn authenticator() -> StaticTokenAuthenticator {
        let mut config = AuthConfig::default();
        config.tokens.insert(
            "s3cret".into(),
            TokenGrant {
                user_id: "alice".into(),
                project: "demo".into(),
            },
        );
        StaticTokenAuthenticator::new(&config)
    }

    #[tokio::test]
    async fn test_known_token() {
        let principal = authenticator().authenticate(Some("s3cret")).await.unwrap();
        assert_eq!(principal.user_id, "alice");
        assert_eq!(principal.project, "demo");
    }

    #[tokio::test]
    async fn test_missing_or_unknown_token() {
        let auth = authenticator();
        for token in [None, Some(""), Some("guess")] {
            let err = auth.authenticate(token).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::Unauthorized);
        }
    }
}
