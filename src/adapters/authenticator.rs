use std::sync::Arc;

use async_trait::async_trait;
use http::header;

use crate::{
    config::{AuthConfig, AuthMode},
    ports::authenticator::{AuthError, AuthRequest, Authenticator, Identity},
};

/// Accepts every request as anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn authenticate(&self, _request: AuthRequest<'_>) -> Result<Identity, AuthError> {
        Ok(Identity::anonymous())
    }
}

/// Requires a non-empty `Authorization: Bearer <token>` header. The token is
/// not verified here; upstream services validate it.
#[derive(Debug, Default, Clone, Copy)]
pub struct BearerAuthenticator;

#[async_trait]
impl Authenticator for BearerAuthenticator {
    async fn authenticate(&self, request: AuthRequest<'_>) -> Result<Identity, AuthError> {
        let value = request
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::MissingCredentials)?
            .to_str()
            .map_err(|_| AuthError::InvalidCredentials("non-ascii header".to_string()))?;

        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::trim)
            .ok_or_else(|| AuthError::InvalidCredentials("expected a bearer token".to_string()))?;

        if token.is_empty() {
            return Err(AuthError::InvalidCredentials("empty bearer token".to_string()));
        }

        Ok(Identity {
            subject: "bearer".to_string(),
        })
    }
}

pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match config.mode {
        AuthMode::None => Arc::new(NoAuth),
        AuthMode::Bearer => Arc::new(BearerAuthenticator),
    }
}
