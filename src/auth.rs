//! Token verification capability.
//!
//! Identity lives in an external service; the engine only needs a yes
//! or no plus the user id a token belongs to. `HttpTokenVerifier` asks
//! that service; `StaticTokenVerifier` backs development and tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::AuthConfig;
use crate::errors::AuthError;

/// Claims the engine cares about.
#[derive(Clone, Debug)]
pub struct AuthClaims {
    pub user_id: String,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthClaims, AuthError>;
}

/// Verifies bearer tokens against the external identity service.
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    verify_url: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    user_id: String,
}

impl HttpTokenVerifier {
    pub fn new(verify_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            verify_url: verify_url.into(),
        })
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let response = self
            .client
            .post(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| AuthError::Unreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "token verification rejected");
            return Err(AuthError::Rejected(format!("{status}: {body}")));
        }

        let payload: VerifyResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Rejected(format!("verify response invalid: {err}")))?;
        Ok(AuthClaims {
            user_id: payload.user_id,
        })
    }
}

/// Accepts a single configured token; everything else is rejected.
pub struct StaticTokenVerifier {
    token: String,
    user_id: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        if token == self.token {
            Ok(AuthClaims {
                user_id: self.user_id.clone(),
            })
        } else {
            Err(AuthError::Rejected("unknown token".into()))
        }
    }
}

/// Build the verifier described by the configuration. An external
/// verify endpoint wins over the development token.
pub fn verifier_from_config(
    config: &AuthConfig,
) -> Result<std::sync::Arc<dyn TokenVerifier>, AuthError> {
    if let Some(url) = &config.verify_url {
        let verifier =
            HttpTokenVerifier::new(url.clone(), Duration::from_secs(config.timeout_secs))?;
        return Ok(std::sync::Arc::new(verifier));
    }
    if let Some(token) = &config.dev_token {
        return Ok(std::sync::Arc::new(StaticTokenVerifier::new(
            token.clone(),
            "dev-user",
        )));
    }
    Err(AuthError::Rejected(
        "no verify endpoint or development token configured".into(),
    ))
}
