//! Common types for secrets resolution

use serde::Serialize;
use thiserror::Error;

/// Secrets management errors
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Secret not found
    #[error("Secret not found: {0}")]
    NotFound(String),

    /// Invalid secret value
    #[error("Invalid secret value: {0}")]
    InvalidValue(String),

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SecretsError {
    /// True when the secret simply is not configured (as opposed to a
    /// backend failure while fetching it)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SecretsError::NotFound(_) | SecretsError::Env(std::env::VarError::NotPresent)
        )
    }
}

/// Audit metadata attached to every secret lookup
#[derive(Debug, Clone, Default, Serialize)]
pub struct SecretRequest {
    /// What the secret is needed for (e.g. `cache-backend`, `health-sweep`)
    pub purpose: String,

    /// Request correlation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl SecretRequest {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(SecretsError::NotFound("X".into()).is_not_found());
        assert!(SecretsError::Env(std::env::VarError::NotPresent).is_not_found());
        assert!(!SecretsError::InvalidValue("empty".into()).is_not_found());
        assert!(!SecretsError::Config("bad".into()).is_not_found());
    }

    #[test]
    fn test_secret_request_serialization() {
        let request = SecretRequest::new("cache-backend").with_request_id("req-1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["purpose"], "cache-backend");
        assert_eq!(json["request_id"], "req-1");

        let bare = serde_json::to_value(SecretRequest::new("health")).unwrap();
        assert!(bare.get("request_id").is_none());
    }
}
