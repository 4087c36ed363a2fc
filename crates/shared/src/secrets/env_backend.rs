//! Environment variable backend for secrets
//!
//! Resolves a logical secret name to an environment variable. `.env` files are
//! loaded once on construction. Values are read on every call, so a process
//! manager that rotates the environment (or a sidecar rewriting `.env` before
//! restart) is picked up without caching surprises.
//!
//! # Name mapping
//!
//! `cache-backend.url` → `CACHE_BACKEND_URL`: non-alphanumeric characters
//! become `_` and the result is upper-cased. Names already in upper snake case
//! map to themselves.

use crate::secrets::types::{SecretRequest, SecretsError};
use crate::secrets::SecretResolver;
use async_trait::async_trait;
use std::env;
use tracing::debug;

/// Secrets resolved from the process environment
#[derive(Debug, Clone, Default)]
pub struct EnvSecretResolver {
    /// Optional prefix prepended to every variable name
    prefix: Option<String>,
}

impl EnvSecretResolver {
    /// Create a resolver, loading `.env` if present
    pub fn new() -> Self {
        dotenvy::dotenv().ok();
        Self { prefix: None }
    }

    /// Create a resolver that reads `<PREFIX>_<NAME>` variables
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        dotenvy::dotenv().ok();
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Environment variable name for a logical secret name
    pub fn var_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();

        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix.to_ascii_uppercase(), normalized),
            None => normalized,
        }
    }
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn get_secret(
        &self,
        name: &str,
        caller_id: Option<&str>,
        metadata: &SecretRequest,
    ) -> Result<String, SecretsError> {
        let var = self.var_name(name);

        debug!(
            secret = %name,
            caller = caller_id.unwrap_or("anonymous"),
            purpose = %metadata.purpose,
            "Resolving secret from environment"
        );

        let value = env::var(&var).map_err(|e| match e {
            env::VarError::NotPresent => SecretsError::NotFound(var.clone()),
            other => SecretsError::Env(other),
        })?;

        if value.trim().is_empty() {
            return Err(SecretsError::InvalidValue(format!("{} is empty", var)));
        }

        Ok(value)
    }
}
