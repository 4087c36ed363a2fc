//! Secrets resolution interface
//!
//! The gateway never holds backend credentials for longer than one request.
//! Every operation asks a [`SecretResolver`] for the store's URL and token,
//! trading a small latency cost for credential-rotation safety.
//!
//! # Backends
//!
//! - **EnvSecretResolver**: reads environment variables (and `.env` files)
//!
//! Other backends plug in by implementing [`SecretResolver`].
//!
//! # Usage
//!
//! ```no_run
//! use shared::secrets::{EnvSecretResolver, SecretRequest, SecretResolver};
//!
//! # async fn example() -> Result<(), shared::SecretsError> {
//! let resolver = EnvSecretResolver::new();
//! let url = resolver
//!     .get_secret("UPSTASH_REDIS_REST_URL", Some("user_123"), &SecretRequest::new("cache-backend"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod env_backend;
pub mod types;

use async_trait::async_trait;

pub use env_backend::EnvSecretResolver;
pub use types::{SecretRequest, SecretsError};

/// Resolves a logical secret name to its current value
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Fetch a secret
    ///
    /// # Arguments
    ///
    /// * `name` - Logical secret name
    /// * `caller_id` - Identity the lookup is made on behalf of (audit only)
    /// * `metadata` - Purpose and correlation id
    ///
    /// # Errors
    ///
    /// [`SecretsError::NotFound`] when the secret is not configured, other
    /// variants when the backend fails or the value is unusable.
    async fn get_secret(
        &self,
        name: &str,
        caller_id: Option<&str>,
        metadata: &SecretRequest,
    ) -> Result<String, SecretsError>;
}
