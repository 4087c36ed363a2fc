//! Key scoping and authorization
//!
//! Every key the gateway touches carries a scope prefix:
//!
//! - `user:<ownerId>:<rest>`: readable and writable by `ownerId` only
//! - `app:<rest>`: readable by anyone, writable by privileged callers
//! - `global:<rest>`: readable by anyone, never writable through the gateway
//!
//! An unscoped key is rewritten to `user:<callerId>:<key>`. Scoping runs on
//! every request before any backend call; nothing is cached.

use serde::Serialize;

use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::rate_limit::Tier;

pub const USER_PREFIX: &str = "user:";
pub const APP_PREFIX: &str = "app:";
pub const GLOBAL_PREFIX: &str = "global:";

/// Whether `id` can name a `user:<id>:` namespace. The separator is
/// excluded so one namespace can never be a prefix of another.
pub fn is_valid_user_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(':')
}

/// Ownership class of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    App,
    Global,
}

/// A key after scoping, ready for the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedKey {
    pub scope: Scope,
    pub key: String,
}

/// Who is calling, as far as scoping and rate limiting care
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    /// Authenticated user id, if any
    pub user_id: Option<String>,
    /// Admin or service caller; may write `app:` keys
    pub is_privileged: bool,
    pub tier: Tier,
    /// Rate-limit actor: the user id, or `ip:<addr>` when anonymous
    pub actor_id: String,
}

impl CallerContext {
    /// Anonymous caller identified by client IP
    pub fn anonymous(ip: &str) -> Self {
        Self {
            user_id: None,
            is_privileged: false,
            tier: Tier::Free,
            actor_id: format!("ip:{}", ip),
        }
    }

    /// Authenticated caller
    pub fn user(user_id: impl Into<String>, tier: Tier, is_privileged: bool) -> Self {
        let user_id = user_id.into();
        Self {
            actor_id: user_id.clone(),
            user_id: Some(user_id),
            is_privileged,
            tier,
        }
    }

    fn require_user(&self, message: &str) -> GatewayResult<&str> {
        let id = self
            .user_id
            .as_deref()
            .ok_or_else(|| GatewayError::auth(message))?;
        if !is_valid_user_id(id) {
            return Err(GatewayError::validation(
                "User id must be non-empty and must not contain ':'",
            ));
        }
        Ok(id)
    }
}

/// Scope a single key for a read (`is_write == false`) or a write
pub fn scope_key(key: &str, caller: &CallerContext, is_write: bool) -> GatewayResult<ScopedKey> {
    if key.is_empty() {
        return Err(GatewayError::validation("Key must not be empty"));
    }

    if let Some(rest) = key.strip_prefix(USER_PREFIX) {
        let owner = rest.split(':').next().unwrap_or_default();
        let owns = rest.contains(':')
            && caller
                .user_id
                .as_deref()
                .is_some_and(|id| is_valid_user_id(id) && id == owner);
        if !owns {
            return Err(GatewayError::validation(format!(
                "Access denied: key belongs to user '{}'",
                owner
            )));
        }
        return Ok(ScopedKey {
            scope: Scope::User,
            key: key.to_string(),
        });
    }

    if key.starts_with(APP_PREFIX) {
        if is_write && !caller.is_privileged {
            return Err(GatewayError::validation(
                "Access denied: app keys are read-only for this caller",
            ));
        }
        return Ok(ScopedKey {
            scope: Scope::App,
            key: key.to_string(),
        });
    }

    if key.starts_with(GLOBAL_PREFIX) {
        if is_write {
            return Err(GatewayError::validation(
                "Access denied: global keys are read-only",
            ));
        }
        return Ok(ScopedKey {
            scope: Scope::Global,
            key: key.to_string(),
        });
    }

    let user_id = caller.require_user("Authentication required for unscoped keys")?;
    Ok(ScopedKey {
        scope: Scope::User,
        key: format!("{}{}:{}", USER_PREFIX, user_id, key),
    })
}

/// Scope every key of a batch, failing on the first rejected key
pub fn scope_keys(
    keys: &[String],
    caller: &CallerContext,
    is_write: bool,
) -> GatewayResult<Vec<String>> {
    keys.iter()
        .map(|k| scope_key(k, caller, is_write).map(|s| s.key))
        .collect()
}

/// Escape glob metacharacters so `value` only matches itself
pub fn escape_glob(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Scope a match pattern for `keys`, `scan` or `flush_pattern`
///
/// Patterns always require an authenticated caller. They must stay inside
/// the caller's own namespace; with `allow_shared_read` a listing may also
/// target `app:` or `global:` keys.
pub fn scope_pattern(
    pattern: &str,
    caller: &CallerContext,
    allow_shared_read: bool,
) -> GatewayResult<String> {
    let user_id = caller.require_user("Authentication required for pattern operations")?;

    if pattern.is_empty() {
        return Err(GatewayError::validation("Pattern must not be empty"));
    }

    let namespace = format!("{}{}:", USER_PREFIX, escape_glob(user_id));

    if pattern.starts_with(USER_PREFIX) {
        if pattern.starts_with(&namespace) {
            return Ok(pattern.to_string());
        }
        return Err(GatewayError::validation(
            "Access denied: pattern must stay within your own namespace",
        ));
    }

    if pattern.starts_with(APP_PREFIX) || pattern.starts_with(GLOBAL_PREFIX) {
        if allow_shared_read {
            return Ok(pattern.to_string());
        }
        return Err(GatewayError::validation(
            "Access denied: shared namespaces cannot be flushed",
        ));
    }

    Ok(format!("{}{}", namespace, pattern))
}
