//! Caller identity
//!
//! Turns the request's bearer token into a [`CallerContext`]. A request with
//! no token, or with one that fails verification, is anonymous and rate
//! limited by client address; key scoping then refuses anything that needs a
//! user namespace.

use actix_web::{http::header, HttpRequest};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::gateway::scope::is_valid_user_id;
use crate::gateway::{CallerContext, Tier};
use crate::middleware::client_ip::client_ip;

/// Roles allowed to write shared `app:` keys
const PRIVILEGED_ROLES: &[&str] = &["admin", "service", "service_role"];

/// Resolves the caller of a request
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, req: &HttpRequest) -> CallerContext;
}

/// Claims read from an access token
#[derive(Debug, Clone, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
    pub exp: i64,
}

impl AccessClaims {
    fn is_privileged(&self) -> bool {
        self.role
            .as_deref()
            .is_some_and(|role| PRIVILEGED_ROLES.contains(&role))
    }

    fn tier(&self) -> Tier {
        match self.tier.as_deref().map(str::parse::<Tier>) {
            Some(Ok(tier)) => tier,
            Some(Err(e)) => {
                debug!(error = %e, "Unknown tier claim, using free tier");
                Tier::Free
            }
            None if self.is_privileged() => Tier::Internal,
            None => Tier::Free,
        }
    }
}

/// HS256 bearer-token resolver
pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityResolver {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // audiences differ between issuers; the signature is what matters here
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and return its claims
    pub fn verify(&self, token: &str) -> Option<AccessClaims> {
        match decode::<AccessClaims>(token, &self.key, &self.validation) {
            Ok(data) if is_valid_user_id(&data.claims.sub) => Some(data.claims),
            Ok(_) => {
                debug!("Token subject is not a usable user id, treating caller as anonymous");
                None
            }
            Err(e) => {
                debug!(error = %e, "Token rejected, treating caller as anonymous");
                None
            }
        }
    }
}

impl IdentityResolver for JwtIdentityResolver {
    fn resolve(&self, req: &HttpRequest) -> CallerContext {
        match bearer_token(req).and_then(|token| self.verify(token)) {
            Some(claims) => CallerContext::user(
                claims.sub.clone(),
                claims.tier(),
                claims.is_privileged(),
            ),
            None => CallerContext::anonymous(&client_ip(req)),
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "test_secret_for_identity_resolution_32";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tier: Option<&'a str>,
        exp: i64,
    }

    fn token(sub: &str, role: Option<&str>, tier: Option<&str>, exp_offset: i64) -> String {
        let claims = TestClaims {
            sub,
            role,
            tier,
            exp: chrono::Utc::now().timestamp() + exp_offset,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn request_with(token: &str) -> HttpRequest {
        TestRequest::default()
            .peer_addr("203.0.113.5:5000".parse().unwrap())
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_http_request()
    }

    #[test]
    fn test_valid_token_resolves_user() {
        let resolver = JwtIdentityResolver::new(SECRET);
        let caller = resolver.resolve(&request_with(&token("user-1", None, Some("pro"), 3600)));

        assert_eq!(caller.user_id.as_deref(), Some("user-1"));
        assert_eq!(caller.actor_id, "user-1");
        assert_eq!(caller.tier, Tier::Pro);
        assert!(!caller.is_privileged);
    }

    #[test]
    fn test_service_role_is_privileged_and_internal() {
        let resolver = JwtIdentityResolver::new(SECRET);
        let caller =
            resolver.resolve(&request_with(&token("svc", Some("service_role"), None, 3600)));
        assert!(caller.is_privileged);
        assert_eq!(caller.tier, Tier::Internal);
    }

    #[test]
    fn test_expired_token_is_anonymous() {
        let resolver = JwtIdentityResolver::new(SECRET);
        let caller = resolver.resolve(&request_with(&token("user-1", None, None, -3600)));
        assert!(caller.user_id.is_none());
        assert_eq!(caller.actor_id, "ip:203.0.113.5");
    }

    #[test]
    fn test_wrong_secret_is_anonymous() {
        let resolver = JwtIdentityResolver::new("another_secret_entirely_32_chars_long");
        let caller = resolver.resolve(&request_with(&token("user-1", None, None, 3600)));
        assert!(caller.user_id.is_none());
    }

    #[test]
    fn test_missing_header_is_anonymous() {
        let req = TestRequest::default()
            .peer_addr("198.51.100.9:1234".parse().unwrap())
            .to_http_request();
        let caller = JwtIdentityResolver::new(SECRET).resolve(&req);
        assert_eq!(caller.actor_id, "ip:198.51.100.9");
        assert_eq!(caller.tier, Tier::Free);
    }

    #[test]
    fn test_subject_with_separator_is_anonymous() {
        let resolver = JwtIdentityResolver::new(SECRET);
        let caller = resolver.resolve(&request_with(&token("a:b", None, Some("pro"), 3600)));
        assert!(caller.user_id.is_none());
        assert_eq!(caller.actor_id, "ip:203.0.113.5");
        assert_eq!(caller.tier, Tier::Free);
    }

    #[test]
    fn test_unknown_tier_claim_defaults_to_free() {
        let resolver = JwtIdentityResolver::new(SECRET);
        let caller = resolver.resolve(&request_with(&token("u", None, Some("platinum"), 3600)));
        assert_eq!(caller.tier, Tier::Free);
    }

    #[test]
    fn test_bearer_token_parsing() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic abc"))
            .to_http_request();
        assert!(bearer_token(&req).is_none());

        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer   "))
            .to_http_request();
        assert!(bearer_token(&req).is_none());
    }
}
