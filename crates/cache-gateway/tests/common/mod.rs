//! Shared fixtures for the gateway integration tests
//!
//! [`FakeRedis`] interprets the small command subset the scenarios need and
//! records every command it receives, so tests can assert both on responses
//! and on what actually reached the backend.

#![allow(dead_code)]

use actix_web::web;
use async_trait::async_trait;
use cache_gateway::gateway::{
    BackendCredentials, CacheGateway, ExecutorFactory, GatewayDependencies, GatewayError,
    GatewayResult, RedisExecutor, ServiceProbe,
};
use cache_gateway::middleware::{IdentityResolver, JwtIdentityResolver};
use cache_gateway::routes;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value;
use shared::{
    CacheConfig, InMemoryRateLimitCounter, SecretRequest, SecretResolver, SecretsError,
    ServiceSecretNames,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_JWT_SECRET: &str = "test_jwt_secret_for_integration_tests";
pub const CACHE_URI: &str = "/api/v1/cache";

#[derive(Default)]
struct FakeState {
    strings: HashMap<String, String>,
    ttls: HashMap<String, u64>,
    commands: Vec<Vec<String>>,
    latency: Option<Duration>,
    failure: Option<String>,
}

/// In-memory stand-in for the REST store
#[derive(Clone, Default)]
pub struct FakeRedis {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRedis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    /// Fail every call with `message`, or recover with `None`
    pub fn set_failure(&self, message: Option<&str>) {
        self.state.lock().unwrap().failure = message.map(str::to_string);
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands received whose verb is `verb`
    pub fn count(&self, verb: &str) -> usize {
        self.commands().iter().filter(|c| c[0] == verb).count()
    }

    pub fn stored(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().strings.get(key).cloned()
    }

    /// Store a raw value directly, bypassing the gateway
    pub fn seed(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .strings
            .insert(key.to_string(), value.to_string());
    }

    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.state.lock().unwrap().ttls.get(key).copied()
    }

    async fn before_call(&self, commands: &[Vec<String>]) -> GatewayResult<()> {
        let (latency, failure) = {
            let mut state = self.state.lock().unwrap();
            state.commands.extend(commands.iter().cloned());
            (state.latency, state.failure.clone())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(message) => Err(GatewayError::backend(message, "{\"error\":\"injected\"}")),
            None => Ok(()),
        }
    }

    fn apply(&self, command: &[String]) -> GatewayResult<Value> {
        let mut state = self.state.lock().unwrap();
        let arg = |i: usize| command.get(i).cloned().unwrap_or_default();

        let reply = match command[0].as_str() {
            "PING" => Value::from("PONG"),
            "GET" => state
                .strings
                .get(&arg(1))
                .cloned()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "SET" => {
                let key = arg(1);
                let flags: Vec<&str> = command[3..].iter().map(String::as_str).collect();
                let exists = state.strings.contains_key(&key);
                if (flags.contains(&"NX") && exists) || (flags.contains(&"XX") && !exists) {
                    return Ok(Value::Null);
                }
                if let Some(pos) = flags.iter().position(|f| *f == "EX") {
                    if let Some(ttl) = flags.get(pos + 1).and_then(|t| t.parse().ok()) {
                        state.ttls.insert(key.clone(), ttl);
                    }
                }
                state.strings.insert(key, arg(2));
                Value::from("OK")
            }
            "DEL" => {
                let removed = command[1..]
                    .iter()
                    .filter(|k| state.strings.remove(*k).is_some())
                    .count();
                Value::from(removed)
            }
            "EXISTS" => Value::from(u8::from(state.strings.contains_key(&arg(1)))),
            "TTL" => match state.ttls.get(&arg(1)) {
                Some(ttl) => Value::from(*ttl),
                None if state.strings.contains_key(&arg(1)) => Value::from(-1),
                None => Value::from(-2),
            },
            "EXPIRE" => {
                let key = arg(1);
                if !state.strings.contains_key(&key) {
                    return Ok(Value::from(0));
                }
                let ttl = arg(2).parse().unwrap_or(0);
                state.ttls.insert(key, ttl);
                Value::from(1)
            }
            "MGET" => Value::Array(
                command[1..]
                    .iter()
                    .map(|k| state.strings.get(k).cloned().map(Value::from).unwrap_or(Value::Null))
                    .collect(),
            ),
            "DBSIZE" => Value::from(state.strings.len()),
            "INFO" => Value::from(match arg(1).as_str() {
                "stats" => "# Stats\r\nkeyspace_hits:40\r\nkeyspace_misses:10\r\n",
                "memory" => "# Memory\r\nused_memory:1048576\r\nmaxmemory:0\r\n",
                "clients" => "# Clients\r\nconnected_clients:3\r\n",
                _ => "# Server\r\nredis_version:7.2.4\r\nuptime_in_seconds:3600\r\n",
            }),
            other => {
                return Err(GatewayError::backend(
                    format!("ERR unknown command '{}'", other),
                    "{}",
                ))
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl RedisExecutor for FakeRedis {
    async fn execute(&self, command: Vec<String>) -> GatewayResult<Value> {
        self.before_call(std::slice::from_ref(&command)).await?;
        self.apply(&command)
    }

    async fn pipeline(&self, commands: Vec<Vec<String>>) -> GatewayResult<Vec<Value>> {
        self.before_call(&commands).await?;
        commands.iter().map(|c| self.apply(c)).collect()
    }
}

/// Hands out the same fake regardless of credentials
pub struct FakeExecutors(pub FakeRedis);

impl ExecutorFactory for FakeExecutors {
    fn executor(&self, _credentials: &BackendCredentials) -> GatewayResult<Arc<dyn RedisExecutor>> {
        Ok(Arc::new(self.0.clone()))
    }
}

/// Fixed secret values; anything else is not found
pub struct StaticSecrets(pub HashMap<String, String>);

impl StaticSecrets {
    pub fn cache_only() -> Self {
        let defaults = CacheConfig::default();
        Self(HashMap::from([
            (defaults.url_secret, "https://fake-cache.upstash.io".to_string()),
            (defaults.token_secret, "fake-token".to_string()),
        ]))
    }
}

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn get_secret(
        &self,
        name: &str,
        _caller_id: Option<&str>,
        _metadata: &SecretRequest,
    ) -> Result<String, SecretsError> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| SecretsError::NotFound(name.to_string()))
    }
}

/// Probe answering healthy for every URL
pub struct HealthyProbe;

#[async_trait]
impl ServiceProbe for HealthyProbe {
    async fn probe(&self, _url: &str, _token: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Gateway state wired to a [`FakeRedis`]
pub struct TestState {
    pub redis: FakeRedis,
    pub gateway: web::Data<CacheGateway>,
    pub identity: web::Data<dyn IdentityResolver>,
}

impl TestState {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let redis = FakeRedis::new();
        let gateway = CacheGateway::new(
            &config,
            ServiceSecretNames::default(),
            GatewayDependencies {
                secrets: Arc::new(StaticSecrets::cache_only()),
                executors: Arc::new(FakeExecutors(redis.clone())),
                counter: Arc::new(InMemoryRateLimitCounter::new()),
                probe: Arc::new(HealthyProbe),
            },
        );
        let identity: Arc<dyn IdentityResolver> =
            Arc::new(JwtIdentityResolver::new(TEST_JWT_SECRET));

        Self {
            redis,
            gateway: web::Data::new(gateway),
            identity: web::Data::from(identity),
        }
    }

    /// Register state and routes on an app
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(self.gateway.clone())
            .app_data(self.identity.clone());
        routes::configure(cfg);
    }
}

#[derive(serde::Serialize)]
struct TestClaims<'a> {
    sub: &'a str,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

/// Bearer token for `user_id`, valid for an hour
pub fn create_test_jwt(user_id: &str) -> String {
    sign(TestClaims {
        sub: user_id,
        exp: Utc::now().timestamp() + 3600,
        role: None,
    })
}

/// Bearer token carrying the service role
pub fn create_service_jwt(user_id: &str) -> String {
    sign(TestClaims {
        sub: user_id,
        exp: Utc::now().timestamp() + 3600,
        role: Some("service_role"),
    })
}

fn sign(claims: TestClaims<'_>) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .expect("Failed to create test JWT")
}
