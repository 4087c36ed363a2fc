//! Redis command executor over the REST protocol
//!
//! Commands are JSON arrays of strings posted to the store's base URL;
//! pipelines are arrays of such arrays posted to `<base>/pipeline`. Replies
//! are `{"result": ..}` or `{"error": ".."}` objects.
//!
//! The executor performs exactly one HTTP call per command or pipeline and
//! never retries; the circuit breaker above it decides when to stop calling.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::gateway::error::{GatewayError, GatewayResult};

/// Longest backend body kept in error details
const MAX_ERROR_BODY: usize = 2048;

/// Runs commands against the backing store
#[async_trait]
pub trait RedisExecutor: Send + Sync {
    /// Run one command, returning its `result`
    async fn execute(&self, command: Vec<String>) -> GatewayResult<Value>;

    /// Run several commands in one round trip, results in order
    async fn pipeline(&self, commands: Vec<Vec<String>>) -> GatewayResult<Vec<Value>>;
}

/// Backend base URL and bearer token
#[derive(Clone)]
pub struct BackendCredentials {
    pub url: String,
    pub token: String,
}

impl std::fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Builds an executor for freshly resolved credentials
pub trait ExecutorFactory: Send + Sync {
    fn executor(&self, credentials: &BackendCredentials) -> GatewayResult<Arc<dyn RedisExecutor>>;
}

/// Factory sharing one pooled HTTP client across executors
#[derive(Clone)]
pub struct HttpExecutorFactory {
    client: Client,
}

impl HttpExecutorFactory {
    pub fn new(timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .user_agent(concat!("cache-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::server(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Shared client, reused by the service probes
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl ExecutorFactory for HttpExecutorFactory {
    fn executor(&self, credentials: &BackendCredentials) -> GatewayResult<Arc<dyn RedisExecutor>> {
        if credentials.url.is_empty() || credentials.token.is_empty() {
            return Err(GatewayError::server("Cache backend credentials are empty"));
        }
        Ok(Arc::new(HttpRedisExecutor {
            client: self.client.clone(),
            base_url: credentials.url.trim_end_matches('/').to_string(),
            token: credentials.token.clone(),
        }))
    }
}

/// Executor posting commands to a REST endpoint
pub struct HttpRedisExecutor {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpRedisExecutor {
    async fn post(&self, url: String, body: Value) -> GatewayResult<(u16, String)> {
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::server("Cache backend request timed out")
                } else if e.is_connect() {
                    GatewayError::server("Cache backend connection failed")
                } else {
                    GatewayError::server(format!("Cache backend request failed: {}", e))
                }
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::server(format!("Failed to read backend response: {}", e)))?;
        Ok((status, text))
    }
}

#[async_trait]
impl RedisExecutor for HttpRedisExecutor {
    async fn execute(&self, command: Vec<String>) -> GatewayResult<Value> {
        debug!(
            command = command.first().map(String::as_str).unwrap_or(""),
            "Executing backend command"
        );
        let (status, body) = self.post(self.base_url.clone(), Value::from(command)).await?;
        parse_reply(status, &body)
    }

    async fn pipeline(&self, commands: Vec<Vec<String>>) -> GatewayResult<Vec<Value>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        debug!(commands = commands.len(), "Executing backend pipeline");
        let body = Value::Array(commands.into_iter().map(Value::from).collect());
        let (status, text) = self
            .post(format!("{}/pipeline", self.base_url), body)
            .await?;
        parse_pipeline_reply(status, &text)
    }
}

fn truncated(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

fn check_status(status: u16, body: &str) -> GatewayResult<Value> {
    if !(200..300).contains(&status) {
        return Err(GatewayError::backend(format!("HTTP {}", status), truncated(body)));
    }
    serde_json::from_str(body)
        .map_err(|_| GatewayError::backend("Malformed backend response", truncated(body)))
}

fn unwrap_result(reply: Value, raw: &str) -> GatewayResult<Value> {
    match reply {
        Value::Object(mut obj) => {
            if let Some(err) = obj.remove("error") {
                let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
                return Err(GatewayError::backend(msg, truncated(raw)));
            }
            obj.remove("result")
                .ok_or_else(|| GatewayError::backend("Malformed backend response", truncated(raw)))
        }
        _ => Err(GatewayError::backend(
            "Malformed backend response",
            truncated(raw),
        )),
    }
}

/// Parse a single-command reply
pub fn parse_reply(status: u16, body: &str) -> GatewayResult<Value> {
    let reply = check_status(status, body)?;
    unwrap_result(reply, body)
}

/// Parse a pipeline reply; the first failed command fails the whole call
pub fn parse_pipeline_reply(status: u16, body: &str) -> GatewayResult<Vec<Value>> {
    match check_status(status, body)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| unwrap_result(item, body))
            .collect(),
        _ => Err(GatewayError::backend(
            "Malformed backend response",
            truncated(body),
        )),
    }
}
