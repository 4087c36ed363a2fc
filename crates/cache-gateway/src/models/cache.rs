//! Response envelopes for the cache endpoint

use serde::Serialize;

use crate::gateway::circuit_breaker::CircuitState;
use crate::gateway::health::HealthReport;

/// Metadata attached to every successful operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub version: &'static str,
    pub compressed: bool,
    pub execution_ms: u64,
    pub circuit_breaker: CircuitState,
}

/// `POST` success envelope
#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub operation: &'static str,
    pub result: serde_json::Value,
    pub metadata: ResponseMetadata,
}

/// `GET ?check=ping` body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub success: bool,
    pub status: &'static str,
    pub version: &'static str,
    pub circuit_breaker: CircuitState,
    pub timestamp: String,
}

/// `GET` body: the detailed report plus a top-level success flag
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Gateway version reported in every envelope
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
