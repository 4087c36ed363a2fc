//! Tiered rate limiting
//!
//! Each caller gets a per-minute budget for each operation class, sized by
//! subscription tier. Counting is delegated to a [`RateLimitCounter`]; when
//! the counter is unreachable the request is allowed (fail open).
//!
//! | tier       | read    | write  | delete |
//! |------------|---------|--------|--------|
//! | free       | 100     | 50     | 20     |
//! | pro        | 1 000   | 500    | 200    |
//! | enterprise | 10 000  | 5 000  | 2 000  |
//! | internal   | 100 000 | 50 000 | 20 000 |

use serde::{Deserialize, Serialize};
use shared::RateLimitCounter;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::operations::OperationClass;

/// Fixed window length of every budget
pub const WINDOW_SECONDS: u64 = 60;

/// Subscription tier of a caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Enterprise,
    Internal,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
            Tier::Internal => "internal",
        }
    }

    /// Requests per window for `class`
    pub fn budget(self, class: OperationClass) -> u64 {
        let (read, write, delete) = match self {
            Tier::Free => (100, 50, 20),
            Tier::Pro => (1_000, 500, 200),
            Tier::Enterprise => (10_000, 5_000, 2_000),
            Tier::Internal => (100_000, 50_000, 20_000),
        };
        match class {
            OperationClass::Read => read,
            OperationClass::Write => write,
            OperationClass::Delete => delete,
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            "internal" => Ok(Tier::Internal),
            other => Err(format!("Unknown tier: {}", other)),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limiter applying tier budgets over an external counter
#[derive(Clone)]
pub struct TieredRateLimiter {
    counter: Arc<dyn RateLimitCounter>,
}

impl TieredRateLimiter {
    pub fn new(counter: Arc<dyn RateLimitCounter>) -> Self {
        Self { counter }
    }

    /// Count one `class` request for `actor`
    ///
    /// # Errors
    ///
    /// [`GatewayError::RateLimited`] once the budget is spent. Counter
    /// failures never reject a request.
    pub async fn check_limit(
        &self,
        actor: &str,
        class: OperationClass,
        tier: Tier,
    ) -> GatewayResult<()> {
        let limit = tier.budget(class);

        match self
            .counter
            .check_rate_limit(actor, class.counter_label(), limit, WINDOW_SECONDS)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(actor = %actor, class = %class, tier = %tier, limit, "Rate limit exceeded");
                Err(GatewayError::RateLimited { class, limit })
            }
            Err(e) => {
                warn!(
                    actor = %actor,
                    class = %class,
                    error = %e,
                    "Rate limit counter unavailable, allowing request"
                );
                Ok(())
            }
        }
    }
}
