//! Logical cache operations
//!
//! Every request body deserializes into one [`CacheOperation`] variant. The
//! JSON field `operation` selects the variant; the remaining fields are the
//! variant's typed payload. Classification ([`CacheOperation::class`]) is an
//! exhaustive match, so a new variant cannot be added without deciding how it
//! is rate limited and whether it writes.
//!
//! ```json
//! { "operation": "hset", "key": "user:abc:profile", "field": "theme",
//!   "value": "dark", "ttl": 3600, "options": { "compress": false } }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::gateway::error::{GatewayError, GatewayResult};

/// Rate-limit and write-intent class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Read,
    Write,
    Delete,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::Read => "read",
            OperationClass::Write => "write",
            OperationClass::Delete => "delete",
        }
    }

    /// Label passed to the rate-limit counter
    pub fn counter_label(self) -> &'static str {
        match self {
            OperationClass::Read => "cache:read",
            OperationClass::Write => "cache:write",
            OperationClass::Delete => "cache:delete",
        }
    }

    /// Whether the operation needs write permission on its keys
    pub fn is_write(self) -> bool {
        !matches!(self, OperationClass::Read)
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-declared request priority, carried into logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Options shared by every operation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationOptions {
    /// `false` disables compression for written values
    pub compress: Option<bool>,
    /// Accepted for compatibility, not supported
    pub encrypt: Option<bool>,
    /// Only write when the key/member does not exist
    pub nx: bool,
    /// Only write when the key/member exists
    pub xx: bool,
    /// Include scores in sorted-set range results
    pub with_scores: bool,
    /// Descending order for sorted-set queries
    pub reverse: bool,
    /// `false` opts a read out of coalescing
    pub coalesce: Option<bool>,
    pub priority: Priority,
}

impl OperationOptions {
    pub fn compression_enabled(&self) -> bool {
        self.compress != Some(false)
    }

    pub fn coalescing_enabled(&self) -> bool {
        self.coalesce != Some(false)
    }
}

/// Request body of `POST`
#[derive(Debug, Clone, Deserialize)]
pub struct CacheOperationRequest {
    #[serde(flatten)]
    pub operation: CacheOperation,
    #[serde(default)]
    pub options: OperationOptions,
}

impl CacheOperationRequest {
    /// Parse a JSON body, mapping every failure to a validation error
    pub fn from_json(body: &[u8]) -> GatewayResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::validation(format!("Invalid JSON body: {}", e)))?;

        let name = match value.get("operation") {
            Some(serde_json::Value::String(name)) => name.clone(),
            Some(_) => return Err(GatewayError::validation("Field 'operation' must be a string")),
            None => return Err(GatewayError::validation("Missing required field: operation")),
        };

        serde_json::from_value(value).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("unknown variant") {
                GatewayError::validation(format!("Unknown operation: {}", name))
            } else {
                GatewayError::validation(format!("Invalid '{}' request: {}", name, msg))
            }
        })
    }
}

/// A single key
#[derive(Debug, Clone, Deserialize)]
pub struct KeyArgs {
    pub key: String,
}

/// `set` / `getset`
#[derive(Debug, Clone, Deserialize)]
pub struct SetArgs {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `incr` / `decr` / `hincrby` amount (defaults to 1)
#[derive(Debug, Clone, Deserialize)]
pub struct IncrArgs {
    pub key: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<i64>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `expire`
#[derive(Debug, Clone, Deserialize)]
pub struct ExpireArgs {
    pub key: String,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `mget` / `mdel`
#[derive(Debug, Clone, Deserialize)]
pub struct KeysArgs {
    pub keys: Vec<String>,
}

/// One entry of `mset`
#[derive(Debug, Clone, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: serde_json::Value,
}

/// `mset`
#[derive(Debug, Clone, Deserialize)]
pub struct MsetArgs {
    pub pairs: Vec<KeyValue>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `hget`
#[derive(Debug, Clone, Deserialize)]
pub struct FieldArgs {
    pub key: String,
    pub field: String,
}

/// `hset`
#[derive(Debug, Clone, Deserialize)]
pub struct HsetArgs {
    pub key: String,
    pub field: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `hdel` / `hmget`
#[derive(Debug, Clone, Deserialize)]
pub struct FieldsArgs {
    pub key: String,
    pub fields: Vec<String>,
}

/// `hmset`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmsetArgs {
    pub key: String,
    pub field_values: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `lpush` / `rpush`; accepts `values` or a single `value`
#[derive(Debug, Clone, Deserialize)]
pub struct PushArgs {
    pub key: String,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl PushArgs {
    /// All values to push, `values` first
    pub fn all_values(&self) -> Vec<serde_json::Value> {
        let mut all = self.values.clone();
        if let Some(v) = &self.value {
            all.push(v.clone());
        }
        all
    }
}

/// `lrange` / `ltrim` / `zrange`; inclusive, negative indices count from the end
#[derive(Debug, Clone, Deserialize)]
pub struct RangeArgs {
    pub key: String,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub stop: Option<i64>,
}

impl RangeArgs {
    pub fn bounds(&self) -> (i64, i64) {
        (self.start.unwrap_or(0), self.stop.unwrap_or(-1))
    }
}

/// `lpop` / `rpop`
#[derive(Debug, Clone, Deserialize)]
pub struct PopArgs {
    pub key: String,
    #[serde(default)]
    pub count: Option<u64>,
}

/// One scored sorted-set member
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredMember {
    pub score: f64,
    pub member: String,
}

/// `zadd`; accepts `score` + `member` or `members`
#[derive(Debug, Clone, Deserialize)]
pub struct ZaddArgs {
    pub key: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub members: Vec<ScoredMember>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl ZaddArgs {
    pub fn all_members(&self) -> GatewayResult<Vec<ScoredMember>> {
        let mut all = self.members.clone();
        match (self.score, &self.member) {
            (Some(score), Some(member)) => all.push(ScoredMember {
                score,
                member: member.clone(),
            }),
            (None, None) => {}
            _ => {
                return Err(GatewayError::validation(
                    "zadd requires both 'score' and 'member' when either is given",
                ))
            }
        }
        Ok(all)
    }
}

/// A score bound: a number, or `-inf` / `+inf` / `(5` style text
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScoreBound {
    Number(f64),
    Text(String),
}

impl ScoreBound {
    /// Render as a backend argument, rejecting anything that is not a bound
    pub fn to_arg(&self) -> GatewayResult<String> {
        match self {
            ScoreBound::Number(n) => Ok(format_score(*n)),
            ScoreBound::Text(raw) => {
                let text = raw.trim();
                let body = text.strip_prefix('(').unwrap_or(text);
                let valid = matches!(body, "-inf" | "+inf" | "inf") || body.parse::<f64>().is_ok();
                if valid {
                    Ok(text.to_string())
                } else {
                    Err(GatewayError::validation(format!(
                        "Invalid score bound: {}",
                        raw
                    )))
                }
            }
        }
    }
}

/// Integral scores render without a fractional part
pub fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        score.to_string()
    }
}

/// `zrangebyscore` / `zcount`
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreRangeArgs {
    pub key: String,
    pub min: ScoreBound,
    pub max: ScoreBound,
    #[serde(default)]
    pub count: Option<u64>,
}

/// `zrank` / `zscore` / `sismember`
#[derive(Debug, Clone, Deserialize)]
pub struct MemberArgs {
    pub key: String,
    pub member: String,
}

/// `zrem` / `srem` / `sadd`
#[derive(Debug, Clone, Deserialize)]
pub struct MembersArgs {
    pub key: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `zincrby`
#[derive(Debug, Clone, Deserialize)]
pub struct ZincrbyArgs {
    pub key: String,
    pub member: String,
    pub score: f64,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// `keys` / `flush_pattern`
#[derive(Debug, Clone, Deserialize)]
pub struct PatternArgs {
    pub pattern: String,
}

/// Scan cursor as sent by clients (number or numeric string)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Number(u64),
    Text(String),
}

impl Cursor {
    pub fn to_arg(&self) -> GatewayResult<String> {
        match self {
            Cursor::Number(n) => Ok(n.to_string()),
            Cursor::Text(t) => t
                .trim()
                .parse::<u64>()
                .map(|n| n.to_string())
                .map_err(|_| GatewayError::validation(format!("Invalid scan cursor: {}", t))),
        }
    }
}

/// `scan`
#[derive(Debug, Clone, Deserialize)]
pub struct ScanArgs {
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub count: Option<u64>,
}

/// Every logical operation the gateway understands
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum CacheOperation {
    // string
    Get(KeyArgs),
    Set(SetArgs),
    #[serde(alias = "del")]
    Delete(KeyArgs),
    Incr(IncrArgs),
    Decr(IncrArgs),
    Expire(ExpireArgs),
    Exists(KeyArgs),
    Ttl(KeyArgs),
    Getset(SetArgs),
    // batch
    Mget(KeysArgs),
    Mset(MsetArgs),
    Mdel(KeysArgs),
    // hash
    Hget(FieldArgs),
    Hset(HsetArgs),
    Hgetall(KeyArgs),
    Hdel(FieldsArgs),
    Hincrby(IncrArgs),
    Hmset(HmsetArgs),
    Hmget(FieldsArgs),
    // list
    Lpush(PushArgs),
    Rpush(PushArgs),
    Lrange(RangeArgs),
    Lpop(PopArgs),
    Rpop(PopArgs),
    Llen(KeyArgs),
    Ltrim(RangeArgs),
    // sorted set
    Zadd(ZaddArgs),
    Zrange(RangeArgs),
    Zrangebyscore(ScoreRangeArgs),
    Zrank(MemberArgs),
    Zscore(MemberArgs),
    Zrem(MembersArgs),
    Zincrby(ZincrbyArgs),
    Zcard(KeyArgs),
    Zcount(ScoreRangeArgs),
    // set
    Sadd(MembersArgs),
    Smembers(KeyArgs),
    Sismember(MemberArgs),
    Srem(MembersArgs),
    Scard(KeyArgs),
    // utility
    Keys(PatternArgs),
    Scan(ScanArgs),
    Stats,
    FlushPattern(PatternArgs),
    Health,
    Ping,
}

impl CacheOperation {
    /// Wire name, echoed in every response
    pub fn name(&self) -> &'static str {
        match self {
            CacheOperation::Get(_) => "get",
            CacheOperation::Set(_) => "set",
            CacheOperation::Delete(_) => "delete",
            CacheOperation::Incr(_) => "incr",
            CacheOperation::Decr(_) => "decr",
            CacheOperation::Expire(_) => "expire",
            CacheOperation::Exists(_) => "exists",
            CacheOperation::Ttl(_) => "ttl",
            CacheOperation::Getset(_) => "getset",
            CacheOperation::Mget(_) => "mget",
            CacheOperation::Mset(_) => "mset",
            CacheOperation::Mdel(_) => "mdel",
            CacheOperation::Hget(_) => "hget",
            CacheOperation::Hset(_) => "hset",
            CacheOperation::Hgetall(_) => "hgetall",
            CacheOperation::Hdel(_) => "hdel",
            CacheOperation::Hincrby(_) => "hincrby",
            CacheOperation::Hmset(_) => "hmset",
            CacheOperation::Hmget(_) => "hmget",
            CacheOperation::Lpush(_) => "lpush",
            CacheOperation::Rpush(_) => "rpush",
            CacheOperation::Lrange(_) => "lrange",
            CacheOperation::Lpop(_) => "lpop",
            CacheOperation::Rpop(_) => "rpop",
            CacheOperation::Llen(_) => "llen",
            CacheOperation::Ltrim(_) => "ltrim",
            CacheOperation::Zadd(_) => "zadd",
            CacheOperation::Zrange(_) => "zrange",
            CacheOperation::Zrangebyscore(_) => "zrangebyscore",
            CacheOperation::Zrank(_) => "zrank",
            CacheOperation::Zscore(_) => "zscore",
            CacheOperation::Zrem(_) => "zrem",
            CacheOperation::Zincrby(_) => "zincrby",
            CacheOperation::Zcard(_) => "zcard",
            CacheOperation::Zcount(_) => "zcount",
            CacheOperation::Sadd(_) => "sadd",
            CacheOperation::Smembers(_) => "smembers",
            CacheOperation::Sismember(_) => "sismember",
            CacheOperation::Srem(_) => "srem",
            CacheOperation::Scard(_) => "scard",
            CacheOperation::Keys(_) => "keys",
            CacheOperation::Scan(_) => "scan",
            CacheOperation::Stats => "stats",
            CacheOperation::FlushPattern(_) => "flush_pattern",
            CacheOperation::Health => "health",
            CacheOperation::Ping => "ping",
        }
    }

    /// Rate-limit class; also decides write intent for key scoping
    pub fn class(&self) -> OperationClass {
        use CacheOperation::*;
        match self {
            Get(_) | Exists(_) | Ttl(_) | Mget(_) | Hget(_) | Hgetall(_) | Hmget(_)
            | Lrange(_) | Llen(_) | Zrange(_) | Zrangebyscore(_) | Zrank(_) | Zscore(_)
            | Zcard(_) | Zcount(_) | Smembers(_) | Sismember(_) | Scard(_) | Keys(_)
            | Scan(_) | Stats | Health | Ping => OperationClass::Read,

            Set(_) | Incr(_) | Decr(_) | Expire(_) | Getset(_) | Mset(_) | Hset(_)
            | Hincrby(_) | Hmset(_) | Lpush(_) | Rpush(_) | Lpop(_) | Rpop(_) | Ltrim(_)
            | Zadd(_) | Zincrby(_) | Sadd(_) => OperationClass::Write,

            Delete(_) | Mdel(_) | Hdel(_) | Zrem(_) | Srem(_) | FlushPattern(_) => {
                OperationClass::Delete
            }
        }
    }

    /// Raw key and distinguishing arguments of a single-key read
    ///
    /// Two reads may share one backend call only when both parts match.
    /// Writes, batches and utility operations return `None`.
    pub fn coalescing_target(&self) -> Option<(&str, String)> {
        use CacheOperation::*;
        match self {
            Get(a) | Exists(a) | Ttl(a) | Hgetall(a) | Llen(a) | Zcard(a) | Smembers(a)
            | Scard(a) => Some((&a.key, String::new())),
            Hget(a) => Some((&a.key, a.field.clone())),
            Hmget(a) => Some((&a.key, a.fields.join("\u{1f}"))),
            Lrange(a) | Zrange(a) => {
                let (start, stop) = a.bounds();
                Some((&a.key, format!("{}..{}", start, stop)))
            }
            Zrangebyscore(a) | Zcount(a) => Some((
                &a.key,
                format!("{:?}..{:?}/{:?}", a.min, a.max, a.count),
            )),
            Zrank(a) | Zscore(a) | Sismember(a) => Some((&a.key, a.member.clone())),
            _ => None,
        }
    }
}
