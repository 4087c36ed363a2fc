//! Operation dispatcher
//!
//! Turns one validated [`CacheOperation`] into backend commands and shapes
//! the reply. For every operation:
//!
//! 1. required fields and batch sizes are checked before any backend call
//! 2. keys are scoped with the write intent of the operation's class
//! 3. written values are compressed when large enough, reads always decode
//! 4. collection writes arm their TTL with a follow-up `EXPIRE`
//!
//! The `EXPIRE` after a collection write is a separate call, not part of a
//! transaction. If it fails the data stays without a TTL.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::gateway::circuit_breaker::CircuitState;
use crate::gateway::compression;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::executor::RedisExecutor;
use crate::gateway::health;
use crate::gateway::metrics::GatewayMetrics;
use crate::gateway::operations::*;
use crate::gateway::scope::{scope_key, scope_keys, scope_pattern, CallerContext};

/// Named TTL presets, in seconds
pub mod ttl {
    pub const SHORT: u64 = 60;
    pub const MEDIUM: u64 = 900;
    pub const LONG: u64 = 3_600;
    pub const DAY: u64 = 86_400;
}

/// `SCAN` page size used when the caller gives none
const DEFAULT_SCAN_COUNT: u64 = 100;

/// Limits and defaults applied while dispatching
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub compression_threshold: usize,
    pub max_batch_size: usize,
    pub default_ttl: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            compression_threshold: compression::DEFAULT_THRESHOLD,
            max_batch_size: 100,
            default_ttl: ttl::MEDIUM,
        }
    }
}

impl From<&shared::CacheConfig> for DispatchSettings {
    fn from(cfg: &shared::CacheConfig) -> Self {
        Self {
            compression_threshold: cfg.compression_threshold,
            max_batch_size: cfg.max_batch_size,
            default_ttl: cfg.default_ttl,
        }
    }
}

/// Result of one dispatched operation
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: Value,
    /// Whether a compressed value was written or read
    pub compressed: bool,
}

/// Encodes written values and decodes read ones, remembering whether
/// compression was involved
struct ValueCodec {
    enabled: bool,
    threshold: usize,
    savings: i64,
    compressed: bool,
}

impl ValueCodec {
    fn encode(&mut self, value: &Value) -> GatewayResult<String> {
        let raw = value_to_string(value)?;
        // A plain value carrying the marker would be misread as compressed
        if compression::is_marked(&raw)
            || compression::should_compress(&raw, self.enabled, self.threshold)
        {
            let packed = compression::compress(&raw)?;
            self.savings += packed.savings;
            self.compressed = true;
            return Ok(packed.value);
        }
        Ok(raw)
    }

    fn decode(&mut self, reply: Value) -> GatewayResult<Value> {
        match reply {
            Value::String(s) if compression::is_marked(&s) => match compression::decompress(&s) {
                Ok(plain) => {
                    self.compressed = true;
                    Ok(Value::String(plain))
                }
                Err(e) => {
                    // Stored data, not a backend fault; hand back what is there
                    warn!(error = %e, "Stored value is not valid compressed data, returning it raw");
                    Ok(Value::String(s))
                }
            },
            other => Ok(other),
        }
    }

    fn decode_all(&mut self, reply: Value) -> GatewayResult<Vec<Value>> {
        as_array(reply)?
            .into_iter()
            .map(|v| self.decode(v))
            .collect()
    }
}

/// Routes operations to their handlers against one executor
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn RedisExecutor>,
    metrics: Arc<GatewayMetrics>,
    settings: DispatchSettings,
    circuit: CircuitState,
}

fn cmd<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Values are stored as strings; non-string JSON is stored serialized
fn value_to_string(value: &Value) -> GatewayResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Err(GatewayError::validation("Value must not be null")),
        other => Ok(other.to_string()),
    }
}

fn unexpected(reply: &Value) -> GatewayError {
    GatewayError::backend("Unexpected backend reply", reply.to_string())
}

fn as_int(reply: &Value) -> GatewayResult<i64> {
    match reply {
        Value::Number(n) => n.as_i64().ok_or_else(|| unexpected(reply)),
        Value::String(s) => s.parse().map_err(|_| unexpected(reply)),
        _ => Err(unexpected(reply)),
    }
}

fn as_opt_int(reply: &Value) -> GatewayResult<Option<i64>> {
    match reply {
        Value::Null => Ok(None),
        other => as_int(other).map(Some),
    }
}

fn as_opt_score(reply: &Value) -> GatewayResult<Option<f64>> {
    match reply {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| unexpected(reply)),
        Value::String(s) => s.parse().map(Some).map_err(|_| unexpected(reply)),
        _ => Err(unexpected(reply)),
    }
}

fn as_array(reply: Value) -> GatewayResult<Vec<Value>> {
    match reply {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(unexpected(&other)),
    }
}

/// `[member, score, member, score]` into `[{member, score}]`
fn scored_pairs(flat: Vec<Value>) -> GatewayResult<Vec<Value>> {
    flat.chunks(2)
        .map(|pair| match pair {
            [member, score] => Ok(json!({
                "member": member,
                "score": as_opt_score(score)?,
            })),
            _ => Err(GatewayError::backend(
                "Unexpected backend reply",
                "odd WITHSCORES reply",
            )),
        })
        .collect()
}

fn check_ttl(ttl: Option<u64>, default: u64) -> GatewayResult<u64> {
    match ttl {
        Some(0) => Err(GatewayError::validation("TTL must be greater than zero")),
        Some(t) => Ok(t),
        None => Ok(default),
    }
}

fn require_non_empty<T>(items: &[T], field: &str) -> GatewayResult<()> {
    if items.is_empty() {
        Err(GatewayError::validation(format!(
            "Field '{}' must not be empty",
            field
        )))
    } else {
        Ok(())
    }
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn RedisExecutor>,
        metrics: Arc<GatewayMetrics>,
        settings: DispatchSettings,
        circuit: CircuitState,
    ) -> Self {
        Self {
            executor,
            metrics,
            settings,
            circuit,
        }
    }

    fn check_batch<T>(&self, items: &[T], field: &str) -> GatewayResult<()> {
        require_non_empty(items, field)?;
        if items.len() > self.settings.max_batch_size {
            return Err(GatewayError::validation(format!(
                "Batch too large: {} items (max {})",
                items.len(),
                self.settings.max_batch_size
            )));
        }
        Ok(())
    }

    async fn exec(&self, command: Vec<String>) -> GatewayResult<Value> {
        self.executor.execute(command).await
    }

    async fn expire(&self, key: &str, ttl: u64) -> GatewayResult<()> {
        self.exec(cmd(["EXPIRE".to_string(), key.to_string(), ttl.to_string()]))
            .await
            .map(|_| ())
    }

    /// Arm the TTL of a key an increment may have created. Without an
    /// explicit TTL only keys that have none get the default, so repeated
    /// increments do not keep pushing the expiry out.
    async fn arm_counter_ttl(&self, key: &str, ttl: Option<u64>) -> GatewayResult<()> {
        let mut command = cmd(["EXPIRE".to_string(), key.to_string()]);
        match ttl {
            Some(t) => command.push(t.to_string()),
            None => {
                command.push(self.settings.default_ttl.to_string());
                command.push("NX".into());
            }
        }
        self.exec(command).await.map(|_| ())
    }

    /// Execute `op` on behalf of `caller`
    pub async fn dispatch(
        &self,
        op: CacheOperation,
        options: &OperationOptions,
        caller: &CallerContext,
    ) -> GatewayResult<DispatchOutcome> {
        if options.nx && options.xx {
            return Err(GatewayError::validation(
                "Options 'nx' and 'xx' are mutually exclusive",
            ));
        }

        let is_write = op.class().is_write();
        let mut codec = ValueCodec {
            enabled: options.compression_enabled(),
            threshold: self.settings.compression_threshold,
            savings: 0,
            compressed: false,
        };
        let scoped = |key: &str| scope_key(key, caller, is_write).map(|s| s.key);

        let op_name = op.name();
        debug!(operation = op_name, actor = %caller.actor_id, "Dispatching operation");

        let result = match op {
            // string
            CacheOperation::Get(a) => {
                let reply = self.exec(cmd(["GET".to_string(), scoped(&a.key)?])).await?;
                json!({ "value": codec.decode(reply)? })
            }
            CacheOperation::Set(a) => {
                let key = scoped(&a.key)?;
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let value = codec.encode(&a.value)?;
                let mut command = cmd(["SET".to_string(), key, value, "EX".into(), ttl.to_string()]);
                if options.nx {
                    command.push("NX".into());
                } else if options.xx {
                    command.push("XX".into());
                }
                let reply = self.exec(command).await?;
                json!({ "success": !reply.is_null(), "ttl": ttl })
            }
            CacheOperation::Delete(a) => {
                let reply = self.exec(cmd(["DEL".to_string(), scoped(&a.key)?])).await?;
                json!({ "deleted": as_int(&reply)? })
            }
            CacheOperation::Incr(a) | CacheOperation::Decr(a) if a.field.is_some() => {
                return Err(GatewayError::validation(
                    "Field 'field' is only valid for hincrby",
                ));
            }
            CacheOperation::Incr(a) | CacheOperation::Decr(a) => {
                let verb = if op_name == "incr" { "INCRBY" } else { "DECRBY" };
                let key = scoped(&a.key)?;
                check_ttl(a.ttl, self.settings.default_ttl)?;
                let by = a.value.unwrap_or(1);
                let reply = self
                    .exec(cmd([verb.to_string(), key.clone(), by.to_string()]))
                    .await?;
                self.arm_counter_ttl(&key, a.ttl).await?;
                json!({ "value": as_int(&reply)? })
            }
            CacheOperation::Expire(a) => {
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let reply = self
                    .exec(cmd(["EXPIRE".to_string(), scoped(&a.key)?, ttl.to_string()]))
                    .await?;
                json!({ "success": as_int(&reply)? == 1 })
            }
            CacheOperation::Exists(a) => {
                let reply = self.exec(cmd(["EXISTS".to_string(), scoped(&a.key)?])).await?;
                json!({ "exists": as_int(&reply)? > 0 })
            }
            CacheOperation::Ttl(a) => {
                let reply = self.exec(cmd(["TTL".to_string(), scoped(&a.key)?])).await?;
                json!({ "ttl": as_int(&reply)? })
            }
            CacheOperation::Getset(a) => {
                let key = scoped(&a.key)?;
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let value = codec.encode(&a.value)?;
                let reply = self
                    .exec(cmd([
                        "SET".to_string(),
                        key,
                        value,
                        "EX".into(),
                        ttl.to_string(),
                        "GET".into(),
                    ]))
                    .await?;
                json!({ "oldValue": codec.decode(reply)?, "ttl": ttl })
            }

            // batch
            CacheOperation::Mget(a) => {
                self.check_batch(&a.keys, "keys")?;
                let keys = scope_keys(&a.keys, caller, false)?;
                let mut command = cmd(["MGET"]);
                command.extend(keys);
                let reply = self.exec(command).await?;
                json!({ "values": codec.decode_all(reply)? })
            }
            CacheOperation::Mset(a) => {
                self.check_batch(&a.pairs, "pairs")?;
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let mut set = cmd(["MSET"]);
                let mut expires = Vec::with_capacity(a.pairs.len());
                for pair in &a.pairs {
                    let key = scoped(&pair.key)?;
                    set.push(key.clone());
                    set.push(codec.encode(&pair.value)?);
                    expires.push(cmd(["EXPIRE".to_string(), key, ttl.to_string()]));
                }
                let mut commands = vec![set];
                commands.extend(expires);
                self.executor.pipeline(commands).await?;
                json!({ "success": true, "count": a.pairs.len(), "ttl": ttl })
            }
            CacheOperation::Mdel(a) => {
                self.check_batch(&a.keys, "keys")?;
                let keys = scope_keys(&a.keys, caller, true)?;
                let mut command = cmd(["DEL"]);
                command.extend(keys);
                let reply = self.exec(command).await?;
                json!({ "deleted": as_int(&reply)? })
            }

            // hash
            CacheOperation::Hget(a) => {
                let reply = self
                    .exec(cmd(["HGET".to_string(), scoped(&a.key)?, a.field]))
                    .await?;
                json!({ "value": codec.decode(reply)? })
            }
            CacheOperation::Hset(a) => {
                let key = scoped(&a.key)?;
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let value = codec.encode(&a.value)?;
                let verb = if options.nx { "HSETNX" } else { "HSET" };
                let reply = self
                    .exec(cmd([verb.to_string(), key.clone(), a.field, value]))
                    .await?;
                self.expire(&key, ttl).await?;
                json!({ "created": as_int(&reply)? == 1, "ttl": ttl })
            }
            CacheOperation::Hgetall(a) => {
                let reply = self.exec(cmd(["HGETALL".to_string(), scoped(&a.key)?])).await?;
                let mut fields = Map::new();
                match reply {
                    Value::Object(obj) => {
                        for (field, value) in obj {
                            fields.insert(field, codec.decode(value)?);
                        }
                    }
                    other => {
                        let flat = as_array(other)?;
                        for pair in flat.chunks(2) {
                            if let [Value::String(field), value] = pair {
                                fields.insert(field.clone(), codec.decode(value.clone())?);
                            }
                        }
                    }
                }
                json!({ "fields": fields })
            }
            CacheOperation::Hdel(a) => {
                require_non_empty(&a.fields, "fields")?;
                let mut command = cmd(["HDEL".to_string(), scoped(&a.key)?]);
                command.extend(a.fields);
                let reply = self.exec(command).await?;
                json!({ "deleted": as_int(&reply)? })
            }
            CacheOperation::Hincrby(a) => {
                let field = a
                    .field
                    .ok_or_else(|| GatewayError::validation("Missing required field: field"))?;
                let key = scoped(&a.key)?;
                check_ttl(a.ttl, self.settings.default_ttl)?;
                let by = a.value.unwrap_or(1);
                let reply = self
                    .exec(cmd(["HINCRBY".to_string(), key.clone(), field, by.to_string()]))
                    .await?;
                self.arm_counter_ttl(&key, a.ttl).await?;
                json!({ "value": as_int(&reply)? })
            }
            CacheOperation::Hmset(a) => {
                if a.field_values.is_empty() {
                    return Err(GatewayError::validation(
                        "Field 'fieldValues' must not be empty",
                    ));
                }
                if a.field_values.len() > self.settings.max_batch_size {
                    return Err(GatewayError::validation(format!(
                        "Batch too large: {} items (max {})",
                        a.field_values.len(),
                        self.settings.max_batch_size
                    )));
                }
                let key = scoped(&a.key)?;
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let mut command = cmd(["HSET".to_string(), key.clone()]);
                for (field, value) in &a.field_values {
                    command.push(field.clone());
                    command.push(codec.encode(value)?);
                }
                self.exec(command).await?;
                self.expire(&key, ttl).await?;
                json!({ "success": true, "fields": a.field_values.len(), "ttl": ttl })
            }
            CacheOperation::Hmget(a) => {
                require_non_empty(&a.fields, "fields")?;
                let mut command = cmd(["HMGET".to_string(), scoped(&a.key)?]);
                command.extend(a.fields.iter().cloned());
                let values = codec.decode_all(self.exec(command).await?)?;
                let map: Map<String, Value> = a.fields.into_iter().zip(values).collect();
                json!({ "values": map })
            }

            // list
            CacheOperation::Lpush(a) => {
                self.push("LPUSH", a, caller, is_write, &mut codec).await?
            }
            CacheOperation::Rpush(a) => {
                self.push("RPUSH", a, caller, is_write, &mut codec).await?
            }
            CacheOperation::Lrange(a) => {
                let (start, stop) = a.bounds();
                let reply = self
                    .exec(cmd([
                        "LRANGE".to_string(),
                        scoped(&a.key)?,
                        start.to_string(),
                        stop.to_string(),
                    ]))
                    .await?;
                json!({ "values": codec.decode_all(reply)? })
            }
            CacheOperation::Lpop(a) => self.pop("LPOP", a, caller, is_write, &mut codec).await?,
            CacheOperation::Rpop(a) => self.pop("RPOP", a, caller, is_write, &mut codec).await?,
            CacheOperation::Llen(a) => {
                let reply = self.exec(cmd(["LLEN".to_string(), scoped(&a.key)?])).await?;
                json!({ "length": as_int(&reply)? })
            }
            CacheOperation::Ltrim(a) => {
                let (start, stop) = a.bounds();
                self.exec(cmd([
                    "LTRIM".to_string(),
                    scoped(&a.key)?,
                    start.to_string(),
                    stop.to_string(),
                ]))
                .await?;
                json!({ "success": true })
            }

            // sorted set
            CacheOperation::Zadd(a) => {
                let members = a.all_members()?;
                self.check_batch(&members, "members")?;
                let key = scoped(&a.key)?;
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let mut command = cmd(["ZADD".to_string(), key.clone()]);
                if options.nx {
                    command.push("NX".into());
                } else if options.xx {
                    command.push("XX".into());
                }
                for m in members {
                    command.push(format_score(m.score));
                    command.push(m.member);
                }
                let reply = self.exec(command).await?;
                self.expire(&key, ttl).await?;
                json!({ "added": as_int(&reply)?, "ttl": ttl })
            }
            CacheOperation::Zrange(a) => {
                let (start, stop) = a.bounds();
                let verb = if options.reverse { "ZREVRANGE" } else { "ZRANGE" };
                let mut command = cmd([
                    verb.to_string(),
                    scoped(&a.key)?,
                    start.to_string(),
                    stop.to_string(),
                ]);
                if options.with_scores {
                    command.push("WITHSCORES".into());
                }
                let flat = as_array(self.exec(command).await?)?;
                let members = if options.with_scores {
                    scored_pairs(flat)?
                } else {
                    flat
                };
                json!({ "members": members })
            }
            CacheOperation::Zrangebyscore(a) => {
                let (min, max) = (a.min.to_arg()?, a.max.to_arg()?);
                let key = scoped(&a.key)?;
                let mut command = if options.reverse {
                    cmd(["ZREVRANGEBYSCORE".to_string(), key, max, min])
                } else {
                    cmd(["ZRANGEBYSCORE".to_string(), key, min, max])
                };
                if options.with_scores {
                    command.push("WITHSCORES".into());
                }
                if let Some(count) = a.count {
                    command.extend(cmd(["LIMIT".to_string(), "0".into(), count.to_string()]));
                }
                let flat = as_array(self.exec(command).await?)?;
                let members = if options.with_scores {
                    scored_pairs(flat)?
                } else {
                    flat
                };
                json!({ "members": members })
            }
            CacheOperation::Zrank(a) => {
                let verb = if options.reverse { "ZREVRANK" } else { "ZRANK" };
                let reply = self
                    .exec(cmd([verb.to_string(), scoped(&a.key)?, a.member]))
                    .await?;
                json!({ "rank": as_opt_int(&reply)? })
            }
            CacheOperation::Zscore(a) => {
                let reply = self
                    .exec(cmd(["ZSCORE".to_string(), scoped(&a.key)?, a.member]))
                    .await?;
                json!({ "score": as_opt_score(&reply)? })
            }
            CacheOperation::Zrem(a) => {
                self.check_batch(&a.members, "members")?;
                let mut command = cmd(["ZREM".to_string(), scoped(&a.key)?]);
                command.extend(a.members);
                let reply = self.exec(command).await?;
                json!({ "removed": as_int(&reply)? })
            }
            CacheOperation::Zincrby(a) => {
                let key = scoped(&a.key)?;
                check_ttl(a.ttl, self.settings.default_ttl)?;
                let reply = self
                    .exec(cmd([
                        "ZINCRBY".to_string(),
                        key.clone(),
                        format_score(a.score),
                        a.member,
                    ]))
                    .await?;
                self.arm_counter_ttl(&key, a.ttl).await?;
                json!({ "score": as_opt_score(&reply)? })
            }
            CacheOperation::Zcard(a) => {
                let reply = self.exec(cmd(["ZCARD".to_string(), scoped(&a.key)?])).await?;
                json!({ "count": as_int(&reply)? })
            }
            CacheOperation::Zcount(a) => {
                let (min, max) = (a.min.to_arg()?, a.max.to_arg()?);
                let reply = self
                    .exec(cmd(["ZCOUNT".to_string(), scoped(&a.key)?, min, max]))
                    .await?;
                json!({ "count": as_int(&reply)? })
            }

            // set
            CacheOperation::Sadd(a) => {
                self.check_batch(&a.members, "members")?;
                let key = scoped(&a.key)?;
                let ttl = check_ttl(a.ttl, self.settings.default_ttl)?;
                let mut command = cmd(["SADD".to_string(), key.clone()]);
                command.extend(a.members);
                let reply = self.exec(command).await?;
                self.expire(&key, ttl).await?;
                json!({ "added": as_int(&reply)?, "ttl": ttl })
            }
            CacheOperation::Smembers(a) => {
                let reply = self.exec(cmd(["SMEMBERS".to_string(), scoped(&a.key)?])).await?;
                json!({ "members": as_array(reply)? })
            }
            CacheOperation::Sismember(a) => {
                let reply = self
                    .exec(cmd(["SISMEMBER".to_string(), scoped(&a.key)?, a.member]))
                    .await?;
                json!({ "isMember": as_int(&reply)? == 1 })
            }
            CacheOperation::Srem(a) => {
                self.check_batch(&a.members, "members")?;
                let mut command = cmd(["SREM".to_string(), scoped(&a.key)?]);
                command.extend(a.members);
                let reply = self.exec(command).await?;
                json!({ "removed": as_int(&reply)? })
            }
            CacheOperation::Scard(a) => {
                let reply = self.exec(cmd(["SCARD".to_string(), scoped(&a.key)?])).await?;
                json!({ "count": as_int(&reply)? })
            }

            // utility
            CacheOperation::Keys(a) => {
                let pattern = scope_pattern(&a.pattern, caller, true)?;
                let keys = as_array(self.exec(cmd(["KEYS".to_string(), pattern])).await?)?;
                json!({ "count": keys.len(), "keys": keys })
            }
            CacheOperation::Scan(a) => {
                let cursor = match &a.cursor {
                    Some(c) => c.to_arg()?,
                    None => "0".to_string(),
                };
                let pattern = scope_pattern(a.pattern.as_deref().unwrap_or("*"), caller, true)?;
                let count = a.count.unwrap_or(DEFAULT_SCAN_COUNT);
                let (next, keys) = self.scan_page(cursor, &pattern, count).await?;
                json!({ "cursor": next, "keys": keys })
            }
            CacheOperation::Stats => {
                let reply = self.exec(cmd(["DBSIZE"])).await?;
                json!({
                    "metrics": self.metrics.snapshot(),
                    "circuitBreaker": self.circuit,
                    "dbSize": as_int(&reply)?,
                })
            }
            CacheOperation::FlushPattern(a) => {
                let pattern = scope_pattern(&a.pattern, caller, false)?;
                let deleted = self.flush(&pattern).await?;
                json!({ "deleted": deleted, "pattern": pattern })
            }
            CacheOperation::Health => {
                let report = health::backend_report(
                    self.executor.as_ref(),
                    self.circuit,
                    self.metrics.snapshot(),
                )
                .await;
                serde_json::to_value(report)
                    .map_err(|e| GatewayError::server(format!("Failed to encode report: {}", e)))?
            }
            CacheOperation::Ping => {
                let started = Instant::now();
                let reply = self.exec(cmd(["PING"])).await?;
                json!({
                    "pong": reply.as_str() == Some("PONG"),
                    "latencyMs": started.elapsed().as_millis() as u64,
                })
            }
        };

        if codec.savings != 0 {
            self.metrics.record_compression_savings(codec.savings);
        }

        Ok(DispatchOutcome {
            result,
            compressed: codec.compressed,
        })
    }

    async fn push(
        &self,
        verb: &str,
        args: PushArgs,
        caller: &CallerContext,
        is_write: bool,
        codec: &mut ValueCodec,
    ) -> GatewayResult<Value> {
        let values = args.all_values();
        self.check_batch(&values, "values")?;
        let key = scope_key(&args.key, caller, is_write)?.key;
        let ttl = check_ttl(args.ttl, self.settings.default_ttl)?;

        let mut command = cmd([verb.to_string(), key.clone()]);
        for v in &values {
            command.push(codec.encode(v)?);
        }
        let reply = self.exec(command).await?;
        self.expire(&key, ttl).await?;
        Ok(json!({ "length": as_int(&reply)?, "ttl": ttl }))
    }

    async fn pop(
        &self,
        verb: &str,
        args: PopArgs,
        caller: &CallerContext,
        is_write: bool,
        codec: &mut ValueCodec,
    ) -> GatewayResult<Value> {
        let key = scope_key(&args.key, caller, is_write)?.key;
        match args.count {
            Some(0) => Err(GatewayError::validation("Count must be greater than zero")),
            Some(count) => {
                let reply = self
                    .exec(cmd([verb.to_string(), key, count.to_string()]))
                    .await?;
                Ok(json!({ "values": codec.decode_all(reply)? }))
            }
            None => {
                let reply = self.exec(cmd([verb.to_string(), key])).await?;
                Ok(json!({ "value": codec.decode(reply)? }))
            }
        }
    }

    async fn scan_page(
        &self,
        cursor: String,
        pattern: &str,
        count: u64,
    ) -> GatewayResult<(String, Vec<Value>)> {
        let reply = self
            .exec(cmd([
                "SCAN".to_string(),
                cursor,
                "MATCH".into(),
                pattern.to_string(),
                "COUNT".into(),
                count.to_string(),
            ]))
            .await?;

        match as_array(reply)?.as_slice() {
            [next, Value::Array(keys)] => {
                let next = match next {
                    Value::String(s) => s.clone(),
                    other => as_int(other)?.to_string(),
                };
                Ok((next, keys.clone()))
            }
            _ => Err(GatewayError::server("Unexpected SCAN reply")),
        }
    }

    /// Delete every key matching `pattern`, walking the keyspace with `SCAN`
    async fn flush(&self, pattern: &str) -> GatewayResult<i64> {
        let mut cursor = "0".to_string();
        let mut deleted = 0;
        loop {
            let (next, keys) = self
                .scan_page(cursor, pattern, DEFAULT_SCAN_COUNT)
                .await?;
            let keys: Vec<String> = keys
                .into_iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect();
            for chunk in keys.chunks(self.settings.max_batch_size.max(1)) {
                let mut command = cmd(["DEL"]);
                command.extend(chunk.iter().cloned());
                deleted += as_int(&self.exec(command).await?)?;
            }
            if next == "0" {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::rate_limit::Tier;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays canned replies and records commands
    struct ScriptedExecutor {
        replies: Mutex<Vec<Value>>,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedExecutor {
        fn new(replies: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn commands(&self) -> Vec<Vec<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RedisExecutor for ScriptedExecutor {
        async fn execute(&self, command: Vec<String>) -> GatewayResult<Value> {
            self.seen.lock().unwrap().push(command);
            Ok(self.replies.lock().unwrap().pop().unwrap_or(Value::Null))
        }

        async fn pipeline(&self, commands: Vec<Vec<String>>) -> GatewayResult<Vec<Value>> {
            let mut out = Vec::new();
            for c in commands {
                out.push(self.execute(c).await?);
            }
            Ok(out)
        }
    }

    fn dispatcher(exec: Arc<ScriptedExecutor>) -> Dispatcher {
        Dispatcher::new(
            exec,
            Arc::new(GatewayMetrics::new()),
            DispatchSettings::default(),
            CircuitState::Closed,
        )
    }

    fn alice() -> CallerContext {
        CallerContext::user("alice", Tier::Pro, false)
    }

    fn parse(body: Value) -> CacheOperationRequest {
        CacheOperationRequest::from_json(body.to_string().as_bytes()).unwrap()
    }

    async fn run(exec: Arc<ScriptedExecutor>, body: Value) -> GatewayResult<DispatchOutcome> {
        let req = parse(body);
        dispatcher(exec)
            .dispatch(req.operation, &req.options, &alice())
            .await
    }

    #[tokio::test]
    async fn test_set_uses_single_set_ex() {
        let exec = ScriptedExecutor::new(vec![Value::from("OK")]);
        let out = run(
            exec.clone(),
            json!({"operation": "set", "key": "pref", "value": "dark"}),
        )
        .await
        .unwrap();

        assert_eq!(out.result, json!({"success": true, "ttl": 900}));
        assert_eq!(
            exec.commands(),
            vec![cmd(["SET", "user:alice:pref", "dark", "EX", "900"])]
        );
    }

    #[tokio::test]
    async fn test_set_nx_and_non_string_values() {
        let exec = ScriptedExecutor::new(vec![Value::Null]);
        let out = run(
            exec.clone(),
            json!({"operation": "set", "key": "n", "value": {"a": 1}, "ttl": 60, "options": {"nx": true}}),
        )
        .await
        .unwrap();

        assert_eq!(out.result["success"], false);
        assert_eq!(
            exec.commands()[0],
            cmd(["SET", "user:alice:n", r#"{"a":1}"#, "EX", "60", "NX"])
        );
    }

    #[tokio::test]
    async fn test_large_value_is_compressed_and_decoded() {
        let big = "x".repeat(5000);
        let exec = ScriptedExecutor::new(vec![Value::from("OK")]);
        let out = run(
            exec.clone(),
            json!({"operation": "set", "key": "blob", "value": big.clone()}),
        )
        .await
        .unwrap();
        assert!(out.compressed);
        let stored = exec.commands()[0][2].clone();
        assert!(stored.starts_with("gz:"));

        let exec = ScriptedExecutor::new(vec![Value::from(stored)]);
        let out = run(exec, json!({"operation": "get", "key": "blob"}))
            .await
            .unwrap();
        assert_eq!(out.result["value"], Value::from(big));
        assert!(out.compressed);
    }

    #[tokio::test]
    async fn test_marker_prefixed_value_round_trips() {
        let exec = ScriptedExecutor::new(vec![Value::from("OK")]);
        let out = run(
            exec.clone(),
            json!({"operation": "set", "key": "note", "value": "gz:hello", "options": {"compress": false}}),
        )
        .await
        .unwrap();
        assert!(out.compressed);
        let stored = exec.commands()[0][2].clone();
        assert_ne!(stored, "gz:hello");
        assert_eq!(compression::decompress(&stored).unwrap(), "gz:hello");

        let exec = ScriptedExecutor::new(vec![Value::from(stored)]);
        let out = run(exec, json!({"operation": "get", "key": "note"}))
            .await
            .unwrap();
        assert_eq!(out.result, json!({"value": "gz:hello"}));
    }

    #[tokio::test]
    async fn test_undecodable_stored_value_returned_raw() {
        let exec = ScriptedExecutor::new(vec![json!(["gz:hello", "plain"])]);
        let out = run(exec, json!({"operation": "mget", "keys": ["a", "b"]}))
            .await
            .unwrap();
        assert_eq!(out.result, json!({"values": ["gz:hello", "plain"]}));
        assert!(!out.compressed);
    }

    #[tokio::test]
    async fn test_increments_arm_default_ttl_only_when_missing() {
        let exec = ScriptedExecutor::new(vec![
            Value::from(1),
            Value::from(1),
            Value::from(3),
            Value::from(0),
            json!("2.5"),
            Value::from(1),
        ]);
        let ops = [
            json!({"operation": "incr", "key": "counter"}),
            json!({"operation": "hincrby", "key": "h", "field": "f", "value": 3}),
            json!({"operation": "zincrby", "key": "board", "member": "a", "score": 2.5}),
        ];
        for op in ops {
            run(exec.clone(), op).await.unwrap();
        }

        assert_eq!(
            exec.commands(),
            vec![
                cmd(["INCRBY", "user:alice:counter", "1"]),
                cmd(["EXPIRE", "user:alice:counter", "900", "NX"]),
                cmd(["HINCRBY", "user:alice:h", "f", "3"]),
                cmd(["EXPIRE", "user:alice:h", "900", "NX"]),
                cmd(["ZINCRBY", "user:alice:board", "2.5", "a"]),
                cmd(["EXPIRE", "user:alice:board", "900", "NX"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_decrement_with_explicit_ttl() {
        let exec = ScriptedExecutor::new(vec![Value::from(-2), Value::from(1)]);
        let out = run(
            exec.clone(),
            json!({"operation": "decr", "key": "quota", "value": 2, "ttl": 60}),
        )
        .await
        .unwrap();
        assert_eq!(out.result, json!({"value": -2}));
        assert_eq!(
            exec.commands(),
            vec![
                cmd(["DECRBY", "user:alice:quota", "2"]),
                cmd(["EXPIRE", "user:alice:quota", "60"]),
            ]
        );

        let exec = ScriptedExecutor::new(vec![]);
        let err = run(exec.clone(), json!({"operation": "incr", "key": "quota", "ttl": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_compress_false_stores_verbatim() {
        let big = "y".repeat(5000);
        let exec = ScriptedExecutor::new(vec![Value::from("OK")]);
        let out = run(
            exec.clone(),
            json!({"operation": "set", "key": "blob", "value": big.clone(), "options": {"compress": false}}),
        )
        .await
        .unwrap();
        assert!(!out.compressed);
        assert_eq!(exec.commands()[0][2], big);
    }

    #[tokio::test]
    async fn test_hset_arms_ttl_in_second_call() {
        let exec = ScriptedExecutor::new(vec![Value::from(1), Value::from(1)]);
        let out = run(
            exec.clone(),
            json!({"operation": "hset", "key": "profile", "field": "theme", "value": "dark", "ttl": 3600}),
        )
        .await
        .unwrap();

        assert_eq!(out.result, json!({"created": true, "ttl": 3600}));
        assert_eq!(
            exec.commands(),
            vec![
                cmd(["HSET", "user:alice:profile", "theme", "dark"]),
                cmd(["EXPIRE", "user:alice:profile", "3600"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_hgetall_flat_reply() {
        let exec = ScriptedExecutor::new(vec![json!(["theme", "dark", "lang", "nb"])]);
        let out = run(exec, json!({"operation": "hgetall", "key": "profile"}))
            .await
            .unwrap();
        assert_eq!(out.result, json!({"fields": {"theme": "dark", "lang": "nb"}}));
    }

    #[tokio::test]
    async fn test_batch_limit_checked_before_backend() {
        let exec = ScriptedExecutor::new(vec![]);
        let keys: Vec<String> = (0..101).map(|i| format!("k{}", i)).collect();
        let err = run(exec.clone(), json!({"operation": "mdel", "keys": keys}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_mset_pipeline() {
        let exec = ScriptedExecutor::new(vec![Value::from("OK"), Value::from(1), Value::from(1)]);
        let out = run(
            exec.clone(),
            json!({"operation": "mset", "pairs": [{"key": "a", "value": "1"}, {"key": "b", "value": 2}], "ttl": 60}),
        )
        .await
        .unwrap();
        assert_eq!(out.result, json!({"success": true, "count": 2, "ttl": 60}));
        assert_eq!(
            exec.commands()[0],
            cmd(["MSET", "user:alice:a", "1", "user:alice:b", "2"])
        );
        assert_eq!(exec.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_reverse_score_range_swaps_bounds() {
        let exec = ScriptedExecutor::new(vec![json!(["b", "9", "a", "3"])]);
        let out = run(
            exec.clone(),
            json!({"operation": "zrangebyscore", "key": "board", "min": 0, "max": "+inf",
                   "count": 10, "options": {"reverse": true, "withScores": true}}),
        )
        .await
        .unwrap();

        assert_eq!(
            exec.commands()[0],
            cmd([
                "ZREVRANGEBYSCORE",
                "user:alice:board",
                "+inf",
                "0",
                "WITHSCORES",
                "LIMIT",
                "0",
                "10"
            ])
        );
        assert_eq!(
            out.result["members"],
            json!([{"member": "b", "score": 9.0}, {"member": "a", "score": 3.0}])
        );
    }

    #[tokio::test]
    async fn test_zrank_reverse_and_missing_member() {
        let exec = ScriptedExecutor::new(vec![Value::Null]);
        let out = run(
            exec.clone(),
            json!({"operation": "zrank", "key": "board", "member": "zed", "options": {"reverse": true}}),
        )
        .await
        .unwrap();
        assert_eq!(out.result, json!({"rank": null}));
        assert_eq!(exec.commands()[0][0], "ZREVRANK");
    }

    #[tokio::test]
    async fn test_pop_with_count() {
        let exec = ScriptedExecutor::new(vec![json!(["a", "b"])]);
        let out = run(exec.clone(), json!({"operation": "rpop", "key": "q", "count": 2}))
            .await
            .unwrap();
        assert_eq!(out.result, json!({"values": ["a", "b"]}));
        assert_eq!(exec.commands()[0], cmd(["RPOP", "user:alice:q", "2"]));
    }

    #[tokio::test]
    async fn test_push_requires_values() {
        let exec = ScriptedExecutor::new(vec![]);
        let err = run(exec.clone(), json!({"operation": "lpush", "key": "q"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_set_members_not_compressed() {
        let big = "m".repeat(5000);
        let exec = ScriptedExecutor::new(vec![Value::from(1), Value::from(1)]);
        let out = run(
            exec.clone(),
            json!({"operation": "sadd", "key": "tags", "members": [big.clone()]}),
        )
        .await
        .unwrap();
        assert!(!out.compressed);
        assert_eq!(exec.commands()[0][2], big);
    }

    #[tokio::test]
    async fn test_flush_pattern_walks_cursor() {
        let exec = ScriptedExecutor::new(vec![
            json!(["7", ["user:alice:s:1"]]),
            Value::from(1),
            json!(["0", ["user:alice:s:2", "user:alice:s:3"]]),
            Value::from(2),
        ]);
        let out = run(
            exec.clone(),
            json!({"operation": "flush_pattern", "pattern": "s:*"}),
        )
        .await
        .unwrap();

        assert_eq!(out.result, json!({"deleted": 3, "pattern": "user:alice:s:*"}));
        assert_eq!(exec.commands()[2][1], "7");
    }

    #[tokio::test]
    async fn test_flush_pattern_rejects_shared_namespaces() {
        let exec = ScriptedExecutor::new(vec![]);
        let err = run(exec, json!({"operation": "flush_pattern", "pattern": "app:*"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_nx_and_xx_conflict() {
        let exec = ScriptedExecutor::new(vec![]);
        let err = run(
            exec,
            json!({"operation": "set", "key": "k", "value": "v", "options": {"nx": true, "xx": true}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stats_reports_db_size() {
        let exec = ScriptedExecutor::new(vec![Value::from(42)]);
        let out = run(exec, json!({"operation": "stats"})).await.unwrap();
        assert_eq!(out.result["dbSize"], 42);
        assert_eq!(out.result["circuitBreaker"], "closed");
        assert_eq!(out.result["metrics"]["totalRequests"], 0);
    }
}
