//! Request coalescing for identical concurrent reads
//!
//! The first read for a key registers a shared future; reads arriving while
//! it is in flight await the same future instead of hitting the backend.
//! Entries are dropped a short window after they settle, whatever the
//! outcome, so a burst right after completion still joins.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::gateway::error::GatewayResult;
use crate::gateway::metrics::GatewayMetrics;

type SharedOutcome<T> = Shared<BoxFuture<'static, GatewayResult<T>>>;

/// In-flight entries, tagged with a generation id so a late removal never
/// evicts a newer entry for the same key
type Registry<T> = Arc<Mutex<Entries<T>>>;

pub struct RequestCoalescer<T = Value> {
    pending: Registry<T>,
    next_id: AtomicU64,
    window: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(window: Duration, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            window,
            metrics,
        }
    }

    /// Await the in-flight result for `key`, or run `op` and share its result
    pub async fn coalesce<F>(&self, key: String, op: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let outcome = {
            let mut pending = lock(&self.pending);
            match pending.get(&key) {
                Some((_, existing)) => {
                    debug!(key = %key, "Joining in-flight request");
                    self.metrics.record_coalesced();
                    existing.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = self.register(key.clone(), id, op);
                    pending.insert(key, (id, shared.clone()));
                    shared
                }
            }
        };

        outcome.await
    }

    /// Number of registered entries
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    fn register<F>(&self, key: String, id: u64, op: F) -> SharedOutcome<T>
    where
        F: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let registry = self.pending.clone();
        let window = self.window;

        async move {
            let result = op.await;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let mut pending = lock(&registry);
                if pending.get(&key).is_some_and(|(current, _)| *current == id) {
                    pending.remove(&key);
                }
            });
            result
        }
        .boxed()
        .shared()
    }
}

type Entries<T> = HashMap<String, (u64, SharedOutcome<T>)>;

fn lock<T>(registry: &Registry<T>) -> MutexGuard<'_, Entries<T>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
