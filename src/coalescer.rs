//! Single-flight request coalescing.
//!
//! Concurrent identical upstream calls within one process collapse into
//! a single execution: the first arrival for a key becomes the leader
//! and runs the computation, later arrivals become followers and await
//! the same settled result. Success and failure are shared alike.
//!
//! The leader's computation runs on a detached task, so a caller that
//! disconnects mid-flight cannot strand the waiters: the terminal result
//! is always published and the in-flight entry always cleared.
//! Coalescing is deliberately process-local; replicas each run their own
//! map and the shared quota ledger remains the global safety net.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::GatewayError;

type CallResult = Result<serde_json::Value, GatewayError>;
type InFlightMap = Arc<Mutex<HashMap<String, broadcast::Sender<CallResult>>>>;

/// Result of a coalesced execution, with whether this caller joined an
/// already in-flight computation.
pub struct CoalesceOutcome {
    pub result: CallResult,
    pub coalesced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoalescerStats {
    pub total_requests: u64,
    pub coalesced_requests: u64,
    pub actual_api_calls: u64,
    pub savings_rate: String,
    pub in_flight: usize,
}

enum Role {
    Leader,
    Follower(broadcast::Receiver<CallResult>),
}

/// Removes the in-flight entry when the leader task unwinds without
/// settling, so followers observe a closed channel instead of hanging.
struct InFlightGuard {
    map: InFlightMap,
    key: String,
    armed: bool,
}

impl InFlightGuard {
    /// Publish the settled result to every waiter and clear the entry.
    ///
    /// Removal and send happen under the map lock, so an arrival after
    /// settlement always starts a fresh attempt.
    fn settle(mut self, result: &CallResult) {
        self.armed = false;
        if let Ok(mut map) = self.map.lock() {
            if let Some(sender) = map.remove(&self.key) {
                // No receivers just means the leader had no followers
                let _ = sender.send(result.clone());
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut map) = self.map.lock() {
                map.remove(&self.key);
            }
        }
    }
}

pub struct RequestCoalescer {
    in_flight: InFlightMap,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
        }
    }

    /// Execute `compute` with single-flight semantics for `key`.
    ///
    /// Registration is serialised on the map lock: exactly one caller
    /// per key can become the leader while an entry exists. The settled
    /// value (success or failure) is delivered to the leader and every
    /// follower; nothing is retried per-follower.
    pub async fn execute<F, Fut>(&self, key: &str, compute: F) -> CoalesceOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let role = {
            let mut map = match self.in_flight.lock() {
                Ok(map) => map,
                Err(_) => {
                    return CoalesceOutcome {
                        result: Err(GatewayError::Internal(
                            "in-flight map lock poisoned".to_string(),
                        )),
                        coalesced: false,
                    }
                }
            };
            match map.get(key) {
                Some(sender) => {
                    self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "coalescing with in-flight call");
                    Role::Follower(sender.subscribe())
                }
                None => {
                    let (sender, _) = broadcast::channel(1);
                    map.insert(key.to_string(), sender);
                    Role::Leader
                }
            }
        };

        match role {
            Role::Follower(mut receiver) => {
                let result = match receiver.recv().await {
                    Ok(result) => result,
                    // The leader unwound without publishing; the entry is
                    // already cleared, so report it rather than retry
                    Err(_) => Err(GatewayError::Internal(
                        "in-flight call settled without a result".to_string(),
                    )),
                };
                CoalesceOutcome {
                    result,
                    coalesced: true,
                }
            }
            Role::Leader => {
                let guard = InFlightGuard {
                    map: Arc::clone(&self.in_flight),
                    key: key.to_string(),
                    armed: true,
                };
                let future = compute();
                // Detached so the computation outlives a disconnected
                // caller and followers are still served
                let task = tokio::spawn(async move {
                    let result = future.await;
                    guard.settle(&result);
                    result
                });

                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(key, error = %e, "in-flight computation aborted");
                        Err(GatewayError::Internal(format!(
                            "in-flight computation aborted: {}",
                            e
                        )))
                    }
                };
                CoalesceOutcome {
                    result,
                    coalesced: false,
                }
            }
        }
    }

    pub fn stats(&self) -> CoalescerStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let coalesced = self.coalesced_requests.load(Ordering::Relaxed);
        let rate = if total > 0 {
            coalesced as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let in_flight = self.in_flight.lock().map(|m| m.len()).unwrap_or(0);
        CoalescerStats {
            total_requests: total,
            coalesced_requests: coalesced,
            actual_api_calls: total - coalesced,
            savings_rate: format!("{:.1}%", rate),
            in_flight,
        }
    }
}

impl Default for RequestCoalescer {
    fn default() -> Self {
        Self::new()
    }
}
