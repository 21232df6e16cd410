//! Monthly quota ledger.
//!
//! The counter lives in the shared store so every gateway replica draws
//! from the same budget; it resets on the first of each month to match
//! the provider's billing cycle. Reservation is a single atomic
//! read-modify-write in the store, never a process-local lock.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::metrics;
use crate::store::{GatewayStore, QuotaReserve};

/// `"2025-11"` for November 2025.
pub fn month_tag(now: &DateTime<Utc>) -> String {
    format!("{}-{:02}", now.year(), now.month())
}

/// First of the month after `now`, UTC midnight.
pub fn next_reset(now: &DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    // The first of a month always exists
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(*now)
}

/// Usage snapshot served by /health, /stats and /usage.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub month: String,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_date: String,
    pub percentage: f64,
}

pub struct QuotaLedger {
    store: Arc<dyn GatewayStore>,
    max_calls: u64,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn GatewayStore>, max_calls: u64) -> Self {
        info!(max_calls, "quota ledger ready");
        Self { store, max_calls }
    }

    /// Reserve one upstream call against the current month.
    ///
    /// Returns the count after the increment. `QuotaExceeded` leaves the
    /// ledger untouched; store failures propagate without any mutation.
    pub async fn reserve(&self) -> Result<u64, GatewayError> {
        let now = Utc::now();
        let month = month_tag(&now);

        match self.store.quota_reserve(&month, self.max_calls).await? {
            QuotaReserve::Granted(count) => {
                self.update_gauges(count);
                debug!(count, limit = self.max_calls, "quota reserved");
                Ok(count)
            }
            QuotaReserve::Exhausted(count) => {
                self.update_gauges(count);
                warn!(count, limit = self.max_calls, "monthly quota exhausted");
                Err(GatewayError::QuotaExceeded {
                    used: count,
                    limit: self.max_calls,
                    reset_date: next_reset(&now).to_rfc3339(),
                })
            }
        }
    }

    /// Read-only snapshot of the current month's usage.
    pub async fn usage(&self) -> Result<QuotaUsage, GatewayError> {
        let now = Utc::now();
        let month = month_tag(&now);
        let used = self.store.quota_usage(&month).await?;
        self.update_gauges(used);

        Ok(QuotaUsage {
            month,
            used,
            limit: self.max_calls,
            remaining: self.max_calls.saturating_sub(used),
            reset_date: next_reset(&now).to_rfc3339(),
            percentage: (used as f64 / self.max_calls as f64 * 1000.0).round() / 10.0,
        })
    }

    fn update_gauges(&self, used: u64) {
        metrics::RATE_LIMIT_USED.set(used as i64);
        metrics::RATE_LIMIT_REMAINING.set(self.max_calls.saturating_sub(used) as i64);
    }
}
