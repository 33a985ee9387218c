//! Politeness gate shared by every fetch.
//!
//! Two limits apply at once: at most `max_concurrent` requests in flight, and
//! at least `min_delay` between the starts of consecutive requests. Waiters
//! are admitted in arrival order.

use crate::error::LimiterClosed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Rate limiter handing out [`RateSlot`] guards.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    /// Start time of the most recently admitted request.
    last_started: Mutex<Option<Instant>>,
    max_concurrent: usize,
    min_delay: Duration,
}

/// A held concurrency slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct RateSlot {
    _permit: OwnedSemaphorePermit,
    started_at: Instant,
}

impl RateSlot {
    /// When this request was admitted.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, min_delay: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            last_started: Mutex::new(None),
            max_concurrent,
            min_delay,
        }
    }

    /// Wait for a slot.
    ///
    /// The concurrency permit is taken first, then the spacing lock is held
    /// across the delay so later callers queue behind this one and each
    /// start is measured from the previous admission.
    pub async fn acquire(&self) -> Result<RateSlot, LimiterClosed> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        let mut last = self.last_started.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_delay;
            if ready_at > Instant::now() {
                tracing::debug!(
                    "rate limiter spacing: waiting {}ms",
                    ready_at.saturating_duration_since(Instant::now()).as_millis()
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        if self.permits.is_closed() {
            return Err(LimiterClosed);
        }

        let started_at = Instant::now();
        *last = Some(started_at);
        Ok(RateSlot {
            _permit: permit,
            started_at,
        })
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Reject every current and future waiter. Held slots stay valid until dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
