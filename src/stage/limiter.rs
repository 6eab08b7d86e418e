//! Shared throttle for a stage's external calls.
//!
//! A `RateLimiter` is built per run by the orchestrator and handed to each
//! stage through `StageContext`. Clones share the same bucket, so a stage
//! fanning out to N concurrent requests still respects one budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Longest single wait for a token; very small rates are clamped to this.
const MAX_TOKEN_WAIT: Duration = Duration::from_secs(3600);

/// Token bucket (requests per second with burst) plus a concurrency cap.
///
/// A rate that is zero, negative or not finite disables the bucket; only the
/// concurrency cap applies.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    rate_per_sec: Option<f64>,
    burst: f64,
    bucket: Arc<Mutex<Bucket>>,
    permits: Arc<Semaphore>,
}

/// Held for the duration of one throttled call.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32, max_in_flight: usize) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec: (rate_per_sec.is_finite() && rate_per_sec > 0.0).then_some(rate_per_sec),
            burst,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            })),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// A limiter that never waits. Useful for stages with no external calls.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, 1, Semaphore::MAX_PERMITS)
    }

    /// Wait for a concurrency slot and a token.
    pub async fn acquire(&self) -> RatePermit {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("rate limiter semaphore is never closed");
        let Some(rate) = self.rate_per_sec else {
            return RatePermit { _permit: permit };
        };

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(self.burst);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let missing = 1.0 - bucket.tokens;
                    Some(
                        Duration::try_from_secs_f64(missing / rate)
                            .map_or(MAX_TOKEN_WAIT, |d| d.min(MAX_TOKEN_WAIT)),
                    )
                }
            };

            match wait {
                None => return RatePermit { _permit: permit },
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}
