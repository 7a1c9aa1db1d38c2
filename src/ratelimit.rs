//! Shared write rate limiter for upload workers.
//!
//! A token bucket refilled at `ops_per_sec` with room for a burst of
//! `burst` tokens. Waiters queue on a FIFO mutex before polling the bucket,
//! so one busy worker cannot starve the others.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub struct UploadRateLimiter {
    limiter: DefaultDirectRateLimiter,
    queue: Mutex<()>,
    ops_per_sec: u32,
    burst: u32,
}

impl UploadRateLimiter {
    pub fn new(ops_per_sec: u32, burst: u32) -> Result<Self> {
        let rate = NonZeroU32::new(ops_per_sec)
            .ok_or_else(|| Error::InvalidInput("rate limit must be positive".to_string()))?;
        let burst_size = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst_size)),
            queue: Mutex::new(()),
            ops_per_sec,
            burst: burst_size.get(),
        })
    }

    pub fn ops_per_sec(&self) -> u32 {
        self.ops_per_sec
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Wait for a write slot. Returns [`Error::Cancelled`] as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.wait_turn() => Ok(()),
        }
    }

    async fn wait_turn(&self) {
        let _turn = self.queue.lock().await;
        self.limiter.until_ready().await;
    }
}
