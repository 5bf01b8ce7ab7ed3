// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared token bucket rate limiter. One instance per Muxer, shared by every
//! Connection's writer task so aggregate outbound bytes are capped, not
//! per-Connection bytes.

use std::sync::Mutex;

use tokio::time::{Duration, Instant};

use crate::error::MuxError;

const MIN_RATE_BPS: u64 = 1024 * 1024 / 8;

struct Bucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

/// Token bucket shared across all Connections of a Muxer.
///
/// `rate_bps` is bits per second on the wire; internally tracked in bytes.
/// Rates below 1 Mbit/s are rejected at construction per spec.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_bps: u64) -> Result<Self, MuxError> {
        if rate_bps < MIN_RATE_BPS {
            return Err(MuxError::config(format!(
                "rate_limit_bps of {rate_bps} bytes/s is below the minimum of {MIN_RATE_BPS} (1 Mbit/s)"
            )));
        }
        let rate_per_sec = rate_bps as f64;
        Ok(RateLimiter {
            bucket: Mutex::new(Bucket {
                capacity: rate_per_sec,
                tokens: rate_per_sec,
                rate_per_sec,
                last_refill: Instant::now(),
            }),
        })
    }

    fn refill(bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.rate_per_sec).min(bucket.capacity);
        bucket.last_refill = now;
    }

    /// Block until `bytes` worth of tokens are available, then consume them.
    pub async fn acquire(&self, bytes: usize) {
        let bytes = bytes as f64;
        loop {
            let wait = {
                #[allow(clippy::unwrap_used)]
                let mut bucket = self.bucket.lock().unwrap();
                Self::refill(&mut bucket);
                if bucket.tokens >= bytes {
                    bucket.tokens -= bytes;
                    None
                } else {
                    let deficit = bytes - bucket.tokens;
                    Some(Duration::from_secs_f64((deficit / bucket.rate_per_sec).max(0.001)))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_rates_below_one_mbit() {
        assert!(RateLimiter::new(1000).is_err());
    }

    #[test]
    fn accepts_one_mbit_and_above() {
        assert!(RateLimiter::new(MIN_RATE_BPS).is_ok());
    }

    #[tokio::test]
    async fn acquire_drains_the_bucket_without_blocking_within_capacity() {
        let rl = RateLimiter::new(MIN_RATE_BPS * 10).unwrap();
        rl.acquire(1024).await;
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_when_bucket_is_exhausted() {
        let rl = RateLimiter::new(MIN_RATE_BPS).unwrap();
        rl.acquire(MIN_RATE_BPS as usize).await;
        let start = Instant::now();
        rl.acquire(MIN_RATE_BPS as usize).await;
        assert!(Instant::now().saturating_duration_since(start) >= Duration::from_millis(500));
    }
}
