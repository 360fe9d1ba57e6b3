//! Reservoir rate limiter.
//!
//! A reservoir of `capacity` tokens is refilled to full every
//! `refill_interval`. Each request takes one token, and at most
//! `max_concurrent` requests may be in flight. With the defaults
//! (25 per second, one in flight) calls are fully serialized.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::TransportError;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens available per refill window.
    pub capacity: u32,
    /// Window after which the reservoir is reset to `capacity`.
    pub refill_interval: Duration,
    /// Maximum concurrent in-flight requests.
    pub max_concurrent: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 25,
            refill_interval: Duration::from_secs(1),
            max_concurrent: 1,
        }
    }
}

struct ReservoirState {
    tokens: u32,
    window_start: Instant,
}

/// Thread-safe reservoir of request tokens.
pub struct Reservoir {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<ReservoirState>,
}

impl Reservoir {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            state: Mutex::new(ReservoirState {
                tokens: capacity,
                window_start: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Time until the next refill.
    pub fn wait_time(&self) -> Duration {
        let state = self.state.lock().unwrap();
        self.refill_interval
            .saturating_sub(state.window_start.elapsed())
    }

    /// Tokens left in the current window.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut ReservoirState) {
        if state.window_start.elapsed() >= self.refill_interval {
            state.tokens = self.capacity;
            state.window_start = Instant::now();
        }
    }
}

/// Reservoir plus an in-flight limit.
#[derive(Clone)]
pub struct RateLimiter {
    reservoir: Arc<Reservoir>,
    in_flight: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            reservoir: Arc::new(Reservoir::new(config.capacity, config.refill_interval)),
            in_flight: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        }
    }

    /// Wait for an in-flight slot and a reservoir token.
    ///
    /// The returned permit holds the slot until dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, TransportError> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TransportError::Other(format!("rate limiter closed: {e}")))?;

        while !self.reservoir.try_acquire() {
            let wait = self.reservoir.wait_time().max(Duration::from_millis(1));
            tracing::debug!(wait_ms = wait.as_millis() as u64, "reservoir empty, waiting");
            tokio::time::sleep(wait).await;
        }
        Ok(permit)
    }

    pub fn available(&self) -> u32 {
        self.reservoir.available()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("available", &self.reservoir.available())
            .field("free_slots", &self.in_flight.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_drains_then_rejects() {
        let r = Reservoir::new(3, Duration::from_secs(60));
        assert!(r.try_acquire());
        assert!(r.try_acquire());
        assert!(r.try_acquire());
        assert!(!r.try_acquire(), "should be rate limited");
        assert!(r.wait_time() > Duration::from_secs(50));
    }

    #[test]
    fn reservoir_refills_to_full() {
        let r = Reservoir::new(2, Duration::from_millis(20));
        assert!(r.try_acquire());
        assert!(r.try_acquire());
        assert!(!r.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(r.available(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let rl = RateLimiter::new(RateLimiterConfig {
            capacity: 1,
            refill_interval: Duration::from_millis(50),
            max_concurrent: 1,
        });
        let start = Instant::now();
        drop(rl.acquire().await.unwrap());
        drop(rl.acquire().await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn single_slot_serializes_callers() {
        let rl = RateLimiter::new(RateLimiterConfig {
            capacity: 100,
            refill_interval: Duration::from_secs(1),
            max_concurrent: 1,
        });
        let held = rl.acquire().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(30), rl.acquire()).await;
        assert!(second.is_err(), "second caller must wait for the slot");
        drop(held);
        assert!(rl.acquire().await.is_ok());
    }
}
