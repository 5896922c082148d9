// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Connection, Pool and CircuitBreaker: the resilience layer's data model.
//! The pool's `acquire`/`release` algorithm and the background eviction loops
//! live in `infrastructure::pool`; this module holds only the state shape
//! and the circuit breaker's pure state machine.

use std::time::{Duration, Instant};

use uuid::Uuid;

/// A live JSON-RPC session to a running child. Exclusively owned by the
/// pool that created it; rented to exactly one caller at a time.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub child_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    pub healthy: bool,
    pub busy: bool,
}

impl Connection {
    pub fn new(child_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            child_id: child_id.into(),
            created_at: now,
            last_used_at: now,
            use_count: 0,
            healthy: true,
            busy: false,
        }
    }

    pub fn mark_rented(&mut self) {
        self.busy = true;
        self.use_count += 1;
        self.last_used_at = Instant::now();
    }

    pub fn mark_released(&mut self) {
        self.busy = false;
        self.last_used_at = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.last_used_at)
    }
}

/// Snapshot stats surfaced through `GET /api/performance/pools`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub total_requests: u64,
    pub total_created: u64,
    pub total_evicted: u64,
    pub current_size: usize,
    pub idle: usize,
    pub busy: usize,
}

/// Bounded pool configuration for one child.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub health_interval: Duration,
    pub idle_timeout: Duration,
    pub acquire_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 4,
            health_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            acquire_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Circuit breaker state. Guards a pool's `acquire` gateway; lifetime equals
/// the pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    last_failure_at: Option<Instant>,
    max_failures: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, open_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure_at: None,
            max_failures,
            open_timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call is currently permitted. May transition `Open` ->
    /// `HalfOpen` as a side effect once the open window has elapsed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.open_timeout {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.last_failure_at = None;
    }

    pub fn record_failure(&mut self) {
        self.last_failure_at = Some(Instant::now());
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                self.failures += 1;
                if self.failures >= self.max_failures {
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_max_failures_and_rejects_until_timeout() {
        let mut cb = CircuitBreaker::new(3, Duration::from_millis(20));
        assert!(cb.allow());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn success_resets_failure_counter_and_closes() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(30));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
