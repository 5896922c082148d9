// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Per-child connection pool (C2). `acquire` is poll-based and deliberately
//! not FIFO: a waiter racing a newly freed connection gets comparable
//! latency to a waiter with strict queue position, which avoids a
//! condition-variable queue under the pool lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::connection::{CircuitBreaker, Connection, PoolConfig, PoolStats};
use crate::domain::errors::PoolError;

/// Produces and probes connections for one child. Implementations live in
/// the transport layer (the factory for a given child's pooled session is
/// whatever knows how to keep its stdin/stdout pipe alive).
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Connection, PoolError>;
    async fn health_check(&self, conn: &Connection) -> bool;
    async fn close(&self, conn: &Connection);
}

struct PoolInner {
    connections: Vec<Connection>,
    stats: PoolStats,
}

pub struct ConnectionPool {
    child_id: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    inner: Mutex<PoolInner>,
    circuit: Mutex<CircuitBreaker>,
}

impl ConnectionPool {
    pub fn new(
        child_id: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        max_failures: u32,
        open_timeout: Duration,
    ) -> Self {
        Self {
            child_id: child_id.into(),
            config,
            factory,
            inner: Mutex::new(PoolInner {
                connections: Vec::new(),
                stats: PoolStats::default(),
            }),
            circuit: Mutex::new(CircuitBreaker::new(max_failures, open_timeout)),
        }
    }

    pub fn child_id(&self) -> &str {
        &self.child_id
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            current_size: inner.connections.len(),
            idle: inner.connections.iter().filter(|c| !c.busy).count(),
            busy: inner.connections.iter().filter(|c| c.busy).count(),
            ..inner.stats.clone()
        }
    }

    /// Acquire a connection, blocking until one is available, the factory
    /// succeeds, or `cancel` fires. Scans for an idle healthy connection
    /// first; creates a new one under `max`; otherwise polls.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Connection, PoolError> {
        if !self.circuit.lock().allow() {
            return Err(PoolError::CircuitOpen(self.child_id.clone()));
        }

        loop {
            if let Some(conn) = self.try_take_idle() {
                self.inner.lock().stats.total_requests += 1;
                return Ok(conn);
            }

            let at_capacity = {
                let inner = self.inner.lock();
                inner.connections.len() >= self.config.max
            };

            if !at_capacity {
                match self.factory.create().await {
                    Ok(mut conn) => {
                        conn.mark_rented();
                        let mut inner = self.inner.lock();
                        inner.connections.push(conn.clone());
                        inner.stats.total_requests += 1;
                        inner.stats.total_created += 1;
                        self.circuit.lock().record_success();
                        return Ok(conn);
                    }
                    Err(err) => {
                        self.circuit.lock().record_failure();
                        if self.inner.lock().connections.len() >= self.config.max {
                            // fall through to polling below
                        } else {
                            return Err(err);
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(self.config.acquire_poll_interval) => {}
            }
        }
    }

    fn try_take_idle(&self) -> Option<Connection> {
        let mut inner = self.inner.lock();
        let slot = inner
            .connections
            .iter_mut()
            .find(|c| !c.busy && c.healthy)?;
        slot.mark_rented();
        Some(slot.clone())
    }

    pub fn release(&self, conn_id: uuid::Uuid, success: bool) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.connections.iter_mut().find(|c| c.id == conn_id) {
            slot.mark_released();
        }
        drop(inner);
        let mut circuit = self.circuit.lock();
        if success {
            circuit.record_success();
        } else {
            circuit.record_failure();
        }
    }

    pub async fn destroy(&self, conn_id: uuid::Uuid) {
        let removed = {
            let mut inner = self.inner.lock();
            if let Some(pos) = inner.connections.iter().position(|c| c.id == conn_id) {
                Some(inner.connections.remove(pos))
            } else {
                None
            }
        };
        if let Some(conn) = removed {
            self.factory.close(&conn).await;
            self.inner.lock().stats.total_evicted += 1;
        }
    }

    /// Background loop: every `health_interval`, probes idle connections and
    /// evicts unhealthy ones.
    pub async fn run_health_check_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let idle: Vec<Connection> = {
                let inner = self.inner.lock();
                inner.connections.iter().filter(|c| !c.busy).cloned().collect()
            };
            for conn in idle {
                if !self.factory.health_check(&conn).await {
                    self.destroy(conn.id).await;
                }
            }
        }
    }

    /// Background loop: evicts idle connections older than `idle_timeout`
    /// while preserving `min`.
    pub async fn run_idle_eviction_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let candidates: Vec<uuid::Uuid> = {
                let inner = self.inner.lock();
                if inner.connections.len() <= self.config.min {
                    Vec::new()
                } else {
                    let mut idle: Vec<&Connection> = inner
                        .connections
                        .iter()
                        .filter(|c| !c.busy && c.idle_for() >= self.config.idle_timeout)
                        .collect();
                    idle.sort_by_key(|c| std::cmp::Reverse(c.idle_for()));
                    let evictable = inner.connections.len() - self.config.min;
                    idle.into_iter().take(evictable).map(|c| c.id).collect()
                }
            };
            for id in candidates {
                self.destroy(id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFactory {
        created: AtomicU32,
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn create(&self) -> Result<Connection, PoolError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::new("child-a"))
        }

        async fn health_check(&self, _conn: &Connection) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self, _conn: &Connection) {}
    }

    fn pool(max: usize) -> ConnectionPool {
        let factory = Arc::new(CountingFactory {
            created: AtomicU32::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        ConnectionPool::new(
            "child-a",
            PoolConfig {
                min: 0,
                max,
                health_interval: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(300),
                acquire_poll_interval: Duration::from_millis(5),
            },
            factory,
            3,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn acquire_creates_up_to_max_then_reuses() {
        let pool = pool(2);
        let cancel = CancellationToken::new();
        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.stats().current_size, 2);
        pool.release(a.id, true);
        let c = pool.acquire(&cancel).await.unwrap();
        assert_eq!(c.id, a.id);
        pool.release(b.id, true);
        pool.release(c.id, true);
    }

    #[tokio::test]
    async fn acquire_respects_cancellation_when_exhausted() {
        let pool = pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();
        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let result = pool.acquire(&waiter_cancel).await;
        assert!(matches!(result, Err(PoolError::Cancelled)));
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_release_failures() {
        let pool = pool(4);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let conn = pool.acquire(&cancel).await.unwrap();
            pool.release(conn.id, false);
        }
        let result = pool.acquire(&cancel).await;
        assert!(matches!(result, Err(PoolError::CircuitOpen(_))));
    }
}
