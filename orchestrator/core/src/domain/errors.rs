// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy shared across the orchestrator.
//!
//! Every bounded context raises its own `thiserror` enum close to where the
//! failure occurs; at the boundary each is converted into a [`ClassifiedError`],
//! the one shape that crosses process/wire boundaries (JSON-RPC `data`,
//! discovery diagnostics, supervisor error history).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a [`ClassifiedError`]. Ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Discriminant for the kind of failure, independent of which component
/// raised it. Mirrors the taxonomy in the error handling design: Configuration,
/// Preflight, Runtime, Transient, Resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingDependency,
    MissingCredential,
    MissingBuildArtifact,
    UnknownChild,
    InvalidProfile,
    SpawnFailed,
    ChildCrashed,
    ProtocolViolation,
    Timeout,
    ConnectionLost,
    CircuitOpen,
    PoolExhausted,
    CacheCapacityZero,
    DiscoveryFailed,
    RpcError,
    RateLimitExceeded,
}

/// Wire/log representation of a failure. Crosses the JSON-RPC boundary as
/// the `data` field of an error object, and is what `ChildState.errorHistory`
/// and discovery diagnostics store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub severity: Severity,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_remedy: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind,
            message: message.into(),
            severity,
            occurred_at: Utc::now(),
            child_id: None,
            suggested_remedy: None,
        }
    }

    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.child_id = Some(child_id.into());
        self
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.suggested_remedy = Some(remedy.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("profile not found: {0}")]
    NotFound(String),
    #[error("profile already exists: {0}")]
    AlreadyExists(String),
    #[error("cannot delete the last remaining profile")]
    LastProfileProtected,
    #[error("cannot activate unknown profile: {0}")]
    ActivatingUnknown(String),
    #[error("{0} is required for {1}")]
    MissingCredential(String, String),
    #[error("child not found: {0}")]
    UnknownChild(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("child {0} is in state {1:?}, cannot start")]
    InvalidStartState(String, crate::domain::child::ChildStatus),
    #[error("preflight check failed for {child_id}: {detail}")]
    PreflightFailed { child_id: String, detail: String },
    #[error("failed to spawn {child_id}: {source}")]
    SpawnFailed {
        child_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child {0} not found")]
    UnknownChild(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("all discovery attempts failed for {0}")]
    Exhausted(String),
    #[error("discovery session timed out for {0}")]
    Timeout(String),
    #[error("child {0} is not running")]
    ChildNotRunning(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool for {0} is exhausted")]
    Exhausted(String),
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error("acquire cancelled")]
    Cancelled,
    #[error("connection factory failed: {0}")]
    FactoryFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache capacity must be greater than zero")]
    CapacityZero,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("child {0} not ready")]
    ChildNotReady(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("rate limit exceeded for profile {0}")]
    RateLimitExceeded(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl From<&RouterError> for ClassifiedError {
    fn from(err: &RouterError) -> Self {
        match err {
            RouterError::ToolNotFound(name) => ClassifiedError::new(
                ErrorKind::UnknownChild,
                format!("tool not found: {name}"),
                Severity::Error,
            ),
            RouterError::ChildNotReady(id) => ClassifiedError::new(
                ErrorKind::ChildCrashed,
                format!("child {id} is not ready"),
                Severity::Warning,
            )
            .with_child(id.clone()),
            RouterError::Pool(PoolError::CircuitOpen(id)) => ClassifiedError::new(
                ErrorKind::CircuitOpen,
                format!("circuit open for {id}"),
                Severity::Warning,
            )
            .with_child(id.clone()),
            RouterError::Pool(PoolError::Exhausted(id)) => ClassifiedError::new(
                ErrorKind::PoolExhausted,
                format!("pool exhausted for {id}"),
                Severity::Warning,
            )
            .with_child(id.clone()),
            RouterError::Pool(other) => {
                ClassifiedError::new(ErrorKind::RpcError, other.to_string(), Severity::Error)
            }
            RouterError::Discovery(_) => ClassifiedError::new(
                ErrorKind::DiscoveryFailed,
                err.to_string(),
                Severity::Error,
            ),
            RouterError::RateLimitExceeded(profile) => ClassifiedError::new(
                ErrorKind::RateLimitExceeded,
                format!("rate limit exceeded for profile {profile}"),
                Severity::Warning,
            ),
        }
    }
}
