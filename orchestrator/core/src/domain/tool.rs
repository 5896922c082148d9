// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Tool catalogue types: what a child advertises, and the cached snapshot of
//! one child's tool set that the discovery engine populates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by a child. `inputSchema` is kept as an opaque JSON
/// value end-to-end — this system never validates against it, only forwards
/// it to the upstream client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub category: String,
    pub child_id: String,
    pub discovered_at: DateTime<Utc>,
}

/// Outcome of one discovery session for one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    Success,
    Error,
}

/// Snapshot of one child's tool set, as stored in the tools cache.
///
/// A cache hit is only valid while `now - captured_at < ttl` *and*
/// `status == Success`; error sets are cached briefly to dampen
/// thundering-herd retries but are never served as authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedToolSet {
    pub child_id: String,
    pub tools: Vec<ToolDescriptor>,
    pub captured_at: DateTime<Utc>,
    pub status: DiscoveryStatus,
    pub error: Option<String>,
}

impl CachedToolSet {
    pub fn success(child_id: impl Into<String>, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            child_id: child_id.into(),
            tools,
            captured_at: Utc::now(),
            status: DiscoveryStatus::Success,
            error: None,
        }
    }

    pub fn failure(child_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            tools: Vec::new(),
            captured_at: Utc::now(),
            status: DiscoveryStatus::Error,
            error: Some(error.into()),
        }
    }
}

/// One diagnostic event emitted during a discovery session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticIssue {
    pub child_id: String,
    pub kind: String,
    pub message: String,
    pub severity: crate::domain::errors::Severity,
    pub occurred_at: DateTime<Utc>,
}

impl DiagnosticIssue {
    pub fn new(
        child_id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
        severity: crate::domain::errors::Severity,
    ) -> Self {
        Self {
            child_id: child_id.into(),
            kind: kind.into(),
            message: message.into(),
            severity,
            occurred_at: Utc::now(),
        }
    }
}
