// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! CallRecord and the analytics/insights types derived from a window of records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single `tools/call` invocation, sealed at exit and appended to an
/// in-memory ring that flushes to a daily journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: Uuid,
    pub tool_name: String,
    pub child_id: String,
    pub profile_id: String,
    pub args: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub response_bytes: Option<u64>,
}

impl CallRecord {
    pub fn start(
        tool_name: impl Into<String>,
        child_id: impl Into<String>,
        profile_id: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool_name: tool_name.into(),
            child_id: child_id.into(),
            profile_id: profile_id.into(),
            args,
            started_at: Utc::now(),
            ended_at: None,
            success: None,
            error_message: None,
            response_bytes: None,
        }
    }

    pub fn complete(&mut self, success: bool, error_message: Option<String>, bytes: u64) {
        self.ended_at = Some(Utc::now());
        self.success = Some(success);
        self.error_message = error_message;
        self.response_bytes = Some(bytes);
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Derived per-child health bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildHealth {
    Healthy,
    Degraded,
    Down,
}

impl ChildHealth {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.95 {
            ChildHealth::Healthy
        } else if rate >= 0.80 {
            ChildHealth::Degraded
        } else {
            ChildHealth::Down
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildStats {
    pub child_id: String,
    pub total_calls: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: i64,
    pub max_duration_ms: i64,
    pub health: ChildHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPopularity {
    pub tool_name: String,
    pub calls: u64,
}

/// Rollup produced by `Analytics(period, days)` over the last `days` journals
/// plus the in-memory buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    pub period_days: u32,
    pub total_calls: u64,
    pub success_rate: f64,
    pub per_child: Vec<ChildStats>,
    pub tool_popularity: Vec<ToolPopularity>,
    pub hourly_distribution: [u64; 24],
    pub daily_distribution: std::collections::BTreeMap<String, u64>,
    pub profile_histogram: std::collections::HashMap<String, u64>,
}

impl Analytics {
    pub fn empty(period_days: u32) -> Self {
        Self {
            period_days,
            total_calls: 0,
            success_rate: 0.0,
            per_child: Vec::new(),
            tool_popularity: Vec::new(),
            hourly_distribution: [0; 24],
            daily_distribution: std::collections::BTreeMap::new(),
            profile_histogram: std::collections::HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthBucket {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl HealthBucket {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            HealthBucket::Excellent
        } else if score >= 75.0 {
            HealthBucket::Good
        } else if score >= 50.0 {
            HealthBucket::Fair
        } else {
            HealthBucket::Poor
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthScore {
    pub child_id: String,
    pub score: f64,
    pub bucket: HealthBucket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub child_id: String,
    pub message: String,
    pub severity: crate::domain::errors::Severity,
}

/// Recommendations/Alerts/HealthScores derived from an [`Analytics`] rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    pub recommendations: Vec<Recommendation>,
    pub alerts: Vec<Alert>,
    pub health_scores: Vec<HealthScore>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_record_completes_with_duration() {
        let mut record = CallRecord::start("search", "github", "development", json!({"q":"x"}));
        assert!(record.success.is_none());
        record.complete(true, None, 128);
        assert_eq!(record.success, Some(true));
        assert_eq!(record.response_bytes, Some(128));
        assert!(record.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn health_bucket_thresholds() {
        assert_eq!(ChildHealth::from_success_rate(0.99), ChildHealth::Healthy);
        assert_eq!(ChildHealth::from_success_rate(0.85), ChildHealth::Degraded);
        assert_eq!(ChildHealth::from_success_rate(0.50), ChildHealth::Down);
    }
}
