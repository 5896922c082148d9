// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Usage Tracker (C7): append-only per-call records, daily journals, and
//! the rollup engine (Analytics, Insights) computed on demand.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Datelike, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::domain::call_record::{
    Alert, Analytics, CallRecord, ChildHealth, ChildStats, HealthBucket, HealthScore, Insights,
    Recommendation, ToolPopularity,
};
use crate::domain::errors::{Severity, TrackerError};

const DEFAULT_MAX_MEMORY_CALLS: usize = 10_000;
const DEFAULT_RETENTION_DAYS: u32 = 30;

pub struct UsageTracker {
    root: PathBuf,
    buffer: Mutex<Vec<CallRecord>>,
    max_memory_calls: usize,
    retention_days: u32,
    flush_lock: AsyncMutex<()>,
}

impl UsageTracker {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            buffer: Mutex::new(Vec::new()),
            max_memory_calls: DEFAULT_MAX_MEMORY_CALLS,
            retention_days: DEFAULT_RETENTION_DAYS,
            flush_lock: AsyncMutex::new(()),
        })
    }

    pub fn start(
        &self,
        tool_name: impl Into<String>,
        child_id: impl Into<String>,
        profile_id: impl Into<String>,
        args: Value,
    ) -> Uuid {
        let record = CallRecord::start(tool_name, child_id, profile_id, args);
        let id = record.id;
        self.buffer.lock().push(record);
        id
    }

    pub async fn complete(
        self: &Arc<Self>,
        handle: Uuid,
        success: bool,
        error: Option<String>,
        bytes: u64,
    ) {
        let should_flush = {
            let mut buffer = self.buffer.lock();
            if let Some(record) = buffer.iter_mut().find(|r| r.id == handle) {
                record.complete(success, error, bytes);
            }
            buffer.len() >= self.max_memory_calls
        };
        if should_flush {
            let _ = self.flush().await;
        }
    }

    /// Moves completed records from the in-memory buffer into today's
    /// journal via read-merge-write, under the single exclusive writer lock.
    pub async fn flush(self: &Arc<Self>) -> Result<(), TrackerError> {
        let _guard = self.flush_lock.lock().await;
        let (today_key, records_to_flush) = {
            let mut buffer = self.buffer.lock();
            let (done, pending): (Vec<_>, Vec<_>) =
                buffer.drain(..).partition(|r| r.ended_at.is_some());
            *buffer = pending;
            (Utc::now().format("%Y-%m-%d").to_string(), done)
        };

        if records_to_flush.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(self.root.join("analytics")).await?;
        let path = self.root.join("analytics").join(format!("calls-{today_key}.json"));

        let mut existing: Vec<CallRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        existing.extend(records_to_flush);

        let serialized = serde_json::to_vec_pretty(&existing)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Deletes journals older than `retentionDays`.
    pub async fn enforce_retention(&self) -> Result<(), TrackerError> {
        let analytics_dir = self.root.join("analytics");
        let mut entries = match tokio::fs::read_dir(&analytics_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.retention_days as i64);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(date_str) = name.strip_prefix("calls-").and_then(|s| s.strip_suffix(".json")) {
                if let Ok(date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
                    if date < cutoff {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn load_journal_records(&self, days: u32) -> Vec<CallRecord> {
        let mut records = Vec::new();
        let analytics_dir = self.root.join("analytics");
        for offset in 0..days.max(1) {
            let date = Utc::now().date_naive() - chrono::Duration::days(offset as i64);
            let path = analytics_dir.join(format!("calls-{}.json", date.format("%Y-%m-%d")));
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(mut parsed) = serde_json::from_slice::<Vec<CallRecord>>(&bytes) {
                    records.append(&mut parsed);
                }
            }
        }
        records
    }

    /// Reads the last `days` journals plus the in-memory buffer and
    /// computes the rollup in one pass. Never errors; an empty window
    /// returns a zeroed aggregate.
    pub async fn analytics(&self, days: u32) -> Analytics {
        let mut records = self.load_journal_records(days).await;
        records.extend(self.buffer.lock().iter().cloned());
        let completed: Vec<&CallRecord> = records.iter().filter(|r| r.success.is_some()).collect();

        if completed.is_empty() {
            return Analytics::empty(days);
        }

        let total_calls = completed.len() as u64;
        let successes = completed.iter().filter(|r| r.success == Some(true)).count() as u64;
        let success_rate = successes as f64 / total_calls as f64;

        let mut per_child: HashMap<String, Vec<&CallRecord>> = HashMap::new();
        let mut tool_counts: HashMap<String, u64> = HashMap::new();
        let mut hourly = [0u64; 24];
        let mut daily: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        let mut profile_histogram: HashMap<String, u64> = HashMap::new();

        for record in &completed {
            per_child.entry(record.child_id.clone()).or_default().push(record);
            *tool_counts.entry(record.tool_name.clone()).or_insert(0) += 1;
            hourly[record.started_at.hour() as usize] += 1;
            *daily.entry(record.started_at.format("%Y-%m-%d").to_string()).or_insert(0) += 1;
            *profile_histogram.entry(record.profile_id.clone()).or_insert(0) += 1;
        }

        let per_child_stats = per_child
            .into_iter()
            .map(|(child_id, records)| {
                let total = records.len() as u64;
                let succ = records.iter().filter(|r| r.success == Some(true)).count() as u64;
                let rate = succ as f64 / total as f64;
                let durations: Vec<i64> = records.iter().filter_map(|r| r.duration_ms()).collect();
                let avg = if durations.is_empty() {
                    0.0
                } else {
                    durations.iter().sum::<i64>() as f64 / durations.len() as f64
                };
                ChildStats {
                    child_id,
                    total_calls: total,
                    success_rate: rate,
                    avg_duration_ms: avg,
                    min_duration_ms: durations.iter().copied().min().unwrap_or(0),
                    max_duration_ms: durations.iter().copied().max().unwrap_or(0),
                    health: ChildHealth::from_success_rate(rate),
                }
            })
            .collect();

        let mut popularity: Vec<ToolPopularity> = tool_counts
            .into_iter()
            .map(|(tool_name, calls)| ToolPopularity { tool_name, calls })
            .collect();
        popularity.sort_by(|a, b| b.calls.cmp(&a.calls));

        Analytics {
            period_days: days,
            total_calls,
            success_rate,
            per_child: per_child_stats,
            tool_popularity: popularity,
            hourly_distribution: hourly,
            daily_distribution: daily,
            profile_histogram,
        }
    }

    pub async fn insights(&self, days: u32) -> Insights {
        let analytics = self.analytics(days).await;

        let mut recommendations = Vec::new();
        if analytics.total_calls > 0 {
            if analytics.success_rate < 0.95 {
                recommendations.push(Recommendation {
                    kind: "low_success_rate".to_string(),
                    message: format!(
                        "overall success rate is {:.1}%, below the 95% target",
                        analytics.success_rate * 100.0
                    ),
                });
            }
            if let Some(top) = analytics.tool_popularity.first() {
                let share = top.calls as f64 / analytics.total_calls as f64;
                if share > 0.5 {
                    recommendations.push(Recommendation {
                        kind: "single_tool_dominance".to_string(),
                        message: format!(
                            "{} accounts for {:.0}% of all calls",
                            top.tool_name,
                            share * 100.0
                        ),
                    });
                }
            }
        }

        let mut alerts = Vec::new();
        let mut health_scores = Vec::new();
        for child in &analytics.per_child {
            if !matches!(child.health, ChildHealth::Healthy) {
                alerts.push(Alert {
                    child_id: child.child_id.clone(),
                    message: format!("{:?} health ({:.1}% success)", child.health, child.success_rate * 100.0),
                    severity: if matches!(child.health, ChildHealth::Down) {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    },
                });
            }

            let response_time_band = if child.avg_duration_ms <= 200.0 {
                25.0
            } else if child.avg_duration_ms <= 1000.0 {
                15.0
            } else {
                5.0
            };
            let activity_band = if child.total_calls > 0 { 15.0 } else { 0.0 };
            let volume_band = (child.total_calls as f64).log10().max(0.0).min(20.0);
            let score = (0.40 * child.success_rate * 100.0 + response_time_band + activity_band + volume_band)
                .clamp(0.0, 100.0);

            health_scores.push(HealthScore {
                child_id: child.child_id.clone(),
                score,
                bucket: HealthBucket::from_score(score),
            });
        }

        Insights {
            recommendations,
            alerts,
            health_scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn analytics_with_no_calls_returns_zeroed_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path());
        let analytics = tracker.analytics(0).await;
        assert_eq!(analytics.total_calls, 0);
        assert_eq!(analytics.success_rate, 0.0);
    }

    #[tokio::test]
    async fn flush_then_analytics_reads_back_journal() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path());
        let handle = tracker.start("search", "github", "development", json!({"q": "x"}));
        tracker.complete(handle, true, None, 512).await;
        tracker.flush().await.unwrap();

        let analytics = tracker.analytics(1).await;
        assert_eq!(analytics.total_calls, 1);
        assert_eq!(analytics.success_rate, 1.0);
        assert_eq!(analytics.per_child[0].child_id, "github");
    }

    #[tokio::test]
    async fn insights_alerts_on_degraded_child() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path());
        for i in 0..10 {
            let handle = tracker.start("search", "flaky", "development", json!({}));
            tracker.complete(handle, i < 5, None, 10).await;
        }
        tracker.flush().await.unwrap();
        let insights = tracker.insights(1).await;
        assert!(!insights.alerts.is_empty());
    }
}
