// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Child descriptor and runtime state — identity and lifecycle shadow of one
//! subprocess-based Tool Protocol server.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ClassifiedError;

/// How a child's executable is launched and what preflight applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Node,
    Python,
    Native,
    Generic,
}

/// Identity and launch recipe of one subprocess-based server.
///
/// Created by the installer, mutated only through the Config Store,
/// destroyed on uninstall.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDescriptor {
    pub id: String,
    pub display_name: String,
    pub runtime_kind: RuntimeKind,
    pub working_dir: std::path::PathBuf,
    pub executable: String,
    pub args: Vec<String>,
    pub env_overlay: HashMap<String, String>,
    pub category: String,
    /// Ordered env-var names that must be non-empty before `start` is permitted.
    pub required_creds: Vec<String>,
    pub tool_limit: Option<u32>,
}

impl ChildDescriptor {
    /// Names among `required_creds` that are absent from `available`.
    pub fn missing_credentials(&self, available: &HashMap<String, String>) -> Vec<String> {
        self.required_creds
            .iter()
            .filter(|name| available.get(*name).map(|v| v.is_empty()).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// Lifecycle status of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    Unconfigured,
    Stopped,
    Starting,
    Running,
    Degraded,
    Failed,
}

const LOG_RING_CAPACITY: usize = 1000;
const ERROR_HISTORY_CAPACITY: usize = 100;

/// Runtime shadow of a [`ChildDescriptor`]. Exactly one per descriptor;
/// lifetime equals the supervisor's process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildState {
    pub status: ChildStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<ClassifiedError>,
    log_ring: VecDeque<String>,
    error_history: VecDeque<ClassifiedError>,
}

impl Default for ChildState {
    fn default() -> Self {
        Self {
            status: ChildStatus::Unconfigured,
            pid: None,
            started_at: None,
            last_error: None,
            log_ring: VecDeque::with_capacity(LOG_RING_CAPACITY),
            error_history: VecDeque::with_capacity(ERROR_HISTORY_CAPACITY),
        }
    }
}

impl ChildState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `Start` is currently permitted.
    pub fn can_start(&self) -> bool {
        matches!(self.status, ChildStatus::Stopped | ChildStatus::Failed)
    }

    pub fn push_log(&mut self, line: String) {
        if self.log_ring.len() == LOG_RING_CAPACITY {
            self.log_ring.pop_front();
        }
        self.log_ring.push_back(line);
    }

    pub fn tail_logs(&self, n: usize) -> Vec<String> {
        let skip = self.log_ring.len().saturating_sub(n);
        self.log_ring.iter().skip(skip).cloned().collect()
    }

    pub fn push_error(&mut self, error: ClassifiedError) {
        if self.error_history.len() == ERROR_HISTORY_CAPACITY {
            self.error_history.pop_front();
        }
        self.last_error = Some(error.clone());
        self.error_history.push_back(error);
    }

    pub fn error_history(&self) -> impl Iterator<Item = &ClassifiedError> {
        self.error_history.iter()
    }

    pub fn mark_starting(&mut self) {
        self.status = ChildStatus::Starting;
    }

    pub fn mark_running(&mut self, pid: u32) {
        self.status = ChildStatus::Running;
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
    }

    pub fn mark_degraded(&mut self) {
        if self.status == ChildStatus::Running {
            self.status = ChildStatus::Degraded;
        }
    }

    pub fn mark_failed(&mut self, error: ClassifiedError) {
        self.status = ChildStatus::Failed;
        self.pid = None;
        self.push_error(error);
    }

    pub fn mark_stopped(&mut self) {
        self.status = ChildStatus::Stopped;
        self.pid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{ErrorKind, Severity};

    fn descriptor() -> ChildDescriptor {
        ChildDescriptor {
            id: "github".into(),
            display_name: "GitHub".into(),
            runtime_kind: RuntimeKind::Node,
            working_dir: "/srv/github".into(),
            executable: "server.js".into(),
            args: vec![],
            env_overlay: HashMap::new(),
            category: "vcs".into(),
            required_creds: vec!["GITHUB_PERSONAL_ACCESS_TOKEN".into()],
            tool_limit: None,
        }
    }

    #[test]
    fn missing_credentials_reports_absent_names() {
        let d = descriptor();
        let missing = d.missing_credentials(&HashMap::new());
        assert_eq!(missing, vec!["GITHUB_PERSONAL_ACCESS_TOKEN".to_string()]);

        let mut present = HashMap::new();
        present.insert("GITHUB_PERSONAL_ACCESS_TOKEN".to_string(), "ghp_x".to_string());
        assert!(d.missing_credentials(&present).is_empty());
    }

    #[test]
    fn log_ring_evicts_oldest() {
        let mut state = ChildState::new();
        for i in 0..(LOG_RING_CAPACITY + 10) {
            state.push_log(format!("line {i}"));
        }
        assert_eq!(state.tail_logs(1000).len(), LOG_RING_CAPACITY);
        assert_eq!(state.tail_logs(1)[0], format!("line {}", LOG_RING_CAPACITY + 9));
    }

    #[test]
    fn error_history_caps_at_capacity() {
        let mut state = ChildState::new();
        for i in 0..(ERROR_HISTORY_CAPACITY + 5) {
            state.push_error(ClassifiedError::new(
                ErrorKind::RpcError,
                format!("err {i}"),
                Severity::Error,
            ));
        }
        assert_eq!(state.error_history().count(), ERROR_HISTORY_CAPACITY);
    }

    #[test]
    fn can_start_only_from_stopped_or_failed() {
        let mut state = ChildState::new();
        assert!(!state.can_start());
        state.mark_stopped();
        assert!(state.can_start());
        state.mark_starting();
        assert!(!state.can_start());
    }
}
