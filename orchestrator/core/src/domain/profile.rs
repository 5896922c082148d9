// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Profile: a named filter + policy over the fleet of children.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_max_tools_per_child() -> u32 {
    50
}

fn default_max_tools_total() -> u32 {
    200
}

fn default_max_concurrent() -> u32 {
    8
}

fn default_rate_per_minute() -> u32 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerChildOverride {
    #[serde(default)]
    pub priority: u32,
    pub max_tools: Option<u32>,
    #[serde(default)]
    pub allowed_categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolFilter {
    #[serde(default)]
    pub include_categories: Vec<String>,
    #[serde(default)]
    pub exclude_categories: Vec<String>,
    #[serde(default)]
    pub include_names: Vec<String>,
    #[serde(default)]
    pub exclude_names: Vec<String>,
}

impl ToolFilter {
    pub fn allows(&self, name: &str, category: &str) -> bool {
        if self.exclude_names.iter().any(|n| n == name) {
            return false;
        }
        if self.exclude_categories.iter().any(|c| c == category) {
            return false;
        }
        if !self.include_names.is_empty() && !self.include_names.iter().any(|n| n == name) {
            return false;
        }
        if !self.include_categories.is_empty()
            && !self.include_categories.iter().any(|c| c == category)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    #[serde(default = "default_max_tools_per_child")]
    pub max_tools_per_child: u32,
    #[serde(default = "default_max_tools_total")]
    pub max_tools_total: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_rate_per_minute")]
    pub rate_per_minute: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tools_per_child: default_max_tools_per_child(),
            max_tools_total: default_max_tools_total(),
            max_concurrent: default_max_concurrent(),
            rate_per_minute: default_rate_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfConfig {
    #[serde(default)]
    pub prefer_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Named view over the fleet. Exactly one Profile is active at a time;
/// switching is atomic (see Config Store `setActive`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub enabled_children: Vec<String>,
    #[serde(default)]
    pub per_child_overrides: HashMap<String, PerChildOverride>,
    #[serde(default)]
    pub tool_filter: ToolFilter,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub perf_config: PerfConfig,
    #[serde(default)]
    pub analytics_config: AnalyticsConfig,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled_children: Vec::new(),
            per_child_overrides: HashMap::new(),
            tool_filter: ToolFilter::default(),
            limits: Limits::default(),
            perf_config: PerfConfig::default(),
            analytics_config: AnalyticsConfig::default(),
        }
    }

    pub fn allows_child(&self, child_id: &str) -> bool {
        self.enabled_children.is_empty() || self.enabled_children.iter().any(|c| c == child_id)
    }

    pub fn priority_for(&self, child_id: &str) -> u32 {
        self.per_child_overrides
            .get(child_id)
            .map(|o| o.priority)
            .unwrap_or(u32::MAX)
    }

    /// The three default profiles seeded by the Config Store on first run.
    pub fn defaults() -> Vec<Profile> {
        vec![
            Profile::new("development"),
            Profile::new("marketing"),
            {
                let mut all = Profile::new("all_tools");
                all.limits.max_tools_total = u32::MAX;
                all
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_filter_excludes_take_priority_over_includes() {
        let filter = ToolFilter {
            include_categories: vec!["vcs".into()],
            exclude_categories: vec![],
            include_names: vec![],
            exclude_names: vec!["delete_repo".into()],
        };
        assert!(filter.allows("create_repo", "vcs"));
        assert!(!filter.allows("delete_repo", "vcs"));
        assert!(!filter.allows("create_repo", "web"));
    }

    #[test]
    fn defaults_seed_three_named_profiles() {
        let defaults = Profile::defaults();
        let ids: Vec<_> = defaults.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["development", "marketing", "all_tools"]);
    }

    #[test]
    fn allows_child_is_permissive_when_unrestricted() {
        let profile = Profile::new("all_tools");
        assert!(profile.allows_child("anything"));
    }
}
