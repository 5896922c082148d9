// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Config Store (C3): ChildDescriptors and Profiles persisted as individual
//! JSON files under a root directory. All writes go through a single-writer
//! serialization lock; readers work against an in-memory snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::domain::child::ChildDescriptor;
use crate::domain::errors::ConfigError;
use crate::domain::profile::Profile;

struct Snapshot {
    children: HashMap<String, ChildDescriptor>,
    profiles: HashMap<String, Profile>,
    active_profile: String,
}

/// Resolves the default platform-appropriate data directory used when no
/// explicit `--config-dir` / `MCP_ORCHESTRATOR_CONFIG_DIR` is given.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("orchestrator")
}

pub struct ConfigStore {
    root: PathBuf,
    snapshot: RwLock<Snapshot>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Loads all persisted files under `root`, seeding the three default
    /// profiles (and marking the first active) when none exist.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>, ConfigError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("profiles")).await?;
        tokio::fs::create_dir_all(root.join("servers")).await?;

        let mut children = HashMap::new();
        let servers_dir = root.join("servers");
        let mut server_entries = tokio::fs::read_dir(&servers_dir).await?;
        while let Some(entry) = server_entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let config_path = entry.path().join("config.json");
            if let Ok(bytes) = tokio::fs::read(&config_path).await {
                let descriptor: ChildDescriptor = serde_json::from_slice(&bytes)?;
                children.insert(descriptor.id.clone(), descriptor);
            }
        }

        let mut profiles = HashMap::new();
        let profiles_dir = root.join("profiles");
        let mut profile_entries = tokio::fs::read_dir(&profiles_dir).await?;
        while let Some(entry) = profile_entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_stem().and_then(|s| s.to_str()) == Some("active") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let profile: Profile = serde_json::from_slice(&bytes)?;
            profiles.insert(profile.id.clone(), profile);
        }

        let active_path = profiles_dir.join("active.json");
        let mut active_profile = match tokio::fs::read(&active_path).await {
            Ok(bytes) => serde_json::from_slice::<ActiveMarker>(&bytes)?.profile_id,
            Err(_) => String::new(),
        };

        if profiles.is_empty() {
            for profile in Profile::defaults() {
                profiles.insert(profile.id.clone(), profile);
            }
            active_profile = "development".to_string();
        }

        if active_profile.is_empty() || !profiles.contains_key(&active_profile) {
            active_profile = profiles.keys().next().cloned().unwrap_or_default();
        }

        let store = Arc::new(Self {
            root,
            snapshot: RwLock::new(Snapshot {
                children,
                profiles,
                active_profile: active_profile.clone(),
            }),
            write_lock: Mutex::new(()),
        });

        store.persist_profiles_if_seeded().await?;
        store.write_active(&active_profile).await?;

        Ok(store)
    }

    async fn persist_profiles_if_seeded(&self) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.snapshot.read().await;
        for profile in snapshot.profiles.values() {
            let path = self.profile_path(&profile.id);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            write_json(&path, profile).await?;
        }
        Ok(())
    }

    fn profile_path(&self, id: &str) -> PathBuf {
        self.root.join("profiles").join(format!("{id}.json"))
    }

    fn child_config_path(&self, id: &str) -> PathBuf {
        self.root.join("servers").join(id).join("config.json")
    }

    pub async fn list_children(&self) -> Vec<ChildDescriptor> {
        self.snapshot.read().await.children.values().cloned().collect()
    }

    pub async fn get_child(&self, id: &str) -> Result<ChildDescriptor, ConfigError> {
        self.snapshot
            .read()
            .await
            .children
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownChild(id.to_string()))
    }

    /// Installs a child, rejecting if any `requiredCreds` name is absent
    /// from `provided_env`.
    pub async fn install_child(
        &self,
        descriptor: ChildDescriptor,
        provided_env: &HashMap<String, String>,
    ) -> Result<(), ConfigError> {
        let missing = descriptor.missing_credentials(provided_env);
        if let Some(name) = missing.into_iter().next() {
            return Err(ConfigError::MissingCredential(name, descriptor.display_name.clone()));
        }

        let _guard = self.write_lock.lock().await;
        let path = self.child_config_path(&descriptor.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_json(&path, &descriptor).await?;

        let mut snapshot = self.snapshot.write().await;
        snapshot.children.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub async fn uninstall_child(&self, id: &str) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.root.join("servers").join(id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        let mut snapshot = self.snapshot.write().await;
        snapshot
            .children
            .remove(id)
            .ok_or_else(|| ConfigError::UnknownChild(id.to_string()))?;
        Ok(())
    }

    pub async fn list_profiles(&self) -> Vec<Profile> {
        self.snapshot.read().await.profiles.values().cloned().collect()
    }

    pub async fn get_profile(&self, id: &str) -> Result<Profile, ConfigError> {
        self.snapshot
            .read()
            .await
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))
    }

    pub async fn get_active_profile(&self) -> Result<Profile, ConfigError> {
        let active_id = self.snapshot.read().await.active_profile.clone();
        self.get_profile(&active_id).await
    }

    pub async fn create_profile(&self, profile: Profile) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        {
            let snapshot = self.snapshot.read().await;
            if snapshot.profiles.contains_key(&profile.id) {
                return Err(ConfigError::AlreadyExists(profile.id.clone()));
            }
        }
        write_json(&self.profile_path(&profile.id), &profile).await?;
        self.snapshot.write().await.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    pub async fn update_profile(&self, profile: Profile) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        {
            let snapshot = self.snapshot.read().await;
            if !snapshot.profiles.contains_key(&profile.id) {
                return Err(ConfigError::NotFound(profile.id.clone()));
            }
        }
        write_json(&self.profile_path(&profile.id), &profile).await?;
        self.snapshot.write().await.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    pub async fn delete_profile(&self, id: &str) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.snapshot.write().await;
        if snapshot.profiles.len() <= 1 {
            return Err(ConfigError::LastProfileProtected);
        }
        if !snapshot.profiles.contains_key(id) {
            return Err(ConfigError::NotFound(id.to_string()));
        }
        snapshot.profiles.remove(id);
        if snapshot.active_profile == id {
            snapshot.active_profile = snapshot.profiles.keys().next().cloned().unwrap_or_default();
        }
        let active = snapshot.active_profile.clone();
        drop(snapshot);
        let _ = tokio::fs::remove_file(self.profile_path(id)).await;
        self.write_active(&active).await?;
        Ok(())
    }

    /// Atomic by writing a separate `active.json`.
    pub async fn set_active(&self, id: &str) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        {
            let snapshot = self.snapshot.read().await;
            if !snapshot.profiles.contains_key(id) {
                return Err(ConfigError::ActivatingUnknown(id.to_string()));
            }
        }
        self.write_active(id).await?;
        self.snapshot.write().await.active_profile = id.to_string();
        Ok(())
    }

    async fn write_active(&self, id: &str) -> Result<(), ConfigError> {
        let path = self.root.join("profiles").join("active.json");
        write_json(&path, &ActiveMarker { profile_id: id.to_string() }).await
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ActiveMarker {
    profile_id: String,
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_boot_seeds_three_default_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let mut ids: Vec<_> = store.list_profiles().await.into_iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["all_tools", "development", "marketing"]);
        assert_eq!(store.get_active_profile().await.unwrap().id, "development");
    }

    #[tokio::test]
    async fn install_rejects_missing_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let descriptor = ChildDescriptor {
            id: "github".into(),
            display_name: "GitHub".into(),
            runtime_kind: crate::domain::child::RuntimeKind::Node,
            working_dir: dir.path().join("github"),
            executable: "server.js".into(),
            args: vec![],
            env_overlay: HashMap::new(),
            category: "vcs".into(),
            required_creds: vec!["GITHUB_PERSONAL_ACCESS_TOKEN".into()],
            tool_limit: None,
        };
        let result = store.install_child(descriptor, &HashMap::new()).await;
        assert!(matches!(result, Err(ConfigError::MissingCredential(name, _)) if name == "GITHUB_PERSONAL_ACCESS_TOKEN"));
    }

    #[tokio::test]
    async fn set_active_is_atomic_and_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        store.set_active("marketing").await.unwrap();
        assert_eq!(store.get_active_profile().await.unwrap().id, "marketing");
    }

    #[tokio::test]
    async fn cannot_delete_last_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        store.delete_profile("marketing").await.unwrap();
        store.delete_profile("all_tools").await.unwrap();
        let result = store.delete_profile("development").await;
        assert!(matches!(result, Err(ConfigError::LastProfileProtected)));
    }

    #[tokio::test]
    async fn uninstall_leaves_no_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        let mut env = HashMap::new();
        env.insert("GITHUB_PERSONAL_ACCESS_TOKEN".to_string(), "x".to_string());
        let descriptor = ChildDescriptor {
            id: "github".into(),
            display_name: "GitHub".into(),
            runtime_kind: crate::domain::child::RuntimeKind::Node,
            working_dir: dir.path().join("github"),
            executable: "server.js".into(),
            args: vec![],
            env_overlay: HashMap::new(),
            category: "vcs".into(),
            required_creds: vec!["GITHUB_PERSONAL_ACCESS_TOKEN".into()],
            tool_limit: None,
        };
        store.install_child(descriptor, &env).await.unwrap();
        store.uninstall_child("github").await.unwrap();
        assert!(!tokio::fs::try_exists(dir.path().join("servers/github")).await.unwrap());
    }
}
