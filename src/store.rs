//! Pending-change persistence and pre-change backups
//!
//! One pretty-printed JSON record per change under `pending_changes/`, and a
//! copy of the repository taken before the pipeline ran under
//! `original_files/<change_id>/`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::ingest::relative_path;
use crate::orchestrator::PipelineResults;

/// Stable id of a requirement: UUIDv5 over the requirement text in the DNS namespace
pub fn change_id_for(requirement: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, requirement.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: String,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    pub requirement: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    pub results: PipelineResults,
    #[serde(default)]
    pub backed_up_files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

pub struct ChangeStore {
    store_dir: PathBuf,
    original_files_dir: PathBuf,
}

impl ChangeStore {
    pub fn open(store_dir: impl Into<PathBuf>, original_files_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            store_dir: store_dir.into(),
            original_files_dir: original_files_dir.into(),
        };
        fs::create_dir_all(&store.store_dir)
            .with_context(|| format!("Failed to create {}", store.store_dir.display()))?;
        fs::create_dir_all(&store.original_files_dir)
            .with_context(|| format!("Failed to create {}", store.original_files_dir.display()))?;
        Ok(store)
    }

    pub fn from_config(config: &crate::Config) -> Result<Self> {
        Self::open(config.pending_changes_dir(), config.backups_dir())
    }

    /// Record path for `change_id`, or `None` when the id is not a UUID
    fn record_path(&self, change_id: &str) -> Option<PathBuf> {
        let id = Uuid::parse_str(change_id).ok()?;
        Some(self.store_dir.join(format!("{id}.json")))
    }

    fn backup_dir(&self, change_id: &str) -> Option<PathBuf> {
        let id = Uuid::parse_str(change_id).ok()?;
        Some(self.original_files_dir.join(id.to_string()))
    }

    pub fn save(&self, record: &ChangeRecord) -> Result<()> {
        let path = self
            .record_path(&record.change_id)
            .with_context(|| format!("Invalid change id {}", record.change_id))?;

        if let Ok(Some(existing)) = self.get(&record.change_id) {
            if existing.repo_path != record.repo_path {
                warn!(
                    "Change {} previously targeted {}; overwriting with {}",
                    record.change_id,
                    existing.repo_path.display(),
                    record.repo_path.display()
                );
            }
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("💾 Saved pending change {}", record.change_id);
        Ok(())
    }

    pub fn get(&self, change_id: &str) -> Result<Option<ChangeRecord>> {
        let Some(path) = self.record_path(change_id) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt change record {}", path.display()))?;
        Ok(Some(record))
    }

    /// All stored records, oldest first; unreadable records are skipped
    pub fn list(&self) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.store_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(change_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(change_id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping change record {}: {:#}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Copy every file of `repo_path` (minus `exclude_dirs`) into the backup
    /// directory of `change_id`, replacing any earlier backup for that id.
    pub fn backup_original_files(
        &self,
        change_id: &str,
        repo_path: &Path,
        exclude_dirs: &[String],
    ) -> Result<Vec<String>> {
        let backup_dir = self
            .backup_dir(change_id)
            .with_context(|| format!("Invalid change id {change_id}"))?;
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir)
                .with_context(|| format!("Failed to clear {}", backup_dir.display()))?;
        }
        fs::create_dir_all(&backup_dir)?;

        let excluded: Vec<PathBuf> = exclude_dirs.iter().map(|d| repo_path.join(d)).collect();
        let walker = WalkDir::new(repo_path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !excluded.iter().any(|x| e.path().starts_with(x)));

        let mut backed_up = Vec::new();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_path(repo_path, entry.path());
            let dest = backup_dir.join(&rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("Failed to back up {}", entry.path().display()))?;
            backed_up.push(rel);
        }

        info!("📦 Backed up {} files for change {}", backed_up.len(), change_id);
        Ok(backed_up)
    }

    /// Content of `file_path` as it was before the change, if it was backed up
    pub fn original_file_content(&self, change_id: &str, file_path: &str) -> Option<String> {
        let backup_dir = self.backup_dir(change_id)?;
        let path = crate::executor::resolve_in_repo(&backup_dir, file_path).ok()?;
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                debug!("No backup for {} in change {}: {}", file_path, change_id, e);
                None
            }
        }
    }
}
