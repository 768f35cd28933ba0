// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Bastion.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Workflow state persistence
//!
//! One JSON record per device, written after every step transition so a
//! restarted process can resume mid-workflow. Records older than the
//! staleness window are discarded on load rather than resumed.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default staleness window: 2 hours
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Firmware,
    Content,
}

/// Steps across both workflow kinds, declared in execution order so that
/// derived `Ord` matches workflow progression. Firmware runs
/// ResolvingDependency -> DownloadingBase -> DownloadingTarget -> Installing
/// -> Rebooting -> MonitoringReboot -> Complete; content runs Downloading ->
/// Installing -> Complete. A step is never set backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Idle,
    ResolvingDependency,
    DownloadingBase,
    DownloadingTarget,
    Downloading,
    Installing,
    Rebooting,
    MonitoringReboot,
    Complete,
    Failed,
}

impl WorkflowStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Persisted snapshot of an in-flight workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub kind: WorkflowKind,
    pub target_version: String,
    pub step: WorkflowStep,
    #[serde(default)]
    pub active_job_id: Option<String>,
    /// Base image version resolved for this workflow, if one was required
    #[serde(default)]
    pub base_image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(kind: WorkflowKind, target_version: &str) -> Self {
        let now = Utc::now();
        let prefix = match kind {
            WorkflowKind::Firmware => "fw",
            WorkflowKind::Content => "content",
        };
        Self {
            workflow_id: format!("{prefix}-{}", now.timestamp_millis()),
            kind,
            target_version: target_version.into(),
            step: WorkflowStep::Idle,
            active_job_id: None,
            base_image: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance to `step`. Steps only ever move forward; a regression is a
    /// programming error.
    pub fn advance(&mut self, step: WorkflowStep) {
        debug_assert!(step >= self.step, "workflow step moved backward");
        self.step = step;
        self.active_job_id = None;
        self.updated_at = Utc::now();
    }

    pub fn set_active_job(&mut self, job_id: &str) {
        self.active_job_id = Some(job_id.into());
        self.updated_at = Utc::now();
    }
}

/// Keyed, TTL-aware persistence for in-flight workflow state.
///
/// Each call completes or fails as a unit; a concurrent reader never sees a
/// partial write.
pub trait StateStore: Send + Sync {
    fn save(&self, device_id: &str, state: &WorkflowState) -> Result<()>;

    /// Returns `None` (and clears the record) when the stored state is stale
    /// or fails to deserialize.
    fn load(&self, device_id: &str) -> Result<Option<WorkflowState>>;

    fn clear(&self, device_id: &str) -> Result<()>;
}

/// File-backed store: one JSON file per device, atomic tmp+rename writes
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    staleness: Duration,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            staleness: DEFAULT_STALENESS,
        }
    }

    pub fn with_staleness(dir: impl Into<PathBuf>, staleness: Duration) -> Self {
        Self {
            dir: dir.into(),
            staleness,
        }
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        // Device ids are host names or addresses; keep the filename tame
        let safe: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("workflow_{safe}.json"))
    }

    fn is_stale(&self, state: &WorkflowState) -> bool {
        let age = Utc::now().signed_duration_since(state.updated_at);
        age.to_std().map(|age| age > self.staleness).unwrap_or(false)
    }
}

impl StateStore for FileStateStore {
    fn save(&self, device_id: &str, state: &WorkflowState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(device_id);
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(state)?;

        // Atomic write
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    fn load(&self, device_id: &str) -> Result<Option<WorkflowState>> {
        let path = self.path_for(device_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let state: WorkflowState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                // Corrupt state is treated as absent, never as fatal
                warn!("discarding unreadable workflow state for {device_id}: {e}");
                remove_if_exists(&path)?;
                return Ok(None);
            }
        };

        if self.is_stale(&state) {
            warn!(
                "discarding stale workflow state for {device_id} (last update {})",
                state.updated_at
            );
            remove_if_exists(&path)?;
            return Ok(None);
        }

        Ok(Some(state))
    }

    fn clear(&self, device_id: &str) -> Result<()> {
        remove_if_exists(&self.path_for(device_id))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
