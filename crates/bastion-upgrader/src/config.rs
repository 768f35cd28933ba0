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

//! Configuration module for the upgrade engine

use crate::error::{Result, UpgradeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_15() -> u64 {
    15
}

fn default_120() -> u32 {
    120
}

fn default_60() -> u32 {
    60
}

fn default_7200() -> u64 {
    7200
}

fn default_state_dir() -> String {
    "/data/bastion".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the device management API, e.g. "https://fw-lab-01"
    pub device_url: String,

    /// API key sent with every management request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Verify the device's TLS certificate. Off by default; management
    /// planes usually ship self-signed certificates.
    #[serde(default)]
    pub verify_tls: bool,

    /// Seconds between job status polls
    #[serde(default = "default_15")]
    pub poll_interval_secs: u64,

    /// Job poll ceiling (120 * 15s = 30 minutes)
    #[serde(default = "default_120")]
    pub poll_max_attempts: u32,

    /// Seconds to wait after triggering a reboot before the first probe
    #[serde(default = "default_15")]
    pub reboot_grace_secs: u64,

    /// Seconds between post-reboot liveness probes
    #[serde(default = "default_15")]
    pub probe_interval_secs: u64,

    /// Liveness probe ceiling (60 * 15s = 15 minutes)
    #[serde(default = "default_60")]
    pub probe_max_attempts: u32,

    /// Persisted workflow state older than this is discarded, not resumed
    #[serde(default = "default_7200")]
    pub state_staleness_secs: u64,

    /// Directory holding per-device workflow state files
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_url: "https://192.168.1.1".into(),
            api_key: None,
            verify_tls: false,
            poll_interval_secs: 15,
            poll_max_attempts: 120,
            reboot_grace_secs: 15,
            probe_interval_secs: 15,
            probe_max_attempts: 60,
            state_staleness_secs: 7200,
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn state_staleness(&self) -> Duration {
        Duration::from_secs(self.state_staleness_secs)
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| UpgradeError::Config(format!("failed to parse config: {e}")))
    } else {
        // Create with defaults
        let config = EngineConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &EngineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}
