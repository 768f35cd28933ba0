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

//! Device management-plane abstraction
//!
//! The orchestration engine only ever talks to the device through [`DeviceApi`].
//! The bundled HTTP implementation lives in [`crate::client`]; tests substitute
//! scripted fakes.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of the device's firmware/content version catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: String,
    #[serde(default)]
    pub released_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size_mb: Option<u64>,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default)]
    pub current: bool,
    #[serde(default)]
    pub latest: bool,
}

/// Result of a firmware version check against the device
#[derive(Debug, Clone)]
pub struct SoftwareCheck {
    pub current: String,
    pub latest: Option<String>,
    pub versions: Vec<VersionDescriptor>,
}

impl SoftwareCheck {
    pub fn descriptor(&self, version: &str) -> Option<&VersionDescriptor> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// Result of a content-signature version check
#[derive(Debug, Clone)]
pub struct ContentCheck {
    pub current: Option<String>,
    pub latest: Option<String>,
    pub downloaded: bool,
    pub needs_update: bool,
}

/// Handle for an asynchronous job submitted to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
}

/// Coarse job state as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Finished,
    Active,
    Pending,
    Unknown,
}

impl JobState {
    /// Device job tables use short uppercase codes ("FIN", "ACT", "PEND")
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIN" => Self::Finished,
            "ACT" => Self::Active,
            "PEND" => Self::Pending,
            _ => Self::Unknown,
        }
    }
}

/// Job result field; devices omit it or report non-standard values often
/// enough that `Unknown` and `Absent` are first-class states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Ok,
    Fail,
    Pending,
    Unknown,
    Absent,
}

impl JobResult {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "" => Self::Absent,
            "OK" => Self::Ok,
            "FAIL" => Self::Fail,
            "PEND" | "PENDING" => Self::Pending,
            _ => Self::Unknown,
        }
    }
}

/// Read-only projection of a remote job, fetched on every poll
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    /// 0..=100
    pub progress: u8,
    pub result: JobResult,
    pub details: Option<String>,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.state == JobState::Finished
    }
}

/// Progress fields arrive as "55", "55%" or occasionally a word like
/// "Completed"; non-numeric values count as 100 for a finished job and 0
/// otherwise.
pub fn parse_progress(raw: &str, state: JobState) -> u8 {
    match raw.trim().trim_end_matches('%').parse::<u8>() {
        Ok(p) => p.min(100),
        Err(_) => {
            if state == JobState::Finished {
                100
            } else {
                0
            }
        }
    }
}

/// Management-plane operations the engine requires from a device.
///
/// All operations target the single device the implementation is bound to.
/// `health_probe` must stay lightweight: it only answers whether the
/// management plane responds, and must not fan out to update servers.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn check_versions(&self) -> Result<SoftwareCheck>;

    async fn check_content(&self) -> Result<ContentCheck>;

    async fn download(&self, version: &str) -> Result<JobHandle>;

    async fn install(&self, version: &str) -> Result<JobHandle>;

    async fn download_content(&self) -> Result<JobHandle>;

    async fn install_content(&self) -> Result<JobHandle>;

    async fn request_reboot(&self) -> Result<()>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus>;

    async fn health_probe(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_parse() {
        assert_eq!(JobState::parse("FIN"), JobState::Finished);
        assert_eq!(JobState::parse("fin"), JobState::Finished);
        assert_eq!(JobState::parse("ACT"), JobState::Active);
        assert_eq!(JobState::parse("PEND"), JobState::Pending);
        assert_eq!(JobState::parse("???"), JobState::Unknown);
    }

    #[test]
    fn test_job_result_parse() {
        assert_eq!(JobResult::parse("OK"), JobResult::Ok);
        assert_eq!(JobResult::parse("FAIL"), JobResult::Fail);
        assert_eq!(JobResult::parse("PEND"), JobResult::Pending);
        assert_eq!(JobResult::parse(""), JobResult::Absent);
        assert_eq!(JobResult::parse("  "), JobResult::Absent);
        assert_eq!(JobResult::parse("WAT"), JobResult::Unknown);
    }

    #[test]
    fn test_parse_progress_lenient() {
        assert_eq!(parse_progress("55", JobState::Active), 55);
        assert_eq!(parse_progress("55%", JobState::Active), 55);
        assert_eq!(parse_progress("Completed", JobState::Finished), 100);
        assert_eq!(parse_progress("Completed", JobState::Active), 0);
        assert_eq!(parse_progress("", JobState::Pending), 0);
    }

    #[test]
    fn test_software_check_descriptor_lookup() {
        let check = SoftwareCheck {
            current: "10.1.0".into(),
            latest: Some("10.1.2".into()),
            versions: vec![VersionDescriptor {
                version: "10.1.2".into(),
                released_on: None,
                size_mb: Some(512),
                downloaded: false,
                uploaded: false,
                current: false,
                latest: true,
            }],
        };
        assert!(check.descriptor("10.1.2").is_some());
        assert!(check.descriptor("9.0.0").is_none());
    }
}
