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

//! Remote job polling
//!
//! Submits nothing itself: given a job id, polls the device on a fixed
//! interval until the job is terminal, the attempt ceiling is hit, or the
//! workflow is cancelled. Transient fetch errors are expected (the device
//! gets busy) and consume an attempt instead of failing the job.

use crate::device::{DeviceApi, JobResult, JobStatus};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Terminal outcome of polling one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success(SuccessDetail),
    Failure { reason: String },
    /// No terminal status within `max_attempts` polls
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessDetail {
    pub job_id: String,
    pub details: Option<String>,
}

/// How a terminal job status reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Failure(String),
}

/// Classify a terminal job status.
///
/// Deliberately permissive: devices in the field finish jobs with result
/// `OK`, `PEND`, an unrecognized word, or no result at all, and still mean
/// success. Only an explicit `FAIL`, or an absent result whose details read
/// like a failure, counts as failure. Tightening this to `OK`-only is a
/// known candidate change; see the narrow-vs-wide tests below before doing
/// it.
pub fn classify(status: &JobStatus) -> Classification {
    let details = status.details.as_deref().unwrap_or("");
    let details_lower = details.to_ascii_lowercase();

    match status.result {
        JobResult::Fail => Classification::Failure(if details.is_empty() {
            "job reported FAIL".into()
        } else {
            details.into()
        }),
        JobResult::Ok | JobResult::Pending | JobResult::Unknown => Classification::Success,
        JobResult::Absent => {
            if details_lower.contains("success") || details_lower.contains("complete") {
                Classification::Success
            } else if details_lower.contains("fail") || details_lower.contains("error") {
                Classification::Failure(details.into())
            } else {
                // Finished without saying anything either way
                Classification::Success
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobPoller {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl JobPoller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Poll `job_id` until terminal, ceiling, or cancel. Raw job progress is
    /// fed through `on_progress` on every successful fetch.
    pub async fn poll(
        &self,
        device: &dyn DeviceApi,
        job_id: &str,
        mut on_progress: impl FnMut(u8) + Send,
        cancel: &watch::Receiver<bool>,
    ) -> JobOutcome {
        for attempt in 1..=self.max_attempts {
            let mut cancel_rx = cancel.clone();
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = cancelled(&mut cancel_rx) => {
                    debug!("poll of job {job_id} cancelled at attempt {attempt}");
                    return JobOutcome::Cancelled;
                }
            }

            let status = match device.job_status(job_id).await {
                Ok(status) => status,
                Err(e) => {
                    // Busy or briefly unreachable; keep polling
                    warn!("job {job_id} status fetch failed (attempt {attempt}): {e}");
                    continue;
                }
            };

            debug!(
                "job {job_id} attempt {attempt}: state {:?}, progress {}%, result {:?}",
                status.state, status.progress, status.result
            );
            on_progress(status.progress);

            if status.is_terminal() {
                return match classify(&status) {
                    Classification::Success => JobOutcome::Success(SuccessDetail {
                        job_id: job_id.into(),
                        details: status.details,
                    }),
                    Classification::Failure(reason) => JobOutcome::Failure { reason },
                };
            }
        }

        warn!(
            "job {job_id} still not terminal after {} polls",
            self.max_attempts
        );
        JobOutcome::Timeout
    }
}

/// Resolves once the cancel flag flips to true; pends forever if the sender
/// side is gone (an orphaned receiver must not look cancelled).
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
