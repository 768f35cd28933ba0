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

//! Progress mapping and workflow events
//!
//! The orchestrator emits typed events over a channel; rendering them is the
//! caller's job. Each active step owns a percent range and remote job
//! progress is scaled into it, so overall progress is monotone within a step
//! and pins to the step's upper bound when the step succeeds.

use crate::state::WorkflowStep;
use serde::Serialize;

/// Pre-reboot share of the firmware progress budget; the reboot monitor
/// takes the rest.
const FIRMWARE_PRE_REBOOT_BUDGET: u8 = 90;

/// Percent ranges for the steps actually present in a workflow. Steps whose
/// artifact is already downloaded are absent and the budget re-splits across
/// the remaining ones.
#[derive(Debug, Clone)]
pub struct StepPlan {
    ranges: Vec<(WorkflowStep, u8, u8)>,
}

impl StepPlan {
    /// Firmware plan: the 0..=90 pre-reboot budget is split evenly across
    /// the present download/install sub-steps, reboot monitoring takes
    /// 90..=100.
    pub fn firmware(download_base: bool, download_target: bool) -> Self {
        let mut job_steps = Vec::new();
        if download_base {
            job_steps.push(WorkflowStep::DownloadingBase);
        }
        if download_target {
            job_steps.push(WorkflowStep::DownloadingTarget);
        }
        job_steps.push(WorkflowStep::Installing);

        let mut ranges = split_budget(&job_steps, 0, FIRMWARE_PRE_REBOOT_BUDGET);
        ranges.push((WorkflowStep::Rebooting, FIRMWARE_PRE_REBOOT_BUDGET, FIRMWARE_PRE_REBOOT_BUDGET));
        ranges.push((WorkflowStep::MonitoringReboot, FIRMWARE_PRE_REBOOT_BUDGET, 100));
        Self { ranges }
    }

    /// Content plan: no reboot, so the job steps share the whole budget
    pub fn content(download: bool) -> Self {
        let mut job_steps = Vec::new();
        if download {
            job_steps.push(WorkflowStep::Downloading);
        }
        job_steps.push(WorkflowStep::Installing);
        Self {
            ranges: split_budget(&job_steps, 0, 100),
        }
    }

    pub fn range(&self, step: WorkflowStep) -> Option<(u8, u8)> {
        self.ranges
            .iter()
            .find(|(s, _, _)| *s == step)
            .map(|(_, lo, hi)| (*lo, *hi))
    }

    /// Scale a remote job's 0..=100 progress into `step`'s range. Unknown
    /// steps map to their own raw progress rather than panicking.
    pub fn scale(&self, step: WorkflowStep, job_percent: u8) -> u8 {
        let Some((lo, hi)) = self.range(step) else {
            return job_percent.min(100);
        };
        let span = u32::from(hi - lo);
        let part = span * u32::from(job_percent.min(100)) / 100;
        lo + part as u8
    }

    /// Upper bound of `step`, reported when the step resolves successfully
    pub fn upper_bound(&self, step: WorkflowStep) -> u8 {
        self.range(step).map(|(_, hi)| hi).unwrap_or(100)
    }
}

fn split_budget(steps: &[WorkflowStep], lo: u8, hi: u8) -> Vec<(WorkflowStep, u8, u8)> {
    let n = steps.len() as u32;
    let span = u32::from(hi - lo);
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let i = i as u32;
            let a = lo + (span * i / n) as u8;
            let b = lo + (span * (i + 1) / n) as u8;
            (*step, a, b)
        })
        .collect()
}

/// Events emitted while a workflow runs. Presentation-agnostic by design.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WorkflowEvent {
    StepStarted {
        step: WorkflowStep,
    },
    Progress {
        step: WorkflowStep,
        /// Overall workflow percent, already scaled through the step plan
        percent: u8,
    },
    StepCompleted {
        step: WorkflowStep,
    },
    Completed,
    /// The liveness ceiling was exhausted after a reboot; the install itself
    /// succeeded, the device just has not confirmed coming back yet
    RebootUnconfirmed,
    Failed {
        step: WorkflowStep,
        reason: String,
    },
    Cancelled,
}
