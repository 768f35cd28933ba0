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

//! Workflow orchestration
//!
//! One [`Orchestrator`] instance drives one workflow against one device:
//! resolve prerequisites, submit remote jobs, poll each to a terminal
//! outcome, optionally reboot and wait for the device to come back. State is
//! checkpointed after every transition so a restarted process can resume
//! where it left off. There is deliberately no rollback: a downloaded image
//! left behind by a failed run is a valid precondition for the next attempt.

use crate::config::EngineConfig;
use crate::device::{DeviceApi, JobHandle};
use crate::error::{Result, UpgradeError};
use crate::liveness::{LivenessOutcome, LivenessProbe};
use crate::poller::{JobOutcome, JobPoller};
use crate::progress::{StepPlan, WorkflowEvent};
use crate::resolver::{BaseImageDecision, resolve_base_image};
use crate::state::{StateStore, WorkflowKind, WorkflowState, WorkflowStep};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Terminal outcome of a workflow run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Complete,
    /// Firmware install succeeded but the device never confirmed coming
    /// back from its reboot within the probe ceiling
    RebootUnconfirmed,
    Failed { step: WorkflowStep, reason: String },
    Cancelled,
}

/// Signals a running workflow to stop after the current poll tick.
///
/// Cancelling clears local state only; an already-submitted remote job keeps
/// running on the device, there is no remote cancel primitive.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

enum JobRequest<'a> {
    Download(&'a str),
    Install(&'a str),
    DownloadContent,
    InstallContent,
}

pub struct Orchestrator {
    device: Arc<dyn DeviceApi>,
    store: Arc<dyn StateStore>,
    device_id: String,
    poller: JobPoller,
    probe: LivenessProbe,
    events: mpsc::UnboundedSender<WorkflowEvent>,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Returns the orchestrator together with its event stream and cancel
    /// handle. One instance per workflow; drop it when the workflow ends.
    pub fn new(
        device: Arc<dyn DeviceApi>,
        store: Arc<dyn StateStore>,
        device_id: impl Into<String>,
        config: &EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>, CancelHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let orchestrator = Self {
            device,
            store,
            device_id: device_id.into(),
            poller: JobPoller::new(config.poll_interval(), config.poll_max_attempts),
            probe: LivenessProbe::new(
                config.reboot_grace(),
                config.probe_interval(),
                config.probe_max_attempts,
            ),
            events: events_tx,
            cancel: cancel_rx,
        };
        (orchestrator, events_rx, CancelHandle { tx: cancel_tx })
    }

    /// Upgrade the device firmware to `target`, rebooting afterwards.
    pub async fn start_firmware_upgrade(&self, target: &str) -> Result<WorkflowOutcome> {
        self.ensure_idle()?;

        let mut state = WorkflowState::new(WorkflowKind::Firmware, target);
        state.advance(WorkflowStep::ResolvingDependency);
        self.store.save(&self.device_id, &state)?;
        info!(
            "starting firmware upgrade workflow {} to {target}",
            state.workflow_id
        );

        let result = self.run_firmware(&mut state).await;
        if let Err(ref e) = result {
            self.abandon(&state, e);
        }
        result
    }

    /// Update content signatures; no reboot involved.
    pub async fn start_content_update(&self) -> Result<WorkflowOutcome> {
        self.ensure_idle()?;

        // Content has no dependency step; the record stays at Idle until the
        // first job goes out
        let mut state = WorkflowState::new(WorkflowKind::Content, "latest");
        self.store.save(&self.device_id, &state)?;
        info!("starting content update workflow {}", state.workflow_id);

        let result = self.run_content(&mut state).await;
        if let Err(ref e) = result {
            self.abandon(&state, e);
        }
        result
    }

    /// Continue a previously persisted workflow, if a non-stale one exists.
    /// A workflow interrupted mid-poll re-queries its active job and keeps
    /// polling; it never resubmits.
    pub async fn resume(&self) -> Result<Option<WorkflowOutcome>> {
        let Some(mut state) = self.store.load(&self.device_id)? else {
            return Ok(None);
        };
        info!(
            "resuming {:?} workflow {} at step {:?}",
            state.kind, state.workflow_id, state.step
        );

        let result = match state.kind {
            WorkflowKind::Firmware => self.run_firmware(&mut state).await,
            WorkflowKind::Content => self.run_content(&mut state).await,
        };
        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                self.abandon(&state, &e);
                Err(e)
            }
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if let Some(existing) = self.store.load(&self.device_id)? {
            return Err(UpgradeError::WorkflowInProgress {
                workflow_id: existing.workflow_id,
            });
        }
        Ok(())
    }

    /// Clear persisted state for a workflow that died on an error, so the
    /// dead record does not block the next start until it goes stale.
    fn abandon(&self, state: &WorkflowState, e: &UpgradeError) {
        let _ = self.store.clear(&self.device_id);
        self.emit(WorkflowEvent::Failed {
            step: state.step,
            reason: e.to_string(),
        });
    }

    async fn run_firmware(&self, state: &mut WorkflowState) -> Result<WorkflowOutcome> {
        // Resumed past the install already: nothing left but the reboot wait
        if state.step >= WorkflowStep::Rebooting {
            let plan = StepPlan::firmware(false, false);
            return self.reboot_and_monitor(state, &plan).await;
        }

        // Always re-check the device; a catalog snapshot from before a crash
        // or an earlier partial run may have stale `downloaded` flags
        let target = state.target_version.clone();
        let check = self.device.check_versions().await?;
        let target_desc = check
            .descriptor(&target)
            .ok_or_else(|| UpgradeError::UnknownVersion(target.clone()))?
            .clone();

        let base = match resolve_base_image(&check.current, &target, &check.versions)? {
            BaseImageDecision::Required(req) => Some(req),
            BaseImageDecision::NotRequired => None,
            BaseImageDecision::NotApplicable => {
                warn!(
                    "cannot reason about base image for {} -> {target}, proceeding without one",
                    check.current
                );
                None
            }
        };
        if let Some(ref req) = base {
            state.base_image = Some(req.version.clone());
        }

        let need_base_download = base.as_ref().is_some_and(|b| !b.downloaded);
        let need_target_download = !target_desc.downloaded;
        let plan = StepPlan::firmware(need_base_download, need_target_download);

        if need_base_download && state.step <= WorkflowStep::DownloadingBase {
            let version = base.as_ref().map(|b| b.version.clone()).unwrap_or_default();
            if let Some(outcome) = self
                .run_job_step(
                    state,
                    WorkflowStep::DownloadingBase,
                    JobRequest::Download(&version),
                    &plan,
                )
                .await?
            {
                return Ok(outcome);
            }
        }

        if need_target_download && state.step <= WorkflowStep::DownloadingTarget {
            if let Some(outcome) = self
                .run_job_step(
                    state,
                    WorkflowStep::DownloadingTarget,
                    JobRequest::Download(&target),
                    &plan,
                )
                .await?
            {
                return Ok(outcome);
            }
        }

        if state.step <= WorkflowStep::Installing {
            if let Some(outcome) = self
                .run_job_step(
                    state,
                    WorkflowStep::Installing,
                    JobRequest::Install(&target),
                    &plan,
                )
                .await?
            {
                return Ok(outcome);
            }
        }

        self.reboot_and_monitor(state, &plan).await
    }

    async fn run_content(&self, state: &mut WorkflowState) -> Result<WorkflowOutcome> {
        let check = self.device.check_content().await?;

        if state.step == WorkflowStep::Idle && !check.needs_update {
            info!("content already up to date, nothing to do");
            let _ = self.store.clear(&self.device_id);
            self.emit(WorkflowEvent::Completed);
            return Ok(WorkflowOutcome::Complete);
        }
        if let Some(latest) = check.latest.clone() {
            state.target_version = latest;
        }

        let plan = StepPlan::content(!check.downloaded);

        if !check.downloaded && state.step <= WorkflowStep::Downloading {
            if let Some(outcome) = self
                .run_job_step(
                    state,
                    WorkflowStep::Downloading,
                    JobRequest::DownloadContent,
                    &plan,
                )
                .await?
            {
                return Ok(outcome);
            }
        }

        if state.step <= WorkflowStep::Installing {
            if let Some(outcome) = self
                .run_job_step(
                    state,
                    WorkflowStep::Installing,
                    JobRequest::InstallContent,
                    &plan,
                )
                .await?
            {
                return Ok(outcome);
            }
        }

        self.store.clear(&self.device_id)?;
        self.emit(WorkflowEvent::Progress {
            step: WorkflowStep::Installing,
            percent: 100,
        });
        self.emit(WorkflowEvent::Completed);
        info!("content update workflow {} complete", state.workflow_id);
        Ok(WorkflowOutcome::Complete)
    }

    /// Run one remote-job step to its terminal outcome. `Ok(None)` means the
    /// step succeeded and the workflow continues; `Ok(Some(..))` is a
    /// terminal workflow outcome reached inside this step.
    async fn run_job_step(
        &self,
        state: &mut WorkflowState,
        step: WorkflowStep,
        request: JobRequest<'_>,
        plan: &StepPlan,
    ) -> Result<Option<WorkflowOutcome>> {
        let job_id = match (state.step == step, state.active_job_id.clone()) {
            // Resumed mid-poll: pick the job up where the device has it
            (true, Some(job_id)) => {
                info!("resuming poll of job {job_id} for step {step:?}");
                job_id
            }
            _ => {
                state.advance(step);
                self.store.save(&self.device_id, state)?;
                let JobHandle { job_id } = self.submit(&request).await?;
                state.set_active_job(&job_id);
                self.store.save(&self.device_id, state)?;
                job_id
            }
        };
        self.emit(WorkflowEvent::StepStarted { step });

        let events = self.events.clone();
        let outcome = self
            .poller
            .poll(
                self.device.as_ref(),
                &job_id,
                |job_percent| {
                    let _ = events.send(WorkflowEvent::Progress {
                        step,
                        percent: plan.scale(step, job_percent),
                    });
                },
                &self.cancel,
            )
            .await;

        match outcome {
            JobOutcome::Success(_) => {
                self.emit(WorkflowEvent::Progress {
                    step,
                    percent: plan.upper_bound(step),
                });
                self.emit(WorkflowEvent::StepCompleted { step });
                Ok(None)
            }
            JobOutcome::Failure { reason } => Ok(Some(self.fail(step, reason))),
            JobOutcome::Timeout => Ok(Some(self.fail(
                step,
                format!(
                    "job {job_id} did not finish within {} polls",
                    self.poller.max_attempts
                ),
            ))),
            JobOutcome::Cancelled => Ok(Some(self.cancelled())),
        }
    }

    async fn reboot_and_monitor(
        &self,
        state: &mut WorkflowState,
        plan: &StepPlan,
    ) -> Result<WorkflowOutcome> {
        if state.step < WorkflowStep::Rebooting {
            state.advance(WorkflowStep::Rebooting);
            self.store.save(&self.device_id, state)?;
            self.emit(WorkflowEvent::StepStarted {
                step: WorkflowStep::Rebooting,
            });
            self.device.request_reboot().await?;
            self.emit(WorkflowEvent::StepCompleted {
                step: WorkflowStep::Rebooting,
            });
        }

        if state.step < WorkflowStep::MonitoringReboot {
            state.advance(WorkflowStep::MonitoringReboot);
            self.store.save(&self.device_id, state)?;
        }
        self.emit(WorkflowEvent::StepStarted {
            step: WorkflowStep::MonitoringReboot,
        });
        self.emit(WorkflowEvent::Progress {
            step: WorkflowStep::MonitoringReboot,
            percent: plan.scale(WorkflowStep::MonitoringReboot, 0),
        });

        match self
            .probe
            .wait_until_reachable(self.device.as_ref(), &self.cancel)
            .await
        {
            LivenessOutcome::Cancelled => Ok(self.cancelled()),
            LivenessOutcome::Done(result) if result.reachable => {
                self.store.clear(&self.device_id)?;
                self.emit(WorkflowEvent::Progress {
                    step: WorkflowStep::MonitoringReboot,
                    percent: 100,
                });
                self.emit(WorkflowEvent::StepCompleted {
                    step: WorkflowStep::MonitoringReboot,
                });
                self.emit(WorkflowEvent::Completed);
                info!("firmware upgrade workflow {} complete", state.workflow_id);
                Ok(WorkflowOutcome::Complete)
            }
            LivenessOutcome::Done(_) => {
                // Not a failure: the install landed, the device just has not
                // answered yet. Surface it distinctly.
                self.store.clear(&self.device_id)?;
                self.emit(WorkflowEvent::RebootUnconfirmed);
                warn!(
                    "workflow {}: reboot is taking unusually long, giving up on confirmation",
                    state.workflow_id
                );
                Ok(WorkflowOutcome::RebootUnconfirmed)
            }
        }
    }

    async fn submit(&self, request: &JobRequest<'_>) -> Result<JobHandle> {
        match request {
            JobRequest::Download(version) => self.device.download(version).await,
            JobRequest::Install(version) => self.device.install(version).await,
            JobRequest::DownloadContent => self.device.download_content().await,
            JobRequest::InstallContent => self.device.install_content().await,
        }
    }

    fn fail(&self, step: WorkflowStep, reason: String) -> WorkflowOutcome {
        warn!("workflow failed at {step:?}: {reason}");
        let _ = self.store.clear(&self.device_id);
        self.emit(WorkflowEvent::Failed {
            step,
            reason: reason.clone(),
        });
        WorkflowOutcome::Failed { step, reason }
    }

    fn cancelled(&self) -> WorkflowOutcome {
        info!("workflow cancelled; remote jobs keep running on the device");
        let _ = self.store.clear(&self.device_id);
        self.emit(WorkflowEvent::Cancelled);
        WorkflowOutcome::Cancelled
    }

    fn emit(&self, event: WorkflowEvent) {
        // Receiver gone just means nobody is watching
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        ContentCheck, JobResult, JobState, JobStatus, SoftwareCheck, VersionDescriptor,
    };
    use crate::state::FileStateStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    const DEVICE: &str = "fw-lab-01";

    fn descriptor(version: &str, downloaded: bool, latest: bool) -> VersionDescriptor {
        VersionDescriptor {
            version: version.into(),
            released_on: None,
            size_mb: Some(420),
            downloaded,
            uploaded: false,
            current: false,
            latest,
        }
    }

    /// Scripted device: every submitted job finishes after a fixed number of
    /// polls; the health probe fails a set number of times after a reboot.
    struct MockDevice {
        current: String,
        catalog: Vec<VersionDescriptor>,
        content: ContentCheck,
        polls_until_done: u32,
        fail_jobs: AtomicBool,
        probe_failures: AtomicU32,
        submissions: Mutex<Vec<String>>,
        jobs: Mutex<HashMap<String, u32>>,
        next_job: AtomicU32,
        rebooted: AtomicBool,
    }

    impl MockDevice {
        fn new(current: &str, catalog: Vec<VersionDescriptor>) -> Self {
            Self {
                current: current.into(),
                catalog,
                content: ContentCheck {
                    current: Some("8950-9237".into()),
                    latest: Some("8952-9251".into()),
                    downloaded: false,
                    needs_update: true,
                },
                polls_until_done: 2,
                fail_jobs: AtomicBool::new(false),
                probe_failures: AtomicU32::new(2),
                submissions: Mutex::new(Vec::new()),
                jobs: Mutex::new(HashMap::new()),
                next_job: AtomicU32::new(1),
                rebooted: AtomicBool::new(false),
            }
        }

        fn with_content(mut self, content: ContentCheck) -> Self {
            self.content = content;
            self
        }

        fn submissions(&self) -> Vec<String> {
            self.submissions.lock().unwrap().clone()
        }

        fn new_job(&self, label: String) -> JobHandle {
            let id = self.next_job.fetch_add(1, Ordering::SeqCst).to_string();
            self.submissions.lock().unwrap().push(label);
            self.jobs
                .lock()
                .unwrap()
                .insert(id.clone(), self.polls_until_done);
            JobHandle { job_id: id }
        }

        fn preload_job(&self, job_id: &str, polls: u32) {
            self.jobs.lock().unwrap().insert(job_id.into(), polls);
        }
    }

    #[async_trait]
    impl DeviceApi for MockDevice {
        async fn check_versions(&self) -> crate::error::Result<SoftwareCheck> {
            Ok(SoftwareCheck {
                current: self.current.clone(),
                latest: self.catalog.iter().find(|v| v.latest).map(|v| v.version.clone()),
                versions: self.catalog.clone(),
            })
        }

        async fn check_content(&self) -> crate::error::Result<ContentCheck> {
            Ok(self.content.clone())
        }

        async fn download(&self, version: &str) -> crate::error::Result<JobHandle> {
            Ok(self.new_job(format!("download {version}")))
        }

        async fn install(&self, version: &str) -> crate::error::Result<JobHandle> {
            Ok(self.new_job(format!("install {version}")))
        }

        async fn download_content(&self) -> crate::error::Result<JobHandle> {
            Ok(self.new_job("download-content".into()))
        }

        async fn install_content(&self) -> crate::error::Result<JobHandle> {
            Ok(self.new_job("install-content".into()))
        }

        async fn request_reboot(&self) -> crate::error::Result<()> {
            self.rebooted.store(true, Ordering::SeqCst);
            self.submissions.lock().unwrap().push("reboot".into());
            Ok(())
        }

        async fn job_status(&self, job_id: &str) -> crate::error::Result<JobStatus> {
            let mut jobs = self.jobs.lock().unwrap();
            let remaining = jobs.entry(job_id.into()).or_insert(u32::MAX);
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(JobStatus {
                    job_id: job_id.into(),
                    state: JobState::Active,
                    progress: 50,
                    result: JobResult::Absent,
                    details: None,
                });
            }
            if self.fail_jobs.load(Ordering::SeqCst) {
                Ok(JobStatus {
                    job_id: job_id.into(),
                    state: JobState::Finished,
                    progress: 100,
                    result: JobResult::Fail,
                    details: Some("image integrity check failed".into()),
                })
            } else {
                Ok(JobStatus {
                    job_id: job_id.into(),
                    state: JobState::Finished,
                    progress: 100,
                    result: JobResult::Ok,
                    details: Some("completed successfully".into()),
                })
            }
        }

        async fn health_probe(&self) -> bool {
            let before = self.probe_failures.load(Ordering::SeqCst);
            if before == 0 {
                return true;
            }
            self.probe_failures.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    struct Harness {
        device: Arc<MockDevice>,
        store: Arc<FileStateStore>,
        orchestrator: Orchestrator,
        events: UnboundedReceiver<WorkflowEvent>,
        handle: CancelHandle,
        _dir: TempDir,
    }

    fn harness(device: MockDevice) -> Harness {
        harness_with(device, EngineConfig::default())
    }

    fn harness_with(device: MockDevice, config: EngineConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let device = Arc::new(device);
        let store = Arc::new(FileStateStore::new(dir.path()));
        let (orchestrator, events, handle) =
            Orchestrator::new(device.clone(), store.clone(), DEVICE, &config);
        Harness {
            device,
            store,
            orchestrator,
            events,
            handle,
            _dir: dir,
        }
    }

    fn drain(events: &mut UnboundedReceiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    fn upgrade_catalog() -> Vec<VersionDescriptor> {
        vec![
            descriptor("10.0.5", false, false),
            descriptor("10.1.0", false, false),
            descriptor("10.1.1", false, false),
            descriptor("10.1.3", false, true),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_upgrade_full_path_with_base_image() {
        let mut h = harness(MockDevice::new("10.0.5", upgrade_catalog()));

        let outcome = h.orchestrator.start_firmware_upgrade("10.1.3").await.unwrap();

        assert_eq!(outcome, WorkflowOutcome::Complete);
        assert_eq!(
            h.device.submissions(),
            vec!["download 10.1.0", "download 10.1.3", "install 10.1.3", "reboot"]
        );
        assert!(h.store.load(DEVICE).unwrap().is_none());

        let events = drain(&mut h.events);
        assert_eq!(events.last(), Some(&WorkflowEvent::Completed));
        let final_percent = events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .next_back();
        assert_eq!(final_percent, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotone_within_each_step() {
        let mut h = harness(MockDevice::new("10.0.5", upgrade_catalog()));
        h.orchestrator.start_firmware_upgrade("10.1.3").await.unwrap();

        let mut last_per_step: HashMap<WorkflowStep, u8> = HashMap::new();
        for event in drain(&mut h.events) {
            if let WorkflowEvent::Progress { step, percent } = event {
                let last = last_per_step.entry(step).or_insert(0);
                assert!(percent >= *last, "progress regressed within {step:?}");
                *last = percent;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_downloaded_artifacts_skip_download_steps() {
        let catalog = vec![
            descriptor("10.0.5", false, false),
            descriptor("10.1.0", true, false),
            descriptor("10.1.3", true, true),
        ];
        let h = harness(MockDevice::new("10.0.5", catalog));

        let outcome = h.orchestrator.start_firmware_upgrade("10.1.3").await.unwrap();

        assert_eq!(outcome, WorkflowOutcome::Complete);
        assert_eq!(h.device.submissions(), vec!["install 10.1.3", "reboot"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_minor_line_needs_no_base_image() {
        let catalog = vec![
            descriptor("10.1.0", false, false),
            descriptor("10.1.3", false, true),
        ];
        let h = harness(MockDevice::new("10.1.0", catalog));

        let outcome = h.orchestrator.start_firmware_upgrade("10.1.3").await.unwrap();

        assert_eq!(outcome, WorkflowOutcome::Complete);
        assert_eq!(
            h.device.submissions(),
            vec!["download 10.1.3", "install 10.1.3", "reboot"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_that_is_its_own_line_base_downloads_once() {
        // 10.1.0 is both the upgrade target and the lowest patch of its
        // line; it must not be staged as base and target separately
        let catalog = vec![
            descriptor("10.0.5", false, false),
            descriptor("10.1.0", false, false),
            descriptor("10.1.3", false, true),
        ];
        let h = harness(MockDevice::new("10.0.5", catalog));

        let outcome = h.orchestrator.start_firmware_upgrade("10.1.0").await.unwrap();

        assert_eq!(outcome, WorkflowOutcome::Complete);
        assert_eq!(
            h.device.submissions(),
            vec!["download 10.1.0", "install 10.1.0", "reboot"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_workflow_is_refused() {
        let h = harness(MockDevice::new("10.0.5", upgrade_catalog()));
        let existing = WorkflowState::new(WorkflowKind::Firmware, "10.1.3");
        h.store.save(DEVICE, &existing).unwrap();

        let err = h.orchestrator.start_firmware_upgrade("10.1.3").await.unwrap_err();
        match err {
            UpgradeError::WorkflowInProgress { workflow_id } => {
                assert_eq!(workflow_id, existing.workflow_id);
            }
            other => panic!("expected WorkflowInProgress, got {other:?}"),
        }
        // Nothing was submitted to the device
        assert!(h.device.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_failure_fails_workflow_and_clears_state() {
        let device = MockDevice::new("10.0.5", upgrade_catalog());
        device.fail_jobs.store(true, Ordering::SeqCst);
        let mut h = harness(device);

        let outcome = h.orchestrator.start_firmware_upgrade("10.1.3").await.unwrap();

        match outcome {
            WorkflowOutcome::Failed { step, reason } => {
                assert_eq!(step, WorkflowStep::DownloadingBase);
                assert!(reason.contains("integrity"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(h.store.load(DEVICE).unwrap().is_none());
        assert!(!h.device.rebooted.load(Ordering::SeqCst));
        assert!(
            drain(&mut h.events)
                .iter()
                .any(|e| matches!(e, WorkflowEvent::Failed { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_base_image_submits_nothing() {
        // Catalog offers target 10.2.1 but no 10.2.x base release at all
        let catalog = vec![
            descriptor("10.0.5", false, false),
            descriptor("10.2.1-h1", false, true),
        ];
        let h = harness(MockDevice::new("10.0.5", catalog));

        let err = h.orchestrator.start_firmware_upgrade("10.2.1-h1").await.unwrap_err();
        assert!(matches!(err, UpgradeError::DependencyUnresolved { .. }));
        assert!(h.device.submissions().is_empty());
        // The aborted record does not block a later start
        assert!(h.store.load(DEVICE).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_mid_install_polls_existing_job() {
        let device = MockDevice::new("10.0.5", upgrade_catalog());
        device.preload_job("77", 2);
        let h = harness(device);

        let mut state = WorkflowState::new(WorkflowKind::Firmware, "10.1.3");
        state.advance(WorkflowStep::Installing);
        state.set_active_job("77");
        h.store.save(DEVICE, &state).unwrap();

        let outcome = h.orchestrator.resume().await.unwrap();

        assert_eq!(outcome, Some(WorkflowOutcome::Complete));
        // The install was not resubmitted; only the reboot went out
        assert_eq!(h.device.submissions(), vec!["reboot"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_with_no_state_is_none() {
        let h = harness(MockDevice::new("10.0.5", upgrade_catalog()));
        assert_eq!(h.orchestrator.resume().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_update_runs_without_reboot() {
        let mut h = harness(MockDevice::new("10.0.5", upgrade_catalog()));

        let outcome = h.orchestrator.start_content_update().await.unwrap();

        assert_eq!(outcome, WorkflowOutcome::Complete);
        assert_eq!(
            h.device.submissions(),
            vec!["download-content", "install-content"]
        );
        assert!(!h.device.rebooted.load(Ordering::SeqCst));
        assert_eq!(drain(&mut h.events).last(), Some(&WorkflowEvent::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_already_downloaded_skips_download() {
        let device = MockDevice::new("10.0.5", upgrade_catalog()).with_content(ContentCheck {
            current: Some("8950-9237".into()),
            latest: Some("8952-9251".into()),
            downloaded: true,
            needs_update: true,
        });
        let h = harness(device);

        let outcome = h.orchestrator.start_content_update().await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Complete);
        assert_eq!(h.device.submissions(), vec!["install-content"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_up_to_date_completes_immediately() {
        let device = MockDevice::new("10.0.5", upgrade_catalog()).with_content(ContentCheck {
            current: Some("8952-9251".into()),
            latest: Some("8952-9251".into()),
            downloaded: true,
            needs_update: false,
        });
        let h = harness(device);

        let outcome = h.orchestrator.start_content_update().await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Complete);
        assert!(h.device.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_checkpoints_carry_content_steps() {
        let mut device = MockDevice::new("10.0.5", upgrade_catalog());
        // Keep the first job polling so the checkpoint can be inspected
        device.polls_until_done = u32::MAX;
        let h = harness(device);
        let store = h.store.clone();
        let orchestrator = h.orchestrator;

        let task = tokio::spawn(async move { orchestrator.start_content_update().await });
        tokio::time::sleep(std::time::Duration::from_secs(40)).await;

        let state = store.load(DEVICE).unwrap().unwrap();
        assert_eq!(state.kind, WorkflowKind::Content);
        assert_eq!(state.step, WorkflowStep::Downloading);

        h.handle.cancel();
        assert_eq!(task.await.unwrap().unwrap(), WorkflowOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_unconfirmed_is_distinct_from_failure() {
        let device = MockDevice::new("10.0.5", upgrade_catalog());
        device.probe_failures.store(u32::MAX, Ordering::SeqCst);
        let mut h = harness_with(
            device,
            EngineConfig {
                probe_max_attempts: 3,
                ..Default::default()
            },
        );

        let outcome = h.orchestrator.start_firmware_upgrade("10.1.3").await.unwrap();

        assert_eq!(outcome, WorkflowOutcome::RebootUnconfirmed);
        assert!(h.store.load(DEVICE).unwrap().is_none());
        let events = drain(&mut h.events);
        assert!(events.contains(&WorkflowEvent::RebootUnconfirmed));
        assert!(!events.iter().any(|e| matches!(e, WorkflowEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_workflow_but_not_the_remote_job() {
        let mut device = MockDevice::new("10.0.5", upgrade_catalog());
        // Jobs never finish; the workflow sits in its first poll loop
        device.polls_until_done = u32::MAX;
        let h = harness(device);
        let device = h.device.clone();
        let store = h.store.clone();
        let orchestrator = h.orchestrator;

        let task =
            tokio::spawn(async move { orchestrator.start_firmware_upgrade("10.1.3").await });

        // Let the workflow submit its first download and start polling
        tokio::time::sleep(std::time::Duration::from_secs(40)).await;
        h.handle.cancel();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        assert!(store.load(DEVICE).unwrap().is_none());

        // The already-submitted job is still progressing on the device:
        // cancel is purely local, there is no remote cancel primitive
        let status = device.job_status("1").await.unwrap();
        assert_eq!(status.state, JobState::Active);
    }
}
