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

//! Bastion Upgrader - Upgrade orchestration engine for managed firewalls
//!
//! Drives long-running update workflows against a single remote device:
//! firmware upgrades (base-image resolution, download, install, reboot,
//! reachability monitoring) and content-signature updates (no reboot). The
//! device stays reachable only through the [`device::DeviceApi`] trait, and
//! every step transition is checkpointed so an interrupted workflow resumes
//! instead of restarting.

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod liveness;
pub mod orchestrator;
pub mod poller;
pub mod progress;
pub mod resolver;
pub mod state;
pub mod version;

pub use config::{EngineConfig, load_config, save_config};
pub use error::UpgradeError;
pub use orchestrator::{CancelHandle, Orchestrator, WorkflowOutcome};
pub use progress::WorkflowEvent;
pub use state::{WorkflowKind, WorkflowState, WorkflowStep};
pub use version::FirmwareVersion;
