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

//! Bastion Upgrader - CLI entry point
//!
//! Thin presentation layer over the orchestration engine: parses a command,
//! wires the HTTP device client and file state store together, and renders
//! workflow events as log lines. All workflow logic lives in the library.

use anyhow::Context;
use bastion_upgrader::client::HttpDeviceClient;
use bastion_upgrader::config::load_config;
use bastion_upgrader::device::DeviceApi;
use bastion_upgrader::orchestrator::{CancelHandle, Orchestrator, WorkflowOutcome};
use bastion_upgrader::progress::WorkflowEvent;
use bastion_upgrader::state::FileStateStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "bastion-upgrader", about = "Firewall upgrade orchestration")]
struct Cli {
    /// Path to the engine config file
    #[arg(long, default_value = "/data/bastion/engine_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show available firmware versions and the current content status
    Check,
    /// Upgrade firmware to the given version (downloads, installs, reboots)
    Upgrade {
        #[arg(long)]
        target: String,
    },
    /// Download and install the latest content signatures (no reboot)
    ContentUpdate,
    /// Resume an interrupted workflow, if one is persisted
    Resume,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bastion_upgrader=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).context("failed to load config")?;
    info!("loaded config for device {}", config.device_url);

    let device = Arc::new(HttpDeviceClient::new(
        &config.device_url,
        config.api_key.clone(),
        config.verify_tls,
    )?);
    let store = Arc::new(FileStateStore::with_staleness(
        config.state_dir.clone(),
        config.state_staleness(),
    ));
    let device_id = config
        .device_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .to_owned();

    match cli.command {
        Command::Check => {
            let versions = device.check_versions().await?;
            info!(
                "current firmware: {}, latest: {}",
                versions.current,
                versions.latest.as_deref().unwrap_or("unknown")
            );
            for v in &versions.versions {
                info!(
                    "  {} (downloaded: {}, latest: {})",
                    v.version, v.downloaded, v.latest
                );
            }
            let content = device.check_content().await?;
            info!(
                "content: current {}, latest {}, update needed: {}",
                content.current.as_deref().unwrap_or("unknown"),
                content.latest.as_deref().unwrap_or("unknown"),
                content.needs_update
            );
            Ok(())
        }
        Command::Upgrade { target } => {
            let (orchestrator, events, handle) =
                Orchestrator::new(device, store, device_id, &config);
            cancel_on_ctrl_c(handle);
            let renderer = tokio::spawn(render_events(events));
            let outcome = orchestrator.start_firmware_upgrade(&target).await;
            // Dropping the orchestrator closes the event channel
            drop(orchestrator);
            renderer.await.ok();
            report(outcome?)
        }
        Command::ContentUpdate => {
            let (orchestrator, events, handle) =
                Orchestrator::new(device, store, device_id, &config);
            cancel_on_ctrl_c(handle);
            let renderer = tokio::spawn(render_events(events));
            let outcome = orchestrator.start_content_update().await;
            drop(orchestrator);
            renderer.await.ok();
            report(outcome?)
        }
        Command::Resume => {
            let (orchestrator, events, handle) =
                Orchestrator::new(device, store, device_id, &config);
            cancel_on_ctrl_c(handle);
            let renderer = tokio::spawn(render_events(events));
            let outcome = orchestrator.resume().await;
            drop(orchestrator);
            renderer.await.ok();
            match outcome? {
                Some(outcome) => report(outcome),
                None => {
                    info!("no workflow to resume");
                    Ok(())
                }
            }
        }
    }
}

/// Route an operator interrupt through the normal cancellation path so the
/// workflow clears its checkpoint instead of dying mid-write.
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling workflow");
            handle.cancel();
        }
    });
}

async fn render_events(mut events: UnboundedReceiver<WorkflowEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            WorkflowEvent::StepStarted { step } => info!("step started: {step:?}"),
            WorkflowEvent::Progress { step, percent } => info!("{step:?}: {percent}%"),
            WorkflowEvent::StepCompleted { step } => info!("step completed: {step:?}"),
            WorkflowEvent::Completed => info!("workflow complete"),
            WorkflowEvent::RebootUnconfirmed => {
                warn!("reboot is taking unusually long; check the device manually")
            }
            WorkflowEvent::Failed { step, reason } => error!("failed at {step:?}: {reason}"),
            WorkflowEvent::Cancelled => warn!("workflow cancelled"),
        }
    }
}

fn report(outcome: WorkflowOutcome) -> anyhow::Result<()> {
    match outcome {
        WorkflowOutcome::Complete => Ok(()),
        WorkflowOutcome::RebootUnconfirmed => {
            // Install succeeded; exit cleanly but loudly
            warn!("upgrade applied, device has not confirmed coming back yet");
            Ok(())
        }
        WorkflowOutcome::Failed { step, reason } => {
            anyhow::bail!("workflow failed at {step:?}: {reason}")
        }
        WorkflowOutcome::Cancelled => anyhow::bail!("workflow cancelled"),
    }
}
