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

//! Post-reboot liveness monitoring
//!
//! After a reboot is triggered the device drops off the network for minutes.
//! Failed probes are the expected steady state here, not errors; the loop
//! ends on the first successful probe or when the ceiling runs out.

use crate::device::DeviceApi;
use crate::poller::cancelled;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessResult {
    pub reachable: bool,
    pub probed_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessProbe {
    /// Delay before the first probe; probing right after triggering a reboot
    /// is meaningless, the device has not even begun shutting down
    pub grace: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessOutcome {
    Done(LivenessResult),
    Cancelled,
}

impl LivenessProbe {
    pub fn new(grace: Duration, interval: Duration, max_attempts: u32) -> Self {
        Self {
            grace,
            interval,
            max_attempts,
        }
    }

    /// Probe until the management plane responds or the ceiling is hit.
    ///
    /// `reachable: false` is not a hard failure: the device may still come
    /// back later, the caller just stops confirming it.
    pub async fn wait_until_reachable(
        &self,
        device: &dyn DeviceApi,
        cancel: &watch::Receiver<bool>,
    ) -> LivenessOutcome {
        let mut cancel_rx = cancel.clone();

        debug!("waiting {:?} before first liveness probe", self.grace);
        tokio::select! {
            _ = sleep(self.grace) => {}
            _ = cancelled(&mut cancel_rx) => return LivenessOutcome::Cancelled,
        }

        for attempt in 1..=self.max_attempts {
            if device.health_probe().await {
                info!("device reachable again after {attempt} probe(s)");
                return LivenessOutcome::Done(LivenessResult {
                    reachable: true,
                    probed_at: Utc::now(),
                    attempts: attempt,
                });
            }

            // Expected while the device reboots
            debug!("liveness probe {attempt}/{} failed", self.max_attempts);

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = sleep(self.interval) => {}
                    _ = cancelled(&mut cancel_rx) => return LivenessOutcome::Cancelled,
                }
            }
        }

        warn!(
            "device not reachable after {} probes; reboot is taking unusually long",
            self.max_attempts
        );
        LivenessOutcome::Done(LivenessResult {
            reachable: false,
            probed_at: Utc::now(),
            attempts: self.max_attempts,
        })
    }
}
