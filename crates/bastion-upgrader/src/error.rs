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

//! Error types for the upgrader crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("state persistence error: {0}")]
    State(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("version parse error: {0}")]
    VersionParse(String),

    #[error("base image {missing_base} required for {target} is not in the device catalog")]
    DependencyUnresolved { target: String, missing_base: String },

    #[error("device did not offer version {0}")]
    UnknownVersion(String),

    #[error("device request failed: {0}")]
    Device(String),

    #[error("job submission rejected: {0}")]
    Submission(String),

    #[error("workflow {workflow_id} is already in progress for this device")]
    WorkflowInProgress { workflow_id: String },
}

pub type Result<T> = std::result::Result<T, UpgradeError>;
