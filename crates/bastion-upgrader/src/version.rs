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

//! Firmware version parsing and comparison module
//!
//! Device firmware versions look like "10.2.3" or "10.2.3-h4", where the
//! `-hN` suffix marks a hotfix layered on top of a patch release.

use crate::error::{Result, UpgradeError};
use std::fmt;

/// Parsed firmware version, e.g. "12.1.3-h1"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Hotfix number from a `-hN` suffix, if present
    pub hotfix: Option<u32>,
}

impl FirmwareVersion {
    /// Parse version strings of the form "X.Y.Z" or "X.Y.Z-hN"
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (triple, hotfix) = match s.split_once('-') {
            Some((triple, suffix)) => {
                let n = suffix
                    .strip_prefix('h')
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| {
                        UpgradeError::VersionParse(format!("invalid hotfix suffix in {s}"))
                    })?;
                (triple, Some(n))
            }
            None => (s, None),
        };

        let parts: Vec<&str> = triple.split('.').collect();
        if parts.len() != 3 {
            return Err(UpgradeError::VersionParse(format!(
                "invalid version format: {s}, expected X.Y.Z"
            )));
        }

        let major = parts[0]
            .parse::<u32>()
            .map_err(|_| UpgradeError::VersionParse(format!("invalid major version: {}", parts[0])))?;
        let minor = parts[1]
            .parse::<u32>()
            .map_err(|_| UpgradeError::VersionParse(format!("invalid minor version: {}", parts[1])))?;
        let patch = parts[2]
            .parse::<u32>()
            .map_err(|_| UpgradeError::VersionParse(format!("invalid patch version: {}", parts[2])))?;

        Ok(Self {
            major,
            minor,
            patch,
            hotfix,
        })
    }

    /// Same version with any hotfix suffix stripped
    pub fn base(&self) -> Self {
        Self {
            hotfix: None,
            ..*self
        }
    }

    /// True when both versions belong to the same `major.minor` release line
    pub fn same_minor_line(&self, other: &Self) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    pub fn is_hotfix(&self) -> bool {
        self.hotfix.is_some()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(h) = self.hotfix {
            write!(f, "-h{h}")?;
        }
        Ok(())
    }
}
