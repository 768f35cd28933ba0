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

//! Base-image dependency resolution
//!
//! Crossing a `major.minor` release line requires the line's base image to be
//! installed before the target patch/hotfix. This module is the pure decision
//! function; it submits nothing and is safe to call repeatedly.

use crate::device::VersionDescriptor;
use crate::error::{Result, UpgradeError};
use crate::version::FirmwareVersion;
use tracing::debug;

/// A base image that must be handled before the target version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImageRequirement {
    pub version: String,
    /// Already present on the device; the download step can be skipped
    pub downloaded: bool,
    pub size_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImageDecision {
    /// Current and target share a minor line; no base image needed
    NotRequired,
    Required(BaseImageRequirement),
    /// One of the version strings is not an X.Y.Z triple; the resolver
    /// refuses to guess rather than picking a base image blindly
    NotApplicable,
}

/// Decide whether upgrading `current` -> `target` needs an intermediate base
/// image, and which one.
///
/// Rules:
/// - hotfix suffixes are ignored when comparing release lines
/// - a hotfix target requires exactly its stripped triple as base
/// - otherwise the base is the lowest-patch release of the target's line;
///   a target that is itself that release needs no extra image
pub fn resolve_base_image(
    current: &str,
    target: &str,
    catalog: &[VersionDescriptor],
) -> Result<BaseImageDecision> {
    let (current, target) = match (
        FirmwareVersion::parse(current),
        FirmwareVersion::parse(target),
    ) {
        (Ok(c), Ok(t)) => (c, t),
        _ => {
            debug!("unparseable version pair ({current}, {target}), base image not applicable");
            return Ok(BaseImageDecision::NotApplicable);
        }
    };

    if current.same_minor_line(&target) {
        return Ok(BaseImageDecision::NotRequired);
    }

    let base = if target.is_hotfix() {
        // Hotfixes layer on one specific patch release, nothing else will do
        find_exact(catalog, &target.base())
    } else {
        lowest_patch_of_line(catalog, &target)
    };

    match base {
        Some(entry) => {
            // A base image precedes a *later* patch/hotfix of its line; when
            // the target is itself the line's base there is nothing extra to
            // stage.
            if FirmwareVersion::parse(&entry.version).ok().as_ref() == Some(&target) {
                debug!("target {target} is its own line base, no extra image needed");
                return Ok(BaseImageDecision::NotRequired);
            }
            debug!(
                "upgrade {current} -> {target} requires base image {}",
                entry.version
            );
            Ok(BaseImageDecision::Required(BaseImageRequirement {
                version: entry.version.clone(),
                downloaded: entry.downloaded,
                size_mb: entry.size_mb,
            }))
        }
        None => Err(UpgradeError::DependencyUnresolved {
            target: target.to_string(),
            missing_base: if target.is_hotfix() {
                target.base().to_string()
            } else {
                format!("{}.{}.x", target.major, target.minor)
            },
        }),
    }
}

fn find_exact<'a>(
    catalog: &'a [VersionDescriptor],
    wanted: &FirmwareVersion,
) -> Option<&'a VersionDescriptor> {
    catalog.iter().find(|entry| {
        FirmwareVersion::parse(&entry.version)
            .map(|v| v == *wanted)
            .unwrap_or(false)
    })
}

/// First (lowest-patch, non-hotfix) release of the target's minor line
fn lowest_patch_of_line<'a>(
    catalog: &'a [VersionDescriptor],
    target: &FirmwareVersion,
) -> Option<&'a VersionDescriptor> {
    catalog
        .iter()
        .filter_map(|entry| {
            FirmwareVersion::parse(&entry.version)
                .ok()
                .filter(|v| !v.is_hotfix() && v.same_minor_line(target))
                .map(|v| (v, entry))
        })
        .min_by_key(|(v, _)| v.patch)
        .map(|(_, entry)| entry)
}
