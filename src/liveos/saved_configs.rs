//! Configuration carried on LiveOS media between customization runs.
//!
//! Some settings only ever land in the ISO grub.cfg (extra kernel
//! arguments, PXE URLs) or describe a rootfs that a later run will not
//! expand (dracut version). They are written to
//! `azl-image-customizer/saved-configs.yaml` on the media and merged back
//! in when that media is customized again.
//!
//! ```rust,ignore
//! use image_customizer::liveos::saved_configs::{update_saved_configs, SavedConfigsUpdate};
//!
//! let merged = update_saved_configs(&log, &store.files.saved_configs_file_path, update)?;
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use std::fs;
use std::path::Path;

use super::package_info::PackageVersionInformation;
use crate::config::{validate_bootstrap_urls, KdumpBootFilesType, KernelCommandLine, SELinuxMode};
use crate::error::CustomizerError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveOsSavedConfigs {
    #[serde(default)]
    pub kernel_command_line: KernelCommandLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdump_boot_files: Option<KdumpBootFilesType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PxeSavedConfigs {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap_base_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap_file_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsSavedConfigs {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dracut_package: Option<PackageVersionInformation>,
    #[serde(default)]
    pub selinux_requested_mode: SELinuxMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux_policy_package: Option<PackageVersionInformation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedConfigs {
    #[serde(default)]
    pub liveos: LiveOsSavedConfigs,
    #[serde(default)]
    pub pxe: PxeSavedConfigs,
    #[serde(default)]
    pub os: OsSavedConfigs,
}

impl SavedConfigs {
    pub fn validate(&self) -> Result<()> {
        for arg in &self.liveos.kernel_command_line.extra_command_line {
            if arg.contains('\n') {
                return Err(CustomizerError::invalid_config(format!(
                    "invalid kernelCommandLine: argument ({:?}) contains a newline",
                    arg
                ))
                .into());
            }
        }
        validate_bootstrap_urls(&self.pxe.bootstrap_base_url, &self.pxe.bootstrap_file_url)
            .context("invalid 'pxe' field")?;
        Ok(())
    }

    /// Load and validate `path`. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CustomizerError::io("failed to read saved configs file")
                    .with_path(path)
                    .with_source(e)
                    .into())
            }
        };
        let saved: SavedConfigs = serde_yaml::from_str(&text).map_err(|e| {
            CustomizerError::structural("failed to parse saved configs file")
                .with_path(path)
                .with_source(e)
        })?;
        saved
            .validate()
            .with_context(|| format!("invalid saved configs file {}", path.display()))?;
        Ok(Some(saved))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory for {}", path.display()))?;
        }
        let text = serde_yaml::to_string(self).context("failed to serialize saved configs")?;
        fs::write(path, text)
            .with_context(|| format!("failed to persist saved configs file to {}", path.display()))?;
        Ok(())
    }
}

/// Values produced by the current run. `None`/empty means "not set here".
#[derive(Debug, Clone, Default)]
pub struct SavedConfigsUpdate {
    pub kernel_command_line: KernelCommandLine,
    pub bootstrap_base_url: String,
    pub bootstrap_file_url: String,
    pub kernel_version: String,
    pub dracut_package: Option<PackageVersionInformation>,
    pub requested_selinux_mode: SELinuxMode,
    pub selinux_policy_package: Option<PackageVersionInformation>,
    pub kdump_boot_files: Option<KdumpBootFilesType>,
}

/// Combine this run's values with the saved ones.
pub fn merge_saved_configs(saved: Option<&SavedConfigs>, update: SavedConfigsUpdate) -> SavedConfigs {
    let mut out = SavedConfigs {
        liveos: LiveOsSavedConfigs {
            kernel_command_line: update.kernel_command_line.clone(),
            kdump_boot_files: update.kdump_boot_files,
        },
        pxe: PxeSavedConfigs {
            bootstrap_base_url: update.bootstrap_base_url.clone(),
            bootstrap_file_url: update.bootstrap_file_url.clone(),
        },
        os: OsSavedConfigs {
            kernel_version: update.kernel_version.clone(),
            dracut_package: update.dracut_package.clone(),
            selinux_requested_mode: update.requested_selinux_mode,
            selinux_policy_package: update.selinux_policy_package.clone(),
        },
    };

    let Some(saved) = saved else {
        return out;
    };

    let saved_args = &saved.liveos.kernel_command_line.extra_command_line;
    if !saved_args.is_empty() {
        let mut combined = saved_args.clone();
        combined.extend(update.kernel_command_line.extra_command_line.iter().cloned());
        out.liveos.kernel_command_line.extra_command_line = combined;
    }

    if update.bootstrap_base_url.is_empty() {
        out.pxe.bootstrap_base_url = saved.pxe.bootstrap_base_url.clone();
    }
    if update.bootstrap_file_url.is_empty() {
        out.pxe.bootstrap_file_url = saved.pxe.bootstrap_file_url.clone();
    }
    // The two URLs are exclusive; the one set in this run wins.
    if !update.bootstrap_base_url.is_empty() {
        out.pxe.bootstrap_file_url.clear();
    }
    if !update.bootstrap_file_url.is_empty() {
        out.pxe.bootstrap_base_url.clear();
    }

    if update.kernel_version.is_empty() {
        out.os.kernel_version = saved.os.kernel_version.clone();
    }
    if update.dracut_package.is_none() {
        out.os.dracut_package = saved.os.dracut_package.clone();
    }
    if update.requested_selinux_mode == SELinuxMode::Default {
        out.os.selinux_requested_mode = saved.os.selinux_requested_mode;
    }
    if update.selinux_policy_package.is_none() {
        out.os.selinux_policy_package = saved.os.selinux_policy_package.clone();
    }
    if update.kdump_boot_files.is_none() {
        out.liveos.kdump_boot_files = saved.liveos.kdump_boot_files;
    }

    out
}

/// Merge `update` into the saved configs at `path` and write them back.
pub fn update_saved_configs(
    log: &Logger,
    path: &Path,
    update: SavedConfigsUpdate,
) -> Result<SavedConfigs> {
    info!(log, "updating saved configurations"; "path" => %path.display());

    let saved = SavedConfigs::load(path)
        .with_context(|| format!("failed to load saved configurations {}", path.display()))?;
    let merged = merge_saved_configs(saved.as_ref(), update);
    merged.validate()?;
    merged.persist(path).context("failed to save iso configs")?;
    Ok(merged)
}
