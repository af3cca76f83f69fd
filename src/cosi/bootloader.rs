//! Bootloader descriptor for `metadata.json`.
//!
//! Grub images only record their type. systemd-boot images list their boot
//! entries: Boot Loader Specification entries from `/boot/loader/entries`,
//! or when there are none, standalone UKIs under `/boot/efi/EFI/Linux`.

use anyhow::{bail, Context, Result};
use slog::{debug, Logger};
use std::fs;
use std::path::Path;

use super::metadata::{
    BootloaderType, CosiBootloader, SystemDBoot, SystemDBootEntry, SystemDBootEntryType,
};
use crate::distro::DistroHandler;
use crate::error::CustomizerError;
use crate::process::Cmd;

pub const LOADER_ENTRIES_DIR: &str = "boot/loader/entries";
pub const UKI_DIR: &str = "boot/efi/EFI/Linux";
pub const KERNEL_PREFIX: &str = "vmlinuz-";

/// Kernel version from a kernel or UKI file name (`vmlinuz-6.6.47.1-1.azl3`).
pub fn kernel_version_from_name(name: &str) -> Result<String> {
    match name.strip_prefix(KERNEL_PREFIX) {
        Some(version) => Ok(version.to_string()),
        None => bail!(
            "invalid kernel name: ({}), expected to start with prefix: ({})",
            name,
            KERNEL_PREFIX
        ),
    }
}

fn basename(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

/// Parse one loader entry file. `file_name` is the entry's name in the
/// entries directory.
pub fn parse_loader_entry(file_name: &str, content: &str) -> SystemDBootEntry {
    let mut cmdline = String::new();
    let mut kernel = String::new();
    let mut entry_type = None;

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some(idx) = line.find(|c: char| c == ' ' || c == '\t') else {
            continue;
        };
        let key = line[..idx].trim();
        let mut value = line[idx..].trim_matches(|c: char| c == ' ' || c == '\t');
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }

        match key {
            "options" => {
                if !cmdline.is_empty() {
                    cmdline.push(' ');
                }
                cmdline.push_str(value);
            }
            "linux" => {
                if let Ok(version) = kernel_version_from_name(basename(value)) {
                    kernel = version;
                }
            }
            "uki" => {
                if let Ok(version) = kernel_version_from_name(basename(value)) {
                    kernel = version;
                }
                entry_type = Some(SystemDBootEntryType::UkiConfig);
            }
            _ => {}
        }
    }

    let entry_type = entry_type.unwrap_or(if kernel.ends_with(".efi") {
        SystemDBootEntryType::UkiConfig
    } else {
        SystemDBootEntryType::Config
    });

    SystemDBootEntry {
        entry_type,
        path: format!("/{}/{}", LOADER_ENTRIES_DIR, file_name),
        cmdline,
        kernel,
    }
}

/// Entries from `<root>/boot/loader/entries/*.conf`, sorted by file name.
pub fn read_loader_entries(root: &Path) -> Result<Vec<SystemDBootEntry>> {
    let dir = root.join(LOADER_ENTRIES_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read directory {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_file() && name.ends_with(".conf") {
            names.push(name);
        }
    }
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let path = dir.join(&name);
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(parse_loader_entry(&name, &content))
        })
        .collect()
}

/// Kernel command line embedded in a UKI's `.cmdline` section.
fn read_uki_cmdline(uki: &Path, scratch: &Path) -> Result<String> {
    let out = scratch.join(format!(
        "{}.cmdline",
        uki.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    let mut section = std::ffi::OsString::from(".cmdline=");
    section.push(&out);

    Cmd::new("objcopy")
        .arg("--dump-section")
        .arg(section)
        .arg_path(uki)
        .error_msg(format!("failed to extract cmdline from UKI {}", uki.display()))
        .run()?;

    let cmdline = fs::read_to_string(&out)
        .with_context(|| format!("failed to read extracted cmdline {}", out.display()));
    let _ = fs::remove_file(&out);
    Ok(cmdline?.trim_end_matches(|c: char| c == '\n' || c == '\0').to_string())
}

/// Standalone UKI entries (`<root>/boot/efi/EFI/Linux/vmlinuz-*.efi`).
pub fn read_uki_entries(root: &Path, scratch: &Path) -> Result<Vec<SystemDBootEntry>> {
    let dir = root.join(UKI_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut ukis = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read directory {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(KERNEL_PREFIX) && name.ends_with(".efi") {
            ukis.push(name);
        }
    }
    ukis.sort();

    fs::create_dir_all(scratch)
        .with_context(|| format!("failed to create {}", scratch.display()))?;

    let mut entries = Vec::new();
    for name in ukis {
        let kernel_name = name.trim_end_matches(".efi");
        let kernel = kernel_version_from_name(kernel_name)
            .with_context(|| format!("invalid kernel name in UKI file ({})", kernel_name))?;
        let cmdline = read_uki_cmdline(&dir.join(&name), scratch)?;
        entries.push(SystemDBootEntry {
            entry_type: SystemDBootEntryType::UkiStandalone,
            path: format!("/{}/{}", UKI_DIR, name),
            cmdline,
            kernel,
        });
    }
    Ok(entries)
}

/// Bootloader descriptor of the image mounted at `root`.
///
/// `scratch` receives temporary UKI section dumps.
pub fn extract_cosi_boot_metadata(
    log: &Logger,
    root: &Path,
    scratch: &Path,
    handler: &dyn DistroHandler,
) -> Result<CosiBootloader> {
    let bootloader_type = handler
        .detect_bootloader_type(root)
        .context("failed to detect bootloader type")?;

    match bootloader_type {
        BootloaderType::Grub => Ok(CosiBootloader {
            bootloader_type,
            systemd_boot: None,
        }),
        BootloaderType::SystemdBoot => {
            let mut entries = read_loader_entries(root)
                .context("error extracting systemd-boot config entries")?;
            if entries.is_empty() {
                entries = read_uki_entries(root, scratch)
                    .context("error extracting UKI standalone entries")?;
            }
            if entries.is_empty() {
                bail!(CustomizerError::missing(
                    "systemd-boot detected, but no supported boot entries found"
                )
                .with_path(root));
            }
            debug!(log, "systemd-boot entries"; "count" => entries.len());
            Ok(CosiBootloader {
                bootloader_type,
                systemd_boot: Some(SystemDBoot { entries }),
            })
        }
    }
}
