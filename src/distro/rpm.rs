//! RPM based distributions: Azure Linux and Fedora.
//!
//! Queries run the host `rpm` against the image database with `--root`.
//! Package changes go through `tdnf`/`dnf --installroot`.

use anyhow::{Context, Result};
use slog::{info, Logger};
use std::path::Path;

use super::{bootloader_from_packages, DistroHandler};
use crate::cosi::metadata::{BootloaderType, OsPackage};
use crate::error::CustomizerError;
use crate::liveos::package_info::{parse_package_info, PackageVersionInformation};
use crate::process::Cmd;

const RPM_QUERY_FORMAT: &str = "%{NAME}|%{VERSION}|%{RELEASE}|%{ARCH}\n";

fn rpm_is_installed(root: &Path, package: &str) -> bool {
    Cmd::new("rpm")
        .arg("--root")
        .arg_path(root)
        .args(["-q", package])
        .allow_fail()
        .run()
        .map(|r| r.success())
        .unwrap_or(false)
}

/// Parse `rpm -qa --queryformat` output.
pub fn parse_rpm_package_list(output: &str) -> Result<Vec<OsPackage>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split('|').collect();
            match parts.as_slice() {
                [name, version, release, arch] => Ok(OsPackage {
                    name: name.to_string(),
                    version: version.to_string(),
                    release: release.to_string(),
                    arch: arch.to_string(),
                }),
                _ => Err(CustomizerError::structural(format!(
                    "malformed rpm line encountered while parsing installed packages: {:?}",
                    line
                ))
                .into()),
            }
        })
        .collect()
}

fn rpm_all_packages(root: &Path) -> Result<Vec<OsPackage>> {
    let result = Cmd::new("rpm")
        .arg("--root")
        .arg_path(root)
        .args(["-qa", "--queryformat", RPM_QUERY_FORMAT])
        .error_msg("failed to list installed rpm packages")
        .run()?;
    parse_rpm_package_list(&result.stdout)
}

fn rpm_package_info(root: &Path, package: &str) -> Result<PackageVersionInformation> {
    let result = Cmd::new("rpm")
        .arg("--root")
        .arg_path(root)
        .args(["-qi", package])
        .error_msg(format!("failed to query package ({})", package))
        .run()?;
    parse_package_info(package, &result.stdout)
}

/// `install`/`remove` invocations of an rpm package manager against `root`.
fn package_manager_commands(
    binary: &str,
    release: &str,
    root: &Path,
    install: &[String],
    remove: &[String],
) -> Vec<Cmd> {
    let base = |verb: &str| {
        Cmd::new(binary)
            .arg(format!("--releasever={}", release))
            .arg("--installroot")
            .arg_path(root)
            .args([verb, "--assumeyes"])
    };

    let mut commands = Vec::new();
    if !remove.is_empty() {
        commands.push(base("remove").args(["--disablerepo", "*"]).args(remove));
    }
    if !install.is_empty() {
        commands.push(base("install").args(install));
    }
    commands
}

fn run_package_manager(
    log: &Logger,
    binary: &str,
    release: &str,
    root: &Path,
    install: &[String],
    remove: &[String],
) -> Result<()> {
    for cmd in package_manager_commands(binary, release, root, install, remove) {
        info!(log, "running package manager"; "command" => cmd.command_line());
        cmd.error_msg(format!("{} failed", binary))
            .run()
            .with_context(|| format!("failed to update packages in {}", root.display()))?;
    }
    Ok(())
}

/// Azure Linux (and CBL-Mariner) images.
#[derive(Debug, Clone)]
pub struct AzureLinuxHandler {
    version: String,
}

impl AzureLinuxHandler {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl DistroHandler for AzureLinuxHandler {
    fn name(&self) -> &'static str {
        "azurelinux"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn manage_packages(
        &self,
        log: &Logger,
        root: &Path,
        install: &[String],
        remove: &[String],
    ) -> Result<()> {
        run_package_manager(log, "tdnf", &self.version, root, install, remove)
    }

    fn is_package_installed(&self, root: &Path, package: &str) -> bool {
        rpm_is_installed(root, package)
    }

    fn get_all_packages(&self, root: &Path) -> Result<Vec<OsPackage>> {
        rpm_all_packages(root)
    }

    fn package_info(&self, root: &Path, package: &str) -> Result<PackageVersionInformation> {
        rpm_package_info(root, package)
    }

    fn detect_bootloader_type(&self, root: &Path) -> Result<BootloaderType> {
        bootloader_from_packages(self, root, &["grub2-efi-binary", "grub2-efi-binary-noprefix"])
    }

    fn grub_config_path(&self) -> &'static str {
        "/boot/grub2/grub.cfg"
    }

    fn supports_selinux(&self) -> bool {
        true
    }
}

/// Fedora images.
#[derive(Debug, Clone)]
pub struct FedoraHandler {
    version: String,
}

impl FedoraHandler {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl DistroHandler for FedoraHandler {
    fn name(&self) -> &'static str {
        "fedora"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn manage_packages(
        &self,
        log: &Logger,
        root: &Path,
        install: &[String],
        remove: &[String],
    ) -> Result<()> {
        run_package_manager(log, "dnf", &self.version, root, install, remove)
    }

    fn is_package_installed(&self, root: &Path, package: &str) -> bool {
        rpm_is_installed(root, package)
    }

    fn get_all_packages(&self, root: &Path) -> Result<Vec<OsPackage>> {
        rpm_all_packages(root)
    }

    fn package_info(&self, root: &Path, package: &str) -> Result<PackageVersionInformation> {
        rpm_package_info(root, package)
    }

    fn detect_bootloader_type(&self, root: &Path) -> Result<BootloaderType> {
        bootloader_from_packages(self, root, &["grub2-efi-x64", "grub2-efi-aa64"])
    }

    fn grub_config_path(&self) -> &'static str {
        "/boot/grub2/grub.cfg"
    }

    fn supports_selinux(&self) -> bool {
        true
    }
}
