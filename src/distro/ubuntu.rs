//! Ubuntu images, queried through the image's dpkg database.

use anyhow::{bail, Result};
use slog::Logger;
use std::path::{Path, PathBuf};

use super::{bootloader_from_packages, DistroHandler};
use crate::cosi::metadata::{BootloaderType, OsPackage};
use crate::error::CustomizerError;
use crate::liveos::package_info::PackageVersionInformation;
use crate::process::Cmd;

fn admin_dir(root: &Path) -> PathBuf {
    root.join("var/lib/dpkg")
}

fn dpkg_query(root: &Path) -> Cmd {
    let mut admindir = std::ffi::OsString::from("--admindir=");
    admindir.push(admin_dir(root));
    Cmd::new("dpkg-query").arg(admindir)
}

/// Parse `dpkg-query -W -f='${Package}\t${Version}\t${Architecture}\n'`.
///
/// dpkg has no separate release field; the full version goes into `version`.
pub fn parse_dpkg_package_list(output: &str) -> Result<Vec<OsPackage>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            match parts.as_slice() {
                [name, version, arch] => Ok(OsPackage {
                    name: name.to_string(),
                    version: version.to_string(),
                    release: String::new(),
                    arch: arch.to_string(),
                }),
                _ => Err(CustomizerError::structural(format!(
                    "malformed dpkg line encountered while parsing installed packages: {:?}",
                    line
                ))
                .into()),
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct UbuntuHandler {
    version: String,
}

impl UbuntuHandler {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl DistroHandler for UbuntuHandler {
    fn name(&self) -> &'static str {
        "ubuntu"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn manage_packages(
        &self,
        _log: &Logger,
        _root: &Path,
        install: &[String],
        remove: &[String],
    ) -> Result<()> {
        if !install.is_empty() || !remove.is_empty() {
            bail!(CustomizerError::policy(
                "package management customizations are not yet supported for Ubuntu"
            ));
        }
        Ok(())
    }

    fn is_package_installed(&self, root: &Path, package: &str) -> bool {
        dpkg_query(root)
            .args(["-W", "-f=${Status}", package])
            .allow_fail()
            .run()
            .map(|r| r.success() && r.stdout.contains("installed"))
            .unwrap_or(false)
    }

    fn get_all_packages(&self, root: &Path) -> Result<Vec<OsPackage>> {
        let result = dpkg_query(root)
            .args(["-W", "-f=${Package}\t${Version}\t${Architecture}\n"])
            .error_msg("failed to list installed dpkg packages")
            .run()?;
        parse_dpkg_package_list(&result.stdout)
    }

    fn package_info(&self, _root: &Path, package: &str) -> Result<PackageVersionInformation> {
        bail!(CustomizerError::policy("package version information is not available on Ubuntu")
            .with_identifier(package))
    }

    fn detect_bootloader_type(&self, root: &Path) -> Result<BootloaderType> {
        bootloader_from_packages(self, root, &["grub-efi-amd64", "grub-efi-arm64", "grub-efi"])
    }

    fn grub_config_path(&self) -> &'static str {
        "/boot/grub/grub.cfg"
    }

    fn supports_selinux(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    #[test]
    fn parses_dpkg_output() {
        let out = "bash\t5.2.21-2ubuntu4\tamd64\nlibc6\t2.39-0ubuntu8.3\tamd64\n";
        let packages = parse_dpkg_package_list(out).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].version, "5.2.21-2ubuntu4");
        assert!(packages[0].release.is_empty());
        assert!(parse_dpkg_package_list("bash 5.2\n").is_err());
    }

    #[test]
    fn package_changes_are_rejected() {
        let handler = UbuntuHandler::new("24.04");
        let log = logging::discard();
        let root = Path::new("/nonexistent");
        assert!(handler.manage_packages(&log, root, &[], &[]).is_ok());
        assert!(handler
            .manage_packages(&log, root, &["vim".to_string()], &[])
            .is_err());
    }

    #[test]
    fn admindir_is_inside_root() {
        let cmd = dpkg_query(Path::new("/mnt/image")).args(["-W"]);
        assert_eq!(
            cmd.command_line(),
            "dpkg-query --admindir=/mnt/image/var/lib/dpkg -W"
        );
    }
}
