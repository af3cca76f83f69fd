//! Distribution-specific queries against a mounted image root.
//!
//! The set of supported distributions is closed. [`detect`] reads
//! `/etc/os-release` once and returns the matching [`DistroHandler`]; every
//! later package or bootloader question goes through that handler.
//!
//! ```rust,ignore
//! use image_customizer::distro;
//!
//! let handler = distro::detect(&rootfs)?;
//! let packages = handler.get_all_packages(&rootfs)?;
//! let bootloader = handler.detect_bootloader_type(&rootfs)?;
//! ```

mod rpm;
mod ubuntu;

pub use rpm::{AzureLinuxHandler, FedoraHandler};
pub use ubuntu::UbuntuHandler;

use anyhow::{Context, Result};
use slog::Logger;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::cosi::metadata::{BootloaderType, OsPackage};
use crate::error::CustomizerError;
use crate::liveos::package_info::PackageVersionInformation;

/// Location of the os-release file inside an image.
pub const OS_RELEASE_PATH: &str = "etc/os-release";

/// Package and bootloader capabilities of one distribution.
///
/// Paths returned by the handler are absolute inside the image
/// (e.g. `/boot/grub2/grub.cfg`); callers join them onto the root.
pub trait DistroHandler {
    /// Short distribution name (`azurelinux`, `fedora`, `ubuntu`).
    fn name(&self) -> &'static str;

    /// Release version read from os-release (`3.0`, `42`, `24.04`).
    fn version(&self) -> &str;

    /// Install and remove packages inside `root`.
    fn manage_packages(
        &self,
        log: &Logger,
        root: &Path,
        install: &[String],
        remove: &[String],
    ) -> Result<()>;

    fn is_package_installed(&self, root: &Path, package: &str) -> bool;

    /// Every installed package, for the COSI package list.
    fn get_all_packages(&self, root: &Path) -> Result<Vec<OsPackage>>;

    /// Version fingerprint of one installed package.
    fn package_info(&self, root: &Path, package: &str) -> Result<PackageVersionInformation>;

    fn detect_bootloader_type(&self, root: &Path) -> Result<BootloaderType>;

    fn grub_config_path(&self) -> &'static str;

    fn supports_selinux(&self) -> bool;
}

/// Bootloader detection shared by every handler: any installed grub EFI
/// package wins over systemd-boot.
pub(crate) fn bootloader_from_packages(
    handler: &dyn DistroHandler,
    root: &Path,
    grub_packages: &[&str],
) -> Result<BootloaderType> {
    if grub_packages
        .iter()
        .any(|p| handler.is_package_installed(root, p))
    {
        return Ok(BootloaderType::Grub);
    }
    if handler.is_package_installed(root, "systemd-boot") {
        return Ok(BootloaderType::SystemdBoot);
    }
    Err(CustomizerError::missing(format!(
        "unknown bootloader: neither {} nor systemd-boot found",
        grub_packages.join(", ")
    ))
    .with_path(root)
    .into())
}

/// Parse os-release `KEY=value` lines. Quotes around values are stripped.
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                .unwrap_or(v);
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

/// Raw os-release contents of the image at `root`.
pub fn read_os_release(root: &Path) -> Result<String> {
    let path = root.join(OS_RELEASE_PATH);
    fs::read_to_string(&path).map_err(|e| {
        CustomizerError::missing("failed to read os-release")
            .with_path(&path)
            .with_source(e)
            .into()
    })
}

/// Handler for the distribution described by an os-release file.
pub fn handler_from_os_release(content: &str) -> Result<Box<dyn DistroHandler>> {
    let fields = parse_os_release(content);
    let id = fields.get("ID").map(String::as_str).unwrap_or_default();
    let version = fields.get("VERSION_ID").cloned().unwrap_or_default();

    let handler: Box<dyn DistroHandler> = match id {
        "azurelinux" | "mariner" => Box::new(AzureLinuxHandler::new(version)),
        "fedora" => Box::new(FedoraHandler::new(version)),
        "ubuntu" => Box::new(UbuntuHandler::new(version)),
        other => {
            return Err(CustomizerError::policy("unsupported distribution")
                .with_identifier(other)
                .into())
        }
    };
    Ok(handler)
}

/// Detect the distribution of the image mounted at `root`.
pub fn detect(root: &Path) -> Result<Box<dyn DistroHandler>> {
    let content = read_os_release(root)?;
    handler_from_os_release(&content)
        .with_context(|| format!("failed to detect distribution of {}", root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{kind_of, ErrorKind};
    use tempfile::TempDir;

    const AZL_OS_RELEASE: &str = r#"NAME="Microsoft Azure Linux"
VERSION="3.0.20240824"
ID=azurelinux
VERSION_ID="3.0"
PRETTY_NAME="Microsoft Azure Linux 3.0"
"#;

    #[test]
    fn parses_quoted_values() {
        let fields = parse_os_release(AZL_OS_RELEASE);
        assert_eq!(fields["ID"], "azurelinux");
        assert_eq!(fields["VERSION_ID"], "3.0");
        assert_eq!(fields["NAME"], "Microsoft Azure Linux");
    }

    #[test]
    fn selects_handler_by_id() {
        let azl = handler_from_os_release(AZL_OS_RELEASE).unwrap();
        assert_eq!(azl.name(), "azurelinux");
        assert_eq!(azl.version(), "3.0");
        assert!(azl.supports_selinux());
        assert_eq!(azl.grub_config_path(), "/boot/grub2/grub.cfg");

        let mariner = handler_from_os_release("ID=mariner\nVERSION_ID=2.0\n").unwrap();
        assert_eq!(mariner.name(), "azurelinux");

        let ubuntu = handler_from_os_release("ID=ubuntu\nVERSION_ID=\"24.04\"\n").unwrap();
        assert_eq!(ubuntu.name(), "ubuntu");
        assert!(!ubuntu.supports_selinux());
        assert_eq!(ubuntu.grub_config_path(), "/boot/grub/grub.cfg");

        let fedora = handler_from_os_release("ID=fedora\nVERSION_ID=42\n").unwrap();
        assert_eq!(fedora.name(), "fedora");
    }

    #[test]
    fn unknown_distro_is_policy_error() {
        let err = handler_from_os_release("ID=gentoo\n").err().unwrap();
        assert_eq!(kind_of(&err), Some(ErrorKind::Policy));
    }

    #[test]
    fn detect_reads_image_root() {
        let tmp = TempDir::new().unwrap();
        let err = detect(tmp.path()).err().unwrap();
        assert_eq!(kind_of(&err), Some(ErrorKind::MissingArtifact));

        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join(OS_RELEASE_PATH), AZL_OS_RELEASE).unwrap();
        assert_eq!(detect(tmp.path()).unwrap().name(), "azurelinux");
    }
}
