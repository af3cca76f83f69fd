//! SELinux mode detection and the LiveOS SELinux gate.

use anyhow::{Context, Result};
use regex::Regex;
use slog::{warn, Logger};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use super::grub;
use super::package_info::{verify_no_live_os_selinux_blockers, PackageVersionInformation};
use crate::config::SELinuxMode;
use crate::error::CustomizerError;

/// SELinux config file, relative to the image root.
pub const SELINUX_CONFIG_FILE: &str = "etc/selinux/config";

/// Kernel arguments that together decide the SELinux mode.
pub const SELINUX_ARG_NAMES: &[&str] = &["security", "selinux", "enforcing"];

fn selinux_config_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*SELINUX=(\S+)").expect("valid regex"))
}

fn arg_value<'a>(args: &'a [String], name: &str) -> Result<Option<&'a str>> {
    let mut found = None;
    for arg in args {
        let (arg_name, value) = arg.split_once('=').unwrap_or((arg.as_str(), ""));
        if arg_name == name {
            if found.is_some() {
                return Err(CustomizerError::structural(format!(
                    "kernel arg ({}) is specified more than once",
                    name
                ))
                .with_identifier(name)
                .into());
            }
            found = Some(value);
        }
    }
    Ok(found)
}

/// SELinux mode forced by kernel arguments.
///
/// `Default` means the arguments leave the decision to `/etc/selinux/config`.
pub fn selinux_mode_from_args(args: &[String]) -> Result<SELinuxMode> {
    let security = arg_value(args, "security")?;
    let selinux = arg_value(args, "selinux")?;
    let enforcing = arg_value(args, "enforcing")?;

    if security != Some("selinux") || selinux != Some("1") {
        return Ok(SELinuxMode::Disabled);
    }
    if enforcing == Some("1") {
        return Ok(SELinuxMode::ForceEnforcing);
    }
    Ok(SELinuxMode::Default)
}

/// SELinux mode set in `<root>/etc/selinux/config`.
pub fn selinux_mode_from_config_file(root: &Path) -> Result<SELinuxMode> {
    let path = root.join(SELINUX_CONFIG_FILE);
    let content = fs::read_to_string(&path).map_err(|e| {
        CustomizerError::missing("failed to read SELinux config file")
            .with_path(&path)
            .with_source(e)
    })?;

    let caps = selinux_config_regex().captures(&content).ok_or_else(|| {
        CustomizerError::structural("failed to find SELinux mode in config file").with_path(&path)
    })?;

    match &caps[1] {
        "enforcing" => Ok(SELinuxMode::Enforcing),
        "permissive" => Ok(SELinuxMode::Permissive),
        "disabled" => Ok(SELinuxMode::Disabled),
        other => Err(CustomizerError::structural(format!("unknown SELinux mode ({})", other))
            .with_path(&path)
            .into()),
    }
}

/// Effective SELinux mode of a mounted image: kernel command line first,
/// then the config file.
///
/// `grub_cfg` is absolute inside the image (e.g. `/boot/grub2/grub.cfg`).
pub fn read_image_selinux_mode(root: &Path, grub_cfg: &str) -> Result<SELinuxMode> {
    let grub_cfg_path = root.join(grub_cfg.trim_start_matches('/'));
    let content = fs::read_to_string(&grub_cfg_path)
        .with_context(|| format!("failed to read {}", grub_cfg_path.display()))?;
    let args = grub::linux_command_line_args(&content)
        .with_context(|| format!("failed to read kernel arguments from {}", grub_cfg_path.display()))?;

    match selinux_mode_from_args(&args)? {
        SELinuxMode::Default => selinux_mode_from_config_file(root),
        mode => Ok(mode),
    }
}

/// Kernel arguments that select `mode`.
pub fn selinux_mode_args(mode: SELinuxMode) -> Result<Vec<String>> {
    let args: &[&str] = match mode {
        SELinuxMode::Disabled => &["selinux=0"],
        SELinuxMode::ForceEnforcing => &["security=selinux", "selinux=1", "enforcing=1"],
        SELinuxMode::Permissive | SELinuxMode::Enforcing => &["security=selinux", "selinux=1"],
        SELinuxMode::Default => {
            return Err(CustomizerError::invalid_config(format!(
                "unknown SELinux mode ({})",
                mode.as_str()
            ))
            .into())
        }
    };
    Ok(args.iter().map(|s| s.to_string()).collect())
}

/// Replace the SELinux kernel arguments of every `linux` line.
pub fn set_selinux_mode_args(grub_cfg: &str, mode: SELinuxMode) -> Result<String> {
    let args = selinux_mode_args(mode)?;
    grub::update_kernel_args(grub_cfg, SELINUX_ARG_NAMES, &args)
}

/// Decide whether the LiveOS media must boot with SELinux disabled.
///
/// An image with SELinux enabled needs a dracut (and selinux-policy) recent
/// enough for live boot. When they are too old, an explicit request for
/// SELinux in this run is a policy error; otherwise SELinux is turned off
/// with a warning.
pub fn resolve_selinux_state(
    log: &Logger,
    image_mode: SELinuxMode,
    requested_mode: SELinuxMode,
    dracut: Option<&PackageVersionInformation>,
    selinux_policy: Option<&PackageVersionInformation>,
) -> Result<bool> {
    if image_mode == SELinuxMode::Disabled {
        return Ok(false);
    }

    let Err(e) = verify_no_live_os_selinux_blockers(dracut, selinux_policy) else {
        return Ok(false);
    };

    if requested_mode != SELinuxMode::Disabled && requested_mode != SELinuxMode::Default {
        return Err(CustomizerError::policy(format!(
            "SELinux cannot be enabled due to older dracut and selinux-policy package versions: {:#}",
            e
        ))
        .with_identifier(requested_mode.as_str())
        .into());
    }

    warn!(log, "SELinux disabled due to older dracut and selinux-policy package versions";
        "reason" => format!("{:#}", e));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{kind_of, ErrorKind};
    use crate::logging;
    use tempfile::TempDir;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mode_from_args() {
        assert_eq!(selinux_mode_from_args(&args(&["ro"])).unwrap(), SELinuxMode::Disabled);
        assert_eq!(
            selinux_mode_from_args(&args(&["security=selinux", "selinux=1"])).unwrap(),
            SELinuxMode::Default
        );
        assert_eq!(
            selinux_mode_from_args(&args(&["security=selinux", "selinux=1", "enforcing=1"])).unwrap(),
            SELinuxMode::ForceEnforcing
        );
        assert!(selinux_mode_from_args(&args(&["selinux=1", "selinux=0"])).is_err());
    }

    #[test]
    fn image_mode_falls_back_to_config_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("boot/grub2")).unwrap();
        fs::create_dir_all(root.join("etc/selinux")).unwrap();
        fs::write(
            root.join("boot/grub2/grub.cfg"),
            "linux /boot/vmlinuz-6.6 root=/dev/sda2 security=selinux selinux=1\n",
        )
        .unwrap();
        fs::write(root.join(SELINUX_CONFIG_FILE), "# comment\nSELINUX=permissive\nSELINUXTYPE=targeted\n").unwrap();

        let mode = read_image_selinux_mode(root, "/boot/grub2/grub.cfg").unwrap();
        assert_eq!(mode, SELinuxMode::Permissive);
    }

    #[test]
    fn missing_config_file() {
        let tmp = TempDir::new().unwrap();
        let err = selinux_mode_from_config_file(tmp.path()).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::MissingArtifact));
    }

    #[test]
    fn disabled_image_needs_no_check() {
        let log = logging::discard();
        let disable =
            resolve_selinux_state(&log, SELinuxMode::Disabled, SELinuxMode::Enforcing, None, None).unwrap();
        assert!(!disable);
    }

    #[test]
    fn old_dracut_disables_selinux_by_default() {
        let log = logging::discard();
        let dracut = PackageVersionInformation::new(&[102], 7, "azl", 3);
        let disable =
            resolve_selinux_state(&log, SELinuxMode::Enforcing, SELinuxMode::Default, Some(&dracut), None)
                .unwrap();
        assert!(disable);
    }

    #[test]
    fn explicit_request_with_old_dracut_is_policy_error() {
        let log = logging::discard();
        let dracut = PackageVersionInformation::new(&[102], 7, "azl", 3);
        let err =
            resolve_selinux_state(&log, SELinuxMode::Enforcing, SELinuxMode::Enforcing, Some(&dracut), None)
                .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Policy));
    }

    #[test]
    fn new_enough_packages_keep_selinux() {
        let log = logging::discard();
        let dracut = PackageVersionInformation::new(&[102], 11, "azl", 3);
        let policy = PackageVersionInformation::new(&[2, 20240226], 9, "azl", 3);
        let disable = resolve_selinux_state(
            &log,
            SELinuxMode::Enforcing,
            SELinuxMode::Enforcing,
            Some(&dracut),
            Some(&policy),
        )
        .unwrap();
        assert!(!disable);
    }

    #[test]
    fn mode_args() {
        assert_eq!(selinux_mode_args(SELinuxMode::Disabled).unwrap(), vec!["selinux=0"]);
        assert!(selinux_mode_args(SELinuxMode::Default).is_err());
    }
}
