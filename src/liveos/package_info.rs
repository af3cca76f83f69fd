//! Installed package versions and LiveOS feature minimums.
//!
//! Versions are tracked as `x.y-R.nameN` (e.g. `102-11.azl3`): numeric
//! version components, a package release, and the distro tag the release
//! was built for.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Version fingerprint of an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersionInformation {
    #[serde(rename = "PackageVersionComponents")]
    pub version_components: Vec<u64>,
    #[serde(rename = "PackageRelease")]
    pub release: u32,
    #[serde(rename = "DistroName")]
    pub distro_name: String,
    #[serde(rename = "DistroVersion")]
    pub distro_version: u32,
}

impl PackageVersionInformation {
    pub fn new(components: &[u64], release: u32, distro_name: &str, distro_version: u32) -> Self {
        Self {
            version_components: components.to_vec(),
            release,
            distro_name: distro_name.to_string(),
            distro_version,
        }
    }

    pub fn version_string(&self) -> String {
        self.version_components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn full_version_string(&self) -> String {
        format!(
            "{}-{}.{}{}",
            self.version_string(),
            self.release,
            self.distro_name,
            self.distro_version
        )
    }

    /// Fail unless `self` is at least `minimum`.
    ///
    /// Distro name must match and the version must have the same number of
    /// components. Components compare left to right; the first larger
    /// component settles it, otherwise the release decides.
    pub fn verify_minimum_version(&self, minimum: &PackageVersionInformation) -> Result<()> {
        let min = minimum.full_version_string();
        let cur = self.full_version_string();

        if self.distro_name != minimum.distro_name {
            bail!("did not find required distro ({}) - found ({})", min, cur);
        }
        if self.distro_version < minimum.distro_version {
            bail!("did not find required distro version ({}) (or newer) - found ({})", min, cur);
        }
        if self.version_components.len() != minimum.version_components.len() {
            bail!("unexpected number of version components ({}) - found ({})", min, cur);
        }

        for (have, need) in self
            .version_components
            .iter()
            .zip(minimum.version_components.iter())
        {
            if have < need {
                bail!("did not find required package version ({}) (or newer) - found ({})", min, cur);
            }
            if have > need {
                return Ok(());
            }
        }

        if self.release < minimum.release {
            bail!(
                "did not find required package release version ({}) (or newer) - found ({})",
                min,
                cur
            );
        }
        Ok(())
    }
}

impl fmt::Display for PackageVersionInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_version_string())
    }
}

fn release_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]+)\.([a-zA-Z]+)([0-9]+)").expect("valid regex"))
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)*$").expect("valid regex"))
}

fn info_version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Version\s+:\s+(\S+)").expect("valid regex"))
}

fn info_release_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Release\s+:\s+(\S+)").expect("valid regex"))
}

/// Split a release such as `11.azl3` into (release, distro name, distro version).
pub fn parse_release_string(release: &str) -> Result<(u32, String, u32)> {
    let caps = release_regex()
        .captures(release)
        .with_context(|| format!("failed to parse package release information ({})", release))?;

    let package_release: u32 = caps[1].parse().with_context(|| {
        format!("failed to parse package release version ({}) into an unsigned integer", &caps[1])
    })?;
    let distro_version: u32 = caps[3].parse().with_context(|| {
        format!("failed to parse distro version ({}) into an unsigned integer", &caps[3])
    })?;
    Ok((package_release, caps[2].to_string(), distro_version))
}

/// Parse a dotted numeric version (`2.20240226`).
pub fn parse_version_string(version: &str) -> Result<Vec<u64>> {
    if !version_regex().is_match(version) {
        bail!("invalid version format: {}", version);
    }
    version
        .split('.')
        .map(|c| {
            c.parse::<u64>().with_context(|| {
                format!("failed to parse package version component ({}) into an unsigned integer", c)
            })
        })
        .collect()
}

/// Parse `tdnf info` / `rpm -qi` output for `package`.
pub fn parse_package_info(package: &str, output: &str) -> Result<PackageVersionInformation> {
    let version = info_version_regex()
        .captures(output)
        .map(|c| c[1].to_string())
        .with_context(|| {
            format!(
                "failed to extract version information from the ({}) package information (\n{}\n)",
                package, output
            )
        })?;
    let release = info_release_regex()
        .captures(output)
        .map(|c| c[1].to_string())
        .with_context(|| {
            format!(
                "failed to extract release information from the ({}) package information (\n{}\n)",
                package, output
            )
        })?;

    let components = parse_version_string(&version).with_context(|| {
        format!("failed to parse the ({}) package version information ({})", package, version)
    })?;
    let (release, distro_name, distro_version) = parse_release_string(&release)
        .with_context(|| format!("failed to parse release information for package ({})", package))?;

    Ok(PackageVersionInformation {
        version_components: components,
        release,
        distro_name,
        distro_version,
    })
}

/// Oldest dracut that can PXE boot a LiveOS ISO.
pub fn pxe_dracut_minimum() -> PackageVersionInformation {
    PackageVersionInformation::new(&[102], 7, "azl", 3)
}

/// Oldest dracut that can boot a LiveOS ISO with SELinux enabled.
pub fn selinux_dracut_minimum() -> PackageVersionInformation {
    PackageVersionInformation::new(&[102], 11, "azl", 3)
}

/// Oldest selinux-policy with LiveOS support.
pub fn selinux_policy_minimum() -> PackageVersionInformation {
    PackageVersionInformation::new(&[2, 20240226], 9, "azl", 3)
}

pub fn verify_dracut_pxe_support(dracut: &PackageVersionInformation) -> Result<()> {
    dracut.verify_minimum_version(&pxe_dracut_minimum()).context(
        "did not find the minimum (dracut) required version to support PXE boot with LiveOS ISOs",
    )
}

pub fn verify_dracut_selinux_support(dracut: &PackageVersionInformation) -> Result<()> {
    dracut.verify_minimum_version(&selinux_dracut_minimum()).context(
        "did not find the minimum (dracut) required version to support SELinux with LiveOS ISOs",
    )
}

pub fn verify_selinux_policy_support(policy: &PackageVersionInformation) -> Result<()> {
    policy.verify_minimum_version(&selinux_policy_minimum()).context(
        "did not find the minimum (selinux-policy) required version to support SELinux with LiveOS ISOs",
    )
}

/// dracut info is required; selinux-policy is checked only when present.
pub fn verify_no_live_os_selinux_blockers(
    dracut: Option<&PackageVersionInformation>,
    selinux_policy: Option<&PackageVersionInformation>,
) -> Result<()> {
    match dracut {
        Some(d) => verify_dracut_selinux_support(d)?,
        None => bail!("dracut package information is missing"),
    }
    if let Some(p) = selinux_policy {
        verify_selinux_policy_support(p)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TDNF_INFO: &str = "\
Loaded plugin: tdnfrepogpgcheck
Name          : dracut
Arch          : x86_64
Epoch         : 0
Version       : 102
Release       : 11.azl3
Install Size  : 1.32M (1384710)
Repo          : @system
Summary       : Initramfs generator using udev
";

    #[test]
    fn parses_tdnf_info() {
        let info = parse_package_info("dracut", TDNF_INFO).unwrap();
        assert_eq!(info.version_components, vec![102]);
        assert_eq!(info.release, 11);
        assert_eq!(info.distro_name, "azl");
        assert_eq!(info.distro_version, 3);
        assert_eq!(info.to_string(), "102-11.azl3");
    }

    #[test]
    fn multi_component_versions() {
        assert_eq!(parse_version_string("2.20240226").unwrap(), vec![2, 20240226]);
        assert_eq!(parse_version_string("1.2.3.4").unwrap(), vec![1, 2, 3, 4]);
        assert!(parse_version_string("1.2a").is_err());
        assert!(parse_version_string("").is_err());
    }

    #[test]
    fn missing_release_line_fails() {
        let err = parse_package_info("dracut", "Version : 102\n").unwrap_err();
        assert!(format!("{:#}", err).contains("release information"));
    }

    #[test]
    fn minimum_version_ordering() {
        let min = selinux_policy_minimum();
        let newer_component = PackageVersionInformation::new(&[2, 20240301], 1, "azl", 3);
        assert!(newer_component.verify_minimum_version(&min).is_ok());

        let older_release = PackageVersionInformation::new(&[2, 20240226], 8, "azl", 3);
        assert!(older_release.verify_minimum_version(&min).is_err());

        let same = PackageVersionInformation::new(&[2, 20240226], 9, "azl", 3);
        assert!(same.verify_minimum_version(&min).is_ok());

        let other_distro = PackageVersionInformation::new(&[2, 20240226], 9, "cm", 3);
        assert!(other_distro.verify_minimum_version(&min).is_err());

        let fewer_components = PackageVersionInformation::new(&[3], 9, "azl", 3);
        assert!(fewer_components.verify_minimum_version(&min).is_err());
    }

    #[test]
    fn selinux_blockers() {
        let old_dracut = PackageVersionInformation::new(&[102], 7, "azl", 3);
        let new_dracut = PackageVersionInformation::new(&[102], 11, "azl", 3);
        let old_policy = PackageVersionInformation::new(&[2, 20240226], 1, "azl", 3);

        assert!(verify_no_live_os_selinux_blockers(None, None).is_err());
        assert!(verify_no_live_os_selinux_blockers(Some(&old_dracut), None).is_err());
        assert!(verify_no_live_os_selinux_blockers(Some(&new_dracut), None).is_ok());
        assert!(verify_no_live_os_selinux_blockers(Some(&new_dracut), Some(&old_policy)).is_err());

        assert!(verify_dracut_pxe_support(&old_dracut).is_ok());
    }
}
