//! Kernel-version keyed classification of `/boot` files.
//!
//! `vmlinuz-6.6.47.1-1.azl3`, `initramfs-6.6.47.1-1.azl3.img` and
//! `config-6.6.47.1-1.azl3` all belong to the `6.6.47.1-1.azl3` group.
//! kdump initramfs files (`initramfs-<version>kdump.img`) form their own
//! group per version.

use regex::Regex;
use std::sync::OnceLock;

use super::constants::{INITRAMFS_PREFIX, INITRD_PREFIX, KDUMP_INITRD_MARKER, VMLINUZ_PREFIX};

/// Extracts a kernel version from a boot file name.
pub trait KernelVersionMatcher {
    fn kernel_version(&self, file_name: &str) -> Option<String>;
}

/// Matches Azure Linux / CBL-Mariner kernel releases
/// (`x.y.z[.w]-R.azlN` or `x.y.z[.w]-R.cmN`).
#[derive(Debug, Default, Clone, Copy)]
pub struct AzureLinuxKernelMatcher;

fn azl_kernel_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d+\.\d+\.\d+(?:\.\d+)?-\d+\.(?:azl|cm)\d)(?:\b|kdump)")
            .expect("valid regex")
    })
}

impl KernelVersionMatcher for AzureLinuxKernelMatcher {
    fn kernel_version(&self, file_name: &str) -> Option<String> {
        azl_kernel_regex()
            .captures(file_name)
            .map(|caps| caps[1].to_string())
    }
}

/// Role of a kernel-specific file within its version group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFileRole {
    Vmlinuz,
    Initrd,
    /// Other files of a kernel group (config, System.map, ...).
    Other,
    KdumpInitrd,
    /// A `kdump.img` file that is not an initramfs; kept as an additional file.
    KdumpOther,
}

impl KernelFileRole {
    /// Whether the file is tracked by a boot file group rather than copied
    /// as a plain additional file.
    pub fn is_grouped(&self) -> bool {
        !matches!(self, KernelFileRole::KdumpOther)
    }
}

/// Version and role of `file_name`, or `None` when it carries no kernel
/// version.
pub fn classify_kernel_file(
    matcher: &dyn KernelVersionMatcher,
    file_name: &str,
) -> Option<(String, KernelFileRole)> {
    let version = matcher.kernel_version(file_name)?;
    let is_initrd = file_name.starts_with(INITRAMFS_PREFIX) || file_name.starts_with(INITRD_PREFIX);

    let role = if file_name.contains(KDUMP_INITRD_MARKER) {
        if is_initrd {
            KernelFileRole::KdumpInitrd
        } else {
            KernelFileRole::KdumpOther
        }
    } else if file_name.starts_with(VMLINUZ_PREFIX) {
        KernelFileRole::Vmlinuz
    } else if is_initrd {
        KernelFileRole::Initrd
    } else {
        KernelFileRole::Other
    };
    Some((version, role))
}
