//! Host tool checks.
//!
//! Each workflow shells out to a fixed set of tools. Checking them up front
//! turns a half-finished build with a loop device still attached into a
//! single clear message.
//!
//! ```rust,ignore
//! use image_customizer::preflight::{check_required_tools, COSI_TOOLS};
//!
//! check_required_tools(COSI_TOOLS)?;
//! ```

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools needed to convert a disk image to COSI.
///
/// Each tuple is (command_name, package_name).
pub const COSI_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("sfdisk", "util-linux"),
    ("lsblk", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

/// Tools needed to build or rebuild a LiveOS ISO.
pub const ISO_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
    ("mkfs.fat", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("cpio", "cpio"),
    ("gzip", "gzip"),
];

/// Tools needed to produce a PXE bundle.
pub const PXE_TOOLS: &[(&str, &str)] = ISO_TOOLS;

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}
