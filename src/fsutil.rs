//! Filesystem helpers for staging LiveOS media.
//!
//! Boot trees carry symlinks (`vmlinuz -> vmlinuz-<version>`) that must
//! survive the trip into the artifact store, so every copy here preserves
//! links instead of following them.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively copy a directory, preserving symlinks.
///
/// # Arguments
///
/// * `src` - Source directory to copy
/// * `dst` - Destination directory (created if it doesn't exist)
///
/// # Example
///
/// ```rust,ignore
/// use image_customizer::fsutil::copy_dir_recursive;
///
/// copy_dir_recursive(Path::new("/mnt/image"), &build_dir.join("writeable-rootfs"))?;
/// ```
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            copy_no_dereference(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

/// Copy one file or symlink, creating parent directories.
///
/// A symlink is recreated with the same target. Regular files keep their
/// permission bits.
pub fn copy_no_dereference(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let md = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to stat {}", src.display()))?;
    if md.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        if dst.exists() || dst.is_symlink() {
            fs::remove_file(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("Failed to create symlink: {}", dst.display()))?;
    } else {
        fs::copy(src, dst).with_context(|| {
            format!("Failed to copy {} to {}", src.display(), dst.display())
        })?;
    }
    Ok(())
}

/// Move a file by renaming, with fallback to copy+delete.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete
            copy_no_dereference(src, dst)?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Add the owner write bit to every file and directory under `root`.
///
/// Trees extracted from ISO9660 media come out read-only.
pub fn make_owner_writable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let md = entry.metadata()?;
        let mut perms = md.permissions();
        let mode = perms.mode();
        if mode & 0o200 == 0 {
            perms.set_mode(mode | 0o200);
            fs::set_permissions(entry.path(), perms)
                .with_context(|| format!("Failed to chmod {}", entry.path().display()))?;
        }
    }
    Ok(())
}
