//! Filesystem mounts and the host mount table.

use anyhow::{Context, Result};
use slog::{info, warn, Logger};
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::Resource;
use crate::error::CustomizerError;
use crate::process::Cmd;

/// One entry of the host mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub target: PathBuf,
    pub fstype: String,
    /// `MS_*` flags derived from the mount options.
    pub flags: u64,
}

impl MountPoint {
    pub fn is_read_only(&self) -> bool {
        self.flags & libc::MS_RDONLY as u64 != 0
    }
}

/// Undo the octal escapes (`\040`) used in `/proc/self/mounts`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/self/mounts` (fstab format).
pub fn parse_mounts(content: &str) -> Vec<MountPoint> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or_default();

            let mut flags = 0u64;
            for option in options.split(',') {
                match option {
                    "ro" => flags |= libc::MS_RDONLY as u64,
                    "nosuid" => flags |= libc::MS_NOSUID as u64,
                    "nodev" => flags |= libc::MS_NODEV as u64,
                    "noexec" => flags |= libc::MS_NOEXEC as u64,
                    _ => {}
                }
            }

            Some(MountPoint {
                target: PathBuf::from(unescape_mount_field(target)),
                fstype: fstype.to_string(),
                flags,
            })
        })
        .collect()
}

/// Current mount table of this process.
pub fn read_mounts() -> Result<Vec<MountPoint>> {
    let content =
        fs::read_to_string("/proc/self/mounts").context("failed to read /proc/self/mounts")?;
    Ok(parse_mounts(&content))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether the most specific mount containing `path` is read-only.
///
/// `path` need not exist. Paths under no listed mount are writable.
pub fn is_path_on_read_only_mount(path: &Path, mounts: &[MountPoint]) -> bool {
    let path = normalize(path);
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.target))
        .max_by_key(|m| m.target.components().count())
        .map(MountPoint::is_read_only)
        .unwrap_or(false)
}

/// First mount whose target is `dir` or lies below it.
pub fn first_mount_within<'a>(dir: &Path, mounts: &'a [MountPoint]) -> Option<&'a MountPoint> {
    let dir = normalize(dir);
    mounts.iter().find(|m| m.target.starts_with(&dir))
}

/// A mounted filesystem, unmounted on release.
#[derive(Debug)]
pub struct Mount {
    source: PathBuf,
    target: PathBuf,
    log: Logger,
    mounted: bool,
}

impl Mount {
    /// Mount `source` at `target`, creating `target` if needed.
    ///
    /// `options` is passed through `-o` when non-empty.
    pub fn new(
        log: &Logger,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &[&str],
    ) -> Result<Self> {
        fs::create_dir_all(target).map_err(|e| {
            CustomizerError::lifecycle("failed to create mount directory")
                .with_path(target)
                .with_source(e)
        })?;

        let mut cmd = Cmd::new("mount");
        if let Some(fstype) = fstype {
            cmd = cmd.args(["-t", fstype]);
        }
        if !options.is_empty() {
            cmd = cmd.arg("-o").arg(options.join(","));
        }
        let result = cmd.arg_path(source).arg_path(target).allow_fail().run()?;
        if !result.success() {
            return Err(CustomizerError::lifecycle(format!(
                "failed to mount {}: {}",
                source.display(),
                result.stderr.trim()
            ))
            .with_path(target)
            .into());
        }

        info!(log, "mounted"; "source" => %source.display(), "target" => %target.display());
        Ok(Self {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            log: log.clone(),
            mounted: true,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }
}

impl Resource for Mount {
    fn release(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;

        let result = Cmd::new("umount").arg_path(&self.target).allow_fail().run()?;
        if !result.success() {
            return Err(CustomizerError::lifecycle(format!(
                "failed to unmount: {}",
                result.stderr.trim()
            ))
            .with_path(&self.target)
            .into());
        }
        info!(self.log, "unmounted"; "target" => %self.target.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "mount {} on {}",
            self.source.display(),
            self.target.display()
        )
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(self.log, "failed to unmount"; "error" => format!("{:#}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/sda2 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/loop3p2 /mnt/image ext4 ro,relatime 0 0
/dev/loop3p3 /mnt/image/var ext4 rw,relatime 0 0
/dev/sdb1 /media/usb\\040disk vfat ro 0 0
";

    #[test]
    fn parses_flags_and_escapes() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(mounts.len(), 5);
        assert!(!mounts[0].is_read_only());
        assert!(mounts[1].flags & libc::MS_NOEXEC as u64 != 0);
        assert!(mounts[2].is_read_only());
        assert_eq!(mounts[4].target, PathBuf::from("/media/usb disk"));
    }

    #[test]
    fn most_specific_mount_wins() {
        let mounts = parse_mounts(MOUNTS);
        let history = Path::new("/mnt/image/usr/share/image-customizer/history.json");
        assert!(is_path_on_read_only_mount(history, &mounts));

        let var = Path::new("/mnt/image/var/lib/thing");
        assert!(!is_path_on_read_only_mount(var, &mounts));

        assert!(!is_path_on_read_only_mount(Path::new("/home/user"), &mounts));
        assert!(is_path_on_read_only_mount(Path::new("/media/usb disk/x"), &mounts));
    }

    #[test]
    fn finds_mounts_inside_a_directory() {
        let mounts = parse_mounts(MOUNTS);
        let inside = first_mount_within(Path::new("/mnt"), &mounts).unwrap();
        assert_eq!(inside.target, PathBuf::from("/mnt/image"));
        assert!(first_mount_within(Path::new("/mnt/image/var"), &mounts).is_some());
        assert!(first_mount_within(Path::new("/mnt/image/usr"), &mounts).is_none());
        assert!(first_mount_within(Path::new("/mnt/im"), &mounts).is_none());
    }

    #[test]
    fn prefix_match_is_by_component() {
        let mounts = parse_mounts(MOUNTS);
        assert!(!is_path_on_read_only_mount(Path::new("/mnt/image2/file"), &mounts));
        assert!(!is_path_on_read_only_mount(
            Path::new("/mnt/image/var/../var/x"),
            &mounts
        ));
    }

    #[test]
    fn unlisted_paths_are_writable() {
        assert!(!is_path_on_read_only_mount(Path::new("/tmp/x"), &[]));
    }
}
