//! Scoped OS resources: loop devices, mounts, scratch directories and
//! intermediate files.
//!
//! Each guard releases its resource on `Drop` (best effort, failures are
//! logged) and also offers an explicit `close()` that reports failures.
//! [`CleanupStack`] owns several guards and releases them in reverse order of
//! acquisition, joining every cleanup error onto the operation's result.
//!
//! ```rust,ignore
//! let mut stack = CleanupStack::new(log.clone());
//! let loopback = Loopback::attach(&log, &raw_image)?;
//! let device = loopback.device_path().to_path_buf();
//! stack.push(loopback);
//! let result = do_work(&device);
//! stack.finish(result)?;
//! ```

pub mod loopback;
pub mod mount;

pub use loopback::Loopback;
pub use mount::{first_mount_within, is_path_on_read_only_mount, read_mounts, Mount, MountPoint};

use anyhow::Result;
use slog::{debug, warn, Logger};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{join_cleanup, CustomizerError};

/// Something that must be released when an operation ends.
pub trait Resource {
    /// Release the resource. Calling it twice is a no-op.
    fn release(&mut self) -> Result<()>;

    /// Short description used in logs.
    fn describe(&self) -> String;
}

/// How a [`ScratchDir`] goes away on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Whole tree. Refused while anything is mounted inside it.
    Tree,
    /// `rmdir` only. Whatever was written inside must be released first.
    EmptyDir,
}

/// Directory removed on release.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    log: Logger,
    removal: Removal,
    released: bool,
}

impl ScratchDir {
    /// Create `path` (and parents) and take ownership of it. The tree is
    /// removed recursively on release.
    pub fn create(log: &Logger, path: impl Into<PathBuf>) -> Result<Self> {
        Self::create_with(log, path.into(), Removal::Tree)
    }

    /// Like [`ScratchDir::create`], but release only removes the directory
    /// itself. Files written into it are tracked with [`OwnedFile`]; anything
    /// left behind makes the release fail.
    pub fn create_output_dir(log: &Logger, path: impl Into<PathBuf>) -> Result<Self> {
        Self::create_with(log, path.into(), Removal::EmptyDir)
    }

    fn create_with(log: &Logger, path: PathBuf, removal: Removal) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| {
            CustomizerError::lifecycle("failed to create temporary directory")
                .with_path(&path)
                .with_source(e)
        })?;
        debug!(log, "created scratch directory"; "path" => %path.display());
        Ok(Self {
            path,
            log: log.clone(),
            removal,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn remove_tree(&self) -> std::io::Result<()> {
        let canonical = fs::canonicalize(&self.path)?;
        // Without a readable mount table (no procfs) the check is skipped.
        let mounts = match read_mounts() {
            Ok(mounts) => mounts,
            Err(e) => {
                debug!(self.log, "mount table unavailable"; "error" => format!("{:#}", e));
                Vec::new()
            }
        };
        if let Some(mount) = first_mount_within(&canonical, &mounts) {
            return Err(std::io::Error::other(format!(
                "{} is still mounted",
                mount.target.display()
            )));
        }
        fs::remove_dir_all(&self.path)
    }
}

impl Resource for ScratchDir {
    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let removed = match self.removal {
            Removal::Tree => self.remove_tree(),
            Removal::EmptyDir => fs::remove_dir(&self.path),
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CustomizerError::lifecycle("failed to remove temporary directory")
                .with_path(&self.path)
                .with_source(e)
                .into()),
        }
    }

    fn describe(&self) -> String {
        format!("directory {}", self.path.display())
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(self.log, "cleanup failed"; "error" => format!("{:#}", e));
        }
    }
}

/// Intermediate file removed on release.
#[derive(Debug)]
pub struct OwnedFile {
    path: PathBuf,
    log: Logger,
    released: bool,
}

impl OwnedFile {
    /// Take ownership of `path`, which need not exist yet.
    pub fn new(log: &Logger, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            log: log.clone(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for OwnedFile {
    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CustomizerError::lifecycle("failed to remove file")
                .with_path(&self.path)
                .with_source(e)
                .into()),
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

impl Drop for OwnedFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(self.log, "cleanup failed"; "error" => format!("{:#}", e));
        }
    }
}

/// Resources released last-in first-out.
pub struct CleanupStack {
    log: Logger,
    items: Vec<Box<dyn Resource>>,
}

impl CleanupStack {
    pub fn new(log: Logger) -> Self {
        Self {
            log,
            items: Vec::new(),
        }
    }

    /// Take ownership of `resource`. Copy out anything still needed (device
    /// path, mount target) before pushing.
    pub fn push<R: Resource + 'static>(&mut self, resource: R) {
        self.items.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Release everything in reverse order and collect failures.
    pub fn release_all(&mut self) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        while let Some(mut item) = self.items.pop() {
            debug!(self.log, "releasing"; "resource" => item.describe());
            if let Err(e) = item.release() {
                errors.push(e.context(format!("failed to release {}", item.describe())));
            }
        }
        errors
    }

    /// Release everything and merge the cleanup errors into `result`.
    ///
    /// The original failure stays primary; a cleanup failure alone becomes
    /// the reported error.
    pub fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let cleanup = self.release_all();
        match result {
            Ok(value) => match join_cleanup(None, cleanup) {
                None => Ok(value),
                Some(err) => Err(err),
            },
            Err(primary) => match join_cleanup(Some(primary), cleanup) {
                Some(err) => Err(err),
                None => Err(anyhow::anyhow!("operation failed")),
            },
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        for e in self.release_all() {
            warn!(self.log, "cleanup failed"; "error" => format!("{:#}", e));
        }
    }
}
