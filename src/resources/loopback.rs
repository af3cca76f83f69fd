//! Loop device attached to a raw disk image.

use anyhow::Result;
use slog::{info, warn, Logger};
use std::path::{Path, PathBuf};

use super::Resource;
use crate::error::CustomizerError;
use crate::process::Cmd;

#[derive(Debug)]
pub struct Loopback {
    device: PathBuf,
    image: PathBuf,
    log: Logger,
    attached: bool,
}

impl Loopback {
    /// Attach `image` to the first free loop device, with partition scanning.
    pub fn attach(log: &Logger, image: &Path) -> Result<Self> {
        let result = Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(image)
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(CustomizerError::lifecycle(format!(
                "failed to attach loop device: {}",
                result.stderr.trim()
            ))
            .with_path(image)
            .into());
        }

        let device = PathBuf::from(result.stdout.trim());
        if device.as_os_str().is_empty() {
            return Err(CustomizerError::lifecycle("losetup did not report a device")
                .with_path(image)
                .into());
        }

        // Partition nodes appear asynchronously.
        let _ = Cmd::new("udevadm").arg("settle").allow_fail().run();

        info!(log, "attached loop device"; "device" => %device.display(), "image" => %image.display());
        Ok(Self {
            device,
            image: image.to_path_buf(),
            log: log.clone(),
            attached: true,
        })
    }

    pub fn device_path(&self) -> &Path {
        &self.device
    }

    /// Node of partition `number` (`/dev/loop3p2`).
    pub fn partition_path(&self, number: u32) -> PathBuf {
        partition_node(&self.device, number)
    }

    /// Detach, reporting failure.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }
}

/// Partition node of a loop device.
pub fn partition_node(device: &Path, number: u32) -> PathBuf {
    let mut node = device.as_os_str().to_os_string();
    node.push(format!("p{}", number));
    PathBuf::from(node)
}

impl Resource for Loopback {
    fn release(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;

        let result = Cmd::new("losetup")
            .arg("--detach")
            .arg_path(&self.device)
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(CustomizerError::lifecycle(format!(
                "failed to detach loop device: {}",
                result.stderr.trim()
            ))
            .with_path(&self.device)
            .into());
        }
        info!(self.log, "detached loop device"; "device" => %self.device.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "loop device {} ({})",
            self.device.display(),
            self.image.display()
        )
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(self.log, "failed to detach loop device"; "error" => format!("{:#}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_nodes() {
        assert_eq!(
            partition_node(Path::new("/dev/loop3"), 2),
            PathBuf::from("/dev/loop3p2")
        );
        assert_eq!(
            partition_node(Path::new("/dev/loop12"), 10),
            PathBuf::from("/dev/loop12p10")
        );
    }
}
