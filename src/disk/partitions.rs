//! Per-partition image extraction.
//!
//! Each partition of the attached disk is copied to `<base>_<n>.raw`, its
//! size recorded, and (for `raw-zst`) compressed into `<base>_<n>.raw.zst`
//! behind the image-UUID skippable frame.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::table::partition_number;
use super::zstd::{compress_with_frame, remove_intermediate, CompressionSettings};
use crate::error::CustomizerError;
use crate::process::Cmd;

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,FSTYPE,UUID,PARTUUID,PARTTYPE,PARTLABEL,MOUNTPOINT";

/// A block device as reported by `lsblk`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BlockPartition {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub partuuid: Option<String>,
    #[serde(default)]
    pub parttype: Option<String>,
    #[serde(default)]
    pub partlabel: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<BlockPartition>,
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockPartition>,
}

/// Output layout of extracted partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFormat {
    Raw,
    RawZst,
}

impl std::str::FromStr for PartitionFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(PartitionFormat::Raw),
            "raw-zst" => Ok(PartitionFormat::RawZst),
            other => bail!(CustomizerError::invalid_config(format!(
                "unsupported partition format ({}), supported: raw, raw-zst",
                other
            ))),
        }
    }
}

/// Metadata of one extracted partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionMetadata {
    #[serde(rename = "partitionnum")]
    pub partition_num: u32,
    /// File name inside the output directory, e.g. `image_1.raw.zst`.
    pub filename: String,
    pub partlabel: String,
    pub fstype: String,
    pub parttype: String,
    pub uuid: String,
    pub partuuid: String,
    pub mountpoint: String,
    #[serde(rename = "uncompressedsize")]
    pub uncompressed_size: u64,
}

/// Parse `lsblk --json` output into a flat list of partitions (children
/// included, device nodes of type other than `part` dropped).
pub fn parse_lsblk_json(json: &str) -> Result<Vec<BlockPartition>> {
    let parsed: LsblkOutput =
        serde_json::from_str(json).context("Failed to parse lsblk JSON output")?;

    fn flatten(devices: Vec<BlockPartition>, out: &mut Vec<BlockPartition>) {
        for mut dev in devices {
            let children = std::mem::take(&mut dev.children);
            if dev.device_type == "part" {
                out.push(dev);
            }
            flatten(children, out);
        }
    }

    let mut partitions = Vec::new();
    flatten(parsed.blockdevices, &mut partitions);
    Ok(partitions)
}

/// Partitions of `device`, in lsblk order.
pub fn list_partitions(device: &Path) -> Result<Vec<BlockPartition>> {
    let result = Cmd::new("lsblk")
        .args(["--json", "--bytes", "--output", LSBLK_COLUMNS])
        .arg_path(device)
        .error_msg(format!("Failed to list partitions of {}", device.display()))
        .run()?;
    parse_lsblk_json(&result.stdout)
}

/// Extract every partition of `device` into `out_dir`.
pub fn extract_partitions(
    log: &Logger,
    device: &Path,
    out_dir: &Path,
    basename: &str,
    format: PartitionFormat,
    image_uuid: &[u8; 16],
    settings: CompressionSettings,
) -> Result<Vec<PartitionMetadata>> {
    let partitions = list_partitions(device)?;
    extract_partition_files(log, &partitions, out_dir, basename, format, image_uuid, settings)
}

/// Extraction over an already-listed set of partitions.
pub fn extract_partition_files(
    log: &Logger,
    partitions: &[BlockPartition],
    out_dir: &Path,
    basename: &str,
    format: PartitionFormat,
    image_uuid: &[u8; 16],
    settings: CompressionSettings,
) -> Result<Vec<PartitionMetadata>> {
    let mut output = Vec::new();

    for partition in partitions.iter().filter(|p| p.device_type == "part") {
        let number = partition_number(&partition.path).ok_or_else(|| {
            CustomizerError::structural("cannot determine partition number")
                .with_path(&partition.path)
        })?;

        let tag = format!("{}_{}", basename, number);
        let raw = copy_block_device_to_file(Path::new(&partition.path), out_dir, &format!("{}.raw", tag))?;

        let uncompressed_size = fs::metadata(&raw)
            .map_err(|e| {
                CustomizerError::io("failed to stat file")
                    .with_path(&raw)
                    .with_source(e)
            })?
            .len();

        let file_path = match format {
            PartitionFormat::Raw => raw,
            PartitionFormat::RawZst => {
                let framed = compress_with_frame(&raw, out_dir, &tag, image_uuid, settings)
                    .with_context(|| format!("failed to compress partition {}", number))?;
                remove_intermediate(&raw)?;
                framed
            }
        };

        info!(log, "partition file created"; "path" => %file_path.display(), "partition" => number);

        output.push(PartitionMetadata {
            partition_num: number,
            filename: file_name(&file_path)?,
            partlabel: partition.partlabel.clone().unwrap_or_default(),
            fstype: partition.fstype.clone().unwrap_or_default(),
            parttype: partition.parttype.clone().unwrap_or_default(),
            uuid: partition.uuid.clone().unwrap_or_default(),
            partuuid: partition.partuuid.clone().unwrap_or_default(),
            mountpoint: partition.mountpoint.clone().unwrap_or_default(),
            uncompressed_size,
        });
    }

    Ok(output)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))
}

/// Copy the whole of `device` into `<out_dir>/<name>`.
pub fn copy_block_device_to_file(device: &Path, out_dir: &Path, name: &str) -> Result<PathBuf> {
    let dest = out_dir.join(name);
    let copy = || -> io::Result<()> {
        let mut src = File::open(device)?;
        let mut dst = BufWriter::with_capacity(1024 * 1024, File::create(&dest)?);
        io::copy(&mut src, &mut dst)?;
        dst.flush()
    };

    copy().map_err(|e| {
        CustomizerError::io(format!(
            "failed to copy block device (source='{}', destination='{}')",
            device.display(),
            dest.display()
        ))
        .with_source(e)
    })?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::zstd::{decompress_file, read_skippable_frame};
    use crate::logging;
    use tempfile::TempDir;

    const LSBLK: &str = r#"{
   "blockdevices": [
      {"name":"loop4", "path":"/dev/loop4", "type":"loop", "fstype":null, "uuid":null,
       "partuuid":null, "parttype":null, "partlabel":null, "mountpoint":null,
       "children": [
          {"name":"loop4p1", "path":"/dev/loop4p1", "type":"part", "fstype":"vfat",
           "uuid":"4BD9-3A78", "partuuid":"7b1367a6-5845-43f2-99b1-a742d873f590",
           "parttype":"c12a7328-f81f-11d2-ba4b-00a0c93ec93b", "partlabel":"esp",
           "mountpoint":null},
          {"name":"loop4p2", "path":"/dev/loop4p2", "type":"part", "fstype":"ext4",
           "uuid":"f0e1d2c3-0000-4000-8000-000000000001",
           "partuuid":"0d2c7d1e-2a8b-4b1c-9c62-6e0b0d4c3f11",
           "parttype":"4f68bce3-e8cd-4db1-96e7-fbcaf984b709", "partlabel":"rootfs",
           "mountpoint":null}
       ]}
   ]
}"#;

    #[test]
    fn flattens_lsblk_children() {
        let parts = parse_lsblk_json(LSBLK).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].path, "/dev/loop4p1");
        assert_eq!(parts[0].fstype.as_deref(), Some("vfat"));
        assert_eq!(parts[1].partlabel.as_deref(), Some("rootfs"));
    }

    #[test]
    fn partition_format_names() {
        assert_eq!("raw".parse::<PartitionFormat>().unwrap(), PartitionFormat::Raw);
        assert_eq!("raw-zst".parse::<PartitionFormat>().unwrap(), PartitionFormat::RawZst);
        assert!("qcow2".parse::<PartitionFormat>().is_err());
    }

    #[test]
    fn extracts_and_compresses_partitions() {
        let tmp = TempDir::new().unwrap();
        let dev_dir = tmp.path().join("dev");
        let out_dir = tmp.path().join("out");
        fs::create_dir_all(&dev_dir).unwrap();
        fs::create_dir_all(&out_dir).unwrap();

        let p1 = dev_dir.join("loop4p1");
        let p2 = dev_dir.join("loop4p2");
        fs::write(&p1, vec![0x11u8; 64 * 1024]).unwrap();
        fs::write(&p2, vec![0x22u8; 96 * 1024]).unwrap();

        let partitions = vec![
            BlockPartition {
                path: p1.display().to_string(),
                device_type: "part".to_string(),
                fstype: Some("vfat".to_string()),
                partuuid: Some("aaaa".to_string()),
                ..Default::default()
            },
            BlockPartition {
                path: p2.display().to_string(),
                device_type: "part".to_string(),
                fstype: Some("ext4".to_string()),
                uuid: Some("bbbb".to_string()),
                ..Default::default()
            },
        ];

        let uuid = [3u8; 16];
        let meta = extract_partition_files(
            &logging::discard(),
            &partitions,
            &out_dir,
            "image",
            PartitionFormat::RawZst,
            &uuid,
            CompressionSettings::default(),
        )
        .unwrap();

        assert_eq!(meta.len(), 2);
        assert_eq!(meta[0].partition_num, 1);
        assert_eq!(meta[0].filename, "image_1.raw.zst");
        assert_eq!(meta[0].uncompressed_size, 64 * 1024);
        assert_eq!(meta[1].filename, "image_2.raw.zst");
        assert_eq!(meta[1].uuid, "bbbb");
        assert!(!out_dir.join("image_1.raw").exists());
        assert!(!out_dir.join("image_2_temp.raw.zst").exists());

        let framed = out_dir.join("image_2.raw.zst");
        assert_eq!(read_skippable_frame(&framed).unwrap(), Some(uuid));
        let raw = tmp.path().join("check.raw");
        assert_eq!(decompress_file(&framed, &raw).unwrap(), 96 * 1024);
    }
}
