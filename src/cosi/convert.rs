//! Raw disk image to COSI conversion.
//!
//! ```text
//! raw image ─► loop device ─► <base>_gpt.raw.zst       (partition table)
//!                           ─► <base>_<n>.raw.zst       (every partition)
//!                           ─► read-only mount of the OS (fstab, os-release,
//!                                                         packages, bootloader)
//!           ─► <output>.cosi  (metadata.json + images/)
//! ```
//!
//! Everything acquired along the way (work directory, loop device, mounts) is
//! released in reverse order, and release failures are joined onto the
//! conversion result.

use anyhow::{Context, Result};
use slog::{debug, info, Logger};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::bootloader::extract_cosi_boot_metadata;
use super::builder::{build_cosi_file, image_path, populate_image_file, CosiImageInfo, VerityDevice};
use super::metadata::{cosi_arch, Compression, CosiBootloader, ImageFile, MetadataJson, OsPackage};
use crate::disk::{
    build_disk_metadata, extract_gpt_data, extract_partitions, CompressionSettings,
    PartitionFormat, PartitionMetadata,
};
use crate::distro;
use crate::error::CustomizerError;
use crate::resources::loopback::partition_node;
use crate::resources::{CleanupStack, Loopback, Mount, OwnedFile, ScratchDir};

/// Directory under the build dir receiving extracted images.
pub const COSI_IMAGES_DIR: &str = "cosiimages";
const ROOTFS_MOUNT_DIR: &str = "cosi-rootfs";
const SCRATCH_DIR: &str = "cosi-scratch";

/// Filesystems never probed for an OS root.
const NON_ROOT_FSTYPES: &[&str] = &["vfat", "swap", ""];

/// Inputs of [`convert_to_cosi`].
#[derive(Debug, Clone)]
pub struct CosiConvertOptions {
    pub raw_image: PathBuf,
    pub output: PathBuf,
    pub build_dir: PathBuf,
    pub image_uuid: Uuid,
    pub compression: CompressionSettings,
    pub verity: Vec<VerityDevice>,
}

/// One line of `/etc/fstab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: String,
}

/// Parse fstab content. Comments, blank lines and `none`/swap targets are dropped.
pub fn parse_fstab(content: &str) -> Vec<FstabEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let target = fields[1];
            if !target.starts_with('/') {
                return None;
            }
            Some(FstabEntry {
                source: fields[0].to_string(),
                target: target.to_string(),
                fstype: fields[2].to_string(),
                options: fields.get(3).copied().unwrap_or("defaults").to_string(),
            })
        })
        .collect()
}

/// Partition an fstab source field refers to.
fn find_partition<'a>(
    source: &str,
    partitions: &'a [PartitionMetadata],
) -> Option<&'a PartitionMetadata> {
    let (key, value) = source.split_once('=').unwrap_or(("", source));
    let value = value.trim_matches('"');
    partitions.iter().find(|p| match key {
        "PARTUUID" => p.partuuid.eq_ignore_ascii_case(value),
        "UUID" => p.uuid.eq_ignore_ascii_case(value),
        "PARTLABEL" => p.partlabel == value,
        _ => false,
    })
}

/// Map each partition identifier (PARTUUID, else filesystem UUID) to the
/// mount point fstab assigns it.
pub fn mounts_from_fstab(
    entries: &[FstabEntry],
    partitions: &[PartitionMetadata],
) -> BTreeMap<String, String> {
    let mut mounts = BTreeMap::new();
    for entry in entries {
        if let Some(p) = find_partition(&entry.source, partitions) {
            let id = if p.partuuid.is_empty() { &p.uuid } else { &p.partuuid };
            if !id.is_empty() {
                mounts.insert(id.clone(), entry.target.clone());
            }
        }
    }
    mounts
}

/// OS facts read from the mounted image.
struct OsInfo {
    mounts: BTreeMap<String, String>,
    os_release: String,
    os_packages: Vec<OsPackage>,
    bootloader: CosiBootloader,
}

/// Mount the OS read-only and read what `metadata.json` needs.
fn read_os_info(
    log: &Logger,
    loopback_device: &Path,
    partitions: &[PartitionMetadata],
    build_dir: &Path,
    stack: &mut CleanupStack,
) -> Result<OsInfo> {
    let root = build_dir.join(ROOTFS_MOUNT_DIR);
    // Pushed before any mount so it is removed after the last unmount.
    stack.push(ScratchDir::create_output_dir(log, &root)?);
    let node = |p: &PartitionMetadata| partition_node(loopback_device, p.partition_num);

    let mut fstab = None;
    for partition in partitions {
        if NON_ROOT_FSTYPES.contains(&partition.fstype.as_str()) {
            continue;
        }
        let mount = match Mount::new(log, &node(partition), &root, Some(&partition.fstype), &["ro"]) {
            Ok(m) => m,
            Err(e) => {
                debug!(log, "partition not mountable"; "partition" => partition.partition_num, "error" => format!("{:#}", e));
                continue;
            }
        };
        match std::fs::read_to_string(root.join("etc/fstab")) {
            Ok(content) => {
                stack.push(mount);
                fstab = Some(content);
                break;
            }
            Err(_) => mount.close()?,
        }
    }
    let fstab = fstab.ok_or_else(|| {
        CustomizerError::missing("failed to find a partition containing /etc/fstab")
            .with_path(loopback_device)
    })?;

    let entries = parse_fstab(&fstab);
    let mounts = mounts_from_fstab(&entries, partitions);

    let mut nested: Vec<&FstabEntry> = entries
        .iter()
        .filter(|e| e.target != "/" && e.target.starts_with("/boot"))
        .collect();
    nested.sort_by_key(|e| e.target.matches('/').count());
    for entry in nested {
        if let Some(p) = find_partition(&entry.source, partitions) {
            let target = root.join(entry.target.trim_start_matches('/'));
            let mount = Mount::new(log, &node(p), &target, Some(&p.fstype), &["ro"])?;
            stack.push(mount);
        }
    }

    let scratch = ScratchDir::create(log, build_dir.join(SCRATCH_DIR))?;
    let scratch_path = scratch.path().to_path_buf();
    stack.push(scratch);

    let os_release = distro::read_os_release(&root)?;
    let handler = distro::handler_from_os_release(&os_release)?;
    info!(log, "detected distribution"; "name" => handler.name(), "version" => handler.version());

    let os_packages = handler
        .get_all_packages(&root)
        .context("failed to get installed packages")?;
    let bootloader =
        extract_cosi_boot_metadata(log, &root, &scratch_path, handler.as_ref())?;

    Ok(OsInfo {
        mounts,
        os_release,
        os_packages,
        bootloader,
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Convert a raw disk image into a COSI archive.
pub fn convert_to_cosi(log: &Logger, options: &CosiConvertOptions) -> Result<MetadataJson> {
    let mut stack = CleanupStack::new(log.clone());
    let result = convert_inner(log, options, &mut stack);
    stack
        .finish(result)
        .with_context(|| format!("failed to convert {} to COSI", options.raw_image.display()))
}

fn convert_inner(
    log: &Logger,
    options: &CosiConvertOptions,
    stack: &mut CleanupStack,
) -> Result<MetadataJson> {
    let basename = file_stem(&options.output);
    let uuid_bytes = *options.image_uuid.as_bytes();

    let out_dir = ScratchDir::create_output_dir(log, options.build_dir.join(COSI_IMAGES_DIR))?;
    let out_path = out_dir.path().to_path_buf();
    stack.push(out_dir);

    let loopback = Loopback::attach(log, &options.raw_image)?;
    let device = loopback.device_path().to_path_buf();
    stack.push(loopback);

    let gpt = extract_gpt_data(
        log,
        &device,
        &options.raw_image,
        &out_path,
        &basename,
        &uuid_bytes,
        options.compression,
    )?;
    stack.push(OwnedFile::new(log, &gpt.compressed_file_path));
    let partitions = extract_partitions(
        log,
        &device,
        &out_path,
        &basename,
        PartitionFormat::RawZst,
        &uuid_bytes,
        options.compression,
    )?;
    for p in &partitions {
        stack.push(OwnedFile::new(log, out_path.join(&p.filename)));
    }

    let mut gpt_image = ImageFile {
        path: image_path(&file_name(&gpt.compressed_file_path)),
        uncompressed_size: gpt.uncompressed_size,
        ..Default::default()
    };
    populate_image_file(&gpt.compressed_file_path, &mut gpt_image)?;

    let mut partition_images = BTreeMap::new();
    for p in &partitions {
        let mut image = ImageFile {
            path: image_path(&p.filename),
            uncompressed_size: p.uncompressed_size,
            ..Default::default()
        };
        populate_image_file(&out_path.join(&p.filename), &mut image)?;
        partition_images.insert(p.partition_num, image);
    }
    let disk = build_disk_metadata(&gpt, gpt_image, &partition_images);

    let os = read_os_info(log, &device, &partitions, &options.build_dir, stack)?;

    let info = CosiImageInfo {
        id: options.image_uuid.hyphenated().to_string(),
        os_arch: cosi_arch(std::env::consts::ARCH).to_string(),
        os_release: os.os_release,
        os_packages: os.os_packages,
        bootloader: os.bootloader,
        disk: Some(disk),
        compression: Some(Compression {
            max_window_log: options.compression.long,
        }),
    };

    let metadata = build_cosi_file(
        log,
        &out_path,
        &options.output,
        &partitions,
        &options.verity,
        &os.mounts,
        info,
    )?;
    info!(log, "successfully converted to COSI"; "path" => %options.output.display());
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FSTAB: &str = "\
# /etc/fstab
PARTUUID=7b1367a6-5845-43f2-99b1-a742d873f590  /boot/efi  vfat  umask=0077  0 2
UUID=F0E1D2C3-0000-4000-8000-000000000001      /          ext4  defaults    0 1
PARTLABEL=var                                   /var       xfs   defaults    0 2
/dev/sda4                                       none       swap  sw          0 0
tmpfs                                           /tmp       tmpfs defaults    0 0
";

    fn partitions() -> Vec<PartitionMetadata> {
        vec![
            PartitionMetadata {
                partition_num: 1,
                filename: "disk_1.raw.zst".to_string(),
                fstype: "vfat".to_string(),
                partuuid: "7b1367a6-5845-43f2-99b1-a742d873f590".to_string(),
                ..Default::default()
            },
            PartitionMetadata {
                partition_num: 2,
                filename: "disk_2.raw.zst".to_string(),
                fstype: "ext4".to_string(),
                uuid: "f0e1d2c3-0000-4000-8000-000000000001".to_string(),
                ..Default::default()
            },
            PartitionMetadata {
                partition_num: 3,
                filename: "disk_3.raw.zst".to_string(),
                fstype: "xfs".to_string(),
                partlabel: "var".to_string(),
                partuuid: "0d2c7d1e-2a8b-4b1c-9c62-6e0b0d4c3f11".to_string(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn fstab_parsing() {
        let entries = parse_fstab(FSTAB);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].target, "/boot/efi");
        assert_eq!(entries[0].options, "umask=0077");
        assert_eq!(entries[3].fstype, "tmpfs");
    }

    #[test]
    fn mounts_keyed_by_identifier() {
        let mounts = mounts_from_fstab(&parse_fstab(FSTAB), &partitions());
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts["7b1367a6-5845-43f2-99b1-a742d873f590"], "/boot/efi");
        assert_eq!(mounts["f0e1d2c3-0000-4000-8000-000000000001"], "/");
        assert_eq!(mounts["0d2c7d1e-2a8b-4b1c-9c62-6e0b0d4c3f11"], "/var");
    }

    #[test]
    fn output_basename() {
        assert_eq!(file_stem(Path::new("/out/azl3.cosi")), "azl3");
        assert_eq!(file_name(Path::new("/w/azl3_gpt.raw.zst")), "azl3_gpt.raw.zst");
    }
}
