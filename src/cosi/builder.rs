//! COSI archive assembly.
//!
//! Layout of the produced tar (PAX-compatible ustar headers, mode 0400):
//!
//! ```text
//! metadata.json
//! images/<base>_<n>.raw.zst          data partition
//! images/<base>_<m>.raw.zst          its verity hash partition, if any
//! ...
//! images/<base>_gpt.raw.zst          disk regions not already written
//! ```

use anyhow::{Context, Result};
use sha2::{Digest, Sha384};
use slog::{info, Logger};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::metadata::{
    Compression, CosiBootloader, Disk, FileSystem, ImageFile, MetadataJson, OsPackage,
    VerityConfig, COSI_METADATA_VERSION,
};
use crate::digest::sha384_file;
use crate::disk::PartitionMetadata;
use crate::error::CustomizerError;

pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const IMAGES_DIR: &str = "images";
const ENTRY_MODE: u32 = 0o400;

/// A dm-verity pairing. Identifiers are a PARTUUID or a filesystem UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityDevice {
    pub name: String,
    pub root_hash: String,
    pub data_id: String,
    pub hash_id: String,
}

/// Image-wide facts recorded in `metadata.json`.
#[derive(Debug, Clone)]
pub struct CosiImageInfo {
    /// Hyphenated image UUID.
    pub id: String,
    pub os_arch: String,
    pub os_release: String,
    pub os_packages: Vec<OsPackage>,
    pub bootloader: CosiBootloader,
    pub disk: Option<Disk>,
    pub compression: Option<Compression>,
}

struct ImageBuildData {
    source: PathBuf,
    metadata: FileSystem,
    verity_source: Option<PathBuf>,
}

/// Stat and hash `source` into `image`. `image.path` and
/// `image.uncompressed_size` are left untouched.
pub fn populate_image_file(source: &Path, image: &mut ImageFile) -> Result<()> {
    let md = fs::metadata(source).map_err(|e| {
        CustomizerError::io("failed to stat image file")
            .with_path(source)
            .with_source(e)
    })?;
    if md.is_dir() {
        return Err(CustomizerError::io("image source is a directory")
            .with_path(source)
            .into());
    }
    image.compressed_size = md.len();

    let (sha384, _) = sha384_file(source)
        .with_context(|| format!("failed to calculate sha384 of {}", source.display()))?;
    image.sha384 = sha384;
    Ok(())
}

/// Archive path of an extracted file.
pub fn image_path(filename: &str) -> String {
    format!("{}/{}", IMAGES_DIR, filename)
}

/// Build the COSI archive at `output` from the extracted files in `source_dir`.
///
/// `mounts` maps a PARTUUID or filesystem UUID to its mount point. Verity
/// hash partitions are folded into their data partition's entry. On failure
/// the partially written `output` is removed.
pub fn build_cosi_file(
    log: &Logger,
    source_dir: &Path,
    output: &Path,
    partitions: &[PartitionMetadata],
    verity: &[VerityDevice],
    mounts: &BTreeMap<String, String>,
    info: CosiImageInfo,
) -> Result<MetadataJson> {
    let (metadata, image_data) =
        collect_images(log, source_dir, partitions, verity, mounts, info)?;

    if let Err(e) = write_archive(output, source_dir, &metadata, &image_data) {
        let _ = fs::remove_file(output);
        return Err(e.context(format!("failed to build COSI file {}", output.display())));
    }

    info!(log, "finished building COSI"; "path" => %output.display(), "images" => metadata.images.len());
    Ok(metadata)
}

fn collect_images(
    log: &Logger,
    source_dir: &Path,
    partitions: &[PartitionMetadata],
    verity: &[VerityDevice],
    mounts: &BTreeMap<String, String>,
    info: CosiImageInfo,
) -> Result<(MetadataJson, Vec<ImageBuildData>)> {
    let mut by_id: HashMap<&str, &PartitionMetadata> = HashMap::new();
    for p in partitions {
        for id in [p.partuuid.as_str(), p.uuid.as_str()] {
            if !id.is_empty() {
                by_id.insert(id, p);
            }
        }
    }

    let hash_partitions: HashSet<u32> = verity
        .iter()
        .filter_map(|v| by_id.get(v.hash_id.as_str()).map(|p| p.partition_num))
        .collect();

    let lookup = |map: &BTreeMap<String, String>, p: &PartitionMetadata| -> Option<String> {
        [p.partuuid.as_str(), p.uuid.as_str()]
            .iter()
            .filter(|id| !id.is_empty())
            .find_map(|id| map.get(*id).cloned())
    };

    let mut image_data = Vec::new();
    for partition in partitions {
        if hash_partitions.contains(&partition.partition_num) {
            continue;
        }

        let mount_point = match lookup(mounts, partition) {
            Some(m) if !m.is_empty() => m,
            _ => continue,
        };
        if partition.fstype.is_empty() {
            continue;
        }

        let mut data = ImageBuildData {
            source: source_dir.join(&partition.filename),
            metadata: FileSystem {
                image: ImageFile {
                    path: image_path(&partition.filename),
                    uncompressed_size: partition.uncompressed_size,
                    ..Default::default()
                },
                mount_point,
                fs_type: partition.fstype.clone(),
                fs_uuid: partition.uuid.clone(),
                part_type: partition.parttype.clone(),
                verity: None,
            },
            verity_source: None,
        };

        let pairing = verity.iter().find(|v| {
            (!partition.partuuid.is_empty() && v.data_id == partition.partuuid)
                || (!partition.uuid.is_empty() && v.data_id == partition.uuid)
        });
        if let Some(v) = pairing {
            let hash = by_id.get(v.hash_id.as_str()).ok_or_else(|| {
                CustomizerError::missing("missing metadata for verity hash partition")
                    .with_identifier(&v.hash_id)
            })?;
            data.metadata.verity = Some(VerityConfig {
                image: ImageFile {
                    path: image_path(&hash.filename),
                    uncompressed_size: hash.uncompressed_size,
                    ..Default::default()
                },
                roothash: v.root_hash.clone(),
            });
            data.verity_source = Some(source_dir.join(&hash.filename));
        }

        image_data.push(data);
    }

    for data in &mut image_data {
        populate_image_file(&data.source, &mut data.metadata.image).with_context(|| {
            format!("failed to populate COSI metadata (source='{}')", data.source.display())
        })?;
        if let (Some(source), Some(verity)) = (&data.verity_source, &mut data.metadata.verity) {
            populate_image_file(source, &mut verity.image)
                .context("failed to populate verity image metadata")?;
        }
        info!(log, "populated metadata for image"; "source" => %data.source.display());
    }

    let metadata = MetadataJson {
        version: COSI_METADATA_VERSION.to_string(),
        os_arch: info.os_arch,
        disk: info.disk,
        images: image_data.iter().map(|d| d.metadata.clone()).collect(),
        os_release: info.os_release,
        id: info.id,
        bootloader: info.bootloader,
        os_packages: info.os_packages,
        compression: info.compression,
    };

    Ok((metadata, image_data))
}

fn write_archive(
    output: &Path,
    source_dir: &Path,
    metadata: &MetadataJson,
    image_data: &[ImageBuildData],
) -> Result<()> {
    let json = serde_json::to_vec_pretty(metadata).context("failed to marshal COSI metadata")?;

    let file = File::create(output).map_err(|e| {
        CustomizerError::io("failed to create COSI file")
            .with_path(output)
            .with_source(e)
    })?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let mut header = entry_header(json.len() as u64);
    builder
        .append_data(&mut header, METADATA_FILE_NAME, &json[..])
        .context("failed to write metadata.json to COSI")?;

    let mut written: HashSet<&str> = HashSet::new();
    for data in image_data {
        append_image(&mut builder, &data.source, &data.metadata.image)?;
        written.insert(&data.metadata.image.path);
        if let (Some(source), Some(verity)) = (&data.verity_source, &data.metadata.verity) {
            append_image(&mut builder, source, &verity.image)
                .context("failed to add verity file to COSI")?;
            written.insert(&verity.image.path);
        }
    }

    if let Some(disk) = &metadata.disk {
        for region in &disk.gpt_regions {
            if written.contains(region.image.path.as_str()) {
                continue;
            }
            let name = region
                .image
                .path
                .strip_prefix(&format!("{}/", IMAGES_DIR))
                .unwrap_or(&region.image.path);
            append_image(&mut builder, &source_dir.join(name), &region.image)?;
            written.insert(&region.image.path);
        }
    }

    let mut inner = builder
        .into_inner()
        .context("failed to finalize COSI tar writer")?;
    inner
        .flush()
        .with_context(|| format!("failed to flush {}", output.display()))?;
    Ok(())
}

fn entry_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(ENTRY_MODE);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_image<W: Write>(builder: &mut tar::Builder<W>, source: &Path, image: &ImageFile) -> Result<()> {
    let f = File::open(source).map_err(|e| {
        CustomizerError::io("failed to open image file")
            .with_path(source)
            .with_source(e)
    })?;
    let mut header = entry_header(image.compressed_size);
    builder
        .append_data(&mut header, &image.path, f.take(image.compressed_size))
        .with_context(|| format!("failed to write image '{}' to COSI", image.path))?;
    Ok(())
}

/// Recompute the SHA-384 of every archive entry and compare it with the
/// metadata. Returns the number of images checked.
pub fn verify_cosi_file(path: &Path) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(file);

    let mut metadata: Option<MetadataJson> = None;
    let mut digests: HashMap<String, (String, u64)> = HashMap::new();

    for (index, entry) in archive.entries()?.enumerate() {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if index == 0 {
            if name != METADATA_FILE_NAME {
                return Err(CustomizerError::structural("first COSI entry is not metadata.json")
                    .with_path(path)
                    .with_identifier(name)
                    .into());
            }
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            metadata = Some(serde_json::from_slice(&buf).context("invalid metadata.json")?);
            continue;
        }

        let mut hasher = Sha384::new();
        let size = std::io::copy(&mut entry, &mut hasher)?;
        let hex = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        digests.insert(name, (hex, size));
    }

    let metadata = metadata.ok_or_else(|| {
        CustomizerError::structural("empty COSI archive").with_path(path)
    })?;

    let mut images: Vec<&ImageFile> = Vec::new();
    for fs in &metadata.images {
        images.push(&fs.image);
        if let Some(v) = &fs.verity {
            images.push(&v.image);
        }
    }
    if let Some(disk) = &metadata.disk {
        images.extend(disk.gpt_regions.iter().map(|r| &r.image));
    }

    for image in &images {
        let (sha, size) = digests.get(&image.path).ok_or_else(|| {
            CustomizerError::missing("image listed in metadata is not in the archive")
                .with_identifier(&image.path)
        })?;
        if *sha != image.sha384 || *size != image.compressed_size {
            return Err(CustomizerError::structural("COSI entry does not match its metadata")
                .with_identifier(&image.path)
                .into());
        }
    }

    Ok(images.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosi::metadata::{BootloaderType, DiskType, GptDiskRegion, RegionType};
    use crate::error::{kind_of, ErrorKind};
    use crate::logging;
    use tempfile::TempDir;

    fn partition(num: u32, fstype: &str, partuuid: &str, uuid: &str) -> PartitionMetadata {
        PartitionMetadata {
            partition_num: num,
            filename: format!("image_{}.raw.zst", num),
            fstype: fstype.to_string(),
            partuuid: partuuid.to_string(),
            uuid: uuid.to_string(),
            parttype: "0fc63daf-8483-4772-8e79-3d69d8477de4".to_string(),
            uncompressed_size: 1 << 20,
            ..Default::default()
        }
    }

    fn info() -> CosiImageInfo {
        CosiImageInfo {
            id: "0b6e7d31-3b5f-4a55-9b0d-8d7c4b7c2f10".to_string(),
            os_arch: "x86_64".to_string(),
            os_release: "NAME=\"Azure Linux\"\n".to_string(),
            os_packages: vec![],
            bootloader: CosiBootloader {
                bootloader_type: BootloaderType::Grub,
                systemd_boot: None,
            },
            disk: None,
            compression: Some(Compression { max_window_log: 27 }),
        }
    }

    /// esp (1), verity-protected root (2), root hash tree (3), unmounted data (4).
    fn fixture(dir: &Path) -> (Vec<PartitionMetadata>, Vec<VerityDevice>, BTreeMap<String, String>) {
        let partitions = vec![
            partition(1, "vfat", "p-esp", "4BD9-3A78"),
            partition(2, "ext4", "p-root", "fs-root"),
            partition(3, "", "p-hash", ""),
            partition(4, "ext4", "p-data", "fs-data"),
        ];
        for (i, p) in partitions.iter().enumerate() {
            fs::write(dir.join(&p.filename), vec![i as u8 + 1; 1000 * (i + 1)]).unwrap();
        }
        let verity = vec![VerityDevice {
            name: "root".to_string(),
            root_hash: "a1b2c3".to_string(),
            data_id: "fs-root".to_string(),
            hash_id: "p-hash".to_string(),
        }];
        let mut mounts = BTreeMap::new();
        mounts.insert("p-esp".to_string(), "/boot/efi".to_string());
        mounts.insert("fs-root".to_string(), "/".to_string());
        (partitions, verity, mounts)
    }

    #[test]
    fn verity_hash_is_folded_into_data_partition() {
        let tmp = TempDir::new().unwrap();
        let (partitions, verity, mounts) = fixture(tmp.path());
        let output = tmp.path().join("image.cosi");

        let metadata = build_cosi_file(
            &logging::discard(),
            tmp.path(),
            &output,
            &partitions,
            &verity,
            &mounts,
            info(),
        )
        .unwrap();

        assert_eq!(metadata.images.len(), 2);
        assert!(metadata
            .images
            .iter()
            .all(|fs| fs.image.path != "images/image_3.raw.zst"));

        let root = &metadata.images[1];
        assert_eq!(root.mount_point, "/");
        let v = root.verity.as_ref().unwrap();
        assert_eq!(v.image.path, "images/image_3.raw.zst");
        assert_eq!(v.roothash, "a1b2c3");
        assert_eq!(v.image.compressed_size, 3000);

        let hash_refs = metadata.images.iter().filter(|fs| fs.verity.is_some()).count();
        assert_eq!(metadata.images.len() + hash_refs, 3);
        assert_eq!(verify_cosi_file(&output).unwrap(), 3);
    }

    #[test]
    fn archive_is_self_consistent_with_disk_regions() {
        let tmp = TempDir::new().unwrap();
        let (partitions, verity, mounts) = fixture(tmp.path());
        fs::write(tmp.path().join("image_gpt.raw.zst"), b"gpt-bytes").unwrap();

        let mut regions = vec![GptDiskRegion {
            image: ImageFile {
                path: image_path("image_gpt.raw.zst"),
                uncompressed_size: 17408,
                ..Default::default()
            },
            region_type: RegionType::PrimaryGpt,
            start_lba: None,
            number: None,
        }];
        populate_image_file(&tmp.path().join("image_gpt.raw.zst"), &mut regions[0].image).unwrap();
        for p in &partitions {
            let mut image = ImageFile {
                path: image_path(&p.filename),
                uncompressed_size: p.uncompressed_size,
                ..Default::default()
            };
            populate_image_file(&tmp.path().join(&p.filename), &mut image).unwrap();
            regions.push(GptDiskRegion {
                image,
                region_type: RegionType::Partition,
                start_lba: Some(2048 * p.partition_num as u64),
                number: Some(p.partition_num),
            });
        }

        let mut info = info();
        info.disk = Some(Disk {
            size: 64 << 20,
            disk_type: DiskType::Gpt,
            lba_size: 512,
            gpt_regions: regions,
        });

        let output = tmp.path().join("image.cosi");
        build_cosi_file(&logging::discard(), tmp.path(), &output, &partitions, &verity, &mounts, info)
            .unwrap();

        // 2 filesystems + 1 verity + 5 regions
        assert_eq!(verify_cosi_file(&output).unwrap(), 8);

        let mut archive = tar::Archive::new(File::open(&output).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names[0], "metadata.json");
        assert_eq!(names.len(), 1 + 4 + 1);
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn missing_hash_partition_is_named() {
        let tmp = TempDir::new().unwrap();
        let (partitions, mut verity, mounts) = fixture(tmp.path());
        verity[0].hash_id = "p-gone".to_string();
        let output = tmp.path().join("image.cosi");

        let err = build_cosi_file(
            &logging::discard(),
            tmp.path(),
            &output,
            &partitions,
            &verity,
            &mounts,
            info(),
        )
        .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::MissingArtifact));
        assert!(format!("{:#}", err).contains("p-gone"));
        assert!(!output.exists());
    }

    #[test]
    fn directory_source_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut image = ImageFile::default();
        let err = populate_image_file(tmp.path(), &mut image).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Io));
    }

    #[test]
    fn unreadable_image_removes_partial_output() {
        let tmp = TempDir::new().unwrap();
        let (partitions, verity, mounts) = fixture(tmp.path());
        let output = tmp.path().join("image.cosi");

        let mut info = info();
        info.disk = Some(Disk {
            size: 1,
            disk_type: DiskType::Gpt,
            lba_size: 512,
            gpt_regions: vec![GptDiskRegion {
                image: ImageFile {
                    path: image_path("absent_gpt.raw.zst"),
                    ..Default::default()
                },
                region_type: RegionType::PrimaryGpt,
                start_lba: None,
                number: None,
            }],
        });

        assert!(build_cosi_file(
            &logging::discard(),
            tmp.path(),
            &output,
            &partitions,
            &verity,
            &mounts,
            info,
        )
        .is_err());
        assert!(!output.exists());
    }
}
