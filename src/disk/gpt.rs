//! Primary GPT (or MBR) extraction.
//!
//! The COSI archive carries the partition table region of the source disk
//! as its own compressed image so the disk can be reassembled byte-exact.
//! For GPT that region runs from LBA 0 through the end of the partition
//! entry array; the array's location and size come from the header at LBA 1.

use anyhow::{Context, Result};
use slog::{debug, info, warn, Logger};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::table::{self, PartitionTable, DEFAULT_SECTOR_SIZE};
use super::zstd::{compress_with_frame, remove_intermediate, CompressionSettings};
use crate::cosi::metadata::{Disk, DiskType, GptDiskRegion, ImageFile, RegionType};
use crate::error::CustomizerError;

pub const GPT_HEADER_LBA: u64 = 1;
/// Bytes of the header that carry fields (the rest of the sector is reserved).
pub const GPT_HEADER_SIZE: usize = 92;
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

const DEFAULT_GPT_ENTRIES_START_LBA: u64 = 2;
const DEFAULT_GPT_PARTITION_ENTRY_LBAS: u64 = 32;

/// UEFI GPT header, little-endian on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub number_of_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

struct LeCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LeCursor<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

impl GptHeader {
    /// Parse the first [`GPT_HEADER_SIZE`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GPT_HEADER_SIZE {
            return Err(CustomizerError::structural(format!(
                "GPT header needs {} bytes, got {}",
                GPT_HEADER_SIZE,
                bytes.len()
            ))
            .into());
        }

        let mut c = LeCursor { buf: bytes, pos: 0 };
        Ok(Self {
            signature: c.take(),
            revision: c.u32(),
            header_size: c.u32(),
            header_crc32: c.u32(),
            reserved: c.u32(),
            my_lba: c.u64(),
            alternate_lba: c.u64(),
            first_usable_lba: c.u64(),
            last_usable_lba: c.u64(),
            disk_guid: c.take(),
            partition_entry_lba: c.u64(),
            number_of_partition_entries: c.u32(),
            size_of_partition_entry: c.u32(),
            partition_entry_array_crc32: c.u32(),
        })
    }

    pub fn encode(&self) -> [u8; GPT_HEADER_SIZE] {
        let mut out = [0u8; GPT_HEADER_SIZE];
        let mut pos = 0;
        let mut put = |bytes: &[u8]| {
            out[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        put(&self.signature);
        put(&self.revision.to_le_bytes());
        put(&self.header_size.to_le_bytes());
        put(&self.header_crc32.to_le_bytes());
        put(&self.reserved.to_le_bytes());
        put(&self.my_lba.to_le_bytes());
        put(&self.alternate_lba.to_le_bytes());
        put(&self.first_usable_lba.to_le_bytes());
        put(&self.last_usable_lba.to_le_bytes());
        put(&self.disk_guid);
        put(&self.partition_entry_lba.to_le_bytes());
        put(&self.number_of_partition_entries.to_le_bytes());
        put(&self.size_of_partition_entry.to_le_bytes());
        put(&self.partition_entry_array_crc32.to_le_bytes());
        out
    }

    pub fn has_valid_signature(&self) -> bool {
        &self.signature == GPT_SIGNATURE
    }

    /// Byte offset just past the partition entry array.
    pub fn end_offset(&self, sector_size: u64) -> Result<u64> {
        if self.number_of_partition_entries == 0 || self.size_of_partition_entry == 0 {
            return Err(CustomizerError::structural(format!(
                "invalid GPT header: numPartitionEntries={}, partitionEntrySize={}",
                self.number_of_partition_entries, self.size_of_partition_entry
            ))
            .into());
        }
        let array_size =
            self.number_of_partition_entries as u64 * self.size_of_partition_entry as u64;
        self.partition_entry_lba
            .checked_mul(sector_size)
            .and_then(|start| start.checked_add(array_size))
            .ok_or_else(|| {
                CustomizerError::structural(format!(
                    "invalid GPT header: partition entry array at LBA {} overflows",
                    self.partition_entry_lba
                ))
                .into()
            })
    }
}

/// Read the GPT header at LBA 1 and return the end of the entry array.
pub fn read_gpt_end_offset(device: &Path, sector_size: u64) -> Result<u64> {
    let mut f = File::open(device)
        .with_context(|| format!("Failed to open disk device {}", device.display()))?;
    f.seek(SeekFrom::Start(GPT_HEADER_LBA * sector_size))
        .context("Failed to seek to GPT header")?;

    let mut buf = [0u8; GPT_HEADER_SIZE];
    f.read_exact(&mut buf).map_err(|e| {
        CustomizerError::structural("failed to read GPT header")
            .with_path(device)
            .with_source(e)
    })?;

    let header = GptHeader::parse(&buf)?;
    header
        .end_offset(sector_size)
        .map_err(|e| e.context(format!("reading {}", device.display())))
}

/// Round `bytes` up to a whole number of sectors.
pub fn round_up_to_sector(bytes: u64, sector_size: u64) -> u64 {
    bytes.div_ceil(sector_size).saturating_mul(sector_size)
}

/// Copy `count` sectors starting at `start` from `device` into `output`.
pub fn extract_sectors(
    device: &Path,
    output: &Path,
    sector_size: u64,
    start: u64,
    count: u64,
) -> Result<()> {
    let mut src = File::open(device)
        .with_context(|| format!("Failed to open source device ({})", device.display()))?;
    let offset = start.saturating_mul(sector_size);
    src.seek(SeekFrom::Start(offset))
        .with_context(|| format!("Failed to seek to offset {}", offset))?;

    let mut dst = File::create(output)
        .with_context(|| format!("Failed to create output file ({})", output.display()))?;

    let bytes = count.saturating_mul(sector_size);
    io::copy(&mut src.take(bytes), &mut dst)
        .with_context(|| format!("Failed to copy {} bytes from {}", bytes, device.display()))?;
    Ok(())
}

/// Result of partition table extraction.
#[derive(Debug, Clone)]
pub struct GptExtractedData {
    pub compressed_file_path: PathBuf,
    /// Exact length of the table region (un-rounded for GPT).
    pub uncompressed_size: u64,
    pub partition_table: PartitionTable,
    pub disk_size: u64,
    /// Sector size used for extraction; sfdisk's value or
    /// [`DEFAULT_SECTOR_SIZE`] when it reports none.
    pub sector_size: u64,
}

/// Extract and compress the partition table region of `device`.
///
/// `raw_image_file` is the image backing the device; its size becomes the
/// disk size recorded in the metadata.
pub fn extract_gpt_data(
    log: &Logger,
    device: &Path,
    raw_image_file: &Path,
    out_dir: &Path,
    basename: &str,
    image_uuid: &[u8; 16],
    settings: CompressionSettings,
) -> Result<GptExtractedData> {
    let partition_table = table::read_partition_table(device)
        .with_context(|| format!("failed to read partition table (device='{}')", device.display()))?
        .ok_or_else(|| CustomizerError::structural("no partition table found").with_path(device))?;

    let disk_size = fs::metadata(raw_image_file)
        .with_context(|| {
            format!("failed to stat disk image file ({})", raw_image_file.display())
        })?
        .len();

    extract_table_region(
        log,
        device,
        partition_table,
        disk_size,
        out_dir,
        basename,
        image_uuid,
        settings,
    )
}

/// Extraction given an already-read partition table.
#[allow(clippy::too_many_arguments)]
pub fn extract_table_region(
    log: &Logger,
    device: &Path,
    partition_table: PartitionTable,
    disk_size: u64,
    out_dir: &Path,
    basename: &str,
    image_uuid: &[u8; 16],
    settings: CompressionSettings,
) -> Result<GptExtractedData> {
    info!(log, "detected partition table"; "type" => &partition_table.label);

    let sector_size = if partition_table.sector_size == 0 {
        DEFAULT_SECTOR_SIZE
    } else {
        partition_table.sector_size
    };

    let (raw_file, uncompressed_size) = match partition_table.label.as_str() {
        "gpt" => extract_primary_gpt(log, device, out_dir, basename, sector_size)?,
        "dos" => {
            let raw = out_dir.join(format!("{}_mbr.raw", basename));
            extract_sectors(device, &raw, sector_size, 0, 1).context("failed to extract MBR")?;
            (raw, sector_size)
        }
        other => {
            return Err(CustomizerError::structural("unsupported partition table type")
                .with_identifier(other)
                .with_path(device)
                .into())
        }
    };

    let tag = format!("{}_gpt", basename);
    let compressed_file_path = compress_with_frame(&raw_file, out_dir, &tag, image_uuid, settings)
        .context("failed to compress GPT data")?;
    remove_intermediate(&raw_file)?;

    info!(log, "partition table extracted and compressed";
        "path" => %compressed_file_path.display(),
        "uncompressed_size" => uncompressed_size);

    Ok(GptExtractedData {
        compressed_file_path,
        uncompressed_size,
        partition_table,
        disk_size,
        sector_size,
    })
}

fn extract_primary_gpt(
    log: &Logger,
    device: &Path,
    out_dir: &Path,
    basename: &str,
    sector_size: u64,
) -> Result<(PathBuf, u64)> {
    let end = match read_gpt_end_offset(device, sector_size) {
        Ok(end) => end,
        Err(e) => {
            warn!(log, "failed to read GPT header, using default 34 sectors"; "error" => format!("{:#}", e));
            (DEFAULT_GPT_ENTRIES_START_LBA + DEFAULT_GPT_PARTITION_ENTRY_LBAS) * sector_size
        }
    };

    let rounded = round_up_to_sector(end, sector_size);
    let sectors = rounded / sector_size;

    let raw = out_dir.join(format!("{}_gpt.raw", basename));
    extract_sectors(device, &raw, sector_size, 0, sectors)
        .context("failed to extract primary GPT")?;

    debug!(log, "extracted primary GPT"; "bytes" => end, "sectors" => sectors);
    Ok((raw, end))
}

/// Disk layout description for `metadata.json`.
///
/// The primary GPT region comes first, then one region per partition in
/// ascending partition number. Partitions missing from `partition_images`
/// are not described.
pub fn build_disk_metadata(
    gpt_data: &GptExtractedData,
    gpt_image: ImageFile,
    partition_images: &BTreeMap<u32, ImageFile>,
) -> Disk {
    let mut regions = vec![GptDiskRegion {
        image: gpt_image,
        region_type: RegionType::PrimaryGpt,
        start_lba: None,
        number: None,
    }];

    let mut partitions: Vec<_> = gpt_data
        .partition_table
        .partitions
        .iter()
        .filter_map(|p| p.number().map(|n| (n, p.start)))
        .collect();
    partitions.sort_by_key(|(n, _)| *n);

    for (number, start) in partitions {
        if let Some(image) = partition_images.get(&number) {
            regions.push(GptDiskRegion {
                image: image.clone(),
                region_type: RegionType::Partition,
                start_lba: Some(start),
                number: Some(number),
            });
        }
    }

    Disk {
        size: gpt_data.disk_size,
        disk_type: DiskType::Gpt,
        lba_size: gpt_data.sector_size,
        gpt_regions: regions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::table::TablePartition;
    use crate::disk::zstd::decompress_file;
    use crate::error::{kind_of, ErrorKind};
    use crate::logging;
    use std::io::Write;
    use tempfile::TempDir;

    const UUID: [u8; 16] = [7u8; 16];

    fn header(entries: u32, entry_size: u32) -> GptHeader {
        GptHeader {
            signature: *GPT_SIGNATURE,
            revision: 0x0001_0000,
            header_size: 92,
            header_crc32: 0xdead_beef,
            reserved: 0,
            my_lba: 1,
            alternate_lba: 8191,
            first_usable_lba: 34,
            last_usable_lba: 8158,
            disk_guid: [0xab; 16],
            partition_entry_lba: 2,
            number_of_partition_entries: entries,
            size_of_partition_entry: entry_size,
            partition_entry_array_crc32: 0x1234_5678,
        }
    }

    /// Disk image with a patterned body and `hdr` at LBA 1.
    fn write_disk(path: &Path, hdr: &GptHeader, total: usize) {
        let mut bytes: Vec<u8> = (0..total).map(|i| (i % 253) as u8).collect();
        bytes[512..512 + GPT_HEADER_SIZE].copy_from_slice(&hdr.encode());
        let mut f = File::create(path).unwrap();
        f.write_all(&bytes).unwrap();
    }

    fn table(label: &str) -> PartitionTable {
        PartitionTable {
            label: label.to_string(),
            device: "/dev/loop9".to_string(),
            sector_size: 512,
            partitions: vec![
                TablePartition {
                    node: "/dev/loop9p2".to_string(),
                    start: 4096,
                    size: 2048,
                    part_type: "4f68bce3-e8cd-4db1-96e7-fbcaf984b709".to_string(),
                    uuid: Some("22".to_string()),
                    name: Some("rootfs".to_string()),
                },
                TablePartition {
                    node: "/dev/loop9p1".to_string(),
                    start: 2048,
                    size: 2048,
                    part_type: "c12a7328-f81f-11d2-ba4b-00a0c93ec93b".to_string(),
                    uuid: Some("11".to_string()),
                    name: Some("esp".to_string()),
                },
                TablePartition {
                    node: "/dev/loop9p3".to_string(),
                    start: 6144,
                    size: 2048,
                    part_type: "0fc63daf-8483-4772-8e79-3d69d8477de4".to_string(),
                    uuid: Some("33".to_string()),
                    name: None,
                },
            ],
        }
    }

    #[test]
    fn header_round_trip() {
        let hdr = header(128, 128);
        let encoded = hdr.encode();
        let parsed = GptHeader::parse(&encoded).unwrap();
        assert_eq!(parsed, hdr);
        assert!(parsed.has_valid_signature());
        assert_eq!(parsed.end_offset(512).unwrap(), 2 * 512 + 128 * 128);
    }

    #[test]
    fn short_header_is_structural() {
        let err = GptHeader::parse(&[0u8; 40]).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::StructuralParse));
    }

    #[test]
    fn end_offset_from_device() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        write_disk(&disk, &header(3, 128), 8192);
        assert_eq!(read_gpt_end_offset(&disk, 512).unwrap(), 1024 + 384);
    }

    #[test]
    fn overflowing_header_is_structural() {
        let mut hdr = header(128, 128);
        hdr.partition_entry_lba = u64::MAX / 2;
        let err = hdr.end_offset(512).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::StructuralParse));

        hdr.partition_entry_lba = u64::MAX / 512;
        let err = hdr.end_offset(512).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::StructuralParse));
    }

    #[test]
    fn overflowing_header_falls_back_to_34_sectors() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        let mut hdr = header(128, 128);
        hdr.partition_entry_lba = u64::MAX;
        write_disk(&disk, &hdr, 40 * 512);

        let data = extract_table_region(
            &logging::discard(),
            &disk,
            table("gpt"),
            40 * 512,
            tmp.path(),
            "disk",
            &UUID,
            CompressionSettings::default(),
        )
        .unwrap();
        assert_eq!(data.uncompressed_size, 34 * 512);
    }

    #[test]
    fn zero_entries_is_structural() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        write_disk(&disk, &header(0, 128), 4096);
        let err = read_gpt_end_offset(&disk, 512).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::StructuralParse));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up_to_sector(1408, 512), 1536);
        assert_eq!(round_up_to_sector(17408, 512), 17408);
    }

    #[test]
    fn extracts_rounded_gpt_region() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        write_disk(&disk, &header(3, 128), 8192);

        let data = extract_table_region(
            &logging::discard(),
            &disk,
            table("gpt"),
            8192,
            tmp.path(),
            "disk",
            &UUID,
            CompressionSettings::default(),
        )
        .unwrap();

        assert_eq!(data.uncompressed_size, 1408);
        assert_eq!(data.compressed_file_path, tmp.path().join("disk_gpt.raw.zst"));
        assert!(!tmp.path().join("disk_gpt.raw").exists());
        assert!(!tmp.path().join("disk_gpt_temp.raw.zst").exists());

        let out = tmp.path().join("gpt.out");
        let size = decompress_file(&data.compressed_file_path, &out).unwrap();
        assert_eq!(size, 1536);
        assert_eq!(fs::read(&out).unwrap(), fs::read(&disk).unwrap()[..1536].to_vec());
    }

    #[test]
    fn extracted_header_parses_to_source_fields() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        let source = header(128, 128);
        write_disk(&disk, &source, 64 * 512);

        let data = extract_table_region(
            &logging::discard(),
            &disk,
            table("gpt"),
            64 * 512,
            tmp.path(),
            "disk",
            &UUID,
            CompressionSettings::default(),
        )
        .unwrap();
        assert_eq!(data.uncompressed_size, 2 * 512 + 128 * 128);

        let out = tmp.path().join("gpt.out");
        decompress_file(&data.compressed_file_path, &out).unwrap();
        let bytes = fs::read(&out).unwrap();
        let sector = data.sector_size as usize;
        let parsed = GptHeader::parse(&bytes[sector..sector + GPT_HEADER_SIZE]).unwrap();

        assert_eq!(parsed.signature, source.signature);
        assert_eq!(parsed.revision, source.revision);
        assert_eq!(parsed.header_size, source.header_size);
        assert_eq!(parsed.header_crc32, source.header_crc32);
        assert_eq!(parsed.reserved, source.reserved);
        assert_eq!(parsed.my_lba, source.my_lba);
        assert_eq!(parsed.alternate_lba, source.alternate_lba);
        assert_eq!(parsed.first_usable_lba, source.first_usable_lba);
        assert_eq!(parsed.last_usable_lba, source.last_usable_lba);
        assert_eq!(parsed.disk_guid, source.disk_guid);
        assert_eq!(parsed.partition_entry_lba, source.partition_entry_lba);
        assert_eq!(parsed.number_of_partition_entries, source.number_of_partition_entries);
        assert_eq!(parsed.size_of_partition_entry, source.size_of_partition_entry);
        assert_eq!(parsed.partition_entry_array_crc32, source.partition_entry_array_crc32);
        assert_eq!(parsed.end_offset(data.sector_size).unwrap(), data.uncompressed_size);
    }

    #[test]
    fn unreported_sector_size_defaults_to_512() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        write_disk(&disk, &header(3, 128), 8192);

        let mut sizeless_table = table("gpt");
        sizeless_table.sector_size = 0;
        let data = extract_table_region(
            &logging::discard(),
            &disk,
            sizeless_table,
            8192,
            tmp.path(),
            "disk",
            &UUID,
            CompressionSettings::default(),
        )
        .unwrap();
        assert_eq!(data.sector_size, DEFAULT_SECTOR_SIZE);
        assert_eq!(data.uncompressed_size, 1408);

        let gpt_image = ImageFile {
            path: "images/disk_gpt.raw.zst".to_string(),
            ..Default::default()
        };
        let disk_meta = build_disk_metadata(&data, gpt_image, &BTreeMap::new());
        assert_eq!(disk_meta.lba_size, 512);
        assert_eq!(disk_meta.gpt_regions.len(), 1);
    }

    #[test]
    fn invalid_header_falls_back_to_34_sectors() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        write_disk(&disk, &header(0, 0), 40 * 512);

        let data = extract_table_region(
            &logging::discard(),
            &disk,
            table("gpt"),
            40 * 512,
            tmp.path(),
            "disk",
            &UUID,
            CompressionSettings::default(),
        )
        .unwrap();
        assert_eq!(data.uncompressed_size, 34 * 512);
    }

    #[test]
    fn mbr_extracts_one_sector() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        write_disk(&disk, &header(1, 1), 4096);

        let data = extract_table_region(
            &logging::discard(),
            &disk,
            table("dos"),
            4096,
            tmp.path(),
            "disk",
            &UUID,
            CompressionSettings::default(),
        )
        .unwrap();
        assert_eq!(data.uncompressed_size, 512);
        assert!(!tmp.path().join("disk_mbr.raw").exists());

        let out = tmp.path().join("mbr.out");
        assert_eq!(decompress_file(&data.compressed_file_path, &out).unwrap(), 512);
    }

    #[test]
    fn unknown_label_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.raw");
        write_disk(&disk, &header(1, 1), 4096);

        let err = extract_table_region(
            &logging::discard(),
            &disk,
            table("sun"),
            4096,
            tmp.path(),
            "disk",
            &UUID,
            CompressionSettings::default(),
        )
        .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::StructuralParse));
        assert!(err.to_string().contains("sun"));
    }

    #[test]
    fn disk_regions_follow_partition_numbers() {
        let data = GptExtractedData {
            compressed_file_path: PathBuf::from("/out/disk_gpt.raw.zst"),
            uncompressed_size: 17408,
            partition_table: table("gpt"),
            disk_size: 4 << 20,
            sector_size: 512,
        };
        let image = |path: &str| ImageFile {
            path: path.to_string(),
            ..Default::default()
        };
        let mut images = BTreeMap::new();
        images.insert(2, image("images/disk_2.raw.zst"));
        images.insert(1, image("images/disk_1.raw.zst"));

        let disk = build_disk_metadata(&data, image("images/disk_gpt.raw.zst"), &images);
        assert_eq!(disk.size, 4 << 20);
        assert_eq!(disk.lba_size, 512);
        assert_eq!(disk.gpt_regions.len(), 3);
        assert_eq!(disk.gpt_regions[0].region_type, RegionType::PrimaryGpt);
        assert_eq!(disk.gpt_regions[0].start_lba, None);
        assert_eq!(disk.gpt_regions[1].number, Some(1));
        assert_eq!(disk.gpt_regions[1].start_lba, Some(2048));
        assert_eq!(disk.gpt_regions[2].number, Some(2));
        assert_eq!(disk.gpt_regions[2].image.path, "images/disk_2.raw.zst");
    }
}
