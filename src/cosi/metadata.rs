//! `metadata.json` model of a COSI archive.

use serde::{Deserialize, Serialize};

/// Metadata format version written into every archive.
pub const COSI_METADATA_VERSION: &str = "1.2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataJson {
    pub version: String,
    pub os_arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<Disk>,
    pub images: Vec<FileSystem>,
    pub os_release: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub bootloader: CosiBootloader,
    pub os_packages: Vec<OsPackage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    #[serde(rename = "maxWindowLog")]
    pub max_window_log: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Gpt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Size of the original disk in bytes.
    pub size: u64,
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    pub lba_size: u64,
    /// Regions in physical LBA order.
    pub gpt_regions: Vec<GptDiskRegion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegionType {
    PrimaryGpt,
    Partition,
    BackupGpt,
    Unallocated,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GptDiskRegion {
    pub image: ImageFile,
    #[serde(rename = "type")]
    pub region_type: RegionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_lba: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
}

/// One packaged filesystem image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystem {
    pub image: ImageFile,
    pub mount_point: String,
    pub fs_type: String,
    pub fs_uuid: String,
    pub part_type: String,
    /// Serialized as `null` when the filesystem has no verity pairing.
    pub verity: Option<VerityConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerityConfig {
    pub image: ImageFile,
    pub roothash: String,
}

/// A file stored in the archive. Sizes and digest describe the stored
/// (compressed) bytes, except `uncompressed_size`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFile {
    pub path: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub sha384: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsPackage {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderType {
    Grub,
    SystemdBoot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosiBootloader {
    #[serde(rename = "type")]
    pub bootloader_type: BootloaderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systemd_boot: Option<SystemDBoot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDBoot {
    pub entries: Vec<SystemDBootEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemDBootEntryType {
    UkiStandalone,
    UkiConfig,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDBootEntry {
    #[serde(rename = "type")]
    pub entry_type: SystemDBootEntryType,
    pub path: String,
    pub cmdline: String,
    pub kernel: String,
}

/// COSI architecture name for a Rust/Go style arch string.
pub fn cosi_arch(arch: &str) -> &str {
    match arch {
        "amd64" | "x86_64" => "x86_64",
        "arm64" | "aarch64" => "arm64",
        other => other,
    }
}
