//! Partition table discovery via `sfdisk --json`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::process::Cmd;

/// Sector size assumed when the table does not report one.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Partition table as reported by sfdisk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    /// `gpt`, `dos`, ...
    pub label: String,
    pub device: String,
    pub sector_size: u64,
    pub partitions: Vec<TablePartition>,
}

/// One entry of the partition table, in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePartition {
    pub node: String,
    pub start: u64,
    pub size: u64,
    pub part_type: String,
    pub uuid: Option<String>,
    pub name: Option<String>,
}

impl TablePartition {
    /// Partition number parsed from the trailing digits of the device node.
    pub fn number(&self) -> Option<u32> {
        partition_number(&self.node)
    }
}

#[derive(Deserialize)]
struct SfdiskOutput {
    partitiontable: SfdiskTable,
}

#[derive(Deserialize)]
struct SfdiskTable {
    label: String,
    #[serde(default)]
    device: String,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type", default)]
    part_type: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Parse the JSON printed by `sfdisk --json <device>`.
pub fn parse_sfdisk_json(json: &str) -> Result<PartitionTable> {
    let parsed: SfdiskOutput =
        serde_json::from_str(json).context("Failed to parse sfdisk JSON output")?;
    let table = parsed.partitiontable;

    let sector_size = match table.sectorsize {
        Some(0) | None => DEFAULT_SECTOR_SIZE,
        Some(n) => n,
    };

    Ok(PartitionTable {
        label: table.label,
        device: table.device,
        sector_size,
        partitions: table
            .partitions
            .into_iter()
            .map(|p| TablePartition {
                node: p.node,
                start: p.start,
                size: p.size,
                part_type: p.part_type.to_lowercase(),
                uuid: p.uuid.map(|u| u.to_lowercase()),
                name: p.name,
            })
            .collect(),
    })
}

/// Read the partition table of a block device or image file.
///
/// Returns `None` when the device carries no recognizable table.
pub fn read_partition_table(device: &Path) -> Result<Option<PartitionTable>> {
    let result = Cmd::new("sfdisk")
        .arg("--json")
        .arg_path(device)
        .allow_fail()
        .run()?;

    if !result.success() {
        if result.stderr.contains("does not contain a recognized partition table") {
            return Ok(None);
        }
        anyhow::bail!(
            "sfdisk failed to read partition table of '{}': {}",
            device.display(),
            result.stderr.trim()
        );
    }

    if result.stdout.trim().is_empty() {
        return Ok(None);
    }

    parse_sfdisk_json(&result.stdout)
        .with_context(|| format!("reading partition table of '{}'", device.display()))
        .map(Some)
}

/// Trailing partition number of a device node (`/dev/loop0p3` -> 3).
pub fn partition_number(node: &str) -> Option<u32> {
    let digits: String = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
