//! Disk image decomposition.
//!
//! - [`table`] reads the partition table through `sfdisk --json`
//! - [`gpt`] extracts the primary GPT/MBR region and describes the disk layout
//! - [`partitions`] extracts each partition into its own image
//! - [`zstd`] compresses images and tags them with the image UUID

pub mod gpt;
pub mod partitions;
pub mod table;
pub mod zstd;

pub use gpt::{build_disk_metadata, extract_gpt_data, GptExtractedData, GptHeader};
pub use partitions::{extract_partitions, PartitionFormat, PartitionMetadata};
pub use table::{read_partition_table, PartitionTable, TablePartition};
pub use zstd::CompressionSettings;
