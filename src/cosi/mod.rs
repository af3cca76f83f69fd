//! COSI (Composable OS Image) packaging.
//!
//! A COSI file is a tar archive whose first entry is `metadata.json`,
//! followed by zstd-compressed partition images under `images/`.
//!
//! - [`metadata`] is the serde model of `metadata.json`
//! - [`builder`] assembles the archive from extracted images
//! - [`bootloader`] derives the bootloader descriptor from a mounted OS
//! - [`convert`] runs the whole raw-image-to-COSI pipeline

pub mod bootloader;
pub mod builder;
pub mod convert;
pub mod metadata;

pub use builder::{build_cosi_file, verify_cosi_file, CosiImageInfo, VerityDevice};
pub use convert::{convert_to_cosi, CosiConvertOptions};
pub use metadata::MetadataJson;
