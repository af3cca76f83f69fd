//! COSI packaging and LiveOS ISO/PXE rebuilding for customized OS disk images.
//!
//! Two pipelines share one substrate:
//!
//! - **COSI** - split a raw disk image into its partition table and
//!   partitions, compress each with a UUID-tagged zstd frame and pack them
//!   with a `metadata.json` manifest
//! - **LiveOS** - collect boot artifacts from a mounted image or an existing
//!   ISO and emit bootable ISO and PXE media
//!
//! # Architecture
//!
//! ```text
//! error / logging / process / config / preflight      (substrate)
//!     │
//!     ├── digest, disk::zstd                          (shared codecs)
//!     │
//!     ├── disk::{table, gpt, partitions} ─► cosi::{metadata, builder, bootloader, convert}
//!     │
//!     └── liveos::{constants, kernel, package_info, saved_configs, store}
//!              ─► liveos::{grub, selinux, iso, pxe, builder}
//!
//! resources (loop devices, mounts, scratch dirs) ─► history, cosi::convert, liveos::builder
//! distro    (os-release driven handlers)         ─► liveos::store, cosi::bootloader
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_customizer::cosi::{convert_to_cosi, CosiConvertOptions};
//! use image_customizer::logging;
//!
//! let log = logging::root_logger(slog::Level::Info);
//! let metadata = convert_to_cosi(&log, &options)?;
//! println!("{} images", metadata.images.len());
//! ```

pub mod config;
pub mod cosi;
pub mod digest;
pub mod disk;
pub mod distro;
pub mod error;
pub mod fsutil;
pub mod history;
pub mod liveos;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod resources;

pub use error::{CustomizerError, ErrorKind};
