//! LiveOS ISO and PXE media.
//!
//! - [`store`] collects boot artifacts from a mounted image or an ISO
//! - [`saved_configs`] carries LiveOS settings across rebuilds
//! - [`kernel`] groups boot files by kernel version
//! - [`grub`] and [`selinux`] rewrite the boot configuration
//! - [`iso`] and [`pxe`] write the media
//! - [`builder`] runs the whole flow

pub mod builder;
pub mod constants;
pub mod grub;
pub mod iso;
pub mod kernel;
pub mod package_info;
pub mod pxe;
pub mod saved_configs;
pub mod selinux;
pub mod store;

pub use builder::{LiveOsBuilder, LiveOsOptions};
pub use kernel::{AzureLinuxKernelMatcher, KernelVersionMatcher};
pub use saved_configs::SavedConfigs;
pub use store::IsoArtifactsStore;
