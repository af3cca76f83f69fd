//! Well-known paths of LiveOS media and per-architecture boot binaries.
//!
//! Paths starting with `/` are relative to either an image root or an ISO
//! root, depending on the name (`OS_*` vs `ISO_*`).

use anyhow::Result;

use crate::error::CustomizerError;

pub const OS_ESP_BOOTLOADER_DIR: &str = "/boot/efi/EFI/BOOT";
pub const ISO_BOOTLOADER_DIR: &str = "/efi/boot";

pub const GRUB_CFG_DIR: &str = "/boot/grub2";
pub const ISO_GRUB_CFG: &str = "grub.cfg";
pub const ISO_GRUB_CFG_PATH: &str = "/boot/grub2/grub.cfg";
pub const PXE_GRUB_CFG: &str = "grub-pxe.cfg";

/// Redirection grub.cfg on the ESP of full disk images. Never copied.
pub const ESP_REDIRECT_GRUB_CFG_PATH: &str = "/boot/efi/boot/grub2/grub.cfg";

/// grub-noprefix looks for its config here when booted from ISO media.
pub const NO_PREFIX_GRUB_CFG_DIR: &str = "EFI/BOOT";

pub const INITRD_IMAGE: &str = "initrd.img";
pub const VMLINUZ_PREFIX: &str = "vmlinuz";
pub const INITRAMFS_PREFIX: &str = "initramfs";
pub const INITRD_PREFIX: &str = "initrd";
pub const KDUMP_INITRD_MARKER: &str = "kdump.img";

pub const ISO_INITRD_PATH: &str = "/boot/initrd.img";
pub const ISO_KERNEL_PATH: &str = "/boot/vmlinuz";
pub const ISO_BOOT_IMAGE_PATH: &str = "/boot/grub2/efiboot.img";

pub const LIVE_OS_DIR: &str = "liveos";
pub const LIVE_OS_IMAGE: &str = "rootfs.img";
pub const LIVE_OS_IMAGE_PATH: &str = "/liveos/rootfs.img";

pub const SAVED_CONFIGS_DIR: &str = "azl-image-customizer";
pub const SAVED_CONFIGS_FILE_NAME: &str = "saved-configs.yaml";
pub const SAVED_CONFIGS_FILE_PATH: &str = "/azl-image-customizer/saved-configs.yaml";

/// Volume label of generated ISOs; grub locates the media by it.
pub const ISO_VOLUME_ID: &str = "CDROM";

/// File name used for the bootstrap ISO when only a base URL is given.
pub const DEFAULT_ISO_IMAGE_NAME: &str = "image.iso";

/// Store subdirectory holding the collected artifacts.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Boot binary names for one CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootFilesArchConfig {
    pub boot_binary: &'static str,
    pub grub_binary: &'static str,
    pub grub_no_prefix_binary: &'static str,
    pub systemd_boot_binary: &'static str,
}

pub const AMD64_BOOT_FILES: BootFilesArchConfig = BootFilesArchConfig {
    boot_binary: "bootx64.efi",
    grub_binary: "grubx64.efi",
    grub_no_prefix_binary: "grubx64-noprefix.efi",
    systemd_boot_binary: "systemd-bootx64.efi",
};

pub const ARM64_BOOT_FILES: BootFilesArchConfig = BootFilesArchConfig {
    boot_binary: "bootaa64.efi",
    grub_binary: "grubaa64.efi",
    grub_no_prefix_binary: "grubaa64-noprefix.efi",
    systemd_boot_binary: "systemd-bootaa64.efi",
};

impl BootFilesArchConfig {
    pub fn os_esp_boot_binary_path(&self) -> String {
        format!("{}/{}", OS_ESP_BOOTLOADER_DIR, self.boot_binary)
    }

    pub fn os_esp_grub_binary_path(&self) -> String {
        format!("{}/{}", OS_ESP_BOOTLOADER_DIR, self.grub_binary)
    }

    pub fn os_esp_grub_no_prefix_binary_path(&self) -> String {
        format!("{}/{}", OS_ESP_BOOTLOADER_DIR, self.grub_no_prefix_binary)
    }

    pub fn iso_boot_binary_path(&self) -> String {
        format!("{}/{}", ISO_BOOTLOADER_DIR, self.boot_binary)
    }

    pub fn iso_grub_binary_path(&self) -> String {
        format!("{}/{}", ISO_BOOTLOADER_DIR, self.grub_binary)
    }
}

/// Boot binaries for `arch`. Accepts both Rust (`x86_64`, `aarch64`) and
/// Go-style (`amd64`, `arm64`) names.
pub fn boot_arch_config(arch: &str) -> Result<BootFilesArchConfig> {
    match arch {
        "x86_64" | "amd64" => Ok(AMD64_BOOT_FILES),
        "aarch64" | "arm64" => Ok(ARM64_BOOT_FILES),
        other => Err(CustomizerError::policy(format!("unsupported architecture: {}", other))
            .with_identifier(other)
            .into()),
    }
}

/// Boot binaries for the architecture this tool runs on.
pub fn host_boot_arch_config() -> Result<BootFilesArchConfig> {
    boot_arch_config(std::env::consts::ARCH)
}
