//! PXE artifact output.
//!
//! The PXE layout is the ISO staging tree with the EFI binaries lifted to the
//! top level and `grub-pxe.cfg` installed as `grub.cfg`. With a bootstrap
//! initramfs the full ISO is placed next to the boot files (it is what the
//! initramfs downloads) and the squashfs is dropped from the tree.
//!
//! Output is either a directory or a `.tar.gz` of that directory.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use slog::{info, Logger};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use super::constants::{
    BootFilesArchConfig, GRUB_CFG_DIR, ISO_BOOTLOADER_DIR, ISO_GRUB_CFG, LIVE_OS_IMAGE_PATH,
    NO_PREFIX_GRUB_CFG_DIR, PXE_GRUB_CFG,
};
use super::package_info::verify_dracut_pxe_support;
use super::store::IsoArtifactsStore;
use crate::config::InitramfsImageType;
use crate::error::CustomizerError;
use crate::fsutil::move_file;
use crate::resources::ScratchDir;

/// URL the bootstrap initramfs downloads the ISO from.
///
/// `file_url` is used as is; `base_url` gets `iso_image_name` appended.
pub fn bootstrap_file_url(base_url: &str, file_url: &str, iso_image_name: &str) -> Result<String> {
    match (base_url.is_empty(), file_url.is_empty()) {
        (false, false) => Err(CustomizerError::invalid_config(
            "cannot specify both 'bootstrapBaseUrl' and 'bootstrapFileUrl' at the same time",
        )
        .into()),
        (true, true) => Err(CustomizerError::invalid_config(
            "either 'bootstrapBaseUrl' or 'bootstrapFileUrl' must be set for a bootstrap PXE image",
        )
        .into()),
        (true, false) => Ok(file_url.to_string()),
        (false, true) => Ok(format!("{}/{}", base_url.trim_end_matches('/'), iso_image_name)),
    }
}

/// File name of the ISO that the PXE bootstrap downloads.
pub fn bootstrap_file_name(base_url: &str, file_url: &str, iso_image_name: &str) -> Result<String> {
    let url = bootstrap_file_url(base_url, file_url, iso_image_name)?;
    let name = url.rsplit('/').next().unwrap_or_default();
    if name.is_empty() {
        return Err(CustomizerError::invalid_config(format!(
            "bootstrap url ({}) does not name a file",
            url
        ))
        .into());
    }
    Ok(name.to_string())
}

/// PXE output request.
#[derive(Debug, Clone)]
pub struct PxeOutput {
    /// Directory, or a path ending in `.tar.gz`.
    pub path: PathBuf,
    pub initramfs_type: InitramfsImageType,
    pub bootstrap_base_url: String,
    pub bootstrap_file_url: String,
    /// Appended to `bootstrap_base_url`.
    pub iso_image_name: String,
}

impl PxeOutput {
    pub fn is_tar_gz(&self) -> bool {
        self.path.to_string_lossy().ends_with(".tar.gz")
    }
}

/// Write the PXE artifacts for `store`.
///
/// `stage` copies the ISO media tree into the given directory;
/// `create_iso` writes the bootstrap ISO to the given path.
pub fn create_pxe_artifacts(
    log: &Logger,
    store: &IsoArtifactsStore,
    boot: &BootFilesArchConfig,
    build_dir: &Path,
    output: &PxeOutput,
    stage: impl Fn(&Path) -> Result<()>,
    create_iso: impl Fn(&Path) -> Result<()>,
) -> Result<()> {
    info!(log, "creating PXE artifacts"; "output" => %output.path.display());

    let scratch = if output.is_tar_gz() {
        Some(ScratchDir::create(log, build_dir.join("tmp-pxe-folder"))?)
    } else {
        None
    };
    let pxe_dir = match &scratch {
        Some(scratch) => scratch.path().to_path_buf(),
        None => output.path.clone(),
    };
    fs::create_dir_all(&pxe_dir)
        .with_context(|| format!("failed to create folder {}", pxe_dir.display()))?;

    stage(&pxe_dir)?;

    // Boot binaries live at the PXE root.
    let efi_dir = pxe_dir.join(ISO_BOOTLOADER_DIR.trim_start_matches('/'));
    for name in [boot.boot_binary, boot.grub_binary] {
        let source = efi_dir.join(name);
        if source.exists() {
            move_file(&source, &pxe_dir.join(name))
                .with_context(|| format!("failed to move boot file {}", source.display()))?;
        }
    }
    let efi_root = pxe_dir.join("efi");
    if efi_root.exists() {
        fs::remove_dir_all(&efi_root)
            .with_context(|| format!("failed to remove folder {}", efi_root.display()))?;
    }

    for cfg_dir in [GRUB_CFG_DIR.trim_start_matches('/'), NO_PREFIX_GRUB_CFG_DIR] {
        let pxe_cfg = pxe_dir.join(cfg_dir).join(PXE_GRUB_CFG);
        if pxe_cfg.exists() {
            let grub_cfg = pxe_dir.join(cfg_dir).join(ISO_GRUB_CFG);
            move_file(&pxe_cfg, &grub_cfg).with_context(|| {
                format!("failed to move {} to {}", pxe_cfg.display(), grub_cfg.display())
            })?;
        }
    }

    if output.initramfs_type == InitramfsImageType::Bootstrap {
        let dracut = store.info.dracut_package_info.as_ref().ok_or_else(|| {
            CustomizerError::policy("dracut package information is missing, cannot verify PXE support")
                .with_identifier("dracut")
        })?;
        verify_dracut_pxe_support(dracut).map_err(|e| {
            CustomizerError::policy(format!("the image does not support PXE booting: {:#}", e))
                .with_identifier("dracut")
        })?;

        let iso_name = bootstrap_file_name(
            &output.bootstrap_base_url,
            &output.bootstrap_file_url,
            &output.iso_image_name,
        )?;
        create_iso(&pxe_dir.join(&iso_name))
            .with_context(|| format!("failed to create bootstrap iso {}", iso_name))?;

        let rootfs = pxe_dir.join(LIVE_OS_IMAGE_PATH.trim_start_matches('/'));
        if rootfs.exists() {
            fs::remove_file(&rootfs)
                .with_context(|| format!("failed to remove {}", rootfs.display()))?;
        }
    }

    if output.is_tar_gz() {
        create_tar_gz(&pxe_dir, &output.path)?;
    }
    if let Some(scratch) = scratch {
        scratch.close()?;
    }

    info!(log, "PXE artifacts written"; "output" => %output.path.display());
    Ok(())
}

/// Write `src_dir` as a gzip-compressed tarball with deterministic ordering
/// and zeroed ownership.
pub fn create_tar_gz(src_dir: &Path, out_path: &Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create folder {}", parent.display()))?;
    }
    let out = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut builder = TarBuilder::new(GzEncoder::new(out, Compression::default()));

    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(src_dir).follow_links(false).min_depth(1) {
        let entry = entry.with_context(|| format!("failed to walk {}", src_dir.display()))?;
        entries.push(entry.into_path());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for path in entries {
        let rel = path
            .strip_prefix(src_dir)
            .with_context(|| format!("{} is not under {}", path.display(), src_dir.display()))?
            .to_path_buf();
        let md = fs::symlink_metadata(&path)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(md.permissions().mode());
        }

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&path)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, &rel, &mut f)?;
        }
    }

    let encoder = builder
        .into_inner()
        .with_context(|| format!("failed to finish tar archive {}", out_path.display()))?;
    encoder
        .finish()
        .with_context(|| format!("failed to finish gzip stream {}", out_path.display()))?;
    Ok(())
}
