//! The LiveOS artifact store.
//!
//! Everything needed to emit LiveOS media is collected into one directory
//! (`<store>/artifacts`) and described by an [`IsoArtifactsStore`]:
//!
//! - [`IsoFilesStore`] knows where each boot artifact lives locally and
//!   where every other file goes on the media
//! - [`IsoInfoStore`] holds the OS facts that gate LiveOS features
//!
//! A store is built fresh on every run, either from a mounted image root or
//! from an existing ISO. When a run starts from an ISO and also has a new
//! image root, the image store is primary and only the ISO's additional
//! files whose destinations are not produced again are carried forward.
//!
//! ```rust,ignore
//! use image_customizer::liveos::store::IsoArtifactsStore;
//!
//! let input = IsoArtifactsStore::from_iso_image(&log, &iso, &build_dir.join("input-store"), &boot, &matcher)?;
//! let store = IsoArtifactsStore::from_mounted_image(&log, Some(&input), &root, &store_dir, handler.as_ref(), &boot, &matcher)?;
//! ```

use anyhow::{Context, Result};
use slog::{debug, info, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::constants::{
    BootFilesArchConfig, ARTIFACTS_DIR, ESP_REDIRECT_GRUB_CFG_PATH, ISO_BOOT_IMAGE_PATH, ISO_GRUB_CFG,
    ISO_GRUB_CFG_PATH, ISO_INITRD_PATH, ISO_KERNEL_PATH, LIVE_OS_IMAGE_PATH, NO_PREFIX_GRUB_CFG_DIR,
    PXE_GRUB_CFG, SAVED_CONFIGS_DIR, SAVED_CONFIGS_FILE_NAME, SAVED_CONFIGS_FILE_PATH,
};
use super::kernel::{classify_kernel_file, KernelFileRole, KernelVersionMatcher};
use super::package_info::PackageVersionInformation;
use super::saved_configs::SavedConfigs;
use super::selinux::read_image_selinux_mode;
use crate::config::{KdumpBootFilesType, SELinuxMode};
use crate::distro::DistroHandler;
use crate::error::CustomizerError;
use crate::fsutil::{copy_no_dereference, make_owner_writable};
use crate::process::Cmd;

/// Boot files of one kernel version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelBootFiles {
    pub vmlinuz_path: Option<PathBuf>,
    pub initrd_image_path: Option<PathBuf>,
    pub other_files: Vec<PathBuf>,
}

/// kdump kernel and initramfs of one kernel version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KdumpBootFiles {
    pub vmlinuz_path: Option<PathBuf>,
    pub initrd_image_path: Option<PathBuf>,
}

/// Local locations of the LiveOS media artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsoFilesStore {
    pub artifacts_dir: PathBuf,
    pub boot_efi_path: Option<PathBuf>,
    pub grub_efi_path: Option<PathBuf>,
    pub iso_boot_image_path: Option<PathBuf>,
    pub iso_grub_cfg_path: Option<PathBuf>,
    pub pxe_grub_cfg_path: Option<PathBuf>,
    pub saved_configs_file_path: PathBuf,
    /// kernel version -> boot files
    pub kernel_boot_files: BTreeMap<String, KernelBootFiles>,
    /// kernel version -> kdump boot files
    pub kdump_boot_files: BTreeMap<String, KdumpBootFiles>,
    /// initrd not tied to a kernel version (`/boot/initrd.img` on media).
    pub initrd_image_path: Option<PathBuf>,
    pub squashfs_image_path: Option<PathBuf>,
    /// local path -> absolute path on the media
    pub additional_files: BTreeMap<PathBuf, String>,
}

/// OS facts relevant to LiveOS features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsoInfoStore {
    pub selinux_mode: SELinuxMode,
    pub kdump_boot_files: Option<KdumpBootFilesType>,
    pub dracut_package_info: Option<PackageVersionInformation>,
    pub selinux_policy_package_info: Option<PackageVersionInformation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsoArtifactsStore {
    pub files: IsoFilesStore,
    pub info: IsoInfoStore,
}

/// `path` relative to `root`, rendered as `/a/b`.
fn media_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{} is not under {}", path.display(), root.display()))?;
    Ok(format!("/{}", rel.to_string_lossy()))
}

/// Files (and symlinks) under `dir`, sorted by path.
fn enumerate_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        if !entry.file_type().is_dir() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Numeric fields of a version string, for ordering `6.10` after `6.9`.
fn version_sort_key(version: &str) -> Vec<u64> {
    version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

impl IsoFilesStore {
    fn empty(store_dir: &Path) -> Self {
        let artifacts_dir = store_dir.join(ARTIFACTS_DIR);
        Self {
            saved_configs_file_path: artifacts_dir.join(SAVED_CONFIGS_DIR).join(SAVED_CONFIGS_FILE_NAME),
            artifacts_dir,
            ..Default::default()
        }
    }

    /// Put a kernel-versioned file into its group.
    ///
    /// Returns `false` when the file is not claimed by a group and should be
    /// treated as an additional file.
    fn store_if_kernel_specific(&mut self, matcher: &dyn KernelVersionMatcher, path: &Path) -> bool {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return false;
        };
        let Some((version, role)) = classify_kernel_file(matcher, &file_name) else {
            return false;
        };

        let path = path.to_path_buf();
        match role {
            KernelFileRole::KdumpInitrd => {
                self.kdump_boot_files.entry(version).or_default().initrd_image_path = Some(path);
            }
            KernelFileRole::KdumpOther => {
                self.kdump_boot_files.entry(version).or_default();
            }
            KernelFileRole::Vmlinuz => {
                self.kernel_boot_files.entry(version).or_default().vmlinuz_path = Some(path);
            }
            KernelFileRole::Initrd => {
                self.kernel_boot_files.entry(version).or_default().initrd_image_path = Some(path);
            }
            KernelFileRole::Other => {
                self.kernel_boot_files.entry(version).or_default().other_files.push(path);
            }
        }
        role.is_grouped()
    }

    fn set_iso_grub_cfg(&mut self, path: PathBuf) {
        self.pxe_grub_cfg_path = path.parent().map(|dir| dir.join(PXE_GRUB_CFG));
        self.iso_grub_cfg_path = Some(path);
    }

    /// Kernel versions found, oldest first.
    pub fn kernel_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.kernel_boot_files.keys().cloned().collect();
        versions.sort_by_key(|v| version_sort_key(v));
        versions
    }

    /// The kernel the media boots: `preferred` when present, otherwise the
    /// newest version with a vmlinuz.
    pub fn primary_kernel(&self, preferred: Option<&str>) -> Option<(&str, &KernelBootFiles)> {
        if let Some(version) = preferred {
            if let Some((k, files)) = self.kernel_boot_files.get_key_value(version) {
                if files.vmlinuz_path.is_some() {
                    return Some((k.as_str(), files));
                }
            }
        }
        self.kernel_versions()
            .iter()
            .rev()
            .find_map(|v| {
                self.kernel_boot_files
                    .get_key_value(v.as_str())
                    .filter(|(_, files)| files.vmlinuz_path.is_some())
            })
            .map(|(k, files)| (k.as_str(), files))
    }

    /// Media destinations this store produces without consulting
    /// `additional_files`.
    pub fn produced_destinations(&self, boot: &BootFilesArchConfig) -> BTreeSet<String> {
        let mut produced: BTreeSet<String> = [
            ISO_KERNEL_PATH,
            ISO_INITRD_PATH,
            ISO_GRUB_CFG_PATH,
            ISO_BOOT_IMAGE_PATH,
            LIVE_OS_IMAGE_PATH,
            SAVED_CONFIGS_FILE_PATH,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        produced.insert(format!("{}/{}", super::constants::GRUB_CFG_DIR, PXE_GRUB_CFG));
        produced.insert(boot.iso_boot_binary_path());
        produced.insert(boot.iso_grub_binary_path());
        produced.extend(self.additional_files.values().cloned());
        produced
    }

    /// Collect the boot artifacts of a mounted image root.
    ///
    /// # Arguments
    ///
    /// * `input` - Store of an input ISO whose extra files carry forward
    /// * `image_root` - Mounted image root
    /// * `store_dir` - Directory that receives `artifacts/`
    pub fn from_mounted_image(
        log: &Logger,
        input: Option<&IsoFilesStore>,
        image_root: &Path,
        store_dir: &Path,
        boot: &BootFilesArchConfig,
        matcher: &dyn KernelVersionMatcher,
    ) -> Result<Self> {
        let mut store = Self::empty(store_dir);

        let boot_dir = image_root.join("boot");
        let boot_files = enumerate_files(&boot_dir)
            .with_context(|| format!("failed to scan /boot folder of {}", image_root.display()))?;

        let using_grub_no_prefix = boot_files.iter().any(|p| {
            p.file_name()
                .map(|n| n == boot.grub_no_prefix_binary)
                .unwrap_or(false)
        });

        let esp_boot = boot.os_esp_boot_binary_path();
        let esp_grub = boot.os_esp_grub_binary_path();
        let esp_grub_no_prefix = boot.os_esp_grub_no_prefix_binary_path();

        for source in boot_files {
            let relative = media_path(image_root, &source)?;
            if relative == ESP_REDIRECT_GRUB_CFG_PATH {
                debug!(log, "not copying redirect grub.cfg"; "path" => %source.display());
                continue;
            }

            let mut target = store.artifacts_dir.join(relative.trim_start_matches('/'));
            let mut additional = false;

            if relative == esp_boot {
                store.boot_efi_path = Some(target.clone());
            } else if relative == esp_grub || relative == esp_grub_no_prefix {
                store.grub_efi_path = Some(target.clone());
            } else if relative == ISO_GRUB_CFG_PATH {
                if using_grub_no_prefix {
                    // grub-noprefix has an empty prefix and reads
                    // EFI/BOOT/grub.cfg from the boot media.
                    target = store.artifacts_dir.join(NO_PREFIX_GRUB_CFG_DIR).join(ISO_GRUB_CFG);
                }
                store.set_iso_grub_cfg(target.clone());
            } else if relative == ISO_INITRD_PATH {
                store.initrd_image_path = Some(target.clone());
            } else {
                additional = !store.store_if_kernel_specific(matcher, &target);
            }

            copy_no_dereference(&source, &target)
                .context("failed to extract files from under the boot folder")?;

            if additional {
                let destination = media_path(&store.artifacts_dir, &target)?;
                store.additional_files.insert(target, destination);
            }
        }

        let kernels = store.kernel_boot_files.clone();
        for (version, kdump) in store.kdump_boot_files.iter_mut() {
            if let Some(kernel) = kernels.get(version) {
                kdump.vmlinuz_path = kernel.vmlinuz_path.clone();
            }
        }

        if let Some(input) = input {
            store.merge_from_input(log, input, boot)?;
        }

        if store.boot_efi_path.is_none() {
            return Err(CustomizerError::missing(format!(
                "failed to find the boot efi file ({}): this file is provided by the (shim) package",
                boot.boot_binary
            ))
            .with_path(image_root.join(esp_boot.trim_start_matches('/')))
            .into());
        }
        if store.grub_efi_path.is_none() {
            return Err(CustomizerError::missing(format!(
                "failed to find the grub efi file ({} or {}): this file is provided by either the \
                 (grub2-efi-binary) or the (grub2-efi-binary-noprefix) package",
                boot.grub_binary, boot.grub_no_prefix_binary
            ))
            .with_path(image_root.join(esp_grub.trim_start_matches('/')))
            .into());
        }

        info!(log, "collected boot artifacts from image";
            "root" => %image_root.display(),
            "kernels" => store.kernel_boot_files.len(),
            "additional_files" => store.additional_files.len());
        Ok(store)
    }

    /// Carry the input ISO's saved configs and extra files into this store.
    fn merge_from_input(
        &mut self,
        log: &Logger,
        input: &IsoFilesStore,
        boot: &BootFilesArchConfig,
    ) -> Result<()> {
        if input.saved_configs_file_path.exists() {
            copy_no_dereference(&input.saved_configs_file_path, &self.saved_configs_file_path)
                .context("failed to copy saved configuration file from the input iso")?;
        }

        let produced = self.produced_destinations(boot);
        for (input_source, destination) in &input.additional_files {
            if produced.contains(destination) {
                debug!(log, "input iso file superseded"; "destination" => destination);
                continue;
            }
            let relative = input_source.strip_prefix(&input.artifacts_dir).with_context(|| {
                format!("{} is not under {}", input_source.display(), input.artifacts_dir.display())
            })?;
            let local = self.artifacts_dir.join(relative);
            copy_no_dereference(input_source, &local)?;
            self.additional_files.insert(local, destination.clone());
        }
        Ok(())
    }

    /// Classify an exploded ISO tree in place.
    pub fn from_iso_tree(
        log: &Logger,
        store_dir: &Path,
        boot: &BootFilesArchConfig,
        matcher: &dyn KernelVersionMatcher,
    ) -> Result<Self> {
        let mut store = Self::empty(store_dir);
        let files = enumerate_files(&store.artifacts_dir)
            .with_context(|| format!("failed to enumerate expanded iso files under {}", store.artifacts_dir.display()))?;

        let iso_boot = boot.iso_boot_binary_path();
        let iso_grub = boot.iso_grub_binary_path();
        let no_prefix_grub_cfg = format!("/{}/{}", NO_PREFIX_GRUB_CFG_DIR, ISO_GRUB_CFG);

        for file in files {
            let relative = media_path(&store.artifacts_dir, &file)?;
            let mut additional = false;

            match relative.as_str() {
                r if r == iso_boot => store.boot_efi_path = Some(file.clone()),
                // The noprefix binary is renamed to the regular grub name on
                // media, so only one name is looked for here.
                r if r == iso_grub => store.grub_efi_path = Some(file.clone()),
                ISO_GRUB_CFG_PATH => store.set_iso_grub_cfg(file.clone()),
                r if r == no_prefix_grub_cfg => store.set_iso_grub_cfg(file.clone()),
                LIVE_OS_IMAGE_PATH => store.squashfs_image_path = Some(file.clone()),
                ISO_INITRD_PATH => store.initrd_image_path = Some(file.clone()),
                SAVED_CONFIGS_FILE_PATH => store.saved_configs_file_path = file.clone(),
                ISO_BOOT_IMAGE_PATH => store.iso_boot_image_path = Some(file.clone()),
                _ => additional = !store.store_if_kernel_specific(matcher, &file),
            }

            if additional {
                store.additional_files.insert(file, relative);
            }
        }

        debug!(log, "classified iso tree";
            "artifacts" => %store.artifacts_dir.display(),
            "additional_files" => store.additional_files.len());
        Ok(store)
    }

    /// Explode `iso` into `<store_dir>/artifacts` and classify it.
    pub fn from_iso_image(
        log: &Logger,
        iso: &Path,
        store_dir: &Path,
        boot: &BootFilesArchConfig,
        matcher: &dyn KernelVersionMatcher,
    ) -> Result<Self> {
        let artifacts_dir = store_dir.join(ARTIFACTS_DIR);
        extract_iso_image(log, iso, &artifacts_dir)
            .with_context(|| format!("failed to extract iso contents from input iso file {}", iso.display()))?;
        Self::from_iso_tree(log, store_dir, boot, matcher)
    }
}

/// Copy the whole file tree of `iso` into `dest`.
pub fn extract_iso_image(log: &Logger, iso: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create folder {}", dest.display()))?;
    info!(log, "extracting iso"; "iso" => %iso.display(), "dest" => %dest.display());

    Cmd::new("xorriso")
        .args(["-osirrox", "on", "-indev"])
        .arg_path(iso)
        .args(["-extract", "/"])
        .arg_path(dest)
        .error_msg(format!("xorriso failed to extract {}", iso.display()))
        .run()?;

    make_owner_writable(dest)
}

impl IsoInfoStore {
    /// Read SELinux mode and package versions from a mounted image.
    pub fn from_mounted_image(image_root: &Path, handler: &dyn DistroHandler) -> Result<Self> {
        let selinux_mode = read_image_selinux_mode(image_root, handler.grub_config_path())
            .with_context(|| format!("failed to determine SELinux mode for {}", image_root.display()))?;

        let dracut_package_info = handler.package_info(image_root, "dracut").with_context(|| {
            format!("failed to determine package information for dracut under {}", image_root.display())
        })?;

        // Other policy packages may be installed instead; absence is fine.
        let selinux_policy_package_info = if handler.is_package_installed(image_root, "selinux-policy") {
            Some(handler.package_info(image_root, "selinux-policy").with_context(|| {
                format!(
                    "failed to determine package information for selinux-policy under {}",
                    image_root.display()
                )
            })?)
        } else {
            None
        };

        Ok(Self {
            selinux_mode,
            kdump_boot_files: None,
            dracut_package_info: Some(dracut_package_info),
            selinux_policy_package_info,
        })
    }

    /// Facts recorded on existing media. The rootfs is not expanded.
    pub fn from_saved_configs(path: &Path) -> Result<Self> {
        let saved = SavedConfigs::load(path)
            .with_context(|| format!("failed to load saved configurations {}", path.display()))?
            .unwrap_or_default();
        Ok(Self {
            selinux_mode: SELinuxMode::Default,
            kdump_boot_files: saved.liveos.kdump_boot_files,
            dracut_package_info: saved.os.dracut_package,
            selinux_policy_package_info: saved.os.selinux_policy_package,
        })
    }
}

impl IsoArtifactsStore {
    pub fn from_mounted_image(
        log: &Logger,
        input: Option<&IsoArtifactsStore>,
        image_root: &Path,
        store_dir: &Path,
        handler: &dyn DistroHandler,
        boot: &BootFilesArchConfig,
        matcher: &dyn KernelVersionMatcher,
    ) -> Result<Self> {
        fs::create_dir_all(store_dir)
            .with_context(|| format!("failed to create folder {}", store_dir.display()))?;
        let files = IsoFilesStore::from_mounted_image(
            log,
            input.map(|i| &i.files),
            image_root,
            store_dir,
            boot,
            matcher,
        )?;
        let info = IsoInfoStore::from_mounted_image(image_root, handler)?;
        Ok(Self { files, info })
    }

    pub fn from_iso_image(
        log: &Logger,
        iso: &Path,
        store_dir: &Path,
        boot: &BootFilesArchConfig,
        matcher: &dyn KernelVersionMatcher,
    ) -> Result<Self> {
        debug!(log, "creating iso store"; "store" => %store_dir.display(), "iso" => %iso.display());
        fs::create_dir_all(store_dir)
            .with_context(|| format!("failed to create folder {}", store_dir.display()))?;
        let files = IsoFilesStore::from_iso_image(log, iso, store_dir, boot, matcher)?;
        let info = IsoInfoStore::from_saved_configs(&files.saved_configs_file_path)?;
        Ok(Self { files, info })
    }

    /// Remove the artifacts directory.
    pub fn clean_up(&self) -> Result<()> {
        match fs::remove_dir_all(&self.files.artifacts_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CustomizerError::lifecycle("failed to clean up artifacts store")
                .with_path(&self.files.artifacts_dir)
                .with_source(e)
                .into()),
        }
    }
}
