//! ISO media assembly.
//!
//! Builds the pieces that only exist on LiveOS media (EFI boot image,
//! squashfs root, full-OS initrd), lays out a staging tree from an
//! [`IsoFilesStore`] and hands it to xorriso.
//!
//! ```rust,ignore
//! use image_customizer::liveos::iso::{create_iso_image, IsoStaging};
//!
//! let staging = IsoStaging::new(&store.files, &boot);
//! staging.stage(&log, &staging_dir)?;
//! create_iso_image(&log, &staging_dir, &output)?;
//! ```

use anyhow::{Context, Result};
use slog::{debug, info, Logger};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::constants::{
    BootFilesArchConfig, ISO_BOOT_IMAGE_PATH, ISO_INITRD_PATH, ISO_KERNEL_PATH, ISO_VOLUME_ID,
    LIVE_OS_IMAGE_PATH, SAVED_CONFIGS_FILE_PATH,
};
use super::store::IsoFilesStore;
use crate::config::{AdditionalFile, KdumpBootFilesType};
use crate::error::CustomizerError;
use crate::fsutil::{copy_dir_recursive, copy_no_dereference};
use crate::process::Cmd;
use crate::resources::ScratchDir;

/// Size of the FAT16 EFI boot image.
pub const EFIBOOT_SIZE_MB: u32 = 16;

/// Mode of the generated `/init` in a full-OS initrd.
const INIT_MODE: u32 = 0o755;

/// Create a FAT16 image holding the EFI boot binaries under `EFI/BOOT`.
///
/// The grub binary is stored under its standard name even when the image
/// ships the noprefix build.
pub fn create_efi_boot_image(
    log: &Logger,
    boot_efi: &Path,
    grub_efi: &Path,
    boot: &BootFilesArchConfig,
    output: &Path,
) -> Result<()> {
    info!(log, "creating EFI boot image"; "path" => %output.display());
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create folder {}", parent.display()))?;
    }
    let img = output.to_string_lossy();

    Cmd::new("dd")
        .args(["if=/dev/zero", &format!("of={}", img)])
        .args(["bs=1M", &format!("count={}", EFIBOOT_SIZE_MB)])
        .error_msg("failed to create FAT16 image with dd")
        .run()?;

    Cmd::new("mkfs.fat")
        .args(["-F", "16"])
        .arg_path(output)
        .error_msg("mkfs.fat failed. Install dosfstools.")
        .run()?;

    Cmd::new("mmd")
        .args(["-i", &img, "::EFI", "::EFI/BOOT"])
        .error_msg("mmd failed to create ::EFI/BOOT. Install mtools.")
        .run()?;

    for (src, name) in [(boot_efi, boot.boot_binary), (grub_efi, boot.grub_binary)] {
        Cmd::new("mcopy")
            .args(["-i", &img])
            .arg_path(src)
            .arg(format!("::EFI/BOOT/{}", name))
            .error_msg(format!("mcopy failed to copy {}", src.display()))
            .run()?;
    }
    Ok(())
}

/// Pack `root` into the LiveOS squashfs, leaving out `/boot`.
pub fn create_squashfs_image(log: &Logger, root: &Path, output: &Path) -> Result<()> {
    info!(log, "creating squashfs image"; "root" => %root.display(), "path" => %output.display());
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create folder {}", parent.display()))?;
    }
    Cmd::new("mksquashfs")
        .arg_path(root)
        .arg_path(output)
        .args(["-xattrs", "-noappend", "-e", "boot"])
        .error_msg(format!("failed to create squashfs image {}", output.display()))
        .run()?;
    Ok(())
}

/// Prepare a copy of the OS root to boot straight from the initrd.
///
/// fstab is dropped (the root is already the initrd) and `/init` starts
/// systemd after mounting `/proc`.
pub fn prepare_full_os_root(root: &Path) -> Result<()> {
    let fstab = root.join("etc/fstab");
    if fstab.exists() {
        fs::remove_file(&fstab).with_context(|| format!("failed to remove {}", fstab.display()))?;
    }

    let init = root.join("init");
    if init.exists() || init.is_symlink() {
        fs::remove_file(&init).with_context(|| format!("failed to remove {}", init.display()))?;
    }
    fs::write(&init, "#!/bin/sh\nmount -t proc proc /proc\nexec /lib/systemd/systemd\n")
        .with_context(|| format!("failed to write {}", init.display()))?;
    fs::set_permissions(&init, fs::Permissions::from_mode(INIT_MODE))
        .with_context(|| format!("failed to set permissions on {}", init.display()))?;
    Ok(())
}

/// Build a gzip cpio initrd carrying the whole OS.
///
/// The image root is copied to a scratch directory under `build_dir` first
/// so the source stays untouched.
pub fn create_full_os_initrd(log: &Logger, root: &Path, build_dir: &Path, output: &Path) -> Result<()> {
    info!(log, "creating full OS initrd"; "root" => %root.display(), "path" => %output.display());

    let scratch = ScratchDir::create(log, build_dir.join("writeable-rootfs"))?;
    copy_dir_recursive(root, scratch.path())
        .with_context(|| format!("failed to copy {} to a writeable folder", root.display()))?;
    prepare_full_os_root(scratch.path())?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create folder {}", parent.display()))?;
    }
    let cpio_cmd = format!(
        "cd {} && find . -print0 | cpio --null -o -H newc 2>/dev/null | gzip -9 > {}",
        scratch.path().display(),
        output.display()
    );
    Cmd::new("sh")
        .args(["-c", &cpio_cmd])
        .error_msg(format!("failed to create initrd {}", output.display()))
        .run()?;

    scratch.close()
}

/// Where a staged file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedSource {
    /// Copied with symlinks followed.
    File(PathBuf),
    /// Copied as is; symlinks stay symlinks.
    Link(PathBuf),
    Content(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub source: StagedSource,
    pub mode: Option<u32>,
}

impl StagedFile {
    fn file(path: &Path) -> Self {
        Self {
            source: StagedSource::File(path.to_path_buf()),
            mode: None,
        }
    }

    fn link(path: &Path) -> Self {
        Self {
            source: StagedSource::Link(path.to_path_buf()),
            mode: None,
        }
    }
}

/// Parse an octal permission string such as `0644`.
pub fn parse_permissions(value: &str) -> Result<u32> {
    u32::from_str_radix(value, 8).map_err(|e| {
        CustomizerError::invalid_config(format!("invalid permissions value ({})", value))
            .with_source(e)
            .into()
    })
}

/// Media layout of an artifact store.
pub struct IsoStaging<'a> {
    store: &'a IsoFilesStore,
    boot: &'a BootFilesArchConfig,
    primary_kernel: Option<&'a str>,
    kdump_boot_files: Option<KdumpBootFilesType>,
    extra_files: &'a [AdditionalFile],
    base_dir: PathBuf,
}

impl<'a> IsoStaging<'a> {
    pub fn new(store: &'a IsoFilesStore, boot: &'a BootFilesArchConfig) -> Self {
        Self {
            store,
            boot,
            primary_kernel: None,
            kdump_boot_files: None,
            extra_files: &[],
            base_dir: PathBuf::new(),
        }
    }

    /// Kernel version whose vmlinuz becomes `/boot/vmlinuz`.
    pub fn primary_kernel(mut self, version: Option<&'a str>) -> Self {
        self.primary_kernel = version;
        self
    }

    pub fn kdump_boot_files(mut self, kdump: Option<KdumpBootFilesType>) -> Self {
        self.kdump_boot_files = kdump;
        self
    }

    /// Files from the configuration; relative sources resolve against
    /// `base_dir`.
    pub fn extra_files(mut self, files: &'a [AdditionalFile], base_dir: &Path) -> Self {
        self.extra_files = files;
        self.base_dir = base_dir.to_path_buf();
        self
    }

    fn relative(&self, path: &Path) -> Result<String> {
        let rel = path.strip_prefix(&self.store.artifacts_dir).with_context(|| {
            format!("{} is not under {}", path.display(), self.store.artifacts_dir.display())
        })?;
        Ok(format!("/{}", rel.to_string_lossy()))
    }

    /// Destination on the media -> staged file.
    pub fn plan(&self) -> Result<BTreeMap<String, StagedFile>> {
        let store = self.store;
        let mut files = BTreeMap::new();

        if let Some(path) = &store.boot_efi_path {
            files.insert(self.boot.iso_boot_binary_path(), StagedFile::file(path));
        }
        if let Some(path) = &store.grub_efi_path {
            files.insert(self.boot.iso_grub_binary_path(), StagedFile::file(path));
        }
        if let Some(path) = &store.iso_boot_image_path {
            files.insert(ISO_BOOT_IMAGE_PATH.to_string(), StagedFile::file(path));
        }
        if let Some(path) = &store.iso_grub_cfg_path {
            files.insert(self.relative(path)?, StagedFile::file(path));
        }
        if let Some(path) = store.pxe_grub_cfg_path.as_ref().filter(|p| p.exists()) {
            files.insert(self.relative(path)?, StagedFile::file(path));
        }
        if store.saved_configs_file_path.exists() {
            files.insert(
                SAVED_CONFIGS_FILE_PATH.to_string(),
                StagedFile::file(&store.saved_configs_file_path),
            );
        }
        if let Some(path) = &store.squashfs_image_path {
            files.insert(LIVE_OS_IMAGE_PATH.to_string(), StagedFile::file(path));
        }
        if let Some(path) = &store.initrd_image_path {
            files.insert(ISO_INITRD_PATH.to_string(), StagedFile::file(path));
        }

        for (version, kernel) in &store.kernel_boot_files {
            let primary = self.primary_kernel == Some(version.as_str());
            if let Some(vmlinuz) = &kernel.vmlinuz_path {
                let destination = if primary {
                    ISO_KERNEL_PATH.to_string()
                } else {
                    self.relative(vmlinuz)?
                };
                files.insert(destination, StagedFile::file(vmlinuz));
            }
            // The primary initramfs is replaced by /boot/initrd.img.
            if let Some(initrd) = kernel.initrd_image_path.as_ref().filter(|_| !primary) {
                files.insert(self.relative(initrd)?, StagedFile::file(initrd));
            }
            for other in &kernel.other_files {
                files.insert(self.relative(other)?, StagedFile::link(other));
            }
        }

        if self.kdump_boot_files == Some(KdumpBootFilesType::Keep) {
            for kdump in store.kdump_boot_files.values() {
                if let Some(initrd) = &kdump.initrd_image_path {
                    files.insert(self.relative(initrd)?, StagedFile::file(initrd));
                }
                if let Some(vmlinuz) = &kdump.vmlinuz_path {
                    let destination = self.relative(vmlinuz)?;
                    files.entry(destination).or_insert_with(|| StagedFile::file(vmlinuz));
                }
            }
        }

        for (local, destination) in &store.additional_files {
            files.insert(destination.clone(), StagedFile::link(local));
        }

        for file in self.extra_files {
            let source = match (&file.source, &file.content) {
                (Some(source), _) => StagedSource::File(self.base_dir.join(source)),
                (None, Some(content)) => StagedSource::Content(content.clone()),
                (None, None) => {
                    return Err(CustomizerError::invalid_config(
                        "additional file must have exactly one of 'source' or 'content'",
                    )
                    .with_path(&file.destination)
                    .into())
                }
            };
            let mode = file.permissions.as_deref().map(parse_permissions).transpose()?;
            let destination = format!("/{}", file.destination.trim_start_matches('/'));
            files.insert(destination, StagedFile { source, mode });
        }

        Ok(files)
    }

    /// Materialize the media tree under `dir`.
    pub fn stage(&self, log: &Logger, dir: &Path) -> Result<()> {
        let plan = self.plan()?;
        info!(log, "staging iso files"; "dir" => %dir.display(), "files" => plan.len());

        for (destination, file) in plan {
            let target = dir.join(destination.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create folder {}", parent.display()))?;
            }
            debug!(log, "staging"; "destination" => &destination);

            match &file.source {
                StagedSource::File(source) => {
                    fs::copy(source, &target).map_err(|e| {
                        CustomizerError::io(format!("failed to stage {}", destination))
                            .with_path(source)
                            .with_source(e)
                    })?;
                }
                StagedSource::Link(source) => copy_no_dereference(source, &target)
                    .with_context(|| format!("failed to stage {}", destination))?,
                StagedSource::Content(content) => fs::write(&target, content)
                    .with_context(|| format!("failed to write {}", target.display()))?,
            }

            if let Some(mode) = file.mode {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("failed to set permissions on {}", target.display()))?;
            }
        }
        Ok(())
    }
}

/// Run xorriso over a staged tree.
pub fn run_xorriso(staging_dir: &Path, output: &Path) -> Result<()> {
    Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-o"])
        .arg_path(output)
        .args(["-V", ISO_VOLUME_ID])
        .args(["-R", "-J", "-joliet-long"])
        .args(["-e", ISO_BOOT_IMAGE_PATH.trim_start_matches('/'), "-no-emul-boot"])
        .arg_path(staging_dir)
        .error_msg("xorriso failed. Install xorriso.")
        .run()?;
    Ok(())
}

/// Write an ISO from a staged tree.
pub fn create_iso_image(log: &Logger, staging_dir: &Path, output: &Path) -> Result<()> {
    let boot_image = staging_dir.join(ISO_BOOT_IMAGE_PATH.trim_start_matches('/'));
    if !boot_image.exists() {
        return Err(CustomizerError::missing("EFI boot image missing from iso staging folder")
            .with_path(&boot_image)
            .into());
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create folder {}", parent.display()))?;
    }

    info!(log, "creating iso"; "path" => %output.display());
    run_xorriso(staging_dir, output)?;
    info!(log, "iso written"; "path" => %output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{kind_of, ErrorKind};
    use crate::liveos::constants::AMD64_BOOT_FILES;
    use crate::liveos::store::{KdumpBootFiles, KernelBootFiles};
    use crate::logging;
    use tempfile::TempDir;

    const KERNEL: &str = "6.6.47.1-1.azl3";
    const OLD_KERNEL: &str = "6.6.44.1-2.azl3";

    fn touch(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn store(tmp: &TempDir) -> IsoFilesStore {
        let a = tmp.path().join("store/artifacts");
        let mut store = IsoFilesStore {
            artifacts_dir: a.clone(),
            boot_efi_path: Some(a.join("boot/efi/EFI/BOOT/bootx64.efi")),
            grub_efi_path: Some(a.join("boot/efi/EFI/BOOT/grubx64-noprefix.efi")),
            iso_boot_image_path: Some(a.join("boot/grub2/efiboot.img")),
            iso_grub_cfg_path: Some(a.join("EFI/BOOT/grub.cfg")),
            pxe_grub_cfg_path: Some(a.join("EFI/BOOT/grub-pxe.cfg")),
            saved_configs_file_path: a.join("azl-image-customizer/saved-configs.yaml"),
            squashfs_image_path: Some(a.join("liveos/rootfs.img")),
            initrd_image_path: Some(a.join("boot/initramfs-6.6.47.1-1.azl3.img")),
            ..Default::default()
        };
        store.kernel_boot_files.insert(
            KERNEL.to_string(),
            KernelBootFiles {
                vmlinuz_path: Some(a.join(format!("boot/vmlinuz-{}", KERNEL))),
                initrd_image_path: Some(a.join(format!("boot/initramfs-{}.img", KERNEL))),
                other_files: vec![a.join(format!("boot/config-{}", KERNEL))],
            },
        );
        store.kernel_boot_files.insert(
            OLD_KERNEL.to_string(),
            KernelBootFiles {
                vmlinuz_path: Some(a.join(format!("boot/vmlinuz-{}", OLD_KERNEL))),
                initrd_image_path: Some(a.join(format!("boot/initramfs-{}.img", OLD_KERNEL))),
                other_files: vec![],
            },
        );
        store.kdump_boot_files.insert(
            KERNEL.to_string(),
            KdumpBootFiles {
                vmlinuz_path: Some(a.join(format!("boot/vmlinuz-{}", KERNEL))),
                initrd_image_path: Some(a.join(format!("boot/initramfs-{}kdump.img", KERNEL))),
            },
        );
        store
            .additional_files
            .insert(a.join("boot/grub2/grubenv"), "/boot/grub2/grubenv".to_string());
        store
    }

    #[test]
    fn plan_maps_store_to_media() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let a = store.artifacts_dir.clone();
        let plan = IsoStaging::new(&store, &AMD64_BOOT_FILES)
            .primary_kernel(Some(KERNEL))
            .plan()
            .unwrap();

        assert_eq!(
            plan["/efi/boot/grubx64.efi"],
            StagedFile::file(&a.join("boot/efi/EFI/BOOT/grubx64-noprefix.efi"))
        );
        assert_eq!(
            plan["/boot/vmlinuz"],
            StagedFile::file(&a.join(format!("boot/vmlinuz-{}", KERNEL)))
        );
        assert_eq!(
            plan["/boot/initrd.img"],
            StagedFile::file(&a.join("boot/initramfs-6.6.47.1-1.azl3.img"))
        );
        assert!(plan.contains_key("/EFI/BOOT/grub.cfg"));
        assert!(plan.contains_key(&format!("/boot/config-{}", KERNEL)));
        assert!(plan.contains_key(&format!("/boot/vmlinuz-{}", OLD_KERNEL)));
        assert!(plan.contains_key(&format!("/boot/initramfs-{}.img", OLD_KERNEL)));
        assert!(!plan.contains_key(&format!("/boot/vmlinuz-{}", KERNEL)));
        assert!(!plan.contains_key(&format!("/boot/initramfs-{}.img", KERNEL)));
        assert!(!plan.contains_key(&format!("/boot/initramfs-{}kdump.img", KERNEL)));
        // Not written yet.
        assert!(!plan.contains_key("/EFI/BOOT/grub-pxe.cfg"));
        assert!(!plan.contains_key(SAVED_CONFIGS_FILE_PATH));
        assert!(plan.contains_key("/boot/grub2/grubenv"));
    }

    #[test]
    fn kdump_files_kept_on_request() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let plan = IsoStaging::new(&store, &AMD64_BOOT_FILES)
            .primary_kernel(Some(KERNEL))
            .kdump_boot_files(Some(KdumpBootFilesType::Keep))
            .plan()
            .unwrap();
        assert!(plan.contains_key(&format!("/boot/initramfs-{}kdump.img", KERNEL)));
        assert!(plan.contains_key(&format!("/boot/vmlinuz-{}", KERNEL)));
    }

    #[test]
    fn extra_files_from_config() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let extra = vec![
            AdditionalFile {
                source: Some("files/motd".into()),
                destination: "/etc/motd".into(),
                ..Default::default()
            },
            AdditionalFile {
                content: Some("set timeout=1\n".into()),
                destination: "boot/grub2/grubenv".into(),
                permissions: Some("0600".into()),
                ..Default::default()
            },
        ];
        let plan = IsoStaging::new(&store, &AMD64_BOOT_FILES)
            .extra_files(&extra, Path::new("/cfg"))
            .plan()
            .unwrap();
        assert_eq!(
            plan["/etc/motd"].source,
            StagedSource::File(PathBuf::from("/cfg/files/motd"))
        );
        assert_eq!(
            plan["/boot/grub2/grubenv"],
            StagedFile {
                source: StagedSource::Content("set timeout=1\n".into()),
                mode: Some(0o600)
            }
        );
    }

    #[test]
    fn bad_permissions_rejected() {
        let err = parse_permissions("rw-r--r--").unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::InvalidConfig));
        assert_eq!(parse_permissions("755").unwrap(), 0o755);
    }

    #[test]
    fn stage_writes_tree() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let a = store.artifacts_dir.clone();
        touch(&a.join("boot/efi/EFI/BOOT/bootx64.efi"), "shim");
        touch(&a.join("boot/efi/EFI/BOOT/grubx64-noprefix.efi"), "grub");
        touch(&a.join("boot/grub2/efiboot.img"), "fat");
        touch(&a.join("EFI/BOOT/grub.cfg"), "cfg");
        touch(&a.join("liveos/rootfs.img"), "squashfs");
        touch(&a.join(format!("boot/vmlinuz-{}", KERNEL)), "kernel");
        touch(&a.join(format!("boot/initramfs-{}.img", KERNEL)), "initrd");
        touch(&a.join(format!("boot/vmlinuz-{}", OLD_KERNEL)), "old kernel");
        touch(&a.join(format!("boot/initramfs-{}.img", OLD_KERNEL)), "old initrd");
        touch(&a.join("boot/grub2/grubenv"), "env");
        std::os::unix::fs::symlink(format!("config-{}-real", KERNEL), a.join(format!("boot/config-{}", KERNEL)))
            .unwrap();

        let staging = tmp.path().join("staging");
        let extra = vec![AdditionalFile {
            content: Some("hello\n".into()),
            destination: "/etc/motd".into(),
            permissions: Some("0640".into()),
            ..Default::default()
        }];
        IsoStaging::new(&store, &AMD64_BOOT_FILES)
            .primary_kernel(Some(KERNEL))
            .extra_files(&extra, tmp.path())
            .stage(&logging::discard(), &staging)
            .unwrap();

        assert_eq!(fs::read_to_string(staging.join("efi/boot/bootx64.efi")).unwrap(), "shim");
        assert_eq!(fs::read_to_string(staging.join("efi/boot/grubx64.efi")).unwrap(), "grub");
        assert_eq!(fs::read_to_string(staging.join("boot/vmlinuz")).unwrap(), "kernel");
        assert_eq!(fs::read_to_string(staging.join("boot/initrd.img")).unwrap(), "initrd");
        assert!(staging.join(format!("boot/config-{}", KERNEL)).is_symlink());
        let motd = staging.join("etc/motd");
        assert_eq!(fs::metadata(&motd).unwrap().permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn full_os_root_has_init() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("etc/fstab"), "/dev/sda2 / ext4 defaults 0 1\n");
        prepare_full_os_root(root).unwrap();
        assert!(!root.join("etc/fstab").exists());
        let init = fs::read_to_string(root.join("init")).unwrap();
        assert!(init.contains("mount -t proc proc /proc"));
        assert!(init.contains("/lib/systemd/systemd"));
        assert_eq!(fs::metadata(root.join("init")).unwrap().permissions().mode() & 0o777, 0o755);
    }

    #[test]
    fn iso_needs_boot_image() {
        let tmp = TempDir::new().unwrap();
        let err = create_iso_image(&logging::discard(), tmp.path(), &tmp.path().join("out.iso")).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::MissingArtifact));
    }
}
