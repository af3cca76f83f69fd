//! LiveOS ISO/PXE build orchestration.
//!
//! ```text
//! image root ─┐
//!             ├─► artifact store ─► saved configs ─► SELinux gate
//! input iso ──┘        │
//!                      ├─► squashfs (bootstrap) | cpio initrd (full-os)
//!                      ├─► grub.cfg / grub-pxe.cfg
//!                      ├─► efiboot.img
//!                      └─► staging ─► .iso and/or PXE dir / .tar.gz
//! ```
//!
//! Work directories live under the build directory and are released in
//! reverse order when the build ends, with cleanup failures joined onto the
//! result.

use anyhow::{Context, Result};
use slog::{info, warn, Logger};
use std::path::{Path, PathBuf};

use super::constants::{
    host_boot_arch_config, BootFilesArchConfig, DEFAULT_ISO_IMAGE_NAME, ISO_BOOT_IMAGE_PATH,
    ISO_INITRD_PATH, LIVE_OS_IMAGE_PATH,
};
use super::grub::{update_grub_cfg, GrubCfgUpdate};
use super::iso::{create_efi_boot_image, create_full_os_initrd, create_iso_image, create_squashfs_image, IsoStaging};
use super::kernel::{AzureLinuxKernelMatcher, KernelVersionMatcher};
use super::pxe::{create_pxe_artifacts, PxeOutput};
use super::saved_configs::{update_saved_configs, SavedConfigs, SavedConfigsUpdate};
use super::selinux::resolve_selinux_state;
use super::store::IsoArtifactsStore;
use crate::config::{AdditionalFile, Config, InitramfsImageType, KernelCommandLine, SELinuxMode};
use crate::distro::{self, DistroHandler};
use crate::error::CustomizerError;
use crate::history::add_image_history;
use crate::resources::{read_mounts, CleanupStack, ScratchDir};

const INPUT_STORE_DIR: &str = "input-iso-store";
const STORE_DIR: &str = "iso-store";
const STAGING_DIR: &str = "iso-staging";

/// Inputs of a LiveOS build.
#[derive(Debug, Clone, Default)]
pub struct LiveOsOptions {
    pub build_dir: PathBuf,
    /// Directory relative config paths resolve against.
    pub base_config_dir: PathBuf,
    pub config: Config,
    pub input_iso: Option<PathBuf>,
    pub output_iso: Option<PathBuf>,
    /// Directory, or a path ending in `.tar.gz`.
    pub output_pxe: Option<PathBuf>,
    /// Hyphenated UUID recorded in the image history.
    pub image_uuid: String,
}

impl LiveOsOptions {
    /// `--initramfs-type` from the PXE section when PXE output is requested,
    /// otherwise from the ISO section. Defaults to bootstrap.
    pub fn initramfs_type(&self) -> InitramfsImageType {
        let pxe = self.config.pxe.as_ref().and_then(|p| p.initramfs_type);
        let iso = self.config.iso.as_ref().and_then(|i| i.initramfs_type);
        let preferred = if self.output_pxe.is_some() { pxe.or(iso) } else { iso.or(pxe) };
        preferred.unwrap_or(InitramfsImageType::Bootstrap)
    }

    /// Extra kernel arguments: ISO section first, then PXE.
    pub fn kernel_command_line(&self) -> KernelCommandLine {
        let mut extra = Vec::new();
        if let Some(iso) = &self.config.iso {
            extra.extend(iso.kernel_command_line.extra_command_line.iter().cloned());
        }
        if let Some(pxe) = &self.config.pxe {
            extra.extend(pxe.kernel_command_line.extra_command_line.iter().cloned());
        }
        KernelCommandLine {
            extra_command_line: extra,
        }
    }

    pub fn additional_files(&self) -> Vec<AdditionalFile> {
        let iso = self.config.iso.iter().flat_map(|i| i.additional_files.iter());
        let pxe = self.config.pxe.iter().flat_map(|p| p.additional_files.iter());
        iso.chain(pxe).cloned().collect()
    }

    /// Name of the ISO on the media server: the output ISO's file name when
    /// there is one.
    pub fn iso_image_name(&self) -> String {
        self.output_iso
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_ISO_IMAGE_NAME.to_string())
    }

    fn saved_configs_update(&self) -> SavedConfigsUpdate {
        let pxe = self.config.pxe.clone().unwrap_or_default();
        SavedConfigsUpdate {
            kernel_command_line: self.kernel_command_line(),
            bootstrap_base_url: pxe.bootstrap_base_url,
            bootstrap_file_url: pxe.bootstrap_file_url,
            kdump_boot_files: self.config.iso.as_ref().and_then(|i| i.kdump_boot_files),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.output_iso.is_none() && self.output_pxe.is_none() {
            return Err(CustomizerError::invalid_config("no ISO or PXE output requested").into());
        }
        self.config.validate()
    }
}

/// Builds LiveOS media from an image root or an existing ISO.
pub struct LiveOsBuilder {
    log: Logger,
    options: LiveOsOptions,
    boot: BootFilesArchConfig,
    matcher: Box<dyn KernelVersionMatcher>,
    /// Detected from the image's os-release when unset.
    handler: Option<Box<dyn DistroHandler>>,
}

impl LiveOsBuilder {
    pub fn new(log: &Logger, options: LiveOsOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            log: log.clone(),
            options,
            boot: host_boot_arch_config()?,
            matcher: Box::new(AzureLinuxKernelMatcher),
            handler: None,
        })
    }

    /// Replace the kernel file name matcher.
    pub fn with_kernel_matcher(mut self, matcher: Box<dyn KernelVersionMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Use `handler` for the image instead of detecting it.
    pub fn with_distro_handler(mut self, handler: Box<dyn DistroHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build from a mounted image root, carrying extra files of the input
    /// ISO forward when one is set.
    pub fn build_from_image(&self, image_root: &Path) -> Result<()> {
        let mut stack = CleanupStack::new(self.log.clone());
        let result = self.build_from_image_inner(image_root, &mut stack);
        stack
            .finish(result)
            .with_context(|| format!("failed to create LiveOS media from {}", image_root.display()))
    }

    /// Rebuild from the input ISO with new LiveOS settings; the OS is
    /// unchanged.
    pub fn rebuild_from_iso(&self) -> Result<()> {
        let iso = self.options.input_iso.as_deref().ok_or_else(|| {
            CustomizerError::invalid_config("an input ISO is required to rebuild LiveOS media")
        })?;
        let mut stack = CleanupStack::new(self.log.clone());
        let result = self.rebuild_from_iso_inner(iso, &mut stack);
        stack
            .finish(result)
            .with_context(|| format!("failed to rebuild LiveOS media from {}", iso.display()))
    }

    fn scratch(&self, stack: &mut CleanupStack, name: &str) -> Result<PathBuf> {
        let dir = ScratchDir::create(&self.log, self.options.build_dir.join(name))?;
        let path = dir.path().to_path_buf();
        stack.push(dir);
        Ok(path)
    }

    fn build_from_image_inner(&self, image_root: &Path, stack: &mut CleanupStack) -> Result<()> {
        let log = &self.log;
        let options = &self.options;

        let mounts = read_mounts()?;
        add_image_history(
            log,
            image_root,
            &mounts,
            &options.config,
            &options.base_config_dir,
            &options.image_uuid,
        )
        .context("failed to add image history")?;

        let detected;
        let handler: &dyn DistroHandler = match &self.handler {
            Some(handler) => handler.as_ref(),
            None => {
                detected = distro::detect(image_root)?;
                detected.as_ref()
            }
        };
        info!(log, "building LiveOS media";
            "distro" => handler.name(), "version" => handler.version(), "root" => %image_root.display());

        let input = match &options.input_iso {
            Some(iso) => {
                let dir = self.scratch(stack, INPUT_STORE_DIR)?;
                Some(IsoArtifactsStore::from_iso_image(log, iso, &dir, &self.boot, self.matcher.as_ref())?)
            }
            None => None,
        };

        let store_dir = self.scratch(stack, STORE_DIR)?;
        let mut store = IsoArtifactsStore::from_mounted_image(
            log,
            input.as_ref(),
            image_root,
            &store_dir,
            handler,
            &self.boot,
            self.matcher.as_ref(),
        )?;
        if let Some(input) = input {
            input.clean_up()?;
        }

        let previous = SavedConfigs::load(&store.files.saved_configs_file_path)?;
        let preferred = previous.as_ref().map(|s| s.os.kernel_version.as_str()).filter(|v| !v.is_empty());
        let primary = store
            .files
            .primary_kernel(preferred)
            .map(|(version, files)| (version.to_string(), files.clone()))
            .ok_or_else(|| {
                CustomizerError::missing("failed to find a kernel under /boot").with_path(image_root.join("boot"))
            })?;
        let (kernel_version, kernel_files) = primary;
        info!(log, "selected kernel"; "version" => &kernel_version);

        let saved = update_saved_configs(
            log,
            &store.files.saved_configs_file_path,
            SavedConfigsUpdate {
                kernel_version: kernel_version.clone(),
                dracut_package: store.info.dracut_package_info.clone(),
                requested_selinux_mode: options.config.selinux_mode(),
                selinux_policy_package: store.info.selinux_policy_package_info.clone(),
                ..options.saved_configs_update()
            },
        )?;
        store.info.kdump_boot_files = saved.liveos.kdump_boot_files;

        let disable_selinux = resolve_selinux_state(
            log,
            store.info.selinux_mode,
            saved.os.selinux_requested_mode,
            store.info.dracut_package_info.as_ref(),
            store.info.selinux_policy_package_info.as_ref(),
        )?;

        let artifacts = store.files.artifacts_dir.clone();
        let initramfs_type = options.initramfs_type();
        match initramfs_type {
            InitramfsImageType::Bootstrap => {
                let squashfs = artifacts.join(LIVE_OS_IMAGE_PATH.trim_start_matches('/'));
                create_squashfs_image(log, image_root, &squashfs)?;
                store.files.squashfs_image_path = Some(squashfs);
                let initrd = kernel_files.initrd_image_path.clone().ok_or_else(|| {
                    CustomizerError::missing("failed to find the initramfs of the selected kernel")
                        .with_identifier(kernel_version.as_str())
                })?;
                store.files.initrd_image_path = Some(initrd);
            }
            InitramfsImageType::FullOs => {
                let initrd = artifacts.join(ISO_INITRD_PATH.trim_start_matches('/'));
                create_full_os_initrd(log, image_root, &options.build_dir, &initrd)?;
                store.files.initrd_image_path = Some(initrd);
                store.files.squashfs_image_path = None;
            }
        }

        self.update_boot_config(&mut store, &saved, initramfs_type == InitramfsImageType::FullOs, disable_selinux)?;
        self.write_outputs(&store, &saved, Some(kernel_version.as_str()), stack)
    }

    fn rebuild_from_iso_inner(&self, iso: &Path, stack: &mut CleanupStack) -> Result<()> {
        let log = &self.log;
        let store_dir = self.scratch(stack, STORE_DIR)?;
        let mut store = IsoArtifactsStore::from_iso_image(log, iso, &store_dir, &self.boot, self.matcher.as_ref())?;

        let saved = update_saved_configs(
            log,
            &store.files.saved_configs_file_path,
            SavedConfigsUpdate {
                requested_selinux_mode: SELinuxMode::Default,
                ..self.options.saved_configs_update()
            },
        )?;
        store.info.kdump_boot_files = saved.liveos.kdump_boot_files;

        let self_contained = store.files.squashfs_image_path.is_none();
        if store.files.initrd_image_path.is_none() {
            return Err(CustomizerError::missing("input iso has no initrd image")
                .with_path(iso)
                .with_identifier(ISO_INITRD_PATH)
                .into());
        }

        self.update_boot_config(&mut store, &saved, self_contained, false)?;
        self.write_outputs(&store, &saved, None, stack)
    }

    /// Rewrite grub.cfg, derive the PXE variant and make sure the EFI boot
    /// image exists.
    fn update_boot_config(
        &self,
        store: &mut IsoArtifactsStore,
        saved: &SavedConfigs,
        initrd_self_contained: bool,
        disable_selinux: bool,
    ) -> Result<()> {
        let files = &mut store.files;
        let iso_cfg = files.iso_grub_cfg_path.clone().ok_or_else(|| {
            CustomizerError::missing("failed to find grub.cfg").with_path(&files.artifacts_dir)
        })?;
        let pxe_cfg = files
            .pxe_grub_cfg_path
            .clone()
            .unwrap_or_else(|| iso_cfg.with_file_name(super::constants::PXE_GRUB_CFG));

        let iso_image_name = self.options.iso_image_name();
        let pxe_written = update_grub_cfg(
            &self.log,
            &iso_cfg,
            &pxe_cfg,
            &GrubCfgUpdate {
                initrd_self_contained,
                disable_selinux,
                saved,
                iso_image_name: &iso_image_name,
            },
        )?;
        if pxe_written {
            files.pxe_grub_cfg_path = Some(pxe_cfg);
        } else if self.options.output_pxe.is_some() {
            warn!(self.log, "PXE output will boot with the ISO grub.cfg");
        }

        if files.iso_boot_image_path.is_none() {
            let (boot_efi, grub_efi) = match (&files.boot_efi_path, &files.grub_efi_path) {
                (Some(b), Some(g)) => (b.clone(), g.clone()),
                _ => {
                    return Err(CustomizerError::missing("EFI boot binaries are missing from the store")
                        .with_path(&files.artifacts_dir)
                        .into())
                }
            };
            let image = files.artifacts_dir.join(ISO_BOOT_IMAGE_PATH.trim_start_matches('/'));
            create_efi_boot_image(&self.log, &boot_efi, &grub_efi, &self.boot, &image)?;
            files.iso_boot_image_path = Some(image);
        }
        Ok(())
    }

    fn write_outputs(
        &self,
        store: &IsoArtifactsStore,
        saved: &SavedConfigs,
        primary_kernel: Option<&str>,
        stack: &mut CleanupStack,
    ) -> Result<()> {
        let log = &self.log;
        let options = &self.options;
        let extra_files = options.additional_files();
        let staging = IsoStaging::new(&store.files, &self.boot)
            .primary_kernel(primary_kernel)
            .kdump_boot_files(store.info.kdump_boot_files)
            .extra_files(&extra_files, &options.base_config_dir);

        let staging_dir = self.scratch(stack, STAGING_DIR)?;
        staging.stage(log, &staging_dir)?;

        if let Some(output) = &options.output_iso {
            create_iso_image(log, &staging_dir, output)?;
        }

        if let Some(output) = &options.output_pxe {
            let pxe = PxeOutput {
                path: output.clone(),
                initramfs_type: if store.files.squashfs_image_path.is_some() {
                    InitramfsImageType::Bootstrap
                } else {
                    InitramfsImageType::FullOs
                },
                bootstrap_base_url: saved.pxe.bootstrap_base_url.clone(),
                bootstrap_file_url: saved.pxe.bootstrap_file_url.clone(),
                iso_image_name: options.iso_image_name(),
            };
            create_pxe_artifacts(
                log,
                store,
                &self.boot,
                &options.build_dir,
                &pxe,
                |dir| staging.stage(log, dir),
                |iso| create_iso_image(log, &staging_dir, iso),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Iso, KdumpBootFilesType, Os, Pxe, SELinux};
    use crate::cosi::metadata::{BootloaderType, OsPackage};
    use crate::error::{kind_of, ErrorKind};
    use crate::history::{history_file_path, read_image_history};
    use crate::liveos::package_info::PackageVersionInformation;
    use crate::logging;
    use crate::preflight::command_exists;
    use std::fs;
    use tempfile::TempDir;

    const KERNEL: &str = "6.6.47.1-1.azl3";
    const IMAGE_UUID: &str = "0c3d7a8e-5b1f-4f57-9a41-2f1f6b0e2d11";

    /// Azure Linux 3 image with the given dracut release and no
    /// selinux-policy package.
    struct FakeAzureLinux {
        dracut_release: u32,
    }

    impl DistroHandler for FakeAzureLinux {
        fn name(&self) -> &'static str {
            "azurelinux"
        }
        fn version(&self) -> &str {
            "3.0"
        }
        fn manage_packages(&self, _: &Logger, _: &Path, _: &[String], _: &[String]) -> Result<()> {
            Ok(())
        }
        fn is_package_installed(&self, _: &Path, package: &str) -> bool {
            package == "dracut"
        }
        fn get_all_packages(&self, _: &Path) -> Result<Vec<OsPackage>> {
            Ok(vec![])
        }
        fn package_info(&self, _: &Path, _: &str) -> Result<PackageVersionInformation> {
            Ok(PackageVersionInformation::new(&[102], self.dracut_release, "azl", 3))
        }
        fn detect_bootloader_type(&self, _: &Path) -> Result<BootloaderType> {
            Ok(BootloaderType::Grub)
        }
        fn grub_config_path(&self) -> &'static str {
            "/boot/grub2/grub.cfg"
        }
        fn supports_selinux(&self) -> bool {
            true
        }
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Image root with SELinux enforcing and one kernel.
    fn image_root(tmp: &TempDir, boot: &BootFilesArchConfig) -> PathBuf {
        let root = tmp.path().join("rootfs");
        write(&root, &format!("boot/efi/EFI/BOOT/{}", boot.boot_binary), "shim");
        write(&root, &format!("boot/efi/EFI/BOOT/{}", boot.grub_binary), "grub");
        write(
            &root,
            "boot/grub2/grub.cfg",
            &format!(
                "search --no-floppy --fs-uuid --set=root 4b7a4fd3\n\
                 linux /boot/vmlinuz-{k} root=PARTUUID=0b1c7a6a-01 ro security=selinux selinux=1\n\
                 initrd /boot/initramfs-{k}.img\n",
                k = KERNEL
            ),
        );
        write(&root, &format!("boot/vmlinuz-{}", KERNEL), "kernel");
        write(&root, &format!("boot/initramfs-{}.img", KERNEL), "initrd");
        write(&root, "etc/selinux/config", "SELINUX=enforcing\nSELINUXTYPE=targeted\n");
        write(&root, "etc/hostname", "edge-01\n");
        root
    }

    fn image_builder(tmp: &TempDir, selinux: SELinuxMode, dracut_release: u32) -> LiveOsBuilder {
        let config = Config {
            os: Some(Os {
                selinux: SELinux { mode: selinux },
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = LiveOsOptions {
            build_dir: tmp.path().join("build"),
            base_config_dir: tmp.path().to_path_buf(),
            config,
            output_iso: Some(tmp.path().join("out/live.iso")),
            image_uuid: IMAGE_UUID.to_string(),
            ..Default::default()
        };
        LiveOsBuilder::new(&logging::discard(), options)
            .unwrap()
            .with_distro_handler(Box::new(FakeAzureLinux { dracut_release }))
    }

    fn options(config: Config) -> LiveOsOptions {
        LiveOsOptions {
            build_dir: PathBuf::from("/tmp/build"),
            config,
            output_iso: Some(PathBuf::from("/out/edge-01.iso")),
            ..Default::default()
        }
    }

    #[test]
    fn initramfs_type_prefers_output_section() {
        let config = Config {
            iso: Some(Iso {
                initramfs_type: Some(InitramfsImageType::FullOs),
                ..Default::default()
            }),
            pxe: Some(Pxe {
                initramfs_type: Some(InitramfsImageType::Bootstrap),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut opts = options(config);
        assert_eq!(opts.initramfs_type(), InitramfsImageType::FullOs);
        opts.output_pxe = Some(PathBuf::from("/out/pxe"));
        assert_eq!(opts.initramfs_type(), InitramfsImageType::Bootstrap);
        assert_eq!(options(Config::default()).initramfs_type(), InitramfsImageType::Bootstrap);
    }

    #[test]
    fn saved_update_from_config() {
        let config = Config {
            iso: Some(Iso {
                kernel_command_line: KernelCommandLine {
                    extra_command_line: vec!["console=ttyS0".into()],
                },
                kdump_boot_files: Some(KdumpBootFilesType::Keep),
                ..Default::default()
            }),
            pxe: Some(Pxe {
                kernel_command_line: KernelCommandLine {
                    extra_command_line: vec!["rd.debug".into()],
                },
                bootstrap_base_url: "http://pxe.example/isos".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let update = options(config).saved_configs_update();
        assert_eq!(update.kernel_command_line.extra_command_line, vec!["console=ttyS0", "rd.debug"]);
        assert_eq!(update.bootstrap_base_url, "http://pxe.example/isos");
        assert_eq!(update.kdump_boot_files, Some(KdumpBootFilesType::Keep));
        assert_eq!(update.requested_selinux_mode, SELinuxMode::Default);
    }

    #[test]
    fn iso_image_name_from_output() {
        assert_eq!(options(Config::default()).iso_image_name(), "edge-01.iso");
        let opts = LiveOsOptions::default();
        assert_eq!(opts.iso_image_name(), DEFAULT_ISO_IMAGE_NAME);
    }

    #[test]
    fn explicit_selinux_with_old_dracut_stops_before_outputs() {
        let tmp = TempDir::new().unwrap();
        let builder = image_builder(&tmp, SELinuxMode::Enforcing, 7);
        let root = image_root(&tmp, &builder.boot);

        let err = builder.build_from_image(&root).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Policy));
        assert!(format!("{:#}", err).contains("dracut"));

        // History is written before the store is built.
        let history = read_image_history(&history_file_path(&root)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].image_uuid, IMAGE_UUID);

        let build = tmp.path().join("build");
        assert!(!build.join(STORE_DIR).exists());
        assert!(!build.join(STAGING_DIR).exists());
        assert!(!tmp.path().join("out/live.iso").exists());
    }

    #[test]
    fn missing_grub_binary_is_reported_after_history() {
        let tmp = TempDir::new().unwrap();
        let builder = image_builder(&tmp, SELinuxMode::Default, 11);
        let root = image_root(&tmp, &builder.boot);
        fs::remove_file(root.join("boot/efi/EFI/BOOT").join(builder.boot.grub_binary)).unwrap();

        let err = builder.build_from_image(&root).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::MissingArtifact));
        assert!(history_file_path(&root).exists());
        assert!(!tmp.path().join("build").join(STORE_DIR).exists());
    }

    #[test]
    fn builds_iso_from_image_root() {
        let tools = ["dd", "mkfs.fat", "mmd", "mcopy", "mksquashfs", "xorriso"];
        if !tools.iter().all(|t| command_exists(t)) {
            return;
        }

        let tmp = TempDir::new().unwrap();
        let builder = image_builder(&tmp, SELinuxMode::Default, 11);
        let root = image_root(&tmp, &builder.boot);

        builder.build_from_image(&root).unwrap();

        let iso = tmp.path().join("out/live.iso");
        assert!(fs::metadata(&iso).unwrap().len() > 0);
        assert_eq!(read_image_history(&history_file_path(&root)).unwrap().len(), 1);
        let build = tmp.path().join("build");
        assert!(!build.join(STORE_DIR).exists());
        assert!(!build.join(STAGING_DIR).exists());
    }

    #[test]
    fn output_required() {
        let err = LiveOsOptions::default().validate().unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::InvalidConfig));
    }
}
