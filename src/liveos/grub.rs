//! grub.cfg rewriting for LiveOS media.
//!
//! Edits are line based: only `search`, `linux` and `initrd` command lines
//! are touched, everything else is copied through byte for byte. Arguments
//! are whitespace separated tokens; `name=value` arguments are matched on
//! `name`.
//!
//! The ISO grub.cfg is derived from the image's own grub.cfg:
//!
//! - `search` commands locate the media by its volume label
//! - kernel and initrd paths point at `/boot/vmlinuz` and `/boot/initrd.img`
//! - `root=` points at the squashfs on the media, or is dropped when the
//!   initrd carries the whole OS
//! - saved extra arguments are appended
//!
//! The PXE variant drops `search`, points `root=` at the bootstrap ISO URL
//! and enables the network downloader.

use anyhow::{Context, Result};
use slog::{info, Logger};
use std::fs;
use std::path::Path;

use super::constants::{ISO_INITRD_PATH, ISO_KERNEL_PATH, ISO_VOLUME_ID, LIVE_OS_DIR, LIVE_OS_IMAGE};
use super::package_info::verify_dracut_pxe_support;
use super::pxe::bootstrap_file_url;
use super::saved_configs::SavedConfigs;
use super::selinux;
use crate::config::SELinuxMode;
use crate::error::CustomizerError;

pub const LINUX_COMMAND: &str = "linux";
pub const INITRD_COMMAND: &str = "initrd";
pub const SEARCH_COMMAND: &str = "search";

/// dracut dmsquash-live arguments for a squashfs rootfs on the media.
pub const LIVE_OS_KERNEL_ARGS: &[&str] = &[
    "rd.shell",
    "rd.live.image",
    "rd.live.overlay=1",
    "rd.live.overlay.overlayfs",
    "rd.live.overlay.nouserconfirmprompt",
];

/// Arguments enabling the dracut network downloader for PXE boot.
pub const PXE_KERNEL_ARGS: &[&str] = &["ip=dhcp", "rd.live.azldownloader=enable"];

fn live_os_kernel_args() -> Vec<String> {
    let mut args: Vec<String> = LIVE_OS_KERNEL_ARGS.iter().map(|s| s.to_string()).collect();
    args.insert(2, format!("rd.live.dir={}", LIVE_OS_DIR));
    args.insert(3, format!("rd.live.squashimg={}", LIVE_OS_IMAGE));
    args
}

fn search_command() -> String {
    format!("search --label {} --set root", ISO_VOLUME_ID)
}

/// Apply `edit` to the tokens of every line whose command is `command`.
///
/// An edit that empties the token list deletes the line. Returns the new
/// content and the number of lines visited.
fn edit_command_lines<F>(content: &str, command: &str, mut edit: F) -> Result<(String, usize)>
where
    F: FnMut(&mut Vec<String>) -> Result<()>,
{
    let mut out = String::with_capacity(content.len());
    let mut count = 0;

    for line in content.split_inclusive('\n') {
        let body = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
        let ending = &line[body.len()..];
        let trimmed = body.trim_start();
        let indent = &body[..body.len() - trimmed.len()];

        let mut tokens: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
        if tokens.first().map(String::as_str) != Some(command) {
            out.push_str(line);
            continue;
        }

        count += 1;
        edit(&mut tokens)?;
        if tokens.is_empty() {
            continue;
        }
        out.push_str(indent);
        out.push_str(&tokens.join(" "));
        out.push_str(ending);
    }

    Ok((out, count))
}

fn arg_name(arg: &str) -> &str {
    arg.split_once('=').map(|(name, _)| name).unwrap_or(arg)
}

fn missing_command(command: &str) -> anyhow::Error {
    CustomizerError::structural(format!("failed to find a '{}' command in grub.cfg", command))
        .with_identifier(command)
        .into()
}

/// Replace every `search` command with `new_command`.
pub fn replace_search_commands(content: &str, new_command: &str) -> Result<String> {
    let (out, count) = edit_command_lines(content, SEARCH_COMMAND, |tokens| {
        *tokens = new_command.split_whitespace().map(str::to_string).collect();
        Ok(())
    })?;
    if count == 0 {
        return Err(missing_command(SEARCH_COMMAND));
    }
    Ok(out)
}

/// Delete every line running `command`.
pub fn remove_commands(content: &str, command: &str) -> Result<String> {
    let (out, _) = edit_command_lines(content, command, |tokens| {
        tokens.clear();
        Ok(())
    })?;
    Ok(out)
}

/// Point the file argument of every `linux` or `initrd` command at `path`.
pub fn set_command_path_all(content: &str, command: &str, path: &str) -> Result<String> {
    let (out, count) = edit_command_lines(content, command, |tokens| {
        if tokens.len() < 2 {
            return Err(CustomizerError::structural(format!(
                "grub.cfg '{}' command has no file argument",
                command
            ))
            .into());
        }
        tokens[1] = path.to_string();
        Ok(())
    })?;
    if count == 0 {
        return Err(missing_command(command));
    }
    Ok(out)
}

/// Kernel arguments of the first `linux` command.
pub fn linux_command_line_args(content: &str) -> Result<Vec<String>> {
    let mut found = None;
    edit_command_lines(content, LINUX_COMMAND, |tokens| {
        if found.is_none() {
            found = Some(tokens.iter().skip(2).cloned().collect::<Vec<_>>());
        }
        Ok(())
    })?;
    found.ok_or_else(|| missing_command(LINUX_COMMAND))
}

/// On every `linux` line, drop the arguments named in `remove` and insert
/// `new_args` where the first of them was (or at the end).
pub fn update_kernel_args(content: &str, remove: &[&str], new_args: &[String]) -> Result<String> {
    let (out, count) = edit_command_lines(content, LINUX_COMMAND, |tokens| {
        let fixed = tokens.len().min(2);
        let mut insert_at = None;
        let mut kept: Vec<String> = tokens.drain(..fixed).collect();
        for arg in tokens.drain(..) {
            if remove.contains(&arg_name(&arg)) {
                insert_at.get_or_insert(kept.len());
            } else {
                kept.push(arg);
            }
        }
        let at = insert_at.unwrap_or(kept.len());
        kept.splice(at..at, new_args.iter().cloned());
        *tokens = kept;
        Ok(())
    })?;
    if count == 0 {
        return Err(missing_command(LINUX_COMMAND));
    }
    Ok(out)
}

/// Set `name=value` on every `linux` line. Each line must carry exactly one
/// `name` argument.
pub fn replace_kernel_arg_value(content: &str, name: &str, value: &str) -> Result<String> {
    let new_arg = format!("{}={}", name, value);
    let (out, count) = edit_command_lines(content, LINUX_COMMAND, |tokens| {
        let positions: Vec<usize> = tokens
            .iter()
            .enumerate()
            .skip(2)
            .filter(|(_, arg)| arg_name(arg) == name)
            .map(|(i, _)| i)
            .collect();
        match positions.as_slice() {
            [i] => {
                tokens[*i] = new_arg.clone();
                Ok(())
            }
            [] => Err(CustomizerError::structural(format!("failed to find kernel arg ({})", name))
                .with_identifier(name)
                .into()),
            _ => Err(CustomizerError::structural(format!(
                "too many instances of kernel arg found ({})",
                name
            ))
            .with_identifier(name)
            .into()),
        }
    })?;
    if count == 0 {
        return Err(missing_command(LINUX_COMMAND));
    }
    Ok(out)
}

/// Append `args` to every `linux` line, skipping arguments already present
/// verbatim so that repeated rebuilds do not accumulate duplicates.
pub fn append_kernel_args(content: &str, args: &[String]) -> Result<String> {
    let (out, count) = edit_command_lines(content, LINUX_COMMAND, |tokens| {
        for arg in args {
            if !tokens.iter().skip(2).any(|existing| existing == arg) {
                tokens.push(arg.clone());
            }
        }
        Ok(())
    })?;
    if count == 0 {
        return Err(missing_command(LINUX_COMMAND));
    }
    Ok(out)
}

/// Inputs for deriving the ISO and PXE grub configs.
#[derive(Debug, Clone, Copy)]
pub struct GrubCfgUpdate<'a> {
    /// The initrd carries the full OS; no squashfs on the media.
    pub initrd_self_contained: bool,
    pub disable_selinux: bool,
    pub saved: &'a SavedConfigs,
    /// Name of the ISO the PXE bootstrap downloads when only a base URL is set.
    pub iso_image_name: &'a str,
}

/// ISO grub.cfg content derived from the image grub.cfg.
pub fn iso_grub_cfg_content(content: &str, update: &GrubCfgUpdate<'_>) -> Result<String> {
    let mut content = replace_search_commands(content, &search_command())
        .context("failed to update the search command in the iso grub.cfg")?;
    content = set_command_path_all(&content, LINUX_COMMAND, ISO_KERNEL_PATH)
        .context("failed to update the kernel file path in the iso grub.cfg")?;
    content = set_command_path_all(&content, INITRD_COMMAND, ISO_INITRD_PATH)
        .context("failed to update the initrd file path in the iso grub.cfg")?;

    let mut extra_args = Vec::new();
    if update.initrd_self_contained {
        content = update_kernel_args(&content, &["root"], &[])
            .context("failed to remove the root kernel argument in the iso grub.cfg")?;
    } else {
        content = replace_kernel_arg_value(&content, "root", &format!("live:LABEL={}", ISO_VOLUME_ID))
            .context("failed to update the root kernel argument in the iso grub.cfg")?;
        extra_args.extend(live_os_kernel_args());
    }

    if update.disable_selinux {
        content = selinux::set_selinux_mode_args(&content, SELinuxMode::Disabled)
            .context("failed to set SELinux mode")?;
    }

    extra_args.extend(
        update
            .saved
            .liveos
            .kernel_command_line
            .extra_command_line
            .iter()
            .cloned(),
    );
    append_kernel_args(&content, &extra_args).context(
        "failed to update the kernel arguments with the LiveOS and user configuration in the iso grub.cfg",
    )
}

/// PXE grub.cfg content derived from the finished ISO grub.cfg.
pub fn pxe_grub_cfg_content(
    iso_content: &str,
    initrd_self_contained: bool,
    base_url: &str,
    file_url: &str,
    iso_image_name: &str,
) -> Result<String> {
    let mut content = remove_commands(iso_content, SEARCH_COMMAND)
        .context("failed to remove the 'search' commands from PXE grub.cfg")?;

    if !initrd_self_contained {
        let url = bootstrap_file_url(base_url, file_url, iso_image_name)?;
        content = replace_kernel_arg_value(&content, "root", &format!("live:{}", url)).context(
            "failed to update the root kernel argument with the PXE iso image url in the PXE grub.cfg",
        )?;
    }

    let pxe_args: Vec<String> = PXE_KERNEL_ARGS.iter().map(|s| s.to_string()).collect();
    append_kernel_args(&content, &pxe_args).context("failed to append the PXE kernel arguments")
}

/// Rewrite `iso_grub_cfg` in place and, when dracut supports it, write the
/// PXE variant to `pxe_grub_cfg`.
///
/// Returns whether the PXE grub.cfg was written.
pub fn update_grub_cfg(
    log: &Logger,
    iso_grub_cfg: &Path,
    pxe_grub_cfg: &Path,
    update: &GrubCfgUpdate<'_>,
) -> Result<bool> {
    info!(log, "updating ISO grub.cfg"; "path" => %iso_grub_cfg.display());

    let input = fs::read_to_string(iso_grub_cfg)
        .with_context(|| format!("failed to read {}", iso_grub_cfg.display()))?;
    let iso_content = iso_grub_cfg_content(&input, update)
        .with_context(|| format!("failed to update {}", iso_grub_cfg.display()))?;
    fs::write(iso_grub_cfg, &iso_content)
        .with_context(|| format!("failed to write {}", iso_grub_cfg.display()))?;

    // PXE output is never requested explicitly, so an image that cannot PXE
    // boot only loses the PXE grub.cfg.
    let dracut_check = match &update.saved.os.dracut_package {
        Some(dracut) => verify_dracut_pxe_support(dracut),
        None => Err(anyhow::anyhow!("dracut package information is missing")),
    };
    if let Err(e) = dracut_check {
        info!(log, "cannot generate grub.cfg for PXE booting"; "reason" => format!("{:#}", e));
        return Ok(false);
    }

    let pxe = &update.saved.pxe;
    if !update.initrd_self_contained && pxe.bootstrap_base_url.is_empty() && pxe.bootstrap_file_url.is_empty() {
        info!(log, "no PXE bootstrap URL configured, skipping PXE grub.cfg");
        return Ok(false);
    }

    let pxe_content = pxe_grub_cfg_content(
        &iso_content,
        update.initrd_self_contained,
        &pxe.bootstrap_base_url,
        &pxe.bootstrap_file_url,
        update.iso_image_name,
    )
    .context("failed to create grub configuration for PXE booting")?;
    fs::write(pxe_grub_cfg, pxe_content)
        .with_context(|| format!("failed to write {}", pxe_grub_cfg.display()))?;
    info!(log, "wrote PXE grub.cfg"; "path" => %pxe_grub_cfg.display());
    Ok(true)
}
