//! Customization configuration.
//!
//! The YAML file passed on the command line deserializes into [`Config`].
//! Field names are camelCase to match the documented file format, and the
//! same structs serialize to JSON for the image history record.
//!
//! ```rust,ignore
//! use image_customizer::config::Config;
//!
//! let config = Config::load(Path::new("image.yaml"))?;
//! let settings = config.cosi_compression();
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::disk::zstd::CompressionSettings;
use crate::error::CustomizerError;

pub const DEFAULT_COSI_COMPRESSION_LEVEL: i32 = 9;
pub const MIN_COSI_COMPRESSION_LEVEL: i32 = 1;
pub const MAX_COSI_COMPRESSION_LEVEL: i32 = 22;
/// zstd `--long` window log used for COSI images (2^27 = 128 MiB).
pub const DEFAULT_COSI_COMPRESSION_LONG: u32 = 27;

/// Protocols accepted for PXE bootstrap ISO downloads.
pub const PXE_ISO_DOWNLOAD_PROTOCOLS: &[&str] = &["ftp://", "http://", "https://", "nfs://", "tftp://"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso: Option<Iso>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pxe: Option<Pxe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Os>,
    #[serde(default)]
    pub scripts: Scripts,
    #[serde(default)]
    pub output: Output,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Os {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default)]
    pub selinux: SELinux,
    #[serde(default)]
    pub kernel_command_line: KernelCommandLine,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_files: Vec<AdditionalFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_dirs: Vec<AdditionalDir>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
    #[serde(default)]
    pub image_history: ImageHistoryMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SELinux {
    #[serde(default)]
    pub mode: SELinuxMode,
}

/// Requested SELinux mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SELinuxMode {
    /// Keep whatever the image already has.
    #[default]
    #[serde(alias = "")]
    Default,
    Disabled,
    Permissive,
    Enforcing,
    ForceEnforcing,
}

impl SELinuxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SELinuxMode::Default => "default",
            SELinuxMode::Disabled => "disabled",
            SELinuxMode::Permissive => "permissive",
            SELinuxMode::Enforcing => "enforcing",
            SELinuxMode::ForceEnforcing => "force-enforcing",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCommandLine {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_command_line: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(default, rename = "sha256hash", skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalDir {
    pub source: String,
    pub destination: String,
    #[serde(default, rename = "sha256hashmap", skip_serializing_if = "Option::is_none")]
    pub sha256_hash_map: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_key_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_group: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageHistoryMode {
    #[default]
    #[serde(alias = "")]
    Default,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scripts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_customization: Vec<Script>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize_customization: Vec<Script>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "sha256hash", skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
}

/// Which initramfs the LiveOS output boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitramfsImageType {
    /// Small initramfs that downloads the full ISO at boot.
    Bootstrap,
    FullOs,
}

/// Whether kdump kernels/initrds are carried into the LiveOS output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdumpBootFilesType {
    Keep,
    #[serde(alias = "")]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iso {
    #[serde(default)]
    pub kernel_command_line: KernelCommandLine,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_files: Vec<AdditionalFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initramfs_type: Option<InitramfsImageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdump_boot_files: Option<KdumpBootFilesType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pxe {
    #[serde(default)]
    pub kernel_command_line: KernelCommandLine,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_files: Vec<AdditionalFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initramfs_type: Option<InitramfsImageType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap_base_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap_file_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    #[serde(default)]
    pub image: OutputImage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputImage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(default)]
    pub cosi: CosiConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CosiCompression>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosiCompression {
    /// zstd level, 1..=22. Levels 20 and up need the ultra window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
}

impl CosiCompression {
    pub fn settings(&self) -> CompressionSettings {
        CompressionSettings {
            level: self.level.unwrap_or(DEFAULT_COSI_COMPRESSION_LEVEL),
            long: DEFAULT_COSI_COMPRESSION_LONG,
        }
    }
}

impl Config {
    /// Read and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(compression) = &self.output.image.cosi.compression {
            if let Some(level) = compression.level {
                if !(MIN_COSI_COMPRESSION_LEVEL..=MAX_COSI_COMPRESSION_LEVEL).contains(&level) {
                    return Err(CustomizerError::invalid_config(format!(
                        "invalid 'level' value ({}): must be between {} and {}",
                        level, MIN_COSI_COMPRESSION_LEVEL, MAX_COSI_COMPRESSION_LEVEL
                    ))
                    .into());
                }
            }
        }

        if let Some(os) = &self.os {
            validate_additional_files(&os.additional_files)?;
            for user in &os.users {
                if user.name.is_empty() {
                    return Err(CustomizerError::invalid_config("user 'name' must not be empty").into());
                }
            }
            for dir in &os.additional_dirs {
                if dir.source.is_empty() || dir.destination.is_empty() {
                    return Err(CustomizerError::invalid_config(
                        "additional dirs need both 'source' and 'destination'",
                    )
                    .into());
                }
            }
        }

        for script in self
            .scripts
            .post_customization
            .iter()
            .chain(self.scripts.finalize_customization.iter())
        {
            match (&script.path, &script.content) {
                (None, None) => {
                    return Err(CustomizerError::invalid_config(
                        "script must have either 'path' or 'content'",
                    )
                    .into())
                }
                (Some(_), Some(_)) => {
                    return Err(CustomizerError::invalid_config(
                        "script cannot have both 'path' and 'content'",
                    )
                    .into())
                }
                _ => {}
            }
        }

        if let Some(iso) = &self.iso {
            validate_additional_files(&iso.additional_files)?;
        }

        if let Some(pxe) = &self.pxe {
            validate_additional_files(&pxe.additional_files)?;
            validate_bootstrap_urls(&pxe.bootstrap_base_url, &pxe.bootstrap_file_url)?;
        }

        Ok(())
    }

    /// Compression settings for COSI output, defaults applied.
    pub fn cosi_compression(&self) -> CompressionSettings {
        self.output
            .image
            .cosi
            .compression
            .clone()
            .unwrap_or_default()
            .settings()
    }

    pub fn selinux_mode(&self) -> SELinuxMode {
        self.os
            .as_ref()
            .map(|os| os.selinux.mode)
            .unwrap_or_default()
    }
}

fn validate_additional_files(files: &[AdditionalFile]) -> Result<()> {
    for file in files {
        if file.destination.is_empty() {
            return Err(CustomizerError::invalid_config(
                "additional file 'destination' must not be empty",
            )
            .into());
        }
        match (&file.source, &file.content) {
            (None, None) | (Some(_), Some(_)) => {
                return Err(CustomizerError::invalid_config(
                    "additional file must have exactly one of 'source' or 'content'",
                )
                .with_path(&file.destination)
                .into())
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check a PXE bootstrap URL. An empty URL is valid (unset).
pub fn validate_pxe_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Ok(());
    }
    if url.chars().any(char::is_whitespace) {
        return Err(CustomizerError::invalid_config(format!("invalid URL value ({})", url)).into());
    }
    if !PXE_ISO_DOWNLOAD_PROTOCOLS
        .iter()
        .any(|protocol| url.starts_with(protocol))
    {
        return Err(CustomizerError::invalid_config(format!(
            "unsupported iso image URL protocol in ({}). One of ({}) is expected.",
            url,
            PXE_ISO_DOWNLOAD_PROTOCOLS.join(", ")
        ))
        .into());
    }
    Ok(())
}

/// At most one of the two bootstrap URLs, each with a supported protocol.
pub fn validate_bootstrap_urls(base_url: &str, file_url: &str) -> Result<()> {
    if !base_url.is_empty() && !file_url.is_empty() {
        return Err(CustomizerError::invalid_config(
            "cannot specify both 'bootstrapBaseUrl' and 'bootstrapFileUrl' at the same time",
        )
        .into());
    }
    validate_pxe_url(base_url)
        .with_context(|| format!("invalid 'bootstrapBaseUrl' field value ({})", base_url))?;
    validate_pxe_url(file_url)
        .with_context(|| format!("invalid 'bootstrapFileUrl' field value ({})", file_url))?;
    Ok(())
}
