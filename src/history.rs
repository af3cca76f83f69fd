//! Customization history recorded inside the image.
//!
//! Each run appends one entry to `/usr/share/image-customizer/history.json`
//! in the customized image. The recorded config is a redacted copy: SSH
//! public keys are replaced with `[redacted]`, and scripts, additional files
//! and additional directories carry SHA-256 hashes of their sources instead of
//! relying on paths that only exist on the build host.
//!
//! ```rust,ignore
//! let written = history::add_image_history(
//!     &log, &rootfs, &read_mounts()?, &config, config_dir, &image_uuid,
//! )?;
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use slog::{debug, info, Logger};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::config::{AdditionalDir, AdditionalFile, Config, ImageHistoryMode, Script};
use crate::digest::sha256_file;
use crate::error::CustomizerError;
use crate::resources::{is_path_on_read_only_mount, MountPoint};

/// History directory, relative to the image root.
pub const HISTORY_DIR: &str = "usr/share/image-customizer";
pub const HISTORY_FILE_NAME: &str = "history.json";
pub const REDACTED: &str = "[redacted]";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One history record.
///
/// `config` is kept as raw JSON so entries written by other tool versions
/// survive a rewrite unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageHistory {
    pub timestamp: String,
    pub tool_version: String,
    pub image_uuid: String,
    pub config: serde_json::Value,
}

/// Path of the history file inside the image mounted at `root`.
pub fn history_file_path(root: &Path) -> PathBuf {
    root.join(HISTORY_DIR).join(HISTORY_FILE_NAME)
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn hash_of(path: &Path) -> Result<String> {
    let (hash, _) = sha256_file(path)
        .with_context(|| format!("error generating SHA256 for {}", path.display()))?;
    Ok(hash)
}

fn hash_scripts(scripts: &mut [Script], base_dir: &Path) -> Result<()> {
    for script in scripts.iter_mut() {
        if let Some(path) = script.path.as_deref().filter(|p| !p.is_empty()) {
            script.sha256_hash = Some(hash_of(&resolve(base_dir, path))?);
        }
    }
    Ok(())
}

fn hash_additional_files(files: &mut [AdditionalFile], base_dir: &Path) -> Result<()> {
    for file in files.iter_mut() {
        if let Some(source) = file.source.as_deref().filter(|s| !s.is_empty()) {
            file.sha256_hash = Some(hash_of(&resolve(base_dir, source))?);
        }
    }
    Ok(())
}

fn hash_additional_dirs(dirs: &mut [AdditionalDir], base_dir: &Path) -> Result<()> {
    for dir in dirs.iter_mut() {
        let root = resolve(base_dir, &dir.source);
        let mut hashes = BTreeMap::new();
        for entry in WalkDir::new(&root) {
            let entry =
                entry.with_context(|| format!("error walking directory {}", root.display()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = entry.path().strip_prefix(&root).with_context(|| {
                format!("error computing relative path for {}", entry.path().display())
            })?;
            hashes.insert(rel.to_string_lossy().into_owned(), hash_of(entry.path())?);
        }
        dir.sha256_hash_map = Some(hashes);
    }
    Ok(())
}

/// Copy of `config` safe to store in the image.
///
/// Relative source paths resolve against `base_dir` (the directory of the
/// config file).
pub fn redacted_config(config: &Config, base_dir: &Path) -> Result<Config> {
    let mut copy = config.clone();

    hash_scripts(&mut copy.scripts.post_customization, base_dir)
        .context("error processing PostCustomization scripts")?;
    hash_scripts(&mut copy.scripts.finalize_customization, base_dir)
        .context("error processing FinalizeCustomization scripts")?;

    if let Some(os) = copy.os.as_mut() {
        hash_additional_files(&mut os.additional_files, base_dir)
            .context("failed to populate additional files")?;
        hash_additional_dirs(&mut os.additional_dirs, base_dir)
            .context("failed to populate additional dirs")?;
        for user in os.users.iter_mut() {
            for key in user.ssh_public_keys.iter_mut() {
                *key = REDACTED.to_string();
            }
        }
    }

    Ok(copy)
}

/// Existing history entries, or none when the file is absent.
pub fn read_image_history(path: &Path) -> Result<Vec<ImageHistory>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CustomizerError::io("failed to read image history file")
                .with_path(path)
                .with_source(e)
                .into())
        }
    };
    serde_json::from_str(&content).map_err(|e| {
        CustomizerError::structural("failed to unmarshal image history file")
            .with_path(path)
            .with_source(e)
            .into()
    })
}

fn write_image_history(path: &Path, entries: &[ImageHistory]) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    entries
        .serialize(&mut ser)
        .context("failed to marshal image history")?;

    fs::write(path, &buf).map_err(|e| {
        CustomizerError::io("failed to write image history to file")
            .with_path(path)
            .with_source(e)
            .into()
    })
}

/// Append an entry for this run to the history file of the image at `root`.
///
/// # Arguments
///
/// * `mounts` - host mount table; the write is skipped when the history
///   directory sits on a read-only mount
/// * `base_dir` - directory relative config paths resolve against
/// * `image_uuid` - hyphenated UUID assigned to the output image
///
/// # Returns
///
/// `true` when an entry was written.
pub fn add_image_history(
    log: &Logger,
    root: &Path,
    mounts: &[MountPoint],
    config: &Config,
    base_dir: &Path,
    image_uuid: &str,
) -> Result<bool> {
    let disabled = config
        .os
        .as_ref()
        .map(|os| os.image_history == ImageHistoryMode::None)
        .unwrap_or(false);
    if disabled {
        debug!(log, "image history disabled");
        return Ok(false);
    }

    let dir = root.join(HISTORY_DIR);
    if is_path_on_read_only_mount(&dir, mounts) {
        debug!(log, "image history skipped, read-only mount"; "path" => %dir.display());
        return Ok(false);
    }

    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format build time")?;
    append_entry(log, root, config, base_dir, image_uuid, &timestamp)?;
    Ok(true)
}

fn append_entry(
    log: &Logger,
    root: &Path,
    config: &Config,
    base_dir: &Path,
    image_uuid: &str,
    timestamp: &str,
) -> Result<()> {
    info!(log, "creating image customizer history file");

    let redacted = redacted_config(config, base_dir).context("failed to modify config")?;
    let config_json = serde_json::to_value(&redacted).context("failed to deep copy config")?;

    let dir = root.join(HISTORY_DIR);
    fs::create_dir_all(&dir).map_err(|e| {
        CustomizerError::io("failed to create logging directory")
            .with_path(&dir)
            .with_source(e)
    })?;

    let path = history_file_path(root);
    let mut entries = read_image_history(&path).context("failed to read image history")?;
    entries.push(ImageHistory {
        timestamp: timestamp.to_string(),
        tool_version: TOOL_VERSION.to_string(),
        image_uuid: image_uuid.to_string(),
        config: config_json,
    });
    write_image_history(&path, &entries).context("failed to write image history")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Os, User};
    use crate::logging;
    use crate::resources::mount::parse_mounts;
    use tempfile::TempDir;

    fn config_with_sources(base: &Path) -> Config {
        fs::write(base.join("motd"), "hello\n").unwrap();
        fs::write(base.join("setup.sh"), "#!/bin/sh\ntrue\n").unwrap();
        fs::create_dir_all(base.join("files/sub")).unwrap();
        fs::write(base.join("files/a.txt"), "a").unwrap();
        fs::write(base.join("files/sub/b.txt"), "b").unwrap();

        let mut config = Config::default();
        config.os = Some(Os {
            additional_files: vec![
                AdditionalFile {
                    source: Some("motd".to_string()),
                    destination: "/etc/motd".to_string(),
                    ..Default::default()
                },
                AdditionalFile {
                    content: Some("inline".to_string()),
                    destination: "/etc/inline".to_string(),
                    ..Default::default()
                },
            ],
            additional_dirs: vec![AdditionalDir {
                source: "files".to_string(),
                destination: "/opt/files".to_string(),
                sha256_hash_map: None,
            }],
            users: vec![User {
                name: "test".to_string(),
                ssh_public_keys: vec!["ssh-ed25519 AAAA test@host".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        });
        config.scripts.post_customization.push(Script {
            path: Some("setup.sh".to_string()),
            ..Default::default()
        });
        config
    }

    #[test]
    fn redaction_and_hashes() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_sources(tmp.path());
        let redacted = redacted_config(&config, tmp.path()).unwrap();

        let os = redacted.os.as_ref().unwrap();
        assert_eq!(os.users[0].ssh_public_keys, vec![REDACTED.to_string()]);
        assert_eq!(
            os.additional_files[0].sha256_hash.as_deref(),
            Some("5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03")
        );
        assert!(os.additional_files[1].sha256_hash.is_none());

        let map = os.additional_dirs[0].sha256_hash_map.as_ref().unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("a.txt"));
        assert!(map.contains_key("sub/b.txt"));

        assert!(redacted.scripts.post_customization[0].sha256_hash.is_some());

        // The caller's config is untouched.
        assert_eq!(
            config.os.as_ref().unwrap().users[0].ssh_public_keys[0],
            "ssh-ed25519 AAAA test@host"
        );
    }

    #[test]
    fn two_runs_append_two_entries() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("config");
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&root).unwrap();
        let config = config_with_sources(&base);
        let log = logging::discard();

        let first = uuid::Uuid::new_v4().to_string();
        let second = uuid::Uuid::new_v4().to_string();
        assert!(add_image_history(&log, &root, &[], &config, &base, &first).unwrap());
        assert!(add_image_history(&log, &root, &[], &config, &base, &second).unwrap());

        let path = history_file_path(&root);
        let entries = read_image_history(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].image_uuid, first);
        assert_eq!(entries[1].image_uuid, second);
        assert_ne!(entries[0].image_uuid, entries[1].image_uuid);
        assert_eq!(entries[1].tool_version, TOOL_VERSION);
        assert_eq!(
            entries[0].config["os"]["users"][0]["sshPublicKeys"][0],
            REDACTED
        );

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n {\n  \"timestamp\""));
        assert!(!text.contains("ssh-ed25519"));
    }

    #[test]
    fn read_only_mount_skips_write() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(&root).unwrap();
        let mounts = parse_mounts(&format!("/dev/loop0p2 {} ext4 ro 0 0\n", root.display()));

        let written = add_image_history(
            &logging::discard(),
            &root,
            &mounts,
            &Config::default(),
            tmp.path(),
            "00000000-0000-0000-0000-000000000000",
        )
        .unwrap();
        assert!(!written);
        assert!(!history_file_path(&root).exists());
    }

    #[test]
    fn disabled_history_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.os = Some(Os {
            image_history: ImageHistoryMode::None,
            ..Default::default()
        });
        let written =
            add_image_history(&logging::discard(), tmp.path(), &[], &config, tmp.path(), "x")
                .unwrap();
        assert!(!written);
        assert!(!history_file_path(tmp.path()).exists());
    }

    #[test]
    fn preserves_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let path = history_file_path(tmp.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"[{"timestamp":"2024-01-01T00:00:00Z","toolVersion":"0.3.0","imageUuid":"old","config":{"storage":{"disks":[]}}}]"#,
        )
        .unwrap();

        append_entry(
            &logging::discard(),
            tmp.path(),
            &Config::default(),
            tmp.path(),
            "new",
            "2026-01-01T00:00:00Z",
        )
        .unwrap();

        let entries = read_image_history(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].config["storage"]["disks"], serde_json::json!([]));
        assert_eq!(entries[1].timestamp, "2026-01-01T00:00:00Z");
    }
}
