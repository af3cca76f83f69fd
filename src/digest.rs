//! Streaming file digests.
//!
//! Files hashed here can be multi-gigabyte partition images, so they are read
//! through a fixed 1 MiB buffer rather than loaded whole.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256, Sha384};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const BUF_SIZE: usize = 1024 * 1024;

fn digest_file<D: Digest>(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = D::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let hex = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    Ok((hex, size))
}

/// SHA-256 hex digest and byte count of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    digest_file::<Sha256>(path)
}

/// SHA-384 hex digest and byte count of a file.
pub fn sha384_file(path: &Path) -> Result<(String, u64)> {
    digest_file::<Sha384>(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn known_digests() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("abc");
        fs::write(&path, b"abc").unwrap();

        let (sha256, size) = sha256_file(&path).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let (sha384, _) = sha384_file(&path).unwrap();
        assert_eq!(
            sha384,
            "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed\
             8086072ba1e7cc2358baeca134c825a7"
        );
    }

    #[test]
    fn missing_file_names_path() {
        let err = sha384_file(Path::new("/nonexistent/part.raw.zst")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/part.raw.zst"));
    }
}
