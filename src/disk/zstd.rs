//! zstd compression with an image-identifying skippable frame.
//!
//! Every compressed image in a COSI archive starts with a zstd skippable
//! frame whose payload is the 16-byte image UUID:
//!
//! ```text
//! +------------+------------+-------------------+------------------+
//! | 0x184D2A50 | 16 (u32le) | image UUID bytes  | zstd frame(s)... |
//! +------------+------------+-------------------+------------------+
//! ```
//!
//! Decoders skip the frame, so the framed file still decompresses to the
//! original raw bytes.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::CustomizerError;

/// Magic of the first skippable-frame variant.
pub const SKIPPABLE_FRAME_MAGIC: u32 = 0x184D_2A50;
pub const SKIPPABLE_FRAME_PAYLOAD_SIZE: u32 = 16;
pub const SKIPPABLE_FRAME_HEADER_SIZE: usize = 8;
/// Largest window any image is compressed with; decoders need at least this.
pub const MAX_WINDOW_LOG: u32 = 31;

/// zstd level and long-distance window log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    pub level: i32,
    pub long: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self { level: 9, long: 27 }
    }
}

/// Compress `input` into `output` with long-distance matching enabled.
pub fn compress_with_zstd(input: &Path, output: &Path, settings: CompressionSettings) -> Result<()> {
    let src = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let dst =
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;

    let mut encoder = ::zstd::stream::write::Encoder::new(BufWriter::new(dst), settings.level)
        .with_context(|| format!("Failed to start zstd encoder (level {})", settings.level))?;
    encoder
        .long_distance_matching(true)
        .context("Failed to enable long-distance matching")?;
    encoder
        .window_log(settings.long)
        .with_context(|| format!("Failed to set zstd window log {}", settings.long))?;

    io::copy(&mut BufReader::new(src), &mut encoder)
        .with_context(|| format!("Failed to compress {}", input.display()))?;

    let mut writer = encoder.finish().context("Failed to finish zstd stream")?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", output.display()))?;
    Ok(())
}

/// Decompress a (possibly framed) zstd file. Returns the decompressed size.
pub fn decompress_file(input: &Path, output: &Path) -> Result<u64> {
    let src = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let mut decoder = ::zstd::stream::read::Decoder::new(src)
        .with_context(|| format!("Failed to start zstd decoder for {}", input.display()))?;
    decoder
        .window_log_max(MAX_WINDOW_LOG)
        .context("Failed to raise zstd window limit")?;

    let mut dst = BufWriter::new(
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?,
    );
    let written = io::copy(&mut decoder, &mut dst)
        .with_context(|| format!("Failed to decompress {}", input.display()))?;
    dst.flush()?;
    Ok(written)
}

/// Header plus payload of a skippable frame carrying `uuid`.
pub fn create_skippable_frame(uuid: &[u8; 16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(SKIPPABLE_FRAME_HEADER_SIZE + uuid.len());
    frame.extend_from_slice(&SKIPPABLE_FRAME_MAGIC.to_le_bytes());
    frame.extend_from_slice(&SKIPPABLE_FRAME_PAYLOAD_SIZE.to_le_bytes());
    frame.extend_from_slice(uuid);
    frame
}

/// Write the skippable frame followed by the contents of `compressed`.
pub fn add_skippable_frame(compressed: &Path, uuid: &[u8; 16], output: &Path) -> Result<()> {
    let mut src = File::open(compressed)
        .with_context(|| format!("Failed to open {}", compressed.display()))?;
    let mut dst = BufWriter::new(
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?,
    );

    dst.write_all(&create_skippable_frame(uuid))
        .with_context(|| format!("Failed to write skippable frame to {}", output.display()))?;
    io::copy(&mut src, &mut dst)
        .with_context(|| format!("Failed to copy compressed data into {}", output.display()))?;
    dst.flush()?;
    Ok(())
}

/// UUID stored in the leading skippable frame, if the file has one.
pub fn read_skippable_frame(path: &Path) -> Result<Option<[u8; 16]>> {
    let mut f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut header = [0u8; SKIPPABLE_FRAME_HEADER_SIZE];
    match f.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != SKIPPABLE_FRAME_MAGIC {
        return Ok(None);
    }

    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if size != SKIPPABLE_FRAME_PAYLOAD_SIZE {
        bail!(CustomizerError::structural(format!(
            "unexpected skippable frame payload size {}",
            size
        ))
        .with_path(path));
    }

    let mut uuid = [0u8; 16];
    f.read_exact(&mut uuid).map_err(|e| {
        CustomizerError::structural("truncated skippable frame")
            .with_path(path)
            .with_source(e)
    })?;
    Ok(Some(uuid))
}

/// Compress `raw` into `<out_dir>/<tag>.raw.zst` behind a skippable frame.
///
/// The intermediate `<tag>_temp.raw.zst` is always removed; failing to
/// remove it is an error. `raw` itself is left to the caller.
pub fn compress_with_frame(
    raw: &Path,
    out_dir: &Path,
    tag: &str,
    uuid: &[u8; 16],
    settings: CompressionSettings,
) -> Result<PathBuf> {
    let temp = out_dir.join(format!("{}_temp.raw.zst", tag));
    let final_path = out_dir.join(format!("{}.raw.zst", tag));

    compress_with_zstd(raw, &temp, settings).map_err(|e| {
        CustomizerError::io(format!("failed to compress image data: {:#}", e)).with_path(raw)
    })?;

    if let Err(e) = add_skippable_frame(&temp, uuid, &final_path) {
        let _ = fs::remove_file(&temp);
        return Err(e.context("failed to add skippable frame"));
    }

    remove_intermediate(&temp)?;
    Ok(final_path)
}

/// Remove an intermediate file, classifying failure as an I/O error.
pub fn remove_intermediate(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| {
        CustomizerError::io("failed to remove temporary file")
            .with_path(path)
            .with_source(e)
            .into()
    })
}
