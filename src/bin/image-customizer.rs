use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image_customizer::config::Config;
use image_customizer::cosi::{convert_to_cosi, CosiConvertOptions};
use image_customizer::disk::extract_gpt_data;
use image_customizer::history::{history_file_path, read_image_history};
use image_customizer::liveos::{LiveOsBuilder, LiveOsOptions};
use image_customizer::preflight::{check_required_tools, COSI_TOOLS, ISO_TOOLS, PXE_TOOLS};
use image_customizer::resources::Loopback;
use image_customizer::logging;
use slog::{error, info, Logger};
use uuid::Uuid;

const DEFAULT_BUILD_DIR: &str = "build";

fn usage() -> &'static str {
    "Usage:\n  image-customizer cosi convert <raw_image> <output.cosi> [--config <file>] [--build-dir <dir>] [-v]\n  image-customizer gpt extract <raw_image> <out_dir> [-v]\n  image-customizer iso build --rootfs <dir> --output <file.iso> [--input-iso <file>] [--output-pxe <dir|file.tar.gz>] [--config <file>] [--build-dir <dir>] [-v]\n  image-customizer iso rebuild --input-iso <file> --output <file.iso> [--output-pxe <dir|file.tar.gz>] [--config <file>] [--build-dir <dir>] [-v]\n  image-customizer pxe build --rootfs <dir> --output <dir|file.tar.gz> [--input-iso <file>] [--config <file>] [--build-dir <dir>] [-v]\n  image-customizer history show <rootfs>"
}

/// `--name value` options and `-v` flags following a subcommand.
#[derive(Debug, Default)]
struct Flags {
    rootfs: Option<PathBuf>,
    output: Option<PathBuf>,
    output_pxe: Option<PathBuf>,
    input_iso: Option<PathBuf>,
    config: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    verbosity: u8,
}

impl Flags {
    fn parse(args: &[String]) -> Result<Self> {
        let mut flags = Flags::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-v" || arg == "--verbose" {
                flags.verbosity += 1;
                continue;
            }
            let slot = match arg.as_str() {
                "--rootfs" => &mut flags.rootfs,
                "--output" => &mut flags.output,
                "--output-pxe" => &mut flags.output_pxe,
                "--input-iso" => &mut flags.input_iso,
                "--config" => &mut flags.config,
                "--build-dir" => &mut flags.build_dir,
                other => bail!("unknown argument '{}'\n{}", other, usage()),
            };
            let value = iter
                .next()
                .with_context(|| format!("missing value for '{}'", arg))?;
            *slot = Some(PathBuf::from(value));
        }
        Ok(flags)
    }

    fn require<'a>(value: &'a Option<PathBuf>, name: &str) -> Result<&'a Path> {
        match value {
            Some(path) => Ok(path),
            None => bail!("missing required argument '{}'\n{}", name, usage()),
        }
    }

    fn build_dir(&self) -> PathBuf {
        self.build_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_DIR))
    }

    /// Load `--config` when given; relative paths in it resolve against its
    /// directory.
    fn load_config(&self) -> Result<(Config, PathBuf)> {
        match &self.config {
            Some(path) => {
                let config = Config::load(path)?;
                let base = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                Ok((config, base))
            }
            None => Ok((Config::default(), std::env::current_dir().context("resolving current directory")?)),
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbosity = args.iter().filter(|a| *a == "-v" || *a == "--verbose").count();
    let log = logging::root_logger(logging::level_from_verbosity(verbosity.min(u8::MAX as usize) as u8));

    if let Err(e) = run(&log, &args) {
        error!(log, "command failed"; "error" => format!("{:#}", e));
        // Let the async drain flush before exiting.
        drop(log);
        std::process::exit(1);
    }
}

fn run(log: &Logger, args: &[String]) -> Result<()> {
    match args {
        [cosi, convert, raw, output, rest @ ..] if cosi == "cosi" && convert == "convert" => {
            cosi_convert(log, Path::new(raw), Path::new(output), &Flags::parse(rest)?)
        }
        [gpt, extract, raw, out_dir, rest @ ..] if gpt == "gpt" && extract == "extract" => {
            Flags::parse(rest)?;
            gpt_extract(log, Path::new(raw), Path::new(out_dir))
        }
        [iso, build, rest @ ..] if iso == "iso" && build == "build" => {
            let flags = Flags::parse(rest)?;
            Flags::require(&flags.output, "--output")?;
            liveos_build(log, &flags, flags.output.clone(), flags.output_pxe.clone())
        }
        [iso, rebuild, rest @ ..] if iso == "iso" && rebuild == "rebuild" => {
            iso_rebuild(log, &Flags::parse(rest)?)
        }
        [pxe, build, rest @ ..] if pxe == "pxe" && build == "build" => {
            let flags = Flags::parse(rest)?;
            let output = Flags::require(&flags.output, "--output")?.to_path_buf();
            liveos_build(log, &flags, None, Some(output))
        }
        [history, show, rootfs] if history == "history" && show == "show" => history_show(Path::new(rootfs)),
        _ => bail!(usage()),
    }
}

fn cosi_convert(log: &Logger, raw: &Path, output: &Path, flags: &Flags) -> Result<()> {
    check_required_tools(COSI_TOOLS)?;
    let (config, _) = flags.load_config()?;

    let options = CosiConvertOptions {
        raw_image: raw.to_path_buf(),
        output: output.to_path_buf(),
        build_dir: flags.build_dir(),
        image_uuid: Uuid::new_v4(),
        compression: config.cosi_compression(),
        verity: Vec::new(),
    };
    let metadata = convert_to_cosi(log, &options)?;
    println!(
        "{} written: {} images, id {}",
        output.display(),
        metadata.images.len(),
        options.image_uuid.hyphenated()
    );
    Ok(())
}

fn gpt_extract(log: &Logger, raw: &Path, out_dir: &Path) -> Result<()> {
    check_required_tools(COSI_TOOLS)?;
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output directory '{}'", out_dir.display()))?;

    let uuid = Uuid::new_v4();
    let basename = raw
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    let loopback = Loopback::attach(log, raw)?;
    let result = extract_gpt_data(
        log,
        loopback.device_path(),
        raw,
        out_dir,
        &basename,
        uuid.as_bytes(),
        Default::default(),
    );
    let closed = loopback.close();
    let gpt = result?;
    closed?;

    println!(
        "{} written: {} bytes of partition table, disk size {}",
        gpt.compressed_file_path.display(),
        gpt.uncompressed_size,
        gpt.disk_size
    );
    Ok(())
}

fn liveos_options(flags: &Flags, output_iso: Option<PathBuf>, output_pxe: Option<PathBuf>) -> Result<LiveOsOptions> {
    let (config, base_config_dir) = flags.load_config()?;
    Ok(LiveOsOptions {
        build_dir: flags.build_dir(),
        base_config_dir,
        config,
        input_iso: flags.input_iso.clone(),
        output_iso,
        output_pxe,
        image_uuid: Uuid::new_v4().hyphenated().to_string(),
    })
}

fn liveos_build(log: &Logger, flags: &Flags, output_iso: Option<PathBuf>, output_pxe: Option<PathBuf>) -> Result<()> {
    check_required_tools(if output_pxe.is_some() { PXE_TOOLS } else { ISO_TOOLS })?;
    let rootfs = Flags::require(&flags.rootfs, "--rootfs")?;

    let options = liveos_options(flags, output_iso, output_pxe)?;
    LiveOsBuilder::new(log, options)?.build_from_image(rootfs)?;
    info!(log, "LiveOS media written");
    Ok(())
}

fn iso_rebuild(log: &Logger, flags: &Flags) -> Result<()> {
    check_required_tools(ISO_TOOLS)?;
    Flags::require(&flags.input_iso, "--input-iso")?;
    let output = Flags::require(&flags.output, "--output")?.to_path_buf();

    let options = liveos_options(flags, Some(output), flags.output_pxe.clone())?;
    LiveOsBuilder::new(log, options)?.rebuild_from_iso()?;
    info!(log, "LiveOS media rebuilt");
    Ok(())
}

fn history_show(rootfs: &Path) -> Result<()> {
    let path = history_file_path(rootfs);
    let entries = read_image_history(&path)?;
    let text = serde_json::to_string_pretty(&entries).context("serializing image history")?;
    println!("{}", text);
    Ok(())
}
