//! pixpipe-bench: replay an editing session through a pixel pipe and
//! report how the cache behaved.
//!
//! The session is fixed: an initial render, a run of slider ticks on the
//! last node, toggling a middle node off and on, panning the view, and
//! zooming to full resolution. Each step prints its hits, misses, and the
//! nodes it recomputed; the cache report follows at the end.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin pixpipe-bench -- [OPTIONS] [IMAGE_PATH]
//! ```
//!
//! Set `RUST_LOG=pixpipe_cache=trace` to watch every cacheline decision.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use pixpipe::{Node, Operator, Pipe, PipeError, Rgba32FImage};
use pixpipe_cache::{CacheConfig, CacheReport, PipeType, Roi};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Largest accepted `--limit-mib`, 1 TiB.
const MAX_LIMIT_MIB: usize = 1 << 20;

/// Replay an editing session through a cached pixel pipe.
#[derive(Parser)]
#[command(name = "pixpipe-bench", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP). A synthetic test
    /// card is used when omitted.
    image_path: Option<PathBuf>,

    /// Test card width when no image is given.
    #[arg(long, default_value_t = 1024)]
    width: u32,

    /// Test card height when no image is given.
    #[arg(long, default_value_t = 768)]
    height: u32,

    /// Pipe type, which selects the cache preset.
    #[arg(long, value_enum, default_value_t = Kind::Full)]
    kind: Kind,

    /// Number of cachelines; overrides the preset.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(2..))]
    entries: Option<usize>,

    /// Cache memory limit in MiB (at most 1 TiB), 0 for none.
    #[arg(long, default_value_t = 256, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(0..=MAX_LIMIT_MIB as u64))]
    limit_mib: usize,

    /// Number of slider ticks.
    #[arg(long, default_value_t = 8)]
    steps: u32,

    /// View scale relative to the source.
    #[arg(long, default_value_t = 0.5)]
    scale: f64,

    /// Output step records and the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Full,
    Preview,
    Export,
    Thumbnail,
}

impl From<Kind> for PipeType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Full => Self::Full,
            Kind::Preview => Self::Preview,
            Kind::Export => Self::Export,
            Kind::Thumbnail => Self::Thumbnail,
        }
    }
}

#[derive(Serialize)]
struct StepRecord {
    step: String,
    hits: usize,
    misses: usize,
    computed: Vec<&'static str>,
    freed_bytes: usize,
    bytes_used: usize,
    millis: f64,
}

#[derive(Serialize)]
struct SessionRecord {
    steps: Vec<StepRecord>,
    report: CacheReport,
}

fn load_source(cli: &Cli) -> Result<Rgba32FImage, String> {
    let Some(path) = &cli.image_path else {
        return Ok(pixpipe::test_card(cli.width, cli.height));
    };
    let bytes =
        std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    eprintln!("Image: {} ({} bytes)", path.display(), bytes.len());
    pixpipe::decode_source(&bytes).map_err(|e| format!("Error decoding image: {e}"))
}

fn build_pipe(cli: &Cli, source: Rgba32FImage) -> Result<Pipe, PipeError> {
    let kind = PipeType::from(cli.kind);
    let limit = cli.limit_mib.saturating_mul(1 << 20);
    let mut config = pixpipe::preset_for(kind, source.dimensions(), limit);
    if let Some(entries) = cli.entries {
        config = CacheConfig { entries, ..config };
    }
    eprintln!("Config: {config:?}");
    Ok(Pipe::new(kind, &config, source, 1)?
        .with_node(Node::new(1, "exposure", Operator::Exposure { ev: 0.3 }))
        .with_node(Node::new(
            2,
            "color balance",
            Operator::ColorBalance {
                gains: [1.05, 1.0, 0.95],
            },
        ))
        .with_node(Node::new(3, "blur", Operator::GaussianBlur { sigma: 1.5 }))
        .with_node(Node::new(4, "vignette", Operator::Vignette { strength: 0.1 })))
}

/// Run one step and record what it cost.
fn step(pipe: &mut Pipe, name: String, roi: &Roi) -> Result<StepRecord, PipeError> {
    let start = Instant::now();
    let out = pipe.process(roi)?;
    Ok(StepRecord {
        step: name,
        hits: out.stats.hits,
        misses: out.stats.misses,
        computed: out.stats.computed,
        freed_bytes: out.stats.reclaimed.freed_bytes,
        bytes_used: pipe.cache().bytes_used(),
        millis: start.elapsed().as_secs_f64() * 1000.0,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn replay(cli: &Cli, pipe: &mut Pipe) -> Result<Vec<StepRecord>, PipeError> {
    let (w, h) = pipe.source_dimensions();
    let view = Roi::full(w, h, cli.scale);
    let last = pipe.nodes().len() - 1;
    let mut records = vec![step(pipe, "initial".into(), &view)?];

    for tick in 1..=cli.steps {
        let strength = (0.1 + 0.05 * f64::from(tick)).min(1.0) as f32;
        pipe.set_params(last, Operator::Vignette { strength })?;
        records.push(step(pipe, format!("slider {tick}"), &view)?);
    }

    pipe.set_enabled(1, false)?;
    records.push(step(pipe, "toggle off".into(), &view)?);
    pipe.set_enabled(1, true)?;
    records.push(step(pipe, "toggle on".into(), &view)?);

    let panned = Roi {
        x: view.width / 4,
        y: view.height / 4,
        width: (view.width / 2).max(1),
        height: (view.height / 2).max(1),
        ..view
    };
    records.push(step(pipe, "pan".into(), &panned)?);
    records.push(step(pipe, "pan back".into(), &view)?);
    records.push(step(pipe, "zoom".into(), &Roi::full(w, h, 1.0))?);
    Ok(records)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let source = match load_source(&cli) {
        Ok(source) => source,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let mut pipe = match build_pipe(&cli, source) {
        Ok(pipe) => pipe,
        Err(e) => {
            eprintln!("Pipe error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let steps = match replay(&cli, &mut pipe) {
        Ok(steps) => steps,
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let session = SessionRecord {
        steps,
        report: pipe.report(),
    };

    if cli.json {
        match serde_json::to_string_pretty(&session) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing session: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    println!(
        "{:<12} {:>5} {:>7} {:>10} {:>10}  computed",
        "Step", "Hits", "Misses", "Used (MB)", "Time (ms)"
    );
    println!("{}", "-".repeat(72));
    for s in &session.steps {
        println!(
            "{:<12} {:>5} {:>7} {:>10} {:>10.3}  {}",
            s.step,
            s.hits,
            s.misses,
            pixpipe_cache::report::to_mb(s.bytes_used),
            s.millis,
            s.computed.join(", "),
        );
    }
    println!();
    println!("{}", session.report);

    ExitCode::SUCCESS
}
