use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use weave_core::{
    cache::{CacheEntry, IdentityCache},
    identity::Gallery,
    observation::{restore, ClipRecord, ObservationRecord},
    Engine, EngineConfig, EventFusionPipeline, ExecutionMode,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "eventweave",
    version,
    about = "Resolve identities across camera clips and fuse them into events",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full run: arbitrate every clip, fuse sessions, write events.
    Resolve {
        /// Clip records (JSON array)
        #[arg(long)]
        clips: PathBuf,

        /// Registered face gallery (JSON array)
        #[arg(long)]
        gallery: PathBuf,

        /// Identity cache snapshot; read if present, rewritten after the run
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Analyze videos on the thread pool
        #[arg(long)]
        parallel: bool,

        #[command(flatten)]
        tuning: Tuning,

        /// Run report output path
        #[arg(short, long, default_value = "events.json")]
        output: PathBuf,
    },

    /// Fusion only, over observations that already carry verdicts.
    Fuse {
        /// Arbitrated observations (JSON array)
        #[arg(long)]
        observations: PathBuf,

        #[command(flatten)]
        tuning: Tuning,

        /// Events output path
        #[arg(short, long, default_value = "events.json")]
        output: PathBuf,
    },

    /// Build an initial cache file from registered body samples.
    SeedCache {
        /// Cache entries (JSON array)
        #[arg(long)]
        samples: PathBuf,

        /// Cache snapshot output path
        #[arg(short, long, default_value = "cache.json")]
        output: PathBuf,
    },
}

/// Config file plus per-threshold overrides.
#[derive(Args)]
struct Tuning {
    /// Engine config (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Face similarity threshold (0–1)
    #[arg(long)]
    face_threshold: Option<f32>,

    /// Body similarity threshold (0–1)
    #[arg(long)]
    body_threshold: Option<f32>,

    /// Maximum gap between clips of one session, in seconds
    #[arg(long)]
    time_threshold: Option<f64>,
}

impl Tuning {
    fn resolve(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(t) = self.face_threshold {
            config.identity.face_threshold = t;
        }
        if let Some(t) = self.body_threshold {
            config.identity.body_threshold = t;
        }
        if let Some(t) = self.time_threshold {
            config.fusion.time_threshold_secs = t;
        }
        config.validate().context("invalid engine configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Resolve {
            clips,
            gallery,
            cache,
            parallel,
            tuning,
            output,
        } => cmd_resolve(clips, gallery, cache, parallel, tuning, output),
        Commands::Fuse {
            observations,
            tuning,
            output,
        } => cmd_fuse(observations, tuning, output),
        Commands::SeedCache { samples, output } => cmd_seed_cache(samples, output),
    }
}

// ── resolve ───────────────────────────────────────────────────────────────────

fn cmd_resolve(
    clips: PathBuf,
    gallery: PathBuf,
    cache_path: Option<PathBuf>,
    parallel: bool,
    tuning: Tuning,
    output: PathBuf,
) -> Result<()> {
    info!("Resolve pipeline");
    info!("  clips   : {}", clips.display());
    info!("  gallery : {}", gallery.display());
    info!("  output  : {}", output.display());

    let config = tuning.resolve()?;
    let records: Vec<ClipRecord> = read_json(&clips)?;
    let gallery = Gallery::load(&gallery)?;
    info!(identities = gallery.len(), "gallery loaded");

    let mut cache = IdentityCache::in_memory(config.identity.cache_validity());
    if let Some(path) = cache_path.as_deref().filter(|p| p.exists()) {
        let entries: Vec<CacheEntry> = read_json(path)?;
        let seeded = cache
            .seed(entries)
            .with_context(|| format!("failed to seed cache from {}", path.display()))?;
        info!(entries = seeded, "cache restored");
    }

    let mode = if parallel {
        ExecutionMode::Parallel
    } else {
        ExecutionMode::Sequential
    };
    let engine = Engine::with_cache(config, gallery, cache);

    let pb = spinner("Resolving identities…");
    let report = engine.run(records, mode);
    pb.finish_with_message(format!(
        "{} events from {} clips ({} skipped).",
        report.events.len(),
        report.observations,
        report.skipped.len()
    ));

    write_json(&output, &report)?;

    if let Some(path) = cache_path {
        let snapshot = engine
            .into_cache()
            .snapshot()
            .context("failed to snapshot identity cache")?;
        write_json(&path, &snapshot)?;
        info!(entries = snapshot.len(), path = %path.display(), "cache saved");
    }
    Ok(())
}

// ── fuse ──────────────────────────────────────────────────────────────────────

fn cmd_fuse(observations: PathBuf, tuning: Tuning, output: PathBuf) -> Result<()> {
    info!("Fuse-only pipeline");
    info!("  observations : {}", observations.display());
    info!("  output       : {}", output.display());

    let config = tuning.resolve()?;
    let records: Vec<ObservationRecord> = read_json(&observations)?;
    let restored = restore(records);
    info!(
        observations = restored.observations.len(),
        skipped = restored.skipped.len(),
        "observations restored"
    );

    let pb = spinner("Fusing sessions…");
    let events = EventFusionPipeline::new(&config).fuse(restored.observations);
    pb.finish_with_message(format!(
        "{} events ({} observations skipped).",
        events.len(),
        restored.skipped.len()
    ));

    write_json(&output, &events)
}

// ── seed-cache ────────────────────────────────────────────────────────────────

fn cmd_seed_cache(samples: PathBuf, output: PathBuf) -> Result<()> {
    let entries: Vec<CacheEntry> = read_json(&samples)?;
    let total = entries.len();

    // Validity is applied on read, so the window here is irrelevant.
    let validity = EngineConfig::default().identity.cache_validity();
    let mut cache = IdentityCache::in_memory(validity);
    let kept = cache.seed(entries).context("failed to seed identity cache")?;
    let snapshot = cache.snapshot().context("failed to snapshot identity cache")?;
    info!(samples = total, identities = kept, "cache seeded");

    write_json(&output, &snapshot)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
