use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mkvdup_core::container::PacketList;
use mkvdup_core::dedup::{DedupFile, DedupWriter, Reconstructor, DEFAULT_CREATOR};
use mkvdup_core::index::DEFAULT_WINDOW_SIZE;
use mkvdup_core::matcher::{match_container, MatcherConfig};
use mkvdup_core::progress::Progress;
use mkvdup_core::source::{classify, source_root, Indexer, IndexerConfig, SourceIndex, SourceLayout};

#[derive(Parser)]
#[command(
    name = "mkvdup",
    version,
    about = "Deduplicate MKV remuxes against their DVD/Blu-ray source"
)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show how a source directory would be indexed
    Classify {
        source: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Build the source hash index and report its size
    Index {
        source: PathBuf,
        #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE)]
        window: usize,
        #[arg(long)]
        progress: bool,
        #[arg(long)]
        json: bool,
    },
    /// Match a container against its source and write a dedup artifact
    Create {
        mkv: PathBuf,
        source: PathBuf,
        /// Packet list from the container parser, as JSON {tracks, packets}
        #[arg(long)]
        packets: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE)]
        window: usize,
        #[arg(long, default_value = DEFAULT_CREATOR)]
        creator: String,
        #[arg(long)]
        progress: bool,
        #[arg(long)]
        json: bool,
    },
    /// Verify artifact integrity and the source files it references
    Check {
        artifact: PathBuf,
        #[arg(long)]
        source: PathBuf,
        /// Also compare source content checksums
        #[arg(long)]
        full: bool,
    },
    /// Rebuild the original container from an artifact and its source
    Extract {
        artifact: PathBuf,
        #[arg(long)]
        source: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print artifact header and section statistics
    Info {
        artifact: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json)?;
    match cli.cmd {
        Cmd::Classify { source, json } => show_layout(&source, json)?,
        Cmd::Index { source, window, progress, json } => index(&source, window, progress, json)?,
        Cmd::Create { mkv, source, packets, output, workers, window, creator, progress, json } => {
            create(&mkv, &source, &packets, &output, workers, window, &creator, progress, json)?
        }
        Cmd::Check { artifact, source, full } => check(&artifact, &source, full)?,
        Cmd::Extract { artifact, source, output } => extract(&artifact, &source, &output)?,
        Cmd::Info { artifact, json } => show_info(&artifact, json)?,
    }
    Ok(())
}

/// Logs go to stderr so stdout only carries command output.
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("mkvdup={level},mkvdup_core={level}")))
        .context("log filter")?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().with_writer(std::io::stderr).with_target(true).json()).init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
            .init();
    }
    Ok(())
}

#[derive(Serialize)]
struct LayoutReport {
    layout: SourceLayout,
    uses_es_offsets: bool,
    files: Vec<String>,
}

fn show_layout(source: &Path, json: bool) -> Result<()> {
    let class = classify(source).with_context(|| format!("classify {}", source.display()))?;
    let report = LayoutReport {
        layout: class.layout,
        uses_es_offsets: class.layout.uses_es_offsets(),
        files: class.files.iter().map(|p| p.display().to_string()).collect(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("layout: {:?} ({} files)", report.layout, report.files.len());
        for f in &report.files {
            println!("  {f}");
        }
    }
    Ok(())
}

fn build_index(source: &Path, window: usize, show_progress: bool) -> Result<SourceIndex> {
    let cfg = IndexerConfig { window_size: window, ..IndexerConfig::default() };
    let prog = Progress::new(show_progress);
    prog.set_stage("index");
    prog.start();
    let built = Indexer::build(source, &cfg, &mut |done, total| prog.set_bytes(done, total));
    prog.stop();
    built.with_context(|| format!("index {}", source.display()))
}

#[derive(Serialize)]
struct IndexReport {
    layout: SourceLayout,
    files: usize,
    source_bytes: u64,
    hashes: usize,
    locations: usize,
    range_map_streams: usize,
}

fn index(source: &Path, window: usize, show_progress: bool, json: bool) -> Result<()> {
    let idx = build_index(source, window, show_progress)?;
    let report = IndexReport {
        layout: idx.layout,
        files: idx.files.len(),
        source_bytes: idx.total_bytes(),
        hashes: idx.index.len(),
        locations: idx.index.location_count(),
        range_map_streams: idx
            .range_maps
            .as_ref()
            .map(|m| m.iter().map(|f| f.streams.len()).sum())
            .unwrap_or(0),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{:?}: {} files, {} bytes, {} hashes, {} locations",
            report.layout, report.files, report.source_bytes, report.hashes, report.locations
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn create(
    mkv: &Path,
    source: &Path,
    packets: &Path,
    output: &Path,
    workers: Option<usize>,
    window: usize,
    creator: &str,
    show_progress: bool,
    json: bool,
) -> Result<()> {
    let list = PacketList::load(packets)
        .with_context(|| format!("load packets {}", packets.display()))?;
    let idx = build_index(source, window, show_progress)?;
    let mut cfg = MatcherConfig::default();
    if let Some(w) = workers {
        if w == 0 {
            bail!("--workers must be at least 1");
        }
        cfg.workers = w;
    }
    let prog = Progress::new(show_progress);
    prog.start();
    let matched = match_container(mkv, &list, &idx, &cfg, Some(&prog));
    prog.stop();
    let mut result = matched.with_context(|| format!("match {}", mkv.display()))?;
    for w in &result.warnings {
        warn!("{w}");
    }
    let written = DedupWriter::new()
        .with_creator(creator)
        .write(output, &idx, &mut result)
        .with_context(|| format!("write {}", output.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result.stats)?);
    } else {
        let size = result.original_size.max(1);
        println!(
            "{}: {} of {} bytes matched ({:.1}%), {} entries, artifact {} bytes",
            output.display(),
            result.matched_bytes(),
            result.original_size,
            result.matched_bytes() as f64 * 100.0 / size as f64,
            written.entries,
            written.artifact_size
        );
    }
    Ok(())
}

fn open_reconstructor(artifact: &Path, source: &Path) -> Result<Reconstructor> {
    let file = DedupFile::open(artifact).with_context(|| format!("open {}", artifact.display()))?;
    Reconstructor::new(file, &source_root(source))
        .with_context(|| format!("verify {}", artifact.display()))
}

fn check(artifact: &Path, source: &Path, full: bool) -> Result<()> {
    let rec = open_reconstructor(artifact, source)?;
    rec.verify_sources(full).context("verify sources")?;
    info!(artifact = %artifact.display(), full, "check passed");
    println!("OK {} ({} source files)", artifact.display(), rec.file().source_files().len());
    Ok(())
}

fn extract(artifact: &Path, source: &Path, output: &Path) -> Result<()> {
    let rec = open_reconstructor(artifact, source)?;
    let f = File::create(output).with_context(|| format!("create {}", output.display()))?;
    let mut w = BufWriter::with_capacity(1 << 20, f);
    let n = rec.write_to(&mut w).with_context(|| format!("reconstruct {}", output.display()))?;
    w.flush()?;
    println!("wrote {} ({n} bytes)", output.display());
    Ok(())
}

fn show_info(artifact: &Path, json: bool) -> Result<()> {
    let file = DedupFile::open(artifact).with_context(|| format!("open {}", artifact.display()))?;
    let s = file.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&s)?);
        return Ok(());
    }
    println!("artifact:   {} ({} bytes, format v{})", s.path.display(), s.artifact_size, s.version);
    println!("creator:    {}", s.creator);
    println!(
        "layout:     {:?} (es offsets: {}, range maps: {})",
        s.layout, s.uses_es_offsets, s.has_range_maps
    );
    println!("original:   {} bytes, xxh64 {}", s.original_size, s.original_checksum);
    println!(
        "entries:    {} ({} source, {} delta, {} lpcm)",
        s.entries, s.source_entries, s.delta_entries, s.lpcm_entries
    );
    println!("matched:    {} bytes, delta {} bytes", s.matched_bytes, s.delta_bytes);
    println!("sources:");
    for f in &s.source_files {
        println!("  {} ({} bytes)", f.rel_path, f.size);
    }
    Ok(())
}
