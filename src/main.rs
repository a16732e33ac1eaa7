//! infernopatch - patches the dyld shared cache for GPU-less devices.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use infernopatch::{patches, CacheAnalyser, Patcher};

/// Patches the dyld shared cache so GPU-dependent system code falls back
/// to software rendering.
#[derive(Parser, Debug)]
#[command(name = "infernopatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Revert bytes to the original state, without reapplying patches
    #[arg(short, long)]
    revert: bool,

    /// Revert bytes and run the patcher, but do not apply the patch modifications
    #[arg(short = 'n', long, conflicts_with = "revert")]
    dry_run: bool,

    /// Patch libsystem_trace.dylib to unredact logs
    #[arg(long)]
    unredact_logs: bool,

    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "2")]
    verbosity: u8,

    /// Path to the main dyld shared cache file
    cache_path: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}.");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn run(cli: &Cli) -> Result<()> {
    let analyser = CacheAnalyser::open(&cli.cache_path)
        .with_context(|| format!("failed to open cache: {}", cli.cache_path.display()))?;

    // Sidecars from a previous run must be replayed first, so the queue
    // built below is rooted at pristine bytes.
    info!("Reverting bytes...");
    for entry in analyser.caches() {
        Patcher::revert(&entry.path)
            .with_context(|| format!("failed to revert: {}", entry.path.display()))?;
    }
    info!("Bytes reverted successfully.");

    if cli.revert {
        return Ok(());
    }

    let mut patcher = Patcher::new();

    info!("Building patches...");
    patches::apply_all(&analyser, &mut patcher, cli.unredact_logs)?;
    info!("Patches built successfully.");

    patcher.print_pending();

    if !cli.dry_run {
        info!("Applying changes...");
        patcher.commit().context("failed to apply changes")?;
        info!("Changes applied successfully.");
    }

    Ok(())
}
