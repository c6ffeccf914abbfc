// Copyright 2026 Timeloom Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use timeloom::config::{self, RunConfig};
use timeloom::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "timeloom",
    about = "Timeloom — reconstruct browsable website snapshots from a web archive",
    version,
    after_help = "Re-running with the same arguments resumes from the content cache."
)]
struct Cli {
    /// Domain to reconstruct (e.g. "example.com")
    domain: String,

    /// Output directory for the reconstructed mirror
    #[arg(long, short, default_value = "timeloom_out")]
    output: PathBuf,

    /// Start date (YYYYMMDD, YYYY-MM-DD, DD/MM/YYYY, or "last_year")
    #[arg(long)]
    start_date: Option<String>,

    /// End date (defaults to today)
    #[arg(long)]
    end_date: Option<String>,

    /// Cap on index page fetches (deterministic truncation)
    #[arg(long)]
    max_pages: Option<usize>,

    /// Concurrent fetch workers
    #[arg(long, default_value_t = config::MAX_WORKERS)]
    threads: usize,

    /// Keep only the most recent capture per URL
    #[arg(long)]
    single_version: bool,

    /// Keep every capture, including digest duplicates
    #[arg(long)]
    full_history: bool,

    /// Ignore previously cached content (results are still cached)
    #[arg(long)]
    no_cache: bool,

    /// Content cache directory
    #[arg(long, default_value = ".timeloom_cache")]
    cache_dir: PathBuf,

    /// Disable the memory-pressure pause on fetch dispatch
    #[arg(long)]
    no_memory_guard: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = config::REQUEST_TIMEOUT_SECS)]
    timeout: u64,

    /// Skip probing the archive for the domain's earliest capture
    #[arg(long)]
    no_auto_detect: bool,

    /// Archive base URL (for mirrors)
    #[arg(long, default_value = config::DEFAULT_ARCHIVE_BASE)]
    archive_url: String,

    /// Enable verbose/debug logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "timeloom=debug" } else { "timeloom=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap()),
        )
        .init();

    let mut cfg = RunConfig::new(cli.domain);
    cfg.output_dir = cli.output;
    cfg.start_date = cli.start_date;
    cfg.end_date = cli.end_date;
    cfg.max_pages = cli.max_pages;
    cfg.workers = cli.threads.max(1);
    cfg.single_version = cli.single_version;
    cfg.full_history = cli.full_history;
    cfg.cache_enabled = !cli.no_cache;
    cfg.cache_dir = cli.cache_dir;
    cfg.memory_guard = !cli.no_memory_guard;
    cfg.timeout_secs = cli.timeout;
    cfg.auto_detect_date = !cli.no_auto_detect;
    cfg.archive_base = cli.archive_url;

    let summary = match Orchestrator::new(cfg).run().await {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    println!(
        "Reconstructed {}: {}/{} captures, {} resources ({} failed)",
        summary.domain,
        summary.captures_ok,
        summary.captures_total,
        summary.resources_fetched,
        summary.resources_failed
    );
    println!(
        "  {} network requests, {} cache hits, manifest at {}",
        summary.network_fetches,
        summary.cache_hits,
        summary.manifest_path.display()
    );
    if summary.completed_with_warnings {
        println!("  Completed with warnings; see manifest for details.");
    }
    Ok(())
}
