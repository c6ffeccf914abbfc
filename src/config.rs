//! Run configuration.
//!
//! One immutable value constructed from the CLI and passed explicitly into
//! every component constructor. No component reads ambient globals, and the
//! engine never re-reads configuration mid-run.

use serde::Serialize;
use std::path::PathBuf;

/// Default concurrent fetch workers.
pub const MAX_WORKERS: usize = 12;
/// Default simultaneous connections per origin host.
pub const PER_HOST_CONNECTIONS: usize = 10;
/// Minimum delay between request starts to the same host.
pub const DOWNLOAD_DELAY_MS: u64 = 500;
/// Base delay for exponential backoff (doubled per attempt).
pub const RETRY_BACKOFF_MS: u64 = 500;
/// Retry attempts for a transient failure.
pub const MAX_ATTEMPTS: u32 = 3;
/// Per-attempt request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// CDX records requested per page.
pub const SNAPSHOTS_PER_PAGE: usize = 500;
/// Width of an index query sub-window, in days.
pub const QUERY_WINDOW_DAYS: i64 = 90;
/// Memory usage percentage above which fetch dispatch pauses.
pub const MEMORY_LIMIT_PERCENT: f32 = 85.0;
/// Years subtracted from today when no start date can be determined.
pub const DYNAMIC_FALLBACK_YEARS: u32 = 5;
/// Content cache size cap.
pub const CACHE_SIZE_LIMIT: u64 = 10_000_000_000;
/// Free disk space required before a run starts, in GiB.
pub const DISK_FLOOR_GB: f64 = 10.0;
/// Public Wayback Machine base URL.
pub const DEFAULT_ARCHIVE_BASE: &str = "https://web.archive.org";

/// Everything a reconstruction run needs to know, fixed at start.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    /// Domain to reconstruct (e.g. "example.com").
    pub domain: String,
    /// Output directory for the mirror.
    pub output_dir: PathBuf,
    /// Explicit start date as given by the user, unparsed.
    pub start_date: Option<String>,
    /// Explicit end date as given by the user, unparsed.
    pub end_date: Option<String>,
    /// Deterministic cap on index page fetches.
    pub max_pages: Option<usize>,
    /// Concurrent fetch workers (global budget).
    pub workers: usize,
    /// Simultaneous connections per host.
    pub per_host: usize,
    /// Keep only the most recent capture per original URL.
    pub single_version: bool,
    /// Keep digest duplicates instead of collapsing to the earliest.
    pub full_history: bool,
    /// Read previously cached content. When false, results are still
    /// written for this run but existing entries are never read.
    pub cache_enabled: bool,
    /// Content cache directory.
    pub cache_dir: PathBuf,
    /// Content cache size cap in bytes.
    pub cache_size_limit: u64,
    /// Pause new fetch dispatch while memory usage exceeds the threshold.
    pub memory_guard: bool,
    /// Memory usage threshold, percent.
    pub memory_threshold: f32,
    /// Per-attempt request timeout in seconds.
    pub timeout_secs: u64,
    /// Retry attempts per target.
    pub max_attempts: u32,
    /// Minimum delay between request starts to one host, milliseconds.
    pub delay_ms: u64,
    /// Probe the archive for the domain's earliest capture when no start
    /// date is given.
    pub auto_detect_date: bool,
    /// Archive base URL (override for mirrors and tests).
    pub archive_base: String,
    /// Free disk space floor in GiB; below this the run aborts.
    pub disk_floor_gb: f64,
}

impl RunConfig {
    /// Config with defaults for the given domain.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            output_dir: PathBuf::from("timeloom_out"),
            start_date: None,
            end_date: None,
            max_pages: None,
            workers: MAX_WORKERS,
            per_host: PER_HOST_CONNECTIONS,
            single_version: false,
            full_history: false,
            cache_enabled: true,
            cache_dir: PathBuf::from(".timeloom_cache"),
            cache_size_limit: CACHE_SIZE_LIMIT,
            memory_guard: true,
            memory_threshold: MEMORY_LIMIT_PERCENT,
            timeout_secs: REQUEST_TIMEOUT_SECS,
            max_attempts: MAX_ATTEMPTS,
            delay_ms: DOWNLOAD_DELAY_MS,
            auto_detect_date: true,
            archive_base: DEFAULT_ARCHIVE_BASE.to_string(),
            disk_floor_gb: DISK_FLOOR_GB,
        }
    }

    /// CDX search endpoint for this archive.
    pub fn cdx_endpoint(&self) -> String {
        format!("{}/cdx/search/cdx", self.archive_base.trim_end_matches('/'))
    }

    /// Replay URL for raw capture bytes. The `id_` suffix asks the archive
    /// for the original bytes without replay-banner injection.
    pub fn replay_url(&self, timestamp: &str, original_url: &str) -> String {
        format!(
            "{}/web/{timestamp}id_/{original_url}",
            self.archive_base.trim_end_matches('/')
        )
    }

    /// Replay URL with the archive's banner, used as the fallback reference
    /// for resources that could not be fetched.
    pub fn live_replay_url(&self, timestamp: &str, original_url: &str) -> String {
        format!(
            "{}/web/{timestamp}/{original_url}",
            self.archive_base.trim_end_matches('/')
        )
    }
}
