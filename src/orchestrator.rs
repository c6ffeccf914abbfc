//! End-to-end reconstruction runs.
//!
//! The orchestrator walks a fixed phase sequence: resolve the date range,
//! enumerate captures from the index, fetch and reconstruct each capture,
//! then finalize the manifest. Only an unparseable explicit date or a fatal
//! capacity condition aborts a run; every other failure is recorded against
//! the capture or window it concerns and the run completes with warnings.

use crate::config::RunConfig;
use crate::dates::DateResolver;
use crate::error::{CapacityError, DateParseError};
use crate::fetch::{ContentCache, FetchEngine, FetchTarget, MemoryGate, ProcMeminfoProbe};
use crate::index::{Capture, CdxClient};
use crate::layout::{Manifest, OutputLayout, ResourceRecord, SnapshotRecord};
use crate::rebuild::{PageLookup, ResourceGraphBuilder};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Failures that abort a run before or during execution.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Date(#[from] DateParseError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Phases of a run, entered strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ResolvingDates,
    Enumerating,
    Fetching,
    Finalizing,
}

/// What a completed run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub domain: String,
    pub captures_total: usize,
    pub captures_ok: usize,
    pub captures_failed: usize,
    pub resources_fetched: usize,
    pub resources_failed: usize,
    pub network_fetches: u64,
    pub cache_hits: u64,
    pub peak_memory_percent: f32,
    /// True when anything degraded: failed windows, captures, or resources.
    pub completed_with_warnings: bool,
    pub manifest_path: PathBuf,
}

struct CaptureOutcome {
    record: Option<SnapshotRecord>,
    warnings: Vec<String>,
    resources_fetched: usize,
    resources_failed: usize,
}

/// Drives one reconstruction run from configuration to manifest.
pub struct Orchestrator {
    cfg: Arc<RunConfig>,
}

impl Orchestrator {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!("run {run_id}: reconstructing {}", self.cfg.domain);

        let layout = Arc::new(OutputLayout::new(self.cfg.output_dir.clone()));
        layout.ensure()?;
        self.check_disk_floor(layout.root())?;

        let cache = Arc::new(ContentCache::open(
            self.cfg.cache_dir.clone(),
            self.cfg.cache_size_limit,
            self.cfg.cache_enabled,
        )?);
        let gate = Arc::new(MemoryGate::new(
            Arc::new(ProcMeminfoProbe),
            self.cfg.memory_threshold,
            self.cfg.memory_guard,
        ));
        let engine = Arc::new(FetchEngine::new(self.cfg.clone(), cache, gate));
        let cdx = CdxClient::new(self.cfg.clone());

        self.enter(Phase::ResolvingDates);
        let resolver = DateResolver::new(Arc::new(cdx.clone()));
        let range = resolver
            .resolve_range(
                self.cfg.start_date.as_deref(),
                self.cfg.end_date.as_deref(),
                self.cfg.auto_detect_date,
                &self.cfg.domain,
            )
            .await?;

        self.enter(Phase::Enumerating);
        let enumeration = cdx.enumerate(range).await;
        let mut warnings: Vec<String> = enumeration
            .window_failures
            .iter()
            .map(|e| e.to_string())
            .collect();
        let captures = enumeration.captures;

        self.enter(Phase::Fetching);
        let builder = Arc::new(ResourceGraphBuilder::new(
            self.cfg.clone(),
            engine.clone(),
            layout.clone(),
        ));
        let pages = Arc::new(PageLookup::from_captures(&captures));
        let bar = progress_bar(captures.len() as u64);

        let outcomes: Vec<CaptureOutcome> = stream::iter(captures.iter())
            .map(|capture| {
                let engine = engine.clone();
                let builder = builder.clone();
                let layout = layout.clone();
                let pages = pages.clone();
                let bar = bar.clone();
                async move {
                    bar.set_message(capture.original_url.clone());
                    let outcome =
                        process_capture(capture, &engine, &builder, &layout, &pages).await;
                    bar.inc(1);
                    outcome
                }
            })
            .buffer_unordered(self.cfg.workers)
            .collect()
            .await;
        bar.finish_and_clear();

        self.enter(Phase::Finalizing);
        let mut records = Vec::new();
        let mut captures_ok = 0usize;
        let mut captures_failed = 0usize;
        let mut resources_fetched = 0usize;
        let mut resources_failed = 0usize;
        for outcome in outcomes {
            resources_fetched += outcome.resources_fetched;
            resources_failed += outcome.resources_failed;
            warnings.extend(outcome.warnings);
            match outcome.record {
                Some(record) => {
                    captures_ok += 1;
                    records.push(record);
                }
                None => captures_failed += 1,
            }
        }
        // Manifest order is deterministic regardless of completion order.
        records.sort_by(|a, b| {
            (&a.timestamp, &a.original_url).cmp(&(&b.timestamp, &b.original_url))
        });

        let completed_with_warnings =
            !warnings.is_empty() || records.iter().any(|r| !r.failures.is_empty());
        let manifest = Manifest {
            run_id: run_id.clone(),
            domain: self.cfg.domain.clone(),
            started_at,
            finished_at: Utc::now(),
            completed_with_warnings,
            records,
            warnings,
        };
        let manifest_path = layout.write_manifest(&manifest)?;

        let summary = RunSummary {
            run_id,
            domain: self.cfg.domain.clone(),
            captures_total: captures.len(),
            captures_ok,
            captures_failed,
            resources_fetched,
            resources_failed,
            network_fetches: engine.network_fetch_count(),
            cache_hits: engine.cache_hit_count(),
            peak_memory_percent: engine.peak_memory_percent(),
            completed_with_warnings,
            manifest_path,
        };
        info!(
            "run {} complete: {}/{} captures, {} resources fetched, {} network requests, {} cache hits",
            summary.run_id,
            summary.captures_ok,
            summary.captures_total,
            summary.resources_fetched,
            summary.network_fetches,
            summary.cache_hits
        );
        Ok(summary)
    }

    fn enter(&self, phase: Phase) {
        info!("phase: {phase:?}");
    }

    /// Refuse to start below the free-space floor. Platforms without a
    /// reading skip the check.
    fn check_disk_floor(&self, root: &Path) -> Result<(), CapacityError> {
        if let Some(available_gb) = available_disk_gb(root) {
            if available_gb < self.cfg.disk_floor_gb {
                return Err(CapacityError::DiskFloor {
                    path: root.display().to_string(),
                    available_gb,
                    required_gb: self.cfg.disk_floor_gb,
                });
            }
            info!("{available_gb:.1} GiB free at {}", root.display());
        }
        Ok(())
    }
}

/// Fetch one capture's HTML and reconstruct its resource graph. Failure is
/// recorded, never propagated.
async fn process_capture(
    capture: &Capture,
    engine: &FetchEngine,
    builder: &ResourceGraphBuilder,
    layout: &OutputLayout,
    pages: &PageLookup,
) -> CaptureOutcome {
    let mut outcome = CaptureOutcome {
        record: None,
        warnings: Vec::new(),
        resources_fetched: 0,
        resources_failed: 0,
    };

    let target = FetchTarget::new(capture.original_url.clone(), capture.timestamp.clone());
    let html_bytes = match engine.fetch(&target).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("capture {}@{} failed: {e}", capture.original_url, capture.timestamp);
            outcome
                .warnings
                .push(format!("capture {}@{} failed: {e}", capture.original_url, capture.timestamp));
            return outcome;
        }
    };

    let page = builder.reconstruct(capture, &html_bytes, pages).await;
    outcome.resources_fetched = page.references.iter().filter(|r| r.fetched).count();
    outcome.resources_failed = page.references.len() - outcome.resources_fetched;

    let local_html_path =
        match layout.write_html(&capture.timestamp, &capture.original_url, &page.html) {
            Ok(rel) => rel,
            Err(e) => {
                outcome.warnings.push(format!(
                    "capture {}@{} could not be persisted: {e:#}",
                    capture.original_url, capture.timestamp
                ));
                return outcome;
            }
        };

    let record = SnapshotRecord {
        timestamp: capture.timestamp.clone(),
        original_url: capture.original_url.clone(),
        local_html_path,
        resources: page
            .references
            .into_iter()
            .map(|r| ResourceRecord {
                url: r.resolved,
                class: r.class.subdir().to_string(),
                local_path: r.local_path,
                fetched: r.fetched,
            })
            .collect(),
        fetched_at: Utc::now(),
        http_status: capture.status_code,
        failures: page.failures,
    };
    if let Err(e) = layout.write_record(&record) {
        outcome
            .warnings
            .push(format!("record for {} not written: {e:#}", record.original_url));
    }
    outcome.record = Some(record);
    outcome
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar
}

/// Free space at `path` in GiB, when the platform can report it.
#[cfg(unix)]
fn available_disk_gb(path: &Path) -> Option<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let bytes = stat.f_bavail as u128 * stat.f_frsize as u128;
    Some(bytes as f64 / 1_073_741_824.0)
}

#[cfg(not(unix))]
fn available_disk_gb(_path: &Path) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn disk_probe_reports_something_for_the_current_dir() {
        let gb = available_disk_gb(Path::new("."));
        assert!(gb.is_some());
        assert!(gb.unwrap() >= 0.0);
    }

    #[test]
    fn disk_floor_rejects_when_space_is_short() {
        let mut cfg = RunConfig::new("example.com");
        cfg.disk_floor_gb = f64::INFINITY;
        let orch = Orchestrator::new(cfg);
        let result = orch.check_disk_floor(Path::new("."));
        if available_disk_gb(Path::new(".")).is_some() {
            assert!(matches!(result, Err(CapacityError::DiskFloor { .. })));
        }
    }
}
