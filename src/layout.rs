//! Output layout — the persisted contract consumed by the index/UI builder.
//!
//! ```text
//! <output>/html/<timestamp>_<safe-name>.html
//! <output>/resources/{css,js,images,fonts,other}/<hash-name>.<ext>
//! <output>/metadata/<timestamp>_<safe-name>.json   # one SnapshotRecord
//! <output>/manifest.json                           # the whole run
//! ```
//!
//! `index.html` is built from the manifest by a separate tool, not here.
//! Writes are idempotent re-derivations, not transactions: a file left by an
//! interrupted run is simply rewritten on resume.

use crate::rebuild::paths::{safe_page_name, ResourceClass};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One resource as recorded in a SnapshotRecord.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRecord {
    pub url: String,
    pub class: String,
    /// Mirror-relative path, when the resource was stored locally.
    pub local_path: Option<String>,
    pub fetched: bool,
}

/// Persisted record of one retrieved capture. Written once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub timestamp: String,
    pub original_url: String,
    pub local_html_path: String,
    pub resources: Vec<ResourceRecord>,
    pub fetched_at: DateTime<Utc>,
    pub http_status: u16,
    /// Degradations recorded against this capture (failed resources,
    /// parse fallbacks). Empty for a clean capture.
    pub failures: Vec<String>,
}

/// Aggregate emitted at FINALIZING for the index-builder collaborator.
#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub domain: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed_with_warnings: bool,
    pub records: Vec<SnapshotRecord>,
    pub warnings: Vec<String>,
}

/// Filesystem placement for one output mirror.
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory skeleton.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("html"))
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        fs::create_dir_all(self.root.join("metadata"))?;
        for class in ResourceClass::ALL {
            fs::create_dir_all(self.root.join("resources").join(class.subdir()))?;
        }
        Ok(())
    }

    /// `<timestamp>_<safe-name>` stem shared by the HTML file and its record.
    pub fn page_stem(timestamp: &str, original_url: &str) -> String {
        format!("{timestamp}_{}", safe_page_name(original_url))
    }

    /// Mirror-relative HTML path for a capture.
    pub fn html_rel_path(timestamp: &str, original_url: &str) -> String {
        format!("html/{}.html", Self::page_stem(timestamp, original_url))
    }

    /// Mirror-relative path for a resource file.
    pub fn resource_rel_path(class: ResourceClass, name: &str) -> String {
        format!("resources/{}/{name}", class.subdir())
    }

    pub fn write_html(&self, timestamp: &str, original_url: &str, html: &str) -> Result<String> {
        let rel = Self::html_rel_path(timestamp, original_url);
        let path = self.root.join(&rel);
        fs::write(&path, html)
            .with_context(|| format!("failed to write page: {}", path.display()))?;
        Ok(rel)
    }

    pub fn write_resource(&self, class: ResourceClass, name: &str, bytes: &[u8]) -> Result<String> {
        let rel = Self::resource_rel_path(class, name);
        let path = self.root.join(&rel);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write resource: {}", path.display()))?;
        Ok(rel)
    }

    pub fn write_record(&self, record: &SnapshotRecord) -> Result<()> {
        let stem = Self::page_stem(&record.timestamp, &record.original_url);
        let path = self.root.join("metadata").join(format!("{stem}.json"));
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write record: {}", path.display()))?;
        Ok(())
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<PathBuf> {
        let path = self.root.join("manifest.json");
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write manifest: {}", path.display()))?;
        Ok(path)
    }
}
