//! Failure taxonomy for a reconstruction run.
//!
//! Only two failures abort a run: an unparseable explicit date and a fatal
//! capacity condition. Everything else is recorded against the capture or
//! reference it concerns and the run continues.

use thiserror::Error;

/// The user asked for a specific date and we could not parse it.
///
/// Never silently downgraded to a fallback tier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateParseError {
    #[error("unrecognized date format: '{0}'")]
    Unrecognized(String),
    #[error("'{0}' matched a date pattern but is not a valid calendar date")]
    InvalidCalendar(String),
}

/// A single fetch target failed.
///
/// Payloads are plain strings rather than source errors so the engine's
/// single-flight channel can hand a clone of one result to every waiter.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Non-transient HTTP status (4xx other than 429). Not retried.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    /// Transient failures (connect errors, timeouts, 5xx, 429) that
    /// persisted through every retry attempt.
    #[error("{url} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },
    /// The target could not be turned into a request at all.
    #[error("malformed fetch target: {0}")]
    InvalidTarget(String),
}

impl FetchError {
    /// The URL this failure concerns, when there is one.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Status { url, .. } | Self::RetriesExhausted { url, .. } => Some(url),
            Self::InvalidTarget(_) => None,
        }
    }
}

/// One sub-window of the index enumeration failed after retries.
///
/// Sibling windows are unaffected; the run continues with partial coverage.
#[derive(Debug, Clone, Error)]
#[error("index query for {from}..{to} failed after {attempts} attempts: {reason}")]
pub struct IndexQueryError {
    pub from: String,
    pub to: String,
    pub attempts: u32,
    pub reason: String,
}

/// Disk or memory exhaustion.
///
/// Disk below the safety floor is fatal; memory pressure only throttles
/// dispatch and never surfaces as an error.
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("only {available_gb:.1} GiB free at {path}, below the {required_gb:.1} GiB safety floor")]
    DiskFloor {
        path: String,
        available_gb: f64,
        required_gb: f64,
    },
}
