//! Snapshot index: enumerate the archive's captures for a domain.
//!
//! The CDX-style index is queried per sub-window with a page-size cap and a
//! resume cursor; results are deduplicated and optionally reduced to one
//! capture per URL. Enumeration is re-invocable — identical inputs yield an
//! identical set.

pub mod client;

pub use client::CdxClient;

use crate::dates::DateRange;
use crate::error::IndexQueryError;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One archived capture of a URL at a specific timestamp.
///
/// Identity is `(original_url, timestamp)`; the digest exists to collapse
/// adjacent timestamps that captured identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capture {
    pub original_url: String,
    /// 14-digit UTC timestamp (`YYYYMMDDhhmmss`).
    pub timestamp: String,
    pub digest: Option<String>,
    pub mime_type: String,
    pub status_code: u16,
}

impl Capture {
    /// Calendar date of the capture, when the timestamp is well formed.
    pub fn date(&self) -> Option<NaiveDate> {
        let compact = self.timestamp.get(..8)?;
        NaiveDate::parse_from_str(compact, "%Y%m%d").ok()
    }
}

/// Result of one enumeration: the capture set plus any sub-windows that
/// exhausted their retries. Partial coverage is reported, not fatal.
#[derive(Debug, Default)]
pub struct EnumerationOutcome {
    pub captures: Vec<Capture>,
    pub window_failures: Vec<IndexQueryError>,
    pub pages_fetched: usize,
}

/// Partition a range into inclusive sub-windows of at most `days` days.
///
/// Long ranges time out at the index API, so they are split before querying.
pub fn split_windows(range: DateRange, days: u64) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut current = range.start;
    loop {
        let window_end = current
            .checked_add_days(Days::new(days))
            .map(|d| d.min(range.end))
            .unwrap_or(range.end);
        windows.push((current, window_end));
        if window_end >= range.end {
            break;
        }
        current = match window_end.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    windows
}

/// Drop exact `(url, timestamp)` duplicates, keeping first occurrence.
pub fn dedup_identity(captures: Vec<Capture>) -> Vec<Capture> {
    let mut seen = HashSet::new();
    captures
        .into_iter()
        .filter(|c| seen.insert((c.original_url.clone(), c.timestamp.clone())))
        .collect()
}

/// Collapse captures of identical content to the earliest representative.
///
/// Input must be sorted by timestamp. Captures without a digest are kept.
pub fn collapse_digests(captures: Vec<Capture>) -> Vec<Capture> {
    let mut seen = HashSet::new();
    captures
        .into_iter()
        .filter(|c| match &c.digest {
            Some(digest) => seen.insert((c.original_url.clone(), digest.clone())),
            None => true,
        })
        .collect()
}

/// Reduce to the single most-recent capture per distinct URL.
///
/// Applied as a final reduction so range and digest semantics are computed
/// over the full set first.
pub fn reduce_single_version(captures: Vec<Capture>) -> Vec<Capture> {
    let mut newest: HashMap<String, Capture> = HashMap::new();
    for c in captures {
        match newest.get(&c.original_url) {
            Some(existing) if existing.timestamp >= c.timestamp => {}
            _ => {
                newest.insert(c.original_url.clone(), c);
            }
        }
    }
    let mut reduced: Vec<Capture> = newest.into_values().collect();
    reduced.sort_by(|a, b| (&a.timestamp, &a.original_url).cmp(&(&b.timestamp, &b.original_url)));
    reduced
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(url: &str, ts: &str, digest: &str) -> Capture {
        Capture {
            original_url: url.to_string(),
            timestamp: ts.to_string(),
            digest: Some(digest.to_string()),
            mime_type: "text/html".to_string(),
            status_code: 200,
        }
    }

    #[test]
    fn windows_cover_the_range_without_overlap() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2015, 12, 31).unwrap(),
        );
        let windows = split_windows(range, 90);
        assert_eq!(windows.first().unwrap().0, range.start);
        assert_eq!(windows.last().unwrap().1, range.end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1 + Days::new(1), pair[1].0);
        }
    }

    #[test]
    fn short_range_is_a_single_window() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2015, 2, 1).unwrap(),
        );
        assert_eq!(split_windows(range, 90).len(), 1);
    }

    #[test]
    fn digest_collapse_keeps_earliest_representative() {
        let captures = vec![
            cap("http://a/", "20150101000000", "D1"),
            cap("http://a/", "20150201000000", "D1"),
            cap("http://a/", "20150301000000", "D2"),
        ];
        let collapsed = collapse_digests(captures);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].timestamp, "20150101000000");
        assert_eq!(collapsed[1].timestamp, "20150301000000");
    }

    #[test]
    fn single_version_keeps_maximum_timestamp_per_url() {
        let captures = vec![
            cap("http://a/", "20150101000000", "D1"),
            cap("http://a/", "20150301000000", "D2"),
            cap("http://b/", "20150201000000", "D3"),
        ];
        let reduced = reduce_single_version(captures);
        assert_eq!(reduced.len(), 2);
        let a = reduced.iter().find(|c| c.original_url == "http://a/").unwrap();
        assert_eq!(a.timestamp, "20150301000000");
    }

    #[test]
    fn identity_dedup_drops_exact_duplicates_only() {
        let captures = vec![
            cap("http://a/", "20150101000000", "D1"),
            cap("http://a/", "20150101000000", "D1"),
            cap("http://a/", "20150102000000", "D1"),
        ];
        assert_eq!(dedup_identity(captures).len(), 2);
    }
}
