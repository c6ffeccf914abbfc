//! Start/end date resolution.
//!
//! The start date comes from a strict priority cascade: an explicit user
//! date (parse failure is fatal — the user asked for a specific thing),
//! then the archive's earliest capture of the domain when auto-detection is
//! on, then `today − 5 years`, then a fixed floor of 2000-01-01. The end
//! date defaults to today.

use crate::config::DYNAMIC_FALLBACK_YEARS;
use crate::error::DateParseError;
use async_trait::async_trait;
use chrono::{Days, Months, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Inclusive calendar date range, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Build a range, swapping the endpoints if they arrive reversed.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            warn!("date range {start}..{end} is reversed, swapping");
            Self {
                start: end,
                end: start,
            }
        }
    }
}

/// Compact `YYYYMMDD` form used by the archive's index API.
pub fn to_compact(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Queries the archive for the earliest capture of a domain.
///
/// Implemented by the CDX client; a trait seam so the resolver can be
/// tested without a network.
#[async_trait]
pub trait EarliestCaptureProbe: Send + Sync {
    /// Date of the earliest capture, or `None` when the probe fails or the
    /// domain has no captures. Probe failure is never fatal.
    async fn earliest_capture(&self, domain: &str) -> Option<NaiveDate>;
}

/// Parse an explicit user-supplied date.
///
/// Accepts `YYYYMMDD`, `YYYY-MM-DD`, `DD/MM/YYYY`, `DD-MM-YYYY`,
/// `YYYY/MM/DD`, and relative tokens in English and Portuguese.
pub fn parse_user_date(input: &str, today: NaiveDate) -> Result<NaiveDate, DateParseError> {
    let s = input.trim();

    let numeric = [
        ("%Y%m%d", is_compact as fn(&str) -> bool),
        ("%Y-%m-%d", is_dashed_ymd),
        ("%d/%m/%Y", is_slashed_dmy),
        ("%d-%m-%Y", is_dashed_dmy),
        ("%Y/%m/%d", is_slashed_ymd),
    ];
    for (fmt, shape) in numeric {
        if shape(s) {
            return NaiveDate::parse_from_str(s, fmt)
                .map_err(|_| DateParseError::InvalidCalendar(s.to_string()));
        }
    }

    let days_back = match s.to_lowercase().as_str() {
        "today" | "hoje" => Some(0),
        "yesterday" | "ontem" => Some(1),
        "last_week" | "semana_passada" => Some(7),
        "last_month" | "mes_passado" => Some(30),
        "last_year" | "ano_passado" => Some(365),
        _ => None,
    };
    if let Some(days) = days_back {
        return Ok(today
            .checked_sub_days(Days::new(days))
            .unwrap_or(NaiveDate::MIN));
    }

    Err(DateParseError::Unrecognized(s.to_string()))
}

fn is_compact(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit())
}

fn shaped(s: &str, groups: [usize; 3], sep: char) -> bool {
    let parts: Vec<&str> = s.split(sep).collect();
    parts.len() == 3
        && parts
            .iter()
            .zip(groups)
            .all(|(p, len)| p.len() == len && p.bytes().all(|b| b.is_ascii_digit()))
}

fn is_dashed_ymd(s: &str) -> bool {
    shaped(s, [4, 2, 2], '-')
}

fn is_slashed_dmy(s: &str) -> bool {
    shaped(s, [2, 2, 4], '/')
}

fn is_dashed_dmy(s: &str) -> bool {
    shaped(s, [2, 2, 4], '-')
}

fn is_slashed_ymd(s: &str) -> bool {
    shaped(s, [4, 2, 2], '/')
}

/// `today − DYNAMIC_FALLBACK_YEARS`, by calendar subtraction.
///
/// Falls back to the fixed constant date if the subtraction itself is
/// impossible.
pub fn dynamic_fallback(today: NaiveDate) -> NaiveDate {
    today
        .checked_sub_months(Months::new(12 * DYNAMIC_FALLBACK_YEARS))
        .unwrap_or_else(fixed_fallback)
}

/// The terminal fallback: 2000-01-01.
pub fn fixed_fallback() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

/// Resolves the effective extraction window.
pub struct DateResolver {
    probe: Arc<dyn EarliestCaptureProbe>,
}

impl DateResolver {
    pub fn new(probe: Arc<dyn EarliestCaptureProbe>) -> Self {
        Self { probe }
    }

    /// Resolve the effective start date. Always terminates in a usable
    /// date unless the user supplied one we cannot parse.
    pub async fn resolve_start(
        &self,
        user_date: Option<&str>,
        auto_detect: bool,
        domain: &str,
    ) -> Result<NaiveDate, DateParseError> {
        let today = Utc::now().date_naive();

        if let Some(raw) = user_date {
            let date = parse_user_date(raw, today)?;
            info!("using user-specified start date: {date}");
            return Ok(date);
        }

        if auto_detect {
            if let Some(date) = self.probe.earliest_capture(domain).await {
                info!("earliest capture of {domain} detected: {date}");
                return Ok(date);
            }
            warn!("earliest-capture detection failed, using dynamic fallback");
        }

        let date = dynamic_fallback(today);
        info!("using dynamic fallback start date: {date}");
        Ok(date)
    }

    /// Resolve the full range; the end date defaults to today.
    pub async fn resolve_range(
        &self,
        user_start: Option<&str>,
        user_end: Option<&str>,
        auto_detect: bool,
        domain: &str,
    ) -> Result<DateRange, DateParseError> {
        let today = Utc::now().date_naive();
        let start = self.resolve_start(user_start, auto_detect, domain).await?;
        let end = match user_end {
            Some(raw) => parse_user_date(raw, today)?,
            None => today,
        };
        Ok(DateRange::new(start, end))
    }
}
