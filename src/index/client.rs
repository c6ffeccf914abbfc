//! HTTP client for the archive's CDX search endpoint.
//!
//! One page per request (`limit` + `showResumeKey` continuation), retry with
//! exponential backoff on transient failures, and per-window degradation:
//! a window that exhausts its retries is reported and skipped while its
//! siblings continue.

use super::{
    collapse_digests, dedup_identity, reduce_single_version, split_windows, Capture,
    EnumerationOutcome,
};
use crate::config::{RunConfig, QUERY_WINDOW_DAYS, SNAPSHOTS_PER_PAGE};
use crate::dates::{to_compact, DateRange, EarliestCaptureProbe};
use crate::error::IndexQueryError;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One parsed CDX page.
#[derive(Debug, Default)]
struct CdxPage {
    captures: Vec<Capture>,
    resume_key: Option<String>,
}

/// Client for the archive's time-series index.
#[derive(Clone)]
pub struct CdxClient {
    http: reqwest::Client,
    cfg: Arc<RunConfig>,
}

impl CdxClient {
    pub fn new(cfg: Arc<RunConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { http, cfg }
    }

    /// Enumerate every capture of the domain within the range.
    ///
    /// Re-invocable: identical inputs yield an identical, order-independent
    /// set. `max_pages` (from config) truncates page fetches deterministically
    /// in window order, which is chronological.
    pub async fn enumerate(&self, range: DateRange) -> EnumerationOutcome {
        let mut outcome = EnumerationOutcome::default();
        let windows = split_windows(range, QUERY_WINDOW_DAYS as u64);
        info!(
            "enumerating {} over {} sub-windows ({}..{})",
            self.cfg.domain,
            windows.len(),
            range.start,
            range.end
        );

        let mut raw: Vec<Capture> = Vec::new();
        for (from, to) in windows {
            let budget = match self.cfg.max_pages {
                Some(max) => {
                    if outcome.pages_fetched >= max {
                        debug!("page budget exhausted, truncating enumeration");
                        break;
                    }
                    Some(max - outcome.pages_fetched)
                }
                None => None,
            };

            let (captures, pages, failure) = self.fetch_window(from, to, budget).await;
            outcome.pages_fetched += pages;
            raw.extend(captures);
            match failure {
                None => debug!("window {from}..{to}: {pages} pages"),
                Some(err) => {
                    // Pages fetched before the failure still count; the
                    // window only loses its tail.
                    warn!("window {from}..{to} degraded: {err}");
                    outcome.window_failures.push(err);
                }
            }
        }

        let mut captures = dedup_identity(raw);
        captures.sort_by(|a, b| {
            (&a.timestamp, &a.original_url).cmp(&(&b.timestamp, &b.original_url))
        });
        if !self.cfg.full_history {
            captures = collapse_digests(captures);
        }
        if self.cfg.single_version {
            captures = reduce_single_version(captures);
        }

        info!(
            "enumeration complete: {} captures, {} pages, {} degraded windows",
            captures.len(),
            outcome.pages_fetched,
            outcome.window_failures.len()
        );
        outcome.captures = captures;
        outcome
    }

    /// Page through one sub-window until its cursor is exhausted or the
    /// remaining page budget runs out. Returns whatever was gathered plus
    /// the page count, with the failure (if any) alongside — a degraded
    /// window keeps the pages it already fetched.
    async fn fetch_window(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        budget: Option<usize>,
    ) -> (Vec<Capture>, usize, Option<IndexQueryError>) {
        let mut captures = Vec::new();
        let mut pages = 0usize;
        let mut resume_key: Option<String> = None;

        loop {
            if let Some(limit) = budget {
                if pages >= limit {
                    break;
                }
            }
            match self.fetch_page(from, to, resume_key.as_deref()).await {
                Ok(page) => {
                    pages += 1;
                    captures.extend(page.captures);
                    match page.resume_key {
                        Some(key) => resume_key = Some(key),
                        None => break,
                    }
                }
                Err(reason) => {
                    // The failed request consumed a page of budget too.
                    let err = IndexQueryError {
                        from: to_compact(from),
                        to: to_compact(to),
                        attempts: self.cfg.max_attempts,
                        reason,
                    };
                    return (captures, pages + 1, Some(err));
                }
            }
        }

        (captures, pages, None)
    }

    /// Fetch and parse one CDX page, retrying transient failures with
    /// exponential backoff.
    async fn fetch_page(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        resume_key: Option<&str>,
    ) -> Result<CdxPage, String> {
        let mut last_error = String::new();

        for attempt in 0..self.cfg.max_attempts {
            if attempt > 0 {
                let delay = Duration::from_millis(
                    crate::config::RETRY_BACKOFF_MS * 2u64.pow(attempt - 1),
                );
                tokio::time::sleep(delay).await;
            }

            let mut params: Vec<(&str, String)> = vec![
                ("url", format!("{}/*", self.cfg.domain)),
                ("output", "json".to_string()),
                ("fl", "timestamp,original,statuscode,mimetype,digest".to_string()),
                ("filter", "statuscode:200".to_string()),
                ("limit", SNAPSHOTS_PER_PAGE.to_string()),
                ("from", to_compact(from)),
                ("to", to_compact(to)),
                ("showResumeKey", "true".to_string()),
            ];
            if let Some(key) = resume_key {
                params.push(("resumeKey", key.to_string()));
            }

            let response = match self
                .http
                .get(self.cfg.cdx_endpoint())
                .query(&params)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request error: {e}");
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status >= 500 || status == 429 {
                last_error = format!("HTTP {status}");
                continue;
            }
            if status != 200 {
                // Non-transient: the window degrades immediately.
                return Err(format!("HTTP {status}"));
            }

            let payload: Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_error = format!("malformed payload: {e}");
                    continue;
                }
            };
            return Ok(parse_cdx_payload(&payload));
        }

        Err(last_error)
    }
}

/// Parse the CDX JSON payload: a header row, data rows, and (with
/// `showResumeKey`) an empty row followed by a single-element resume key row.
/// Only `text/html` rows become captures; the rest are resources reached
/// through page references, not captures in their own right.
fn parse_cdx_payload(payload: &Value) -> CdxPage {
    let rows = match payload.as_array() {
        Some(rows) if rows.len() > 1 => rows,
        _ => return CdxPage::default(),
    };

    let header: Vec<&str> = rows[0]
        .as_array()
        .map(|cells| cells.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let col = |name: &str| header.iter().position(|h| *h == name);
    let (Some(ts_idx), Some(url_idx)) = (col("timestamp"), col("original")) else {
        return CdxPage::default();
    };
    let status_idx = col("statuscode");
    let mime_idx = col("mimetype");
    let digest_idx = col("digest");

    let mut data_rows = &rows[1..];
    let mut resume_key = None;

    // Trailing `[]` + `["<key>"]` is the resume cursor.
    if data_rows.len() >= 2 {
        let tail = &data_rows[data_rows.len() - 1];
        let sep = &data_rows[data_rows.len() - 2];
        let tail_cells = tail.as_array();
        let sep_is_empty = sep.as_array().map(|a| a.is_empty()).unwrap_or(false);
        if sep_is_empty {
            if let Some(cells) = tail_cells {
                if cells.len() == 1 {
                    resume_key = cells[0].as_str().map(str::to_string);
                    data_rows = &data_rows[..data_rows.len() - 2];
                }
            }
        }
    }

    let mut captures = Vec::new();
    for row in data_rows {
        let Some(cells) = row.as_array() else { continue };
        let field = |idx: Option<usize>| -> Option<&str> {
            idx.and_then(|i| cells.get(i)).and_then(Value::as_str)
        };
        let (Some(timestamp), Some(original)) = (field(Some(ts_idx)), field(Some(url_idx)))
        else {
            continue;
        };
        let mime = field(mime_idx).unwrap_or("");
        if !mime.contains("text/html") {
            continue;
        }
        captures.push(Capture {
            original_url: original.to_string(),
            timestamp: timestamp.to_string(),
            digest: field(digest_idx).map(str::to_string),
            mime_type: mime.to_string(),
            status_code: field(status_idx).and_then(|s| s.parse().ok()).unwrap_or(0),
        });
    }

    CdxPage {
        captures,
        resume_key,
    }
}

#[async_trait]
impl EarliestCaptureProbe for CdxClient {
    async fn earliest_capture(&self, domain: &str) -> Option<NaiveDate> {
        let params = [
            ("url", format!("{domain}/*")),
            ("output", "json".to_string()),
            ("fl", "timestamp".to_string()),
            ("limit", "1".to_string()),
        ];
        let response = self
            .http
            .get(self.cfg.cdx_endpoint())
            .query(&params)
            .send()
            .await
            .ok()?;
        if response.status().as_u16() != 200 {
            warn!("earliest-capture probe returned HTTP {}", response.status());
            return None;
        }
        let payload: Value = response.json().await.ok()?;
        let rows = payload.as_array()?;
        let timestamp = rows.get(1)?.as_array()?.first()?.as_str()?;
        let compact = timestamp.get(..8)?;
        NaiveDate::parse_from_str(compact, "%Y%m%d").ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(archive: &str, max_pages: Option<usize>) -> CdxClient {
        let mut cfg = RunConfig::new("example.com");
        cfg.archive_base = archive.to_string();
        cfg.max_attempts = 2;
        cfg.max_pages = max_pages;
        CdxClient::new(Arc::new(cfg))
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn one_row_page() -> serde_json::Value {
        json!([
            ["timestamp", "original", "statuscode", "mimetype", "digest"],
            ["20150415000000", "http://example.com/", "200", "text/html", "AAAA"],
        ])
    }

    #[tokio::test]
    async fn failed_window_degrades_without_sinking_siblings() {
        let server = MockServer::start().await;
        // First sub-window (2015-01-01..2015-04-01) always 500s; its
        // sibling (2015-04-02..) answers normally.
        Mock::given(method("GET"))
            .and(path("/cdx/search/cdx"))
            .and(query_param("from", "20150101"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdx/search/cdx"))
            .and(query_param("from", "20150402"))
            .respond_with(ResponseTemplate::new(200).set_body_json(one_row_page()))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), None);
        let range = DateRange::new(date(2015, 1, 1), date(2015, 5, 1));
        let outcome = client.enumerate(range).await;

        assert_eq!(outcome.captures.len(), 1);
        assert_eq!(outcome.window_failures.len(), 1);
        let failure = &outcome.window_failures[0];
        assert_eq!(failure.from, "20150101");
        assert_eq!(failure.attempts, 2);
        // One failed page request plus one healthy page, counted in the
        // same unit.
        assert_eq!(outcome.pages_fetched, 2);
    }

    #[tokio::test]
    async fn max_pages_truncates_page_requests_deterministically() {
        let server = MockServer::start().await;
        // Every page carries a resume cursor: pagination would never end
        // without the budget.
        let endless = json!([
            ["timestamp", "original", "statuscode", "mimetype", "digest"],
            ["20150101000000", "http://example.com/", "200", "text/html", "AAAA"],
            [],
            ["com,example)/+20150101000000"],
        ]);
        Mock::given(method("GET"))
            .and(path("/cdx/search/cdx"))
            .respond_with(ResponseTemplate::new(200).set_body_json(endless))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Some(2));
        let range = DateRange::new(date(2015, 1, 1), date(2015, 2, 1));
        let outcome = client.enumerate(range).await;

        assert_eq!(outcome.pages_fetched, 2);
        assert!(outcome.window_failures.is_empty());
        // Identical rows across pages collapse to one capture.
        assert_eq!(outcome.captures.len(), 1);
    }

    #[test]
    fn payload_rows_filter_to_html() {
        let payload = json!([
            ["timestamp", "original", "statuscode", "mimetype", "digest"],
            ["20150101000000", "http://example.com/", "200", "text/html", "AAAA"],
            ["20150101000001", "http://example.com/logo.png", "200", "image/png", "BBBB"],
        ]);
        let page = parse_cdx_payload(&payload);
        assert_eq!(page.captures.len(), 1);
        assert_eq!(page.captures[0].original_url, "http://example.com/");
        assert!(page.resume_key.is_none());
    }

    #[test]
    fn trailing_resume_key_is_split_from_data() {
        let payload = json!([
            ["timestamp", "original", "statuscode", "mimetype", "digest"],
            ["20150101000000", "http://example.com/", "200", "text/html", "AAAA"],
            [],
            ["com,example)/+20150101000000"],
        ]);
        let page = parse_cdx_payload(&payload);
        assert_eq!(page.captures.len(), 1);
        assert_eq!(
            page.resume_key.as_deref(),
            Some("com,example)/+20150101000000")
        );
    }

    #[test]
    fn empty_or_header_only_payload_yields_nothing() {
        assert!(parse_cdx_payload(&json!([])).captures.is_empty());
        let header_only = json!([["timestamp", "original", "statuscode", "mimetype", "digest"]]);
        assert!(parse_cdx_payload(&header_only).captures.is_empty());
    }
}
