//! Resource graph reconstruction.
//!
//! Takes one captured HTML document, discovers every resource it references
//! (recursing into fetched CSS), schedules retrieval through the fetch
//! engine, and rewrites references to local mirror paths. Rewriting is
//! text-level substitution keyed by the raw reference string — never a DOM
//! serialization round-trip — so unrelated markup survives byte-for-byte.
//!
//! A resource that fails after retries degrades to the archive's live
//! replay URL for that one reference; the document is always rewritten and
//! persisted regardless.

pub mod css;
pub mod discover;
pub mod paths;

pub use paths::ResourceClass;

use crate::config::RunConfig;
use crate::fetch::{FetchEngine, FetchTarget};
use crate::index::Capture;
use crate::layout::OutputLayout;
use discover::{discover_references, Discovery};
use futures::stream::{self, StreamExt};
use paths::{classify, in_scope, resolve_reference, safe_resource_name};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// How deep `@import` chains are followed inside fetched CSS.
const CSS_RECURSION_LIMIT: u8 = 2;

/// A discovered reference after resolution and scheduling.
#[derive(Debug, Clone)]
pub struct ResourceReference {
    /// The reference exactly as it appeared in the document.
    pub raw: String,
    /// Absolute form, resolved against the document's original URL.
    pub resolved: String,
    pub class: ResourceClass,
    /// Mirror-relative path, when the resource was stored.
    pub local_path: Option<String>,
    pub fetched: bool,
}

/// Output of reconstructing one capture.
#[derive(Debug, Default)]
pub struct ReconstructedPage {
    pub html: String,
    pub references: Vec<ResourceReference>,
    /// Degradations to record against this capture.
    pub failures: Vec<String>,
}

/// The run's capture set, keyed by original URL, for anchor rewriting.
///
/// Anchors pointing at another captured page are rewritten to that page's
/// local file so the mirror is navigable offline; everything else is left
/// alone. Anchor targets are never fetched as resources.
#[derive(Debug, Default)]
pub struct PageLookup {
    pages: HashMap<String, Vec<(String, String)>>,
}

impl PageLookup {
    pub fn from_captures(captures: &[Capture]) -> Self {
        let mut pages: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for capture in captures {
            // Normalize through Url so keys match resolved anchor targets.
            let key = Url::parse(&capture.original_url)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| capture.original_url.clone());
            let file = format!(
                "{}.html",
                OutputLayout::page_stem(&capture.timestamp, &capture.original_url)
            );
            pages
                .entry(key)
                .or_default()
                .push((capture.timestamp.clone(), file));
        }
        Self { pages }
    }

    /// Local file name of the captured version of `url` closest in time to
    /// `near`, when the URL is in the capture set.
    pub fn local_page(&self, url: &Url, near: &str) -> Option<&str> {
        let versions = self.pages.get(url.as_str())?;
        let anchor = timestamp_value(near);
        versions
            .iter()
            .min_by_key(|(ts, _)| timestamp_value(ts).abs_diff(anchor))
            .map(|(_, file)| file.as_str())
    }
}

fn timestamp_value(ts: &str) -> u64 {
    // 14-digit archive timestamps fit u64; malformed ones sort first.
    ts.parse().unwrap_or(0)
}

/// Discovers, fetches, and rewrites the resources of captured documents.
pub struct ResourceGraphBuilder {
    cfg: Arc<RunConfig>,
    engine: Arc<FetchEngine>,
    layout: Arc<OutputLayout>,
}

impl ResourceGraphBuilder {
    pub fn new(cfg: Arc<RunConfig>, engine: Arc<FetchEngine>, layout: Arc<OutputLayout>) -> Self {
        Self {
            cfg,
            engine,
            layout,
        }
    }

    /// Reconstruct one capture: returns the rewritten document plus every
    /// reference that was scheduled. Never fails the capture over a single
    /// resource.
    pub async fn reconstruct(
        &self,
        capture: &Capture,
        html_bytes: &[u8],
        pages: &PageLookup,
    ) -> ReconstructedPage {
        let html = String::from_utf8_lossy(html_bytes).into_owned();
        let mut page = ReconstructedPage::default();

        // scraper's DOM types are not Send; parse on the blocking pool.
        let parse_input = html.clone();
        let discovery = match tokio::task::spawn_blocking(move || discover_references(&parse_input))
            .await
        {
            Ok(d) => d,
            Err(e) => {
                // Degrade to "no resources discovered"; the document is
                // still persisted verbatim.
                warn!("parse task failed for {}: {e}", capture.original_url);
                page.failures
                    .push(format!("parse failed: {e}"));
                Discovery::default()
            }
        };

        let doc_url = self.document_url(capture);
        let resolve_base = discovery
            .base_href
            .as_deref()
            .and_then(|href| resolve_reference(href, &doc_url))
            .unwrap_or_else(|| doc_url.clone());

        // Group raw occurrences by resolved URL: one fetch per distinct
        // resolved URL per capture, however many times it appears.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (Vec<String>, &'static str)> = HashMap::new();
        for reference in &discovery.references {
            let Some(resolved) = resolve_reference(&reference.raw, &resolve_base) else {
                continue;
            };
            if !in_scope(&resolved, &self.cfg.domain) {
                continue;
            }
            let key = resolved.to_string();
            match groups.get_mut(&key) {
                Some((raws, _)) => raws.push(reference.raw.clone()),
                None => {
                    order.push(key.clone());
                    groups.insert(key, (vec![reference.raw.clone()], reference.tag));
                }
            }
        }

        let timestamp = capture.timestamp.clone();
        let fetched: Vec<(Vec<String>, ResourceReference, Vec<ResourceReference>, Vec<String>)> =
            stream::iter(order.into_iter().filter_map(|resolved| {
                let (raws, tag) = groups.remove(&resolved)?;
                Some((resolved, raws, tag))
            }))
            .map(|(resolved, raws, tag)| {
                let ts = timestamp.clone();
                async move {
                    let (reference, nested, failures) =
                        self.fetch_resource(&resolved, tag, &ts).await;
                    (raws, reference, nested, failures)
                }
            })
            .buffer_unordered(self.cfg.workers)
            .collect()
            .await;

        // Rewrite every raw occurrence. HTML lives one level below the
        // mirror root, so local paths get a `../` hop.
        let mut replacements: Vec<(String, String)> = Vec::new();
        for (raws, mut reference, nested, failures) in fetched {
            if let Some(first) = raws.first() {
                reference.raw = first.clone();
            }
            let target = match &reference.local_path {
                Some(local) => format!("../{local}"),
                None => self
                    .cfg
                    .live_replay_url(&capture.timestamp, &reference.resolved),
            };
            for raw in raws {
                replacements.push((raw, target.clone()));
            }
            page.references.push(reference);
            page.references.extend(nested);
            page.failures.extend(failures);
        }

        // In-scope anchors whose target is another captured page point at
        // that page's local file; everything else stays as written.
        for raw in &discovery.anchors {
            let Some(resolved) = resolve_reference(raw, &resolve_base) else {
                continue;
            };
            if !in_scope(&resolved, &self.cfg.domain) {
                continue;
            }
            if let Some(file) = pages.local_page(&resolved, &capture.timestamp) {
                replacements.push((raw.clone(), file.to_string()));
            }
        }

        // Completion order is nondeterministic; the record is not.
        page.references.sort_by(|a, b| a.resolved.cmp(&b.resolved));
        page.failures.sort();

        page.html = rewrite_text(&html, &replacements);
        debug!(
            "reconstructed {} ({} references, {} failures)",
            capture.original_url,
            page.references.len(),
            page.failures.len()
        );
        page
    }

    fn document_url(&self, capture: &Capture) -> Url {
        Url::parse(&capture.original_url)
            .or_else(|_| Url::parse(&format!("http://{}/", self.cfg.domain)))
            .unwrap_or_else(|_| {
                // Guaranteed parseable; the domain came from config.
                Url::parse("http://localhost/").expect("static url")
            })
    }

    /// Fetch one resolved resource, recursing into CSS, and store it under
    /// the layout. Failure degrades to an unfetched reference.
    async fn fetch_resource(
        &self,
        resolved: &str,
        tag: &'static str,
        timestamp: &str,
    ) -> (ResourceReference, Vec<ResourceReference>, Vec<String>) {
        let class = classify(resolved, tag);
        let mut reference = ResourceReference {
            raw: String::new(),
            resolved: resolved.to_string(),
            class,
            local_path: None,
            fetched: false,
        };
        let mut nested = Vec::new();
        let mut failures = Vec::new();

        let target = FetchTarget::new(resolved, timestamp);
        match self.engine.fetch(&target).await {
            Ok(bytes) => {
                let name = match Url::parse(resolved) {
                    Ok(u) => safe_resource_name(&u),
                    Err(_) => {
                        failures.push(format!("unresolvable resource url: {resolved}"));
                        return (reference, nested, failures);
                    }
                };
                let stored: Vec<u8> = if class == ResourceClass::Css {
                    let (rewritten, refs, css_failures) = self
                        .process_css(resolved, &bytes, timestamp, CSS_RECURSION_LIMIT)
                        .await;
                    nested = refs;
                    failures.extend(css_failures);
                    rewritten
                } else {
                    bytes.as_ref().clone()
                };
                match self.layout.write_resource(class, &name, &stored) {
                    Ok(rel) => {
                        reference.local_path = Some(rel);
                        reference.fetched = true;
                    }
                    Err(e) => failures.push(format!("store failed for {resolved}: {e:#}")),
                }
            }
            Err(e) => {
                failures.push(format!("fetch failed for {resolved}: {e}"));
            }
        }
        (reference, nested, failures)
    }

    /// Discover and fetch references inside stylesheet text, rewriting them
    /// relative to the stylesheet's own directory (`resources/css/`).
    fn process_css<'a>(
        &'a self,
        css_url: &'a str,
        bytes: &'a [u8],
        timestamp: &'a str,
        depth: u8,
    ) -> Pin<Box<dyn Future<Output = (Vec<u8>, Vec<ResourceReference>, Vec<String>)> + Send + 'a>>
    {
        Box::pin(async move {
            let text = String::from_utf8_lossy(bytes).into_owned();
            let mut references = Vec::new();
            let mut failures = Vec::new();

            let Ok(base) = Url::parse(css_url) else {
                return (bytes.to_vec(), references, failures);
            };
            if depth == 0 {
                return (bytes.to_vec(), references, failures);
            }

            let mut replacements: Vec<(String, String)> = Vec::new();
            for raw in css::extract_css_urls(&text) {
                let Some(resolved) = resolve_reference(&raw, &base) else {
                    continue;
                };
                if !in_scope(&resolved, &self.cfg.domain) {
                    continue;
                }
                let resolved_str = resolved.to_string();
                let class = classify(&resolved_str, "style");
                let target = FetchTarget::new(resolved_str.clone(), timestamp);

                match self.engine.fetch(&target).await {
                    Ok(nested_bytes) => {
                        let name = safe_resource_name(&resolved);
                        let stored: Vec<u8> = if class == ResourceClass::Css {
                            let (rewritten, refs, nested_failures) = self
                                .process_css(&resolved_str, &nested_bytes, timestamp, depth - 1)
                                .await;
                            references.extend(refs);
                            failures.extend(nested_failures);
                            rewritten
                        } else {
                            nested_bytes.as_ref().clone()
                        };
                        match self.layout.write_resource(class, &name, &stored) {
                            Ok(rel) => {
                                // From resources/css/ up one level into the
                                // sibling class directory.
                                replacements
                                    .push((raw.clone(), format!("../{}/{name}", class.subdir())));
                                references.push(ResourceReference {
                                    raw,
                                    resolved: resolved_str,
                                    class,
                                    local_path: Some(rel),
                                    fetched: true,
                                });
                            }
                            Err(e) => {
                                failures.push(format!("store failed for {resolved_str}: {e:#}"))
                            }
                        }
                    }
                    Err(e) => {
                        failures.push(format!("fetch failed for {resolved_str}: {e}"));
                        replacements.push((
                            raw.clone(),
                            self.cfg.live_replay_url(timestamp, &resolved_str),
                        ));
                        references.push(ResourceReference {
                            raw,
                            resolved: resolved_str,
                            class,
                            local_path: None,
                            fetched: false,
                        });
                    }
                }
            }

            let rewritten = rewrite_text(&text, &replacements);
            (rewritten.into_bytes(), references, failures)
        })
    }
}

/// Substitute raw reference strings with their targets, longest raw first.
/// Occurrences count only when delimited the way references appear in
/// markup and CSS, so short raws never clobber unrelated text.
pub fn rewrite_text(doc: &str, replacements: &[(String, String)]) -> String {
    let mut pairs: Vec<&(String, String)> = replacements.iter().collect();
    pairs.sort_by_key(|(raw, _)| std::cmp::Reverse(raw.len()));

    let mut out = doc.to_string();
    for (raw, target) in pairs {
        if raw.is_empty() || raw == target {
            continue;
        }
        out = replace_delimited(&out, raw, target);
    }
    out
}

fn replace_delimited(doc: &str, raw: &str, replacement: &str) -> String {
    let mut result = String::with_capacity(doc.len());
    let mut rest = doc;
    while let Some(pos) = rest.find(raw) {
        let left_ok = rest[..pos]
            .chars()
            .last()
            .map(|c| matches!(c, '"' | '\'' | '(' | '=' | ',' | ' ' | '\t' | '\n'))
            .unwrap_or(false);
        let right_ok = rest[pos + raw.len()..]
            .chars()
            .next()
            .map(|c| matches!(c, '"' | '\'' | ')' | ',' | ' ' | '\t' | '\n' | '>'))
            .unwrap_or(true);
        result.push_str(&rest[..pos]);
        if left_ok && right_ok {
            result.push_str(replacement);
        } else {
            result.push_str(raw);
        }
        rest = &rest[pos + raw.len()..];
    }
    result.push_str(rest);
    result
}
