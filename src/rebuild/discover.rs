//! Resource reference discovery in raw HTML.
//!
//! Parses the captured document with `scraper` and collects every raw
//! reference string that points at a fetchable resource. Anchor hrefs are
//! collected separately: they are never fetched as resources, but in-scope
//! ones that match another capture get rewritten to that page's local file.
//! Callers run this inside `spawn_blocking`: scraper's DOM types are not
//! `Send`.

use super::css::extract_css_urls;
use super::paths::is_skippable;
use scraper::{Html, Selector};
use std::collections::HashSet;

/// One raw reference as it appears in the document, with the tag context
/// used for classification.
#[derive(Debug, Clone)]
pub struct RawReference {
    pub raw: String,
    pub tag: &'static str,
}

/// Everything discovery finds in one document.
#[derive(Debug, Default)]
pub struct Discovery {
    /// `<base href>` value, if present; resolution uses it instead of the
    /// document URL.
    pub base_href: Option<String>,
    pub references: Vec<RawReference>,
    /// Raw `<a href>` values. Candidates for page-link rewriting, not
    /// resource fetches.
    pub anchors: Vec<String>,
}

/// Collect raw resource references from an HTML document.
pub fn discover_references(html: &str) -> Discovery {
    let doc = Html::parse_document(html);
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Discovery::default();

    let mut push = |raw: &str, tag: &'static str, out: &mut Discovery| {
        let raw = raw.trim();
        if raw.is_empty() || is_skippable(raw) {
            return;
        }
        if seen.insert(raw.to_string()) {
            out.references.push(RawReference {
                raw: raw.to_string(),
                tag,
            });
        }
    };

    let base_sel = Selector::parse("base[href]").unwrap();
    if let Some(base) = doc.select(&base_sel).next() {
        out.base_href = base.value().attr("href").map(str::to_string);
    }

    // Stylesheets and icons via <link>.
    let link_sel = Selector::parse("link[href]").unwrap();
    for el in doc.select(&link_sel) {
        let rel = el.value().attr("rel").unwrap_or_default().to_lowercase();
        if !(rel.contains("stylesheet") || rel.contains("icon")) {
            continue;
        }
        if let Some(href) = el.value().attr("href") {
            push(href, "link", &mut out);
        }
    }

    for (selector, attr, tag) in [
        ("script[src]", "src", "script"),
        ("img[src]", "src", "img"),
        ("video[src]", "src", "video"),
        ("audio[src]", "src", "audio"),
        ("source[src]", "src", "source"),
    ] {
        let sel = Selector::parse(selector).unwrap();
        for el in doc.select(&sel) {
            if let Some(value) = el.value().attr(attr) {
                push(value, tag, &mut out);
            }
        }
    }

    // srcset carries comma-separated "url descriptor" candidates.
    for selector in ["img[srcset]", "source[srcset]"] {
        let sel = Selector::parse(selector).unwrap();
        for el in doc.select(&sel) {
            if let Some(srcset) = el.value().attr("srcset") {
                for candidate in srcset.split(',') {
                    if let Some(url) = candidate.trim().split_whitespace().next() {
                        push(url, "img", &mut out);
                    }
                }
            }
        }
    }

    // Inline style attributes and <style> blocks.
    let styled_sel = Selector::parse("[style]").unwrap();
    for el in doc.select(&styled_sel) {
        if let Some(style) = el.value().attr("style") {
            for url in extract_css_urls(style) {
                push(&url, "style", &mut out);
            }
        }
    }
    let style_sel = Selector::parse("style").unwrap();
    for el in doc.select(&style_sel) {
        let text: String = el.text().collect();
        for url in extract_css_urls(&text) {
            push(&url, "style", &mut out);
        }
    }

    let mut anchor_seen: HashSet<String> = HashSet::new();
    let anchor_sel = Selector::parse("a[href]").unwrap();
    for el in doc.select(&anchor_sel) {
        if let Some(href) = el.value().attr("href") {
            let href = href.trim();
            if href.is_empty() || is_skippable(href) {
                continue;
            }
            if anchor_seen.insert(href.to_string()) {
                out.anchors.push(href.to_string());
            }
        }
    }

    out
}
