//! Reference discovery inside stylesheet text.
//!
//! Fetched CSS is scanned for `url(...)` values (backgrounds, `@font-face`
//! sources) and `@import` targets so the mirror's stylesheets stay
//! self-contained.

use regex::Regex;
use std::sync::OnceLock;

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).expect("valid regex"))
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).expect("valid regex"))
}

/// Raw reference strings found in stylesheet text, in document order,
/// deduplicated.
pub fn extract_css_urls(css: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for caps in url_re().captures_iter(css).chain(import_re().captures_iter(css)) {
        if let Some(m) = caps.get(1) {
            let raw = m.as_str().trim().to_string();
            if !raw.is_empty() && seen.insert(raw.clone()) {
                urls.push(raw);
            }
        }
    }
    urls
}
