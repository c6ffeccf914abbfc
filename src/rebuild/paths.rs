//! Reference resolution, classification, and local-path derivation.
//!
//! Local names are derived from a hash of the resolved URL plus its original
//! extension: arbitrary query strings and path depths cannot be mapped 1:1
//! to flat filenames without collision, and the derivation must be stable
//! across platforms and processes for resumability.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use url::Url;

/// Output subdirectory for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Css,
    Js,
    Image,
    Font,
    Other,
}

impl ResourceClass {
    pub fn subdir(self) -> &'static str {
        match self {
            Self::Css => "css",
            Self::Js => "js",
            Self::Image => "images",
            Self::Font => "fonts",
            Self::Other => "other",
        }
    }

    pub const ALL: [ResourceClass; 5] = [
        Self::Css,
        Self::Js,
        Self::Image,
        Self::Font,
        Self::Other,
    ];
}

/// Classify a resolved URL by tag context and extension. The class only
/// chooses the output subdirectory.
pub fn classify(url: &str, tag: &str) -> ResourceClass {
    let lower = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    let has_ext = |exts: &[&str]| exts.iter().any(|e| lower.ends_with(e));

    if tag == "link" || has_ext(&[".css", ".scss", ".less"]) {
        ResourceClass::Css
    } else if tag == "script" || has_ext(&[".js", ".jsx", ".mjs", ".ts"]) {
        ResourceClass::Js
    } else if tag == "img"
        || tag == "source"
        || has_ext(&[
            ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".bmp", ".ico",
        ])
    {
        ResourceClass::Image
    } else if has_ext(&[".woff", ".woff2", ".ttf", ".otf", ".eot"]) {
        ResourceClass::Font
    } else {
        ResourceClass::Other
    }
}

fn archive_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Archived pages frequently reference the archive's own replay path;
        // strip `[scheme:][//host]/web/<timestamp>[flag_]/` back to the
        // plain original URL before resolution.
        Regex::new(r"^(?:https?:)?(?://[^/]+)?/web/\d{1,14}(?:[a-z]{2}_)?/(https?://.+)$")
            .expect("valid regex")
    })
}

/// Undo archive replay-proxy prefixes on self-referential URLs.
pub fn normalize_archive_url(raw: &str) -> &str {
    match archive_prefix_re().captures(raw) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(raw),
        None => raw,
    }
}

/// Schemes and pseudo-references that are never fetchable resources.
pub fn is_skippable(raw: &str) -> bool {
    let r = raw.trim();
    r.is_empty()
        || r.starts_with('#')
        || r.starts_with("data:")
        || r.starts_with("javascript:")
        || r.starts_with("mailto:")
        || r.starts_with("tel:")
        || r.starts_with("about:")
}

/// Resolve a raw reference to absolute form against the document's original
/// URL. Protocol-relative references take the archive's scheme (https).
pub fn resolve_reference(raw: &str, document_url: &Url) -> Option<Url> {
    if is_skippable(raw) {
        return None;
    }
    let normalized = normalize_archive_url(raw.trim());
    if let Some(rest) = normalized.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}")).ok();
    }
    if normalized.starts_with("http://") || normalized.starts_with("https://") {
        return Url::parse(normalized).ok();
    }
    document_url.join(normalized).ok()
}

/// Whether a resolved URL belongs to the reconstructed domain. Off-domain
/// references are navigational, not mirror dependencies.
pub fn in_scope(url: &Url, domain: &str) -> bool {
    url.host_str()
        .map(|h| h == domain || h.ends_with(&format!(".{domain}")))
        .unwrap_or(false)
}

fn short_hash(input: &str, hex_chars: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest
        .iter()
        .flat_map(|b| [b >> 4, b & 0xf])
        .take(hex_chars)
        .map(|nibble| char::from_digit(nibble as u32, 16).unwrap_or('0'))
        .collect()
}

/// Flat, collision-resistant filename for a resource URL:
/// 16 hex chars of sha256 plus the sanitized original extension.
pub fn safe_resource_name(resolved: &Url) -> String {
    let hash = short_hash(resolved.as_str(), 16);
    let ext: String = resolved
        .path()
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, e)| e.to_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    if ext.is_empty() {
        hash
    } else {
        format!("{hash}.{ext}")
    }
}

/// Readable-but-collision-resistant stem for a captured page URL. The
/// caller appends the timestamp prefix and `.html` extension.
pub fn safe_page_name(original_url: &str) -> String {
    let path = Url::parse(original_url)
        .map(|u| {
            let mut p = u.path().trim_matches('/').to_string();
            if let Some(q) = u.query() {
                p.push('_');
                p.push_str(q);
            }
            p
        })
        .unwrap_or_else(|_| original_url.to_string());

    let mut stem: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        stem = "index".to_string();
    }
    stem.truncate(100);
    // Strip a trailing markup extension; the layout appends .html itself.
    for ext in [".html", ".htm", ".php", ".asp", ".aspx"] {
        if let Some(trimmed) = stem.strip_suffix(ext) {
            stem = trimmed.to_string();
            break;
        }
    }
    format!("{stem}_{}", short_hash(original_url, 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_tag_and_extension() {
        assert_eq!(classify("http://a/style.css?v=2", "link"), ResourceClass::Css);
        assert_eq!(classify("http://a/app.js", "script"), ResourceClass::Js);
        assert_eq!(classify("http://a/logo.png", "img"), ResourceClass::Image);
        assert_eq!(classify("http://a/f.woff2", "style"), ResourceClass::Font);
        assert_eq!(classify("http://a/download.bin", "a"), ResourceClass::Other);
    }

    #[test]
    fn archive_prefixes_are_stripped() {
        assert_eq!(
            normalize_archive_url("https://web.archive.org/web/20150101000000/http://example.com/a.css"),
            "http://example.com/a.css"
        );
        assert_eq!(
            normalize_archive_url("/web/20150101000000id_/http://example.com/a.css"),
            "http://example.com/a.css"
        );
        assert_eq!(
            normalize_archive_url("http://example.com/web-shop/x"),
            "http://example.com/web-shop/x"
        );
    }

    #[test]
    fn relative_references_resolve_against_the_original_url() {
        let doc = Url::parse("http://example.com/sub/page.html").unwrap();
        let resolved = resolve_reference("../img/a.png", &doc).unwrap();
        assert_eq!(resolved.as_str(), "http://example.com/img/a.png");
    }

    #[test]
    fn protocol_relative_references_take_https() {
        let doc = Url::parse("http://example.com/page.html").unwrap();
        let resolved = resolve_reference("//example.com/x.js", &doc).unwrap();
        assert_eq!(resolved.scheme(), "https");
    }

    #[test]
    fn skippable_references_resolve_to_none() {
        let doc = Url::parse("http://example.com/page.html").unwrap();
        for raw in ["data:image/png;base64,AAA", "javascript:void(0)", "#top", "mailto:x@y", ""] {
            assert!(resolve_reference(raw, &doc).is_none(), "{raw}");
        }
    }

    #[test]
    fn scope_covers_subdomains_only() {
        let scheme_host = |s: &str| Url::parse(s).unwrap();
        assert!(in_scope(&scheme_host("http://example.com/x"), "example.com"));
        assert!(in_scope(&scheme_host("http://www.example.com/x"), "example.com"));
        assert!(!in_scope(&scheme_host("http://evilexample.com/x"), "example.com"));
        assert!(!in_scope(&scheme_host("http://other.org/x"), "example.com"));
    }

    #[test]
    fn resource_names_are_deterministic_and_collision_resistant() {
        let a = Url::parse("http://example.com/img/a.png?size=1").unwrap();
        let b = Url::parse("http://example.com/img/a.png?size=2").unwrap();
        assert_eq!(safe_resource_name(&a), safe_resource_name(&a));
        assert_ne!(safe_resource_name(&a), safe_resource_name(&b));
        assert!(safe_resource_name(&a).ends_with(".png"));
    }

    #[test]
    fn page_names_stay_flat_and_distinct() {
        let a = safe_page_name("http://example.com/forum/topic.php?id=1");
        let b = safe_page_name("http://example.com/forum/topic.php?id=2");
        assert_ne!(a, b);
        assert!(!a.contains('/'));
        assert_eq!(safe_page_name("http://example.com/").split('_').next().unwrap(), "index");
    }
}
