//! End-to-end reconstruction against a mocked archive.

use serde_json::json;
use std::fs;
use std::path::Path;
use timeloom::config::RunConfig;
use timeloom::layout::Manifest;
use timeloom::orchestrator::Orchestrator;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TS: &str = "20150115000000";

fn base_cfg(archive: &str, output: &Path, cache: &Path) -> RunConfig {
    let mut cfg = RunConfig::new("example.com");
    cfg.archive_base = archive.to_string();
    cfg.output_dir = output.to_path_buf();
    cfg.cache_dir = cache.to_path_buf();
    cfg.start_date = Some("2015-01-01".to_string());
    cfg.end_date = Some("2015-01-31".to_string());
    cfg.auto_detect_date = false;
    cfg.memory_guard = false;
    cfg.disk_floor_gb = 0.0;
    cfg.delay_ms = 0;
    cfg.workers = 4;
    cfg
}

async fn mount_cdx(server: &MockServer, rows: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/cdx/search/cdx"))
        .and(query_param("output", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .mount(server)
        .await;
}

async fn mount_replay(server: &MockServer, original: &str, body: &[u8], content_type: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/web/{TS}id_/{original}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

fn one_capture_cdx() -> serde_json::Value {
    json!([
        ["timestamp", "original", "statuscode", "mimetype", "digest"],
        [TS, "http://example.com/", "200", "text/html", "AAAA"],
    ])
}

const PAGE: &str = r#"<!DOCTYPE html>
<html><head><link rel="stylesheet" href="/assets/style.css"></head>
<body><img src="/assets/logo.png"><img src="/assets/missing.png"></body></html>"#;

const CSS: &str = "body { background: url('bg.png'); }";

async fn archive_with_page(server: &MockServer, include_missing_ref: bool) {
    mount_cdx(server, one_capture_cdx()).await;
    let page = if include_missing_ref {
        PAGE.to_string()
    } else {
        PAGE.replace(r#"<img src="/assets/missing.png">"#, "")
    };
    mount_replay(server, "http://example.com/", page.as_bytes(), "text/html").await;
    mount_replay(
        server,
        "http://example.com/assets/style.css",
        CSS.as_bytes(),
        "text/css",
    )
    .await;
    mount_replay(
        server,
        "http://example.com/assets/bg.png",
        b"PNGBYTES-BG",
        "image/png",
    )
    .await;
    mount_replay(
        server,
        "http://example.com/assets/logo.png",
        b"PNGBYTES-LOGO",
        "image/png",
    )
    .await;
    // /assets/missing.png is deliberately unmounted: the mock server
    // answers 404, a non-transient failure.
}

fn read_manifest(output: &Path) -> Manifest {
    let text = fs::read_to_string(output.join("manifest.json")).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn read_only_html(output: &Path) -> String {
    let mut entries: Vec<_> = fs::read_dir(output.join("html"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one page");
    fs::read_to_string(entries.remove(0).path()).unwrap()
}

#[tokio::test]
async fn reconstructs_a_capture_and_rewrites_references() {
    let server = MockServer::start().await;
    archive_with_page(&server, false).await;
    let output = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let summary = Orchestrator::new(base_cfg(&server.uri(), output.path(), cache.path()))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.captures_total, 1);
    assert_eq!(summary.captures_ok, 1);
    assert_eq!(summary.captures_failed, 0);
    assert_eq!(summary.resources_failed, 0);
    // style.css, logo.png, and the bg.png referenced from inside the CSS.
    assert_eq!(summary.resources_fetched, 3);
    assert!(!summary.completed_with_warnings);

    let html = read_only_html(output.path());
    assert!(html.contains("../resources/css/"), "{html}");
    assert!(html.contains("../resources/images/"), "{html}");
    assert!(!html.contains("/assets/style.css"), "{html}");

    // The stylesheet itself was rewritten to point at its sibling dir.
    let css_dir = output.path().join("resources/css");
    let css_file = fs::read_dir(&css_dir).unwrap().flatten().next().unwrap();
    let css = fs::read_to_string(css_file.path()).unwrap();
    assert!(css.contains("../images/"), "{css}");
    assert!(!css.contains("bg.png'"), "{css}");

    let manifest = read_manifest(output.path());
    assert_eq!(manifest.records.len(), 1);
    assert!(manifest.records[0].failures.is_empty());
    assert!(manifest.records[0].resources.iter().all(|r| r.fetched));
}

#[tokio::test]
async fn failed_resource_degrades_to_replay_url_and_flags_the_run() {
    let server = MockServer::start().await;
    archive_with_page(&server, true).await;
    let output = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let summary = Orchestrator::new(base_cfg(&server.uri(), output.path(), cache.path()))
        .run()
        .await
        .unwrap();

    // The capture itself still lands; only the one resource degraded.
    assert_eq!(summary.captures_ok, 1);
    assert_eq!(summary.resources_failed, 1);
    assert!(summary.completed_with_warnings);

    let html = read_only_html(output.path());
    let fallback = format!("{}/web/{TS}/http://example.com/assets/missing.png", server.uri());
    assert!(html.contains(&fallback), "{html}");

    let manifest = read_manifest(output.path());
    assert!(manifest.completed_with_warnings);
    let record = &manifest.records[0];
    assert!(!record.failures.is_empty());
    let missing = record
        .resources
        .iter()
        .find(|r| r.url.ends_with("missing.png"))
        .unwrap();
    assert!(!missing.fetched);
    assert!(missing.local_path.is_none());
}

#[tokio::test]
async fn in_scope_anchors_are_rewritten_to_local_pages() {
    let server = MockServer::start().await;
    mount_cdx(
        &server,
        json!([
            ["timestamp", "original", "statuscode", "mimetype", "digest"],
            [TS, "http://example.com/", "200", "text/html", "AAAA"],
            [TS, "http://example.com/other/page.html", "200", "text/html", "BBBB"],
        ]),
    )
    .await;
    let home = r#"<html><body>
        <a href="/other/page.html">other</a>
        <a href="http://elsewhere.org/x">external</a>
        <a href="/not/captured.html">gone</a>
    </body></html>"#;
    mount_replay(&server, "http://example.com/", home.as_bytes(), "text/html").await;
    mount_replay(
        &server,
        "http://example.com/other/page.html",
        b"<html><body>other page</body></html>",
        "text/html",
    )
    .await;
    let output = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let summary = Orchestrator::new(base_cfg(&server.uri(), output.path(), cache.path()))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.captures_ok, 2);

    let manifest = read_manifest(output.path());
    let record_for = |url: &str| {
        manifest
            .records
            .iter()
            .find(|r| r.original_url == url)
            .unwrap()
    };
    let home_record = record_for("http://example.com/");
    let other_record = record_for("http://example.com/other/page.html");
    let other_file = other_record
        .local_html_path
        .strip_prefix("html/")
        .unwrap();

    let html = fs::read_to_string(output.path().join(&home_record.local_html_path)).unwrap();
    // The captured sibling becomes a local link; everything else is verbatim.
    assert!(html.contains(&format!(r#"href="{other_file}""#)), "{html}");
    assert!(!html.contains(r#"href="/other/page.html""#), "{html}");
    assert!(html.contains(r#"href="http://elsewhere.org/x""#), "{html}");
    assert!(html.contains(r#"href="/not/captured.html""#), "{html}");

    // Anchor targets are pages, not resources: nothing scheduled for them.
    assert!(home_record.resources.is_empty());
}

#[tokio::test]
async fn rerun_is_served_entirely_from_the_cache() {
    let server = MockServer::start().await;
    archive_with_page(&server, false).await;
    let cache = tempfile::tempdir().unwrap();
    let out1 = tempfile::tempdir().unwrap();
    let out2 = tempfile::tempdir().unwrap();

    let first = Orchestrator::new(base_cfg(&server.uri(), out1.path(), cache.path()))
        .run()
        .await
        .unwrap();
    assert!(first.network_fetches > 0);

    let second = Orchestrator::new(base_cfg(&server.uri(), out2.path(), cache.path()))
        .run()
        .await
        .unwrap();
    assert_eq!(second.network_fetches, 0, "expected a fully cached rerun");
    assert!(second.cache_hits > 0);

    // Same inputs, same mirror.
    assert_eq!(read_only_html(out1.path()), read_only_html(out2.path()));
    let m1 = read_manifest(out1.path());
    let m2 = read_manifest(out2.path());
    assert_eq!(m1.records.len(), m2.records.len());
    assert_eq!(m1.records[0].local_html_path, m2.records[0].local_html_path);
    assert_eq!(m1.records[0].resources, m2.records[0].resources);
}

#[tokio::test]
async fn no_cache_mode_refetches_but_still_writes_entries() {
    let server = MockServer::start().await;
    archive_with_page(&server, false).await;
    let cache = tempfile::tempdir().unwrap();
    let out1 = tempfile::tempdir().unwrap();
    let out2 = tempfile::tempdir().unwrap();

    let first = Orchestrator::new(base_cfg(&server.uri(), out1.path(), cache.path()))
        .run()
        .await
        .unwrap();

    let mut cfg = base_cfg(&server.uri(), out2.path(), cache.path());
    cfg.cache_enabled = false;
    let second = Orchestrator::new(cfg).run().await.unwrap();

    assert_eq!(second.cache_hits, 0);
    assert_eq!(second.network_fetches, first.network_fetches);
    // Entries written during the bypassed run are still on disk.
    let entries = fs::read_dir(cache.path()).unwrap().flatten().count();
    assert!(entries > 0);
}

#[tokio::test]
async fn empty_index_yields_an_empty_clean_manifest() {
    let server = MockServer::start().await;
    mount_cdx(&server, json!([])).await;
    let output = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let summary = Orchestrator::new(base_cfg(&server.uri(), output.path(), cache.path()))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.captures_total, 0);
    assert!(!summary.completed_with_warnings);
    let manifest = read_manifest(output.path());
    assert!(manifest.records.is_empty());
    assert!(manifest.warnings.is_empty());
}

#[tokio::test]
async fn unparseable_explicit_date_aborts_the_run() {
    let server = MockServer::start().await;
    let output = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let mut cfg = base_cfg(&server.uri(), output.path(), cache.path());
    cfg.start_date = Some("the day before the flood".to_string());
    let result = Orchestrator::new(cfg).run().await;
    assert!(result.is_err());
    assert!(!output.path().join("manifest.json").exists());
}
