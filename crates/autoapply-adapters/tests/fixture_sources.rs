use std::path::PathBuf;
use std::sync::Arc;

use autoapply_adapters::{
    parse_listing, AdapterContext, AdapterRegistry, ApplyOutcome, ListingSelectors, SourceKind,
    SourceSpec,
};
use autoapply_core::{Profile, SearchQuery};
use autoapply_storage::{HttpClientConfig, HttpFetcher, OutboxStore};
use chrono::Utc;
use futures::StreamExt;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture_spec(source_id: &str) -> SourceSpec {
    SourceSpec {
        source_id: source_id.to_string(),
        display_name: Some("Sample feed".to_string()),
        kind: SourceKind::Fixture,
        listing_urls: Vec::new(),
        fixture_path: Some(PathBuf::from("fixtures/sample_feed.json")),
        selectors: ListingSelectors::default(),
        apply: Default::default(),
    }
}

fn context(outbox: &std::path::Path) -> AdapterContext {
    AdapterContext {
        http: Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client")),
        outbox: OutboxStore::new(outbox),
        base_dir: workspace_root(),
    }
}

#[tokio::test]
async fn fixture_feed_searches_and_applies_through_outbox() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = AdapterRegistry::from_specs(
        &[fixture_spec("sample")],
        &["sample".to_string()],
        &context(dir.path()),
    )
    .expect("registry");
    let adapter = registry.get("sample").expect("adapter");

    let query = SearchQuery {
        remote_only: true,
        ..Default::default()
    };
    let postings: Vec<_> = adapter
        .search(&query)
        .filter_map(|item| async move { item.ok() })
        .collect()
        .await;
    let titles: Vec<&str> = postings.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Senior Rust Engineer", "Full Stack Developer", "Python Developer"]
    );

    let profile = Profile {
        name: "Ada".into(),
        email: "ada@example.test".into(),
        ..Default::default()
    };
    assert_eq!(
        adapter.apply(&postings[0], &profile, "letter").await,
        ApplyOutcome::Succeeded
    );
    assert!(matches!(
        adapter.apply(&postings[2], &profile, "letter").await,
        ApplyOutcome::PermanentlyInvalid(_)
    ));
}

#[test]
fn unregistered_enabled_source_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = AdapterRegistry::from_specs(
        &[fixture_spec("sample")],
        &["missing".to_string()],
        &context(dir.path()),
    )
    .expect_err("must fail");
    assert!(err.to_string().contains("missing"));
}

#[test]
fn sample_board_fixture_parses() {
    let html = std::fs::read_to_string(workspace_root().join("fixtures/sample_board.html")).expect("fixture");
    let postings = parse_listing(
        "board",
        &html,
        "https://board.test/search",
        &ListingSelectors::default(),
        Utc::now(),
        &SearchQuery::default(),
    )
    .expect("parse");
    assert_eq!(postings.len(), 2);
    assert_eq!(postings[0].external_url, "https://board.test/jobs/lead-platform");
    assert_eq!(postings[1].company, "Pixel Works");
}
