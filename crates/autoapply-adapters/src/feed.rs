//! JSON job feeds, fetched over HTTP or read from a local fixture file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use autoapply_core::{JobPosting, Profile, SearchQuery};
use autoapply_storage::HttpFetcher;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::listing::html_to_text;
use crate::{
    expand_listing_url, matches_query, paged_stream, AdapterError, Applicator, ApplyOutcome,
    PostingStream, SourceAdapter,
};

/// One entry of a feed. Field aliases cover the common public job-board shapes.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedJob {
    #[serde(default, alias = "position")]
    pub title: String,
    #[serde(default, alias = "company_name")]
    pub company: String,
    #[serde(default, alias = "link", alias = "apply_url")]
    pub url: Option<String>,
    #[serde(default, alias = "description", alias = "body")]
    pub text: String,
    #[serde(default, alias = "candidate_required_location")]
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    Wrapped {
        #[serde(alias = "results")]
        jobs: Vec<FeedJob>,
    },
    Bare(Vec<FeedJob>),
}

pub fn parse_feed(
    source_id: &str,
    bytes: &[u8],
    discovered_at: DateTime<Utc>,
    query: &SearchQuery,
) -> Result<Vec<JobPosting>, AdapterError> {
    let document: FeedDocument = serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::source(source_id, format!("malformed feed: {e}")))?;
    let jobs = match document {
        FeedDocument::Wrapped { jobs } => jobs,
        FeedDocument::Bare(jobs) => jobs,
    };

    let total = jobs.len();
    let postings: Vec<JobPosting> = jobs
        .into_iter()
        .filter(|job| !job.title.trim().is_empty())
        .filter_map(|job| {
            let posting = JobPosting {
                source_id: source_id.to_string(),
                external_url: job.url.unwrap_or_default().trim().to_string(),
                title: job.title.trim().to_string(),
                company: job.company.trim().to_string(),
                raw_text: html_to_text(&job.text),
                discovered_at,
            };
            matches_query(&posting, job.location.as_deref(), query).then_some(posting)
        })
        .collect();
    debug!(source_id, total, kept = postings.len(), "feed parsed");
    Ok(postings)
}

#[derive(Debug, Clone)]
pub enum FeedOrigin {
    Remote { http: Arc<HttpFetcher>, urls: Vec<String> },
    File(PathBuf),
}

#[derive(Debug)]
pub struct FeedSource {
    source_id: String,
    origin: FeedOrigin,
    applicator: Applicator,
}

impl FeedSource {
    pub fn new(source_id: &str, origin: FeedOrigin, applicator: Applicator) -> Self {
        Self {
            source_id: source_id.to_string(),
            origin,
            applicator,
        }
    }
}

#[async_trait]
impl SourceAdapter for FeedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn search(&self, query: &SearchQuery) -> PostingStream {
        let source_id = self.source_id.clone();
        let query = query.clone();
        match &self.origin {
            FeedOrigin::Remote { http, urls } => {
                let http = Arc::clone(http);
                let targets: Vec<String> = urls.iter().map(|u| expand_listing_url(u, &query)).collect();
                paged_stream(targets, move |url: String| {
                    let http = Arc::clone(&http);
                    let source_id = source_id.clone();
                    let query = query.clone();
                    async move {
                        let page = http
                            .get_bytes(&source_id, &url)
                            .await
                            .map_err(|e| AdapterError::source(&source_id, e))?;
                        parse_feed(&source_id, &page.body, Utc::now(), &query)
                    }
                })
            }
            FeedOrigin::File(path) => paged_stream(vec![path.clone()], move |path: PathBuf| {
                let source_id = source_id.clone();
                let query = query.clone();
                async move {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .map_err(|e| AdapterError::source(&source_id, format!("{}: {e}", path.display())))?;
                    parse_feed(&source_id, &bytes, Utc::now(), &query)
                }
            }),
        }
    }

    async fn apply(&self, posting: &JobPosting, profile: &Profile, cover_letter: &str) -> ApplyOutcome {
        self.applicator.submit(posting, profile, cover_letter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoapply_storage::OutboxStore;
    use futures::StreamExt;

    const REMOTIVE_LIKE: &str = r#"{
        "job-count": 3,
        "jobs": [
            {"title": "Rust Engineer", "company_name": "Acme", "url": "https://acme.test/1",
             "description": "<p>Build <b>async</b> services in Rust</p>", "candidate_required_location": "Worldwide"},
            {"title": "Office Manager", "company_name": "Acme", "url": "https://acme.test/2",
             "description": "Keep the office running", "candidate_required_location": "Berlin"},
            {"title": "", "company_name": "Nobody", "url": "https://nobody.test/3"}
        ]
    }"#;

    #[test]
    fn wrapped_feed_is_parsed_and_filtered() {
        let query = SearchQuery {
            keywords: vec!["rust".into()],
            ..Default::default()
        };
        let postings = parse_feed("remotive", REMOTIVE_LIKE.as_bytes(), Utc::now(), &query).expect("parse");
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].company, "Acme");
        assert_eq!(postings[0].raw_text, "Build async services in Rust");
    }

    #[test]
    fn bare_array_with_alternate_field_names() {
        let body = r#"[{"position": "Backend Dev", "company": "Beta", "apply_url": "https://beta.test/x", "body": "python"}]"#;
        let postings = parse_feed("board", body.as_bytes(), Utc::now(), &SearchQuery::default()).expect("parse");
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].title, "Backend Dev");
        assert_eq!(postings[0].external_url, "https://beta.test/x");
    }

    #[test]
    fn malformed_feed_is_a_source_error() {
        let err = parse_feed("board", b"<html>", Utc::now(), &SearchQuery::default()).expect_err("must fail");
        assert!(matches!(err, AdapterError::TransientSource { .. }));
    }

    #[tokio::test]
    async fn fixture_search_restarts_on_every_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.json");
        std::fs::write(&path, REMOTIVE_LIKE).expect("seed");
        let source = FeedSource::new(
            "fixture",
            FeedOrigin::File(path),
            Applicator::Outbox(OutboxStore::new(dir.path().join("outbox"))),
        );

        let query = SearchQuery::default();
        let first: Vec<_> = source.search(&query).collect().await;
        let second: Vec<_> = source.search(&query).collect().await;
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|p| p.is_ok()));
    }

    #[tokio::test]
    async fn missing_fixture_yields_one_error_item() {
        let source = FeedSource::new(
            "fixture",
            FeedOrigin::File(PathBuf::from("/nonexistent/feed.json")),
            Applicator::Outbox(OutboxStore::new("unused")),
        );
        let items: Vec<_> = source.search(&SearchQuery::default()).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
