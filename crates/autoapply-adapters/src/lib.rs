//! Source adapter and match scorer contracts, plus the configurable platform variants
//! the engine selects between.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use autoapply_core::{JobPosting, Profile, SearchQuery};
use autoapply_storage::{FetchError, HttpFetcher, OutboxStore};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod apply;
pub mod feed;
pub mod listing;
pub mod scoring;

pub use apply::{ApplicationPacket, Applicator};
pub use feed::{parse_feed, FeedOrigin, FeedSource};
pub use listing::{parse_listing, ListingSelectors, ListingSource};
pub use scoring::{heuristic_score, KeywordScorer, MatchScorer, RemoteScorer};

pub const CRATE_NAME: &str = "autoapply-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {source_id} unavailable: {message}")]
    TransientSource { source_id: String, message: String },
    #[error("scorer unavailable: {0}")]
    ScorerUnavailable(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn source(source_id: &str, message: impl fmt::Display) -> Self {
        AdapterError::TransientSource {
            source_id: source_id.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result of one application attempt as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Succeeded,
    /// Worth retrying: network error, timeout, rate limiting.
    Failed(String),
    /// Posting is invalid, expired or closed; never retry.
    PermanentlyInvalid(String),
}

pub type PostingStream = BoxStream<'static, Result<JobPosting, AdapterError>>;

/// One platform. `search` is lazy and finite; calling it again restarts discovery.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn search(&self, query: &SearchQuery) -> PostingStream;

    async fn apply(&self, posting: &JobPosting, profile: &Profile, cover_letter: &str) -> ApplyOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    JsonFeed,
    HtmlListing,
    Fixture,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum ApplyVia {
    #[default]
    Outbox,
    Webhook {
        url: String,
    },
}

/// Registry entry describing how to reach one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub kind: SourceKind,
    /// `{keywords}` and `{location}` are substituted, URL-encoded.
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub selectors: ListingSelectors,
    #[serde(default)]
    pub apply: ApplyVia,
}

/// Shared collaborators handed to every adapter at construction.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub http: Arc<HttpFetcher>,
    pub outbox: OutboxStore,
    /// Base for relative fixture paths.
    pub base_dir: PathBuf,
}

pub fn adapter_for_spec(spec: &SourceSpec, ctx: &AdapterContext) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let applicator = Applicator::from_spec(&spec.apply, ctx);
    let adapter: Arc<dyn SourceAdapter> = match spec.kind {
        SourceKind::JsonFeed => {
            if spec.listing_urls.is_empty() {
                return Err(AdapterError::Message(format!(
                    "source {} is a json_feed without listing_urls",
                    spec.source_id
                )));
            }
            Arc::new(FeedSource::new(
                &spec.source_id,
                FeedOrigin::Remote {
                    http: Arc::clone(&ctx.http),
                    urls: spec.listing_urls.clone(),
                },
                applicator,
            ))
        }
        SourceKind::Fixture => {
            let path = spec.fixture_path.as_ref().ok_or_else(|| {
                AdapterError::Message(format!("source {} is a fixture without fixture_path", spec.source_id))
            })?;
            Arc::new(FeedSource::new(
                &spec.source_id,
                FeedOrigin::File(ctx.base_dir.join(path)),
                applicator,
            ))
        }
        SourceKind::HtmlListing => {
            if spec.listing_urls.is_empty() {
                return Err(AdapterError::Message(format!(
                    "source {} is an html_listing without listing_urls",
                    spec.source_id
                )));
            }
            Arc::new(ListingSource::new(
                &spec.source_id,
                Arc::clone(&ctx.http),
                spec.listing_urls.clone(),
                spec.selectors.clone(),
                applicator,
            ))
        }
    };
    Ok(adapter)
}

/// Ordered set of adapters; iteration order is the order postings are processed in.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for `enabled`, in that order, from the registry entries.
    pub fn from_specs(specs: &[SourceSpec], enabled: &[String], ctx: &AdapterContext) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        let mut seen = HashSet::new();
        for source_id in enabled {
            if !seen.insert(source_id.as_str()) {
                continue;
            }
            let spec = specs
                .iter()
                .find(|s| &s.source_id == source_id)
                .ok_or_else(|| AdapterError::Message(format!("no source registered for {source_id}")))?;
            registry.register(adapter_for_spec(spec, ctx)?);
        }
        Ok(registry)
    }

    /// Replaces an adapter with the same id in place.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        if let Some(slot) = self
            .adapters
            .iter_mut()
            .find(|a| a.source_id() == adapter.source_id())
        {
            *slot = adapter;
        } else {
            self.adapters.push(adapter);
        }
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.source_id() == source_id)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.iter()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.source_id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

const REMOTE_MARKERS: &[&str] = &["remote", "anywhere", "worldwide", "work from home", "wfh"];

/// Client-side filter applied to every discovered posting.
pub fn matches_query(posting: &JobPosting, location: Option<&str>, query: &SearchQuery) -> bool {
    let haystack = format!("{} {}", posting.title, posting.raw_text).to_lowercase();

    if !query.keywords.is_empty()
        && !query
            .keywords
            .iter()
            .any(|kw| haystack.contains(&kw.to_lowercase()))
    {
        return false;
    }

    let location = location.map(str::to_lowercase);
    let remote = match &location {
        Some(loc) if !loc.trim().is_empty() => REMOTE_MARKERS.iter().any(|m| loc.contains(m)),
        _ => REMOTE_MARKERS.iter().any(|m| haystack.contains(m)),
    };
    if query.remote_only && !remote {
        return false;
    }

    if !query.locations.is_empty() && !remote {
        let place = location.unwrap_or_else(|| haystack.clone());
        return query
            .locations
            .iter()
            .any(|wanted| place.contains(&wanted.to_lowercase()));
    }
    true
}

/// Substitute `{keywords}` / `{location}` into a listing URL template.
pub fn expand_listing_url(template: &str, query: &SearchQuery) -> String {
    let encode = |value: &str| url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>();
    template
        .replace("{keywords}", &encode(&query.keywords.join(" ")))
        .replace(
            "{location}",
            &encode(query.locations.first().map(String::as_str).unwrap_or("")),
        )
}

/// Turn per-page fetches into a lazy stream of postings; a failed page surfaces as one error item.
pub(crate) fn paged_stream<T, F, Fut>(targets: Vec<T>, fetch: F) -> PostingStream
where
    T: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<JobPosting>, AdapterError>> + Send + 'static,
{
    stream::iter(targets)
        .then(fetch)
        .flat_map(|page| match page {
            Ok(postings) => stream::iter(postings.into_iter().map(Ok)).boxed(),
            Err(err) => stream::once(futures::future::ready(Err(err))).boxed(),
        })
        .boxed()
}
