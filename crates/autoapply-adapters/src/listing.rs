//! HTML job boards scraped with CSS selectors.

use std::sync::Arc;

use async_trait::async_trait;
use autoapply_core::{JobPosting, Profile, SearchQuery};
use autoapply_storage::HttpFetcher;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    expand_listing_url, matches_query, paged_stream, AdapterError, Applicator, ApplyOutcome,
    PostingStream, SourceAdapter,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    /// One match per posting; the other selectors are evaluated inside it.
    pub item: String,
    pub title: String,
    pub company: String,
    pub link: String,
    pub text: Option<String>,
    pub location: Option<String>,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: "article.job, li.job".to_string(),
            title: "h2, h3, .title".to_string(),
            company: ".company".to_string(),
            link: "a[href]".to_string(),
            text: Some(".description".to_string()),
            location: Some(".location".to_string()),
        }
    }
}

/// Visible text of an HTML fragment with whitespace collapsed.
pub fn html_to_text(fragment: &str) -> String {
    if !fragment.contains('<') {
        return fragment.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    let parsed = Html::parse_fragment(fragment);
    parsed
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Message(format!("invalid selector {raw:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(item: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    item.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

pub fn parse_listing(
    source_id: &str,
    html: &str,
    page_url: &str,
    selectors: &ListingSelectors,
    discovered_at: DateTime<Utc>,
    query: &SearchQuery,
) -> Result<Vec<JobPosting>, AdapterError> {
    let item_sel = selector(&selectors.item)?;
    let title_sel = selector(&selectors.title)?;
    let company_sel = selector(&selectors.company)?;
    let link_sel = selector(&selectors.link)?;
    let text_sel = selectors.text.as_deref().map(selector).transpose()?;
    let location_sel = selectors.location.as_deref().map(selector).transpose()?;
    let base = Url::parse(page_url).ok();

    let document = Html::parse_document(html);
    let mut postings = Vec::new();
    for item in document.select(&item_sel) {
        let Some(title) = first_text(&item, &title_sel) else {
            continue;
        };
        let href = item
            .select(&link_sel)
            .next()
            .and_then(|n| n.value().attr("href"))
            .map(str::trim)
            .unwrap_or_default();
        let external_url = match &base {
            Some(base) => base.join(href).map(String::from).unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        };
        let raw_text = text_sel
            .as_ref()
            .and_then(|sel| first_text(&item, sel))
            .unwrap_or_else(|| text_or_none(item.text().collect::<Vec<_>>().join(" ")).unwrap_or_default());
        let location = location_sel.as_ref().and_then(|sel| first_text(&item, sel));

        let posting = JobPosting {
            source_id: source_id.to_string(),
            external_url: if href.is_empty() { String::new() } else { external_url },
            title,
            company: first_text(&item, &company_sel).unwrap_or_default(),
            raw_text,
            discovered_at,
        };
        if matches_query(&posting, location.as_deref(), query) {
            postings.push(posting);
        }
    }
    Ok(postings)
}

#[derive(Debug)]
pub struct ListingSource {
    source_id: String,
    http: Arc<HttpFetcher>,
    urls: Vec<String>,
    selectors: ListingSelectors,
    applicator: Applicator,
}

impl ListingSource {
    pub fn new(
        source_id: &str,
        http: Arc<HttpFetcher>,
        urls: Vec<String>,
        selectors: ListingSelectors,
        applicator: Applicator,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            http,
            urls,
            selectors,
            applicator,
        }
    }
}

#[async_trait]
impl SourceAdapter for ListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn search(&self, query: &SearchQuery) -> PostingStream {
        let source_id = self.source_id.clone();
        let http = Arc::clone(&self.http);
        let selectors = self.selectors.clone();
        let query = query.clone();
        let targets: Vec<String> = self.urls.iter().map(|u| expand_listing_url(u, &query)).collect();
        paged_stream(targets, move |url: String| {
            let source_id = source_id.clone();
            let http = Arc::clone(&http);
            let selectors = selectors.clone();
            let query = query.clone();
            async move {
                let page = http
                    .get_bytes(&source_id, &url)
                    .await
                    .map_err(|e| AdapterError::source(&source_id, e))?;
                let html = String::from_utf8_lossy(&page.body);
                parse_listing(&source_id, &html, &page.final_url, &selectors, Utc::now(), &query)
            }
        })
    }

    async fn apply(&self, posting: &JobPosting, profile: &Profile, cover_letter: &str) -> ApplyOutcome {
        self.applicator.submit(posting, profile, cover_letter).await
    }
}
