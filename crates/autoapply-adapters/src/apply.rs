//! Submission side of an adapter: the packet written for a posting and where it goes.

use std::sync::Arc;

use autoapply_core::{JobPosting, Profile};
use autoapply_storage::{classify_status_code, FetchError, HttpFetcher, OutboxStore, RetryDisposition};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::{AdapterContext, ApplyOutcome, ApplyVia};

#[derive(Debug, Clone, Serialize)]
pub struct Applicant<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub phone: Option<&'a str>,
    pub location: Option<&'a str>,
}

/// Content of one application. Contains no timestamps, so resubmitting the same
/// posting yields byte-identical output.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationPacket<'a> {
    pub fingerprint: String,
    pub source_id: &'a str,
    pub title: &'a str,
    pub company: &'a str,
    pub external_url: &'a str,
    pub applicant: Applicant<'a>,
    pub cover_letter: &'a str,
}

impl<'a> ApplicationPacket<'a> {
    pub fn new(posting: &'a JobPosting, profile: &'a Profile, cover_letter: &'a str) -> Self {
        Self {
            fingerprint: posting.fingerprint().to_string(),
            source_id: &posting.source_id,
            title: &posting.title,
            company: &posting.company,
            external_url: &posting.external_url,
            applicant: Applicant {
                name: &profile.name,
                email: &profile.email,
                phone: profile.phone.as_deref(),
                location: profile.location.as_deref(),
            },
            cover_letter,
        }
    }
}

/// Why a posting cannot be applied to at all, if anything.
pub fn invalid_reason(posting: &JobPosting) -> Option<String> {
    if posting.title.trim().is_empty() {
        return Some("posting has no title".to_string());
    }
    if posting.external_url.trim().is_empty() {
        return Some("posting has no application url".to_string());
    }
    match Url::parse(posting.external_url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => None,
        Ok(url) => Some(format!("unsupported application url scheme {}", url.scheme())),
        Err(err) => Some(format!("invalid application url: {err}")),
    }
}

#[derive(Debug, Clone)]
pub enum Applicator {
    /// Write the packet to the local outbox for out-of-band submission.
    Outbox(OutboxStore),
    /// POST the packet to an HTTP endpoint, one request per submission.
    Webhook { http: Arc<HttpFetcher>, url: String },
}

impl Applicator {
    pub fn from_spec(via: &ApplyVia, ctx: &AdapterContext) -> Self {
        match via {
            ApplyVia::Outbox => Applicator::Outbox(ctx.outbox.clone()),
            ApplyVia::Webhook { url } => Applicator::Webhook {
                http: Arc::clone(&ctx.http),
                url: url.clone(),
            },
        }
    }

    pub async fn submit(&self, posting: &JobPosting, profile: &Profile, cover_letter: &str) -> ApplyOutcome {
        if let Some(reason) = invalid_reason(posting) {
            return ApplyOutcome::PermanentlyInvalid(reason);
        }
        let packet = ApplicationPacket::new(posting, profile, cover_letter);

        match self {
            Applicator::Outbox(outbox) => {
                let bytes = match serde_json::to_vec_pretty(&packet) {
                    Ok(bytes) => bytes,
                    Err(err) => return ApplyOutcome::PermanentlyInvalid(format!("unencodable packet: {err}")),
                };
                match outbox.store_packet(Utc::now(), &posting.source_id, &bytes).await {
                    Ok(stored) => {
                        debug!(
                            source_id = %posting.source_id,
                            path = %stored.relative_path.display(),
                            deduplicated = stored.deduplicated,
                            "application packet written to outbox"
                        );
                        ApplyOutcome::Succeeded
                    }
                    Err(err) => ApplyOutcome::Failed(err.to_string()),
                }
            }
            Applicator::Webhook { http, url } => {
                match http.post_json_once(&posting.source_id, url, &packet).await {
                    Ok(_) => ApplyOutcome::Succeeded,
                    Err(err) => {
                        warn!(source_id = %posting.source_id, error = %err, "application webhook failed");
                        outcome_for_fetch_error(err)
                    }
                }
            }
        }
    }
}

/// Non-retryable HTTP statuses mean the posting is gone or rejected; everything else is transient.
pub fn outcome_for_fetch_error(err: FetchError) -> ApplyOutcome {
    match &err {
        FetchError::HttpStatus { status, .. } if classify_status_code(*status) == RetryDisposition::NonRetryable => {
            ApplyOutcome::PermanentlyInvalid(err.to_string())
        }
        _ => ApplyOutcome::Failed(err.to_string()),
    }
}
