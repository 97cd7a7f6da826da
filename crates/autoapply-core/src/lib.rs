//! Core domain model for the continuous application engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "autoapply-core";

/// Identifies the normalization + digest used for fingerprints. Persisted next to
/// stored fingerprints; a store written under another scheme must not be mixed in.
pub const FINGERPRINT_SCHEME: &str = "v1:sha256:trim-lower-collapse";

const FIELD_SEPARATOR: char = '\u{1f}';

/// A discovered posting. Cycle-scoped; only its fingerprint outlives the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub source_id: String,
    pub external_url: String,
    pub title: String,
    pub company: String,
    pub raw_text: String,
    pub discovered_at: DateTime<Utc>,
}

impl JobPosting {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(
            &self.source_id,
            &self.company,
            &self.title,
            &self.external_url,
        )
    }
}

/// Stable digest of the normalized `(source_id, company, title, external_url)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(source_id: &str, company: &str, title: &str, external_url: &str) -> Self {
        let mut hasher = Sha256::new();
        for (idx, part) in [source_id, company, title, external_url].iter().enumerate() {
            if idx > 0 {
                hasher.update(FIELD_SEPARATOR.to_string().as_bytes());
            }
            hasher.update(Self::normalize_component(part).as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Trim, lowercase and collapse internal whitespace runs to a single space.
    pub fn normalize_component(input: &str) -> String {
        input
            .split_whitespace()
            .map(|word| word.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Wraps an already-computed digest, e.g. one read back from disk.
    pub fn from_hex(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Remote,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub fingerprint: Fingerprint,
    /// 0 – 100
    pub score: u8,
    pub recommend: bool,
    pub rationale: String,
    pub computed_at: DateTime<Utc>,
    pub scored_by: ScoreSource,
}

impl MatchResult {
    pub fn new(
        fingerprint: Fingerprint,
        score: f64,
        recommend: bool,
        rationale: impl Into<String>,
        scored_by: ScoreSource,
    ) -> Self {
        let score = if score.is_finite() {
            score.round().clamp(0.0, 100.0) as u8
        } else {
            0
        };
        Self {
            fingerprint,
            score,
            recommend,
            rationale: rationale.into(),
            computed_at: Utc::now(),
            scored_by,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

/// Reason code attached to `Failed` and `Skipped` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Retries exhausted on transient errors.
    Transient,
    /// Last attempt exceeded the per-attempt timeout.
    Timeout,
    /// Adapter reported the posting invalid, expired or closed.
    Permanent,
    /// Abandoned while shutting down.
    Shutdown,
    /// No enabled adapter can apply for the posting's source.
    NoAdapter,
    /// Another worker already owned the fingerprint.
    Duplicate,
}

/// Audit entry for one fingerprint. Append-only; the latest entry per fingerprint wins
/// on compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    pub attempt_count: u32,
    pub outcome: Outcome,
    #[serde(default)]
    pub reason: Option<ReasonCode>,
    pub last_error: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl ApplicationRecord {
    pub fn pending(posting: &JobPosting, fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            source_id: posting.source_id.clone(),
            title: posting.title.clone(),
            company: posting.company.clone(),
            attempt_count: 0,
            outcome: Outcome::Pending,
            reason: None,
            last_error: None,
            applied_at: None,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.outcome = Outcome::Succeeded;
        self.reason = None;
        self.last_error = None;
        self.applied_at = Some(Utc::now());
        self
    }

    pub fn failed(mut self, reason: ReasonCode, error: impl Into<String>) -> Self {
        self.outcome = Outcome::Failed;
        self.reason = Some(reason);
        self.last_error = Some(error.into());
        self.applied_at = Some(Utc::now());
        self
    }

    pub fn skipped(mut self, reason: ReasonCode, note: impl Into<String>) -> Self {
        self.outcome = Outcome::Skipped;
        self.reason = Some(reason);
        self.last_error = Some(note.into());
        self.applied_at = Some(Utc::now());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }
}

/// Counters for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub postings_seen: u64,
    pub postings_scored: u64,
    pub postings_applied: u64,
    pub successes: u64,
    pub failures: u64,
    pub duplicates_skipped: u64,
    #[serde(default)]
    pub source_failures: u64,
    #[serde(default)]
    pub scorer_fallbacks: u64,
}

impl CycleStats {
    pub fn begin(cycle_number: u64) -> Self {
        let now = Utc::now();
        Self {
            cycle_number,
            started_at: now,
            ended_at: now,
            postings_seen: 0,
            postings_scored: 0,
            postings_applied: 0,
            successes: 0,
            failures: 0,
            duplicates_skipped: 0,
            source_failures: 0,
            scorer_fallbacks: 0,
        }
    }

    /// Folds dispatcher outcomes into the counters.
    pub fn absorb_records(&mut self, records: &[ApplicationRecord]) {
        for record in records {
            match record.outcome {
                Outcome::Succeeded => {
                    self.postings_applied += 1;
                    self.successes += 1;
                }
                Outcome::Failed => {
                    self.postings_applied += 1;
                    self.failures += 1;
                }
                Outcome::Skipped => {
                    if record.reason == Some(ReasonCode::Duplicate) {
                        self.duplicates_skipped += 1;
                    }
                }
                Outcome::Pending => {}
            }
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Running totals across every recorded cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub cycles: u64,
    pub postings_seen: u64,
    pub postings_scored: u64,
    pub postings_applied: u64,
    pub successes: u64,
    pub failures: u64,
    pub duplicates_skipped: u64,
    #[serde(default)]
    pub source_failures: u64,
    #[serde(default)]
    pub scorer_fallbacks: u64,
}

impl RunTotals {
    pub fn absorb(&mut self, stats: &CycleStats) {
        self.cycles += 1;
        self.postings_seen += stats.postings_seen;
        self.postings_scored += stats.postings_scored;
        self.postings_applied += stats.postings_applied;
        self.successes += stats.successes;
        self.failures += stats.failures;
        self.duplicates_skipped += stats.duplicates_skipped;
        self.source_failures += stats.source_failures;
        self.scorer_fallbacks += stats.scorer_fallbacks;
    }

    /// Percentage of applied postings that succeeded; 0 when nothing was applied.
    pub fn success_rate(&self) -> f64 {
        if self.postings_applied == 0 {
            0.0
        } else {
            self.successes as f64 / self.postings_applied as f64 * 100.0
        }
    }
}

/// Query handed to every source adapter each cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
    pub remote_only: bool,
}

pub const DEFAULT_SEARCH_KEYWORDS: &[&str] = &[
    "python",
    "react",
    "node.js",
    "javascript",
    "full stack",
    "remote",
];

pub const MAX_SEARCH_KEYWORDS: usize = 10;

/// Candidate profile. Parsed elsewhere; consumed here as plain data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub years_experience: Option<u32>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub cover_letter_template: Option<String>,
}

impl Profile {
    /// Configured keywords win; otherwise the profile skills, otherwise a default list.
    pub fn search_keywords(&self, configured: &[String]) -> Vec<String> {
        let source: Vec<String> = if !configured.is_empty() {
            configured.to_vec()
        } else if !self.skills.is_empty() {
            self.skills.clone()
        } else {
            DEFAULT_SEARCH_KEYWORDS.iter().map(|s| s.to_string()).collect()
        };
        source.into_iter().take(MAX_SEARCH_KEYWORDS).collect()
    }

    pub fn render_cover_letter(&self, posting: &JobPosting) -> String {
        let template = self.cover_letter_template.as_deref().unwrap_or(
            "Dear {company} hiring team,\n\nI am applying for the {title} position. \
             My background is a close fit for the role and I would welcome a conversation.\n\n\
             Regards,\n{name}",
        );
        template
            .replace("{company}", &posting.company)
            .replace("{title}", &posting.title)
            .replace("{name}", &self.name)
    }
}
