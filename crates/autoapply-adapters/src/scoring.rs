//! Match scorers. The engine treats a remote model as primary and the keyword
//! heuristic as the fallback that never fails.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use autoapply_core::{JobPosting, MatchResult, Profile, ScoreSource};
use autoapply_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::debug;

use crate::AdapterError;

#[async_trait]
pub trait MatchScorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, posting: &JobPosting, profile: &Profile) -> Result<MatchResult, AdapterError>;
}

const KNOWN_SKILLS: &[&str] = &[
    "python", "javascript", "typescript", "react", "node.js", "java", "c++", "c#", "php", "ruby",
    "go", "rust", "swift", "kotlin", "scala", "django", "flask", "express", "angular", "vue",
    "mongodb", "postgresql", "mysql", "redis", "docker", "kubernetes", "aws", "azure", "gcp",
    "git", "linux", "unix", "html", "css", "sass", "less", "webpack", "babel", "jest", "pytest",
    "selenium", "playwright", "cypress", "jenkins", "github actions", "ci/cd",
];

const REMOTE_INDICATORS: &[&str] = &["remote", "work from home", "wfh", "virtual", "distributed"];
const SENIOR_INDICATORS: &[&str] = &["senior", "lead", "principal", "staff"];

const SKILL_WEIGHT: f64 = 60.0;
const REMOTE_WEIGHT: f64 = 30.0;
const SENIORITY_WEIGHT: f64 = 10.0;
const SKILL_SIMILARITY: f64 = 0.93;

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || matches!(c, '+' | '#' | '.' | '/')))
        .map(|t| t.trim_end_matches('.').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Known skills mentioned in `text`; single words must appear as whole tokens.
pub fn extract_skills(text: &str) -> BTreeSet<&'static str> {
    let lower = text.to_lowercase();
    let words = tokens(&lower);
    KNOWN_SKILLS
        .iter()
        .copied()
        .filter(|skill| {
            if skill.contains(' ') {
                lower.contains(skill)
            } else {
                words.contains(*skill)
            }
        })
        .collect()
}

fn skill_matches(candidate: &str, wanted: &str) -> bool {
    candidate == wanted || jaro_winkler(candidate, wanted) >= SKILL_SIMILARITY
}

/// Score in 0..=100 plus the reasons that produced it.
pub fn heuristic_score(posting: &JobPosting, profile: &Profile) -> (f64, Vec<String>) {
    let text = format!("{} {}", posting.title, posting.raw_text).to_lowercase();
    let mut score = 0.0;
    let mut reasons = Vec::new();

    let job_skills = extract_skills(&text);
    let own: Vec<String> = profile.skills.iter().map(|s| s.trim().to_lowercase()).collect();
    if !own.is_empty() && !job_skills.is_empty() {
        let common: Vec<&str> = job_skills
            .iter()
            .copied()
            .filter(|skill| own.iter().any(|o| skill_matches(o, skill)))
            .collect();
        if common.is_empty() {
            reasons.push("no matching skills".to_string());
        } else {
            score += common.len() as f64 / job_skills.len() as f64 * SKILL_WEIGHT;
            reasons.push(format!("skills match: {}", common.join(", ")));
        }
    }

    if REMOTE_INDICATORS.iter().any(|i| text.contains(i)) {
        score += REMOTE_WEIGHT;
        reasons.push("remote work available".to_string());
    } else {
        reasons.push("not remote".to_string());
    }

    let title = posting.title.to_lowercase();
    if SENIOR_INDICATORS.iter().any(|i| title.contains(i)) {
        score += SENIORITY_WEIGHT;
        reasons.push("senior position".to_string());
    }

    (score.min(100.0), reasons)
}

/// Local keyword heuristic. Never fails.
#[derive(Debug, Clone)]
pub struct KeywordScorer {
    min_match_score: u8,
}

impl KeywordScorer {
    pub fn new(min_match_score: u8) -> Self {
        Self { min_match_score }
    }
}

#[async_trait]
impl MatchScorer for KeywordScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn score(&self, posting: &JobPosting, profile: &Profile) -> Result<MatchResult, AdapterError> {
        let (score, reasons) = heuristic_score(posting, profile);
        Ok(MatchResult::new(
            posting.fingerprint(),
            score,
            score >= f64::from(self.min_match_score),
            reasons.join("; "),
            ScoreSource::Heuristic,
        ))
    }
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    posting: &'a JobPosting,
    profile: &'a Profile,
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    score: f64,
    #[serde(default)]
    recommend: Option<bool>,
    #[serde(default)]
    rationale: String,
}

/// Model-backed scorer reached over HTTP: POST `{posting, profile}`, reply
/// `{score, recommend?, rationale?}`.
#[derive(Debug, Clone)]
pub struct RemoteScorer {
    http: Arc<HttpFetcher>,
    endpoint: String,
    min_match_score: u8,
}

impl RemoteScorer {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, min_match_score: u8) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            min_match_score,
        }
    }
}

#[async_trait]
impl MatchScorer for RemoteScorer {
    fn name(&self) -> &str {
        "remote"
    }

    async fn score(&self, posting: &JobPosting, profile: &Profile) -> Result<MatchResult, AdapterError> {
        let reply: ScoreReply = self
            .http
            .post_json("scorer", &self.endpoint, &ScoreRequest { posting, profile })
            .await
            .map_err(|e| AdapterError::ScorerUnavailable(e.to_string()))?;
        validate_reply(&reply)?;
        debug!(fingerprint = %posting.fingerprint().short(), score = reply.score, "remote score");
        Ok(MatchResult::new(
            posting.fingerprint(),
            reply.score,
            reply
                .recommend
                .unwrap_or(reply.score >= f64::from(self.min_match_score)),
            reply.rationale,
            ScoreSource::Remote,
        ))
    }
}

fn validate_reply(reply: &ScoreReply) -> Result<(), AdapterError> {
    if !reply.score.is_finite() || !(0.0..=100.0).contains(&reply.score) {
        return Err(AdapterError::ScorerUnavailable(format!(
            "score {} outside 0..=100",
            reply.score
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn posting(title: &str, text: &str) -> JobPosting {
        JobPosting {
            source_id: "s".into(),
            external_url: "https://jobs.test/1".into(),
            title: title.into(),
            company: "Acme".into(),
            raw_text: text.into(),
            discovered_at: Utc::now(),
        }
    }

    fn profile(skills: &[&str]) -> Profile {
        Profile {
            name: "Ada".into(),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn whole_word_skill_extraction() {
        let skills = extract_skills("Good Go and Rust; CI/CD with GitHub Actions");
        assert!(skills.contains("go"));
        assert!(skills.contains("rust"));
        assert!(skills.contains("ci/cd"));
        assert!(skills.contains("github actions"));
        assert!(!extract_skills("a good day").contains("go"));
    }

    #[test]
    fn weights_add_up_to_one_hundred() {
        let p = posting("Senior Backend Engineer", "Remote role using rust and postgresql");
        let (score, reasons) = heuristic_score(&p, &profile(&["Rust", "PostgreSQL"]));
        assert!((score - 100.0).abs() < 1e-9, "score was {score}");
        assert!(reasons.iter().any(|r| r.starts_with("skills match")));
    }

    #[test]
    fn partial_skill_overlap_is_proportional() {
        let p = posting("Engineer", "python and docker, onsite");
        let (score, _) = heuristic_score(&p, &profile(&["python"]));
        assert!((score - 30.0).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn near_spellings_count_as_skills() {
        let p = posting("Engineer", "kubernetes");
        let (score, _) = heuristic_score(&p, &profile(&["kubernets"]));
        assert!(score > 0.0);
    }

    #[tokio::test]
    async fn keyword_scorer_recommends_above_threshold() {
        let scorer = KeywordScorer::new(40);
        let p = posting("Staff Engineer", "remote rust");
        let result = scorer.score(&p, &profile(&["rust"])).await.expect("score");
        assert_eq!(result.score, 100);
        assert!(result.recommend);
        assert_eq!(result.scored_by, ScoreSource::Heuristic);
        assert_eq!(result.fingerprint, p.fingerprint());
    }

    #[test]
    fn out_of_range_reply_is_rejected() {
        let reply = ScoreReply {
            score: 140.0,
            recommend: None,
            rationale: String::new(),
        };
        assert!(validate_reply(&reply).is_err());
        let reply = ScoreReply {
            score: 55.5,
            recommend: Some(true),
            rationale: "fits".into(),
        };
        assert!(validate_reply(&reply).is_ok());
    }
}
