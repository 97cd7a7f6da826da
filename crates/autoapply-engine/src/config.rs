//! Typed engine configuration, loaded from YAML and validated before any cycle runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use autoapply_adapters::SourceSpec;
use autoapply_core::{Profile, SearchQuery};
use autoapply_storage::{BackoffPolicy, HttpClientConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::EngineError;

pub const DEFAULT_CONFIG_PATH: &str = "config/continuous.yaml";
pub const CONFIG_PATH_ENV: &str = "AUTOAPPLY_CONFIG";
pub const STATE_DIR_ENV: &str = "AUTOAPPLY_STATE_DIR";
pub const REPORTS_DIR_ENV: &str = "AUTOAPPLY_REPORTS_DIR";

const MAX_SECONDS: f64 = 31_536_000.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
    pub remote_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerSettings {
    /// Remote scoring endpoint; without one every posting is scored by the heuristic.
    pub endpoint: Option<String>,
    pub timeout_secs: f64,
}

impl Default for ScorerSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_secs: f64,
    pub calls_per_minute: Option<u32>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("autoapply/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 20.0,
            calls_per_minute: None,
        }
    }
}

/// Every knob of the continuous engine. Durations are seconds and may be fractional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub search_interval: f64,
    pub max_applications_per_cycle: usize,
    pub max_concurrent_applications: usize,
    pub application_delay: f64,
    pub min_match_score: u32,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub attempt_timeout: f64,
    pub source_timeout: f64,
    pub shutdown_grace_timeout: f64,
    pub max_persistence_failures: u32,
    pub enabled_sources: Vec<String>,
    pub sources: Vec<SourceSpec>,
    pub search: SearchSettings,
    pub scorer: ScorerSettings,
    pub http: HttpSettings,
    pub profile_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub monitor_addr: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_interval: 30.0,
            max_applications_per_cycle: 20,
            max_concurrent_applications: 5,
            application_delay: 30.0,
            min_match_score: 40,
            max_retries: 3,
            retry_delay: 300.0,
            attempt_timeout: 120.0,
            source_timeout: 120.0,
            shutdown_grace_timeout: 60.0,
            max_persistence_failures: 3,
            enabled_sources: Vec::new(),
            sources: Vec::new(),
            search: SearchSettings::default(),
            scorer: ScorerSettings::default(),
            http: HttpSettings::default(),
            profile_path: None,
            state_dir: PathBuf::from("state"),
            reports_dir: PathBuf::from("reports"),
            outbox_dir: PathBuf::from("state/outbox"),
            monitor_addr: None,
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl EngineConfig {
    /// Resolve the path from `AUTOAPPLY_CONFIG`, then load, override and validate.
    pub fn from_env() -> Result<Self, EngineError> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::FatalConfig(format!("reading {}: {e}", path.display())))?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse only; callers run `validate` once overrides are applied.
    pub fn from_yaml_str(text: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(text).map_err(|e| EngineError::FatalConfig(format!("parsing config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            let dir = PathBuf::from(dir);
            // An outbox nested under the state dir moves with it.
            if let Ok(rest) = self.outbox_dir.strip_prefix(&self.state_dir) {
                self.outbox_dir = dir.join(rest);
            }
            self.state_dir = dir;
        }
        if let Ok(dir) = std::env::var(REPORTS_DIR_ENV) {
            self.reports_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let mut problems = Vec::new();

        if self.min_match_score > 100 {
            problems.push(format!("min_match_score {} is outside 0..=100", self.min_match_score));
        }
        if self.max_concurrent_applications == 0 {
            problems.push("max_concurrent_applications must be at least 1".to_string());
        }
        if self.max_applications_per_cycle == 0 {
            problems.push("max_applications_per_cycle must be at least 1".to_string());
        }
        if self.max_persistence_failures == 0 {
            problems.push("max_persistence_failures must be at least 1".to_string());
        }

        let durations = [
            ("search_interval", self.search_interval, true),
            ("attempt_timeout", self.attempt_timeout, true),
            ("source_timeout", self.source_timeout, true),
            ("application_delay", self.application_delay, false),
            ("retry_delay", self.retry_delay, false),
            ("shutdown_grace_timeout", self.shutdown_grace_timeout, false),
            ("scorer.timeout_secs", self.scorer.timeout_secs, true),
            ("http.timeout_secs", self.http.timeout_secs, true),
        ];
        for (name, value, positive) in durations {
            if !value.is_finite() || value < 0.0 || value > MAX_SECONDS {
                problems.push(format!("{name} must be between 0 and {MAX_SECONDS} seconds"));
            } else if positive && value == 0.0 {
                problems.push(format!("{name} must be greater than 0"));
            }
        }

        if self.enabled_sources.is_empty() {
            problems.push("enabled_sources must name at least one source".to_string());
        }
        let registered: HashSet<&str> = self.sources.iter().map(|s| s.source_id.as_str()).collect();
        if registered.len() != self.sources.len() {
            problems.push("sources contains duplicate source_id entries".to_string());
        }
        for source_id in &self.enabled_sources {
            if !registered.contains(source_id.as_str()) {
                problems.push(format!("enabled source {source_id} is not registered under sources"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::FatalConfig(problems.join("; ")))
        }
    }

    pub fn search_interval(&self) -> Duration {
        seconds(self.search_interval)
    }

    pub fn application_delay(&self) -> Duration {
        seconds(self.application_delay)
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(self.retry_delay)
    }

    pub fn attempt_timeout(&self) -> Duration {
        seconds(self.attempt_timeout)
    }

    pub fn source_timeout(&self) -> Duration {
        seconds(self.source_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_timeout)
    }

    pub fn scorer_timeout(&self) -> Duration {
        seconds(self.scorer.timeout_secs)
    }

    pub fn fingerprint_dir(&self) -> PathBuf {
        self.state_dir.join("fingerprints")
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.state_dir.join("stats")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: seconds(self.http.timeout_secs),
            user_agent: Some(self.http.user_agent.clone()),
            calls_per_minute: self.http.calls_per_minute,
            backoff: BackoffPolicy::default(),
            ..HttpClientConfig::default()
        }
    }

    /// Keywords fall back to the profile's skills, then to the built-in list.
    pub fn search_query(&self, profile: &Profile) -> SearchQuery {
        SearchQuery {
            keywords: profile.search_keywords(&self.search.keywords),
            locations: self.search.locations.clone(),
            remote_only: self.search.remote_only,
        }
    }

    pub fn load_profile(&self) -> Result<Profile, EngineError> {
        let Some(path) = &self.profile_path else {
            warn!("no profile_path configured; applying with an empty profile");
            return Ok(Profile::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::FatalConfig(format!("reading profile {}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| EngineError::FatalConfig(format!("parsing profile {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
search_interval: 45
min_match_score: 70
enabled_sources: [sample]
sources:
  - source_id: sample
    kind: fixture
    fixture_path: fixtures/sample_feed.json
  - source_id: board
    kind: html_listing
    listing_urls: ["https://board.test/search?q={keywords}"]
    apply:
      via: webhook
      url: https://hooks.test/apply
search:
  remote_only: true
"#;

    #[test]
    fn yaml_fills_defaults() {
        let config = EngineConfig::from_yaml_str(SAMPLE).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.search_interval(), Duration::from_secs(45));
        assert_eq!(config.min_match_score, 70);
        assert_eq!(config.max_concurrent_applications, 5);
        assert_eq!(config.retry_delay(), Duration::from_secs(300));
        assert_eq!(config.sources.len(), 2);
        assert!(matches!(
            config.sources[1].apply,
            autoapply_adapters::ApplyVia::Webhook { .. }
        ));
        assert!(config.search.remote_only);
    }

    #[test]
    fn fractional_seconds_are_accepted() {
        let mut config = EngineConfig::from_yaml_str(SAMPLE).expect("parse");
        config.application_delay = 0.25;
        assert_eq!(config.application_delay(), Duration::from_millis(250));
    }

    #[test]
    fn violations_are_reported_together() {
        let mut config = EngineConfig::from_yaml_str(SAMPLE).expect("parse");
        config.min_match_score = 101;
        config.max_concurrent_applications = 0;
        config.retry_delay = -1.0;
        config.enabled_sources.push("ghost".into());
        let message = config.validate().expect_err("invalid").to_string();
        assert!(message.contains("min_match_score"));
        assert!(message.contains("max_concurrent_applications"));
        assert!(message.contains("retry_delay"));
        assert!(message.contains("ghost"));
    }

    #[test]
    fn no_enabled_source_is_fatal() {
        let config = EngineConfig::default();
        assert!(matches!(config.validate(), Err(EngineError::FatalConfig(_))));
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        let err = EngineConfig::from_yaml_str("sources: [{source_id: x, kind: carrier_pigeon}]")
            .expect_err("must fail");
        assert!(matches!(err, EngineError::FatalConfig(_)));
    }

    #[test]
    fn shipped_config_and_profile_are_valid() {
        let config = EngineConfig::from_yaml_str(include_str!("../../../config/continuous.yaml")).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.enabled_sources, vec!["sample_feed"]);
        let profile: Profile =
            serde_yaml::from_str(include_str!("../../../config/profile.yaml")).expect("profile");
        assert!(profile.skills.contains(&"rust".to_string()));
    }

    #[test]
    fn keywords_come_from_profile_when_unset() {
        let config = EngineConfig::default();
        let profile = Profile {
            skills: vec!["rust".into(), "tokio".into()],
            ..Default::default()
        };
        assert_eq!(config.search_query(&profile).keywords, vec!["rust", "tokio"]);
    }

    #[test]
    fn profile_is_read_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("profile.yaml");
        std::fs::write(&path, "name: Ada\nemail: ada@example.test\nskills: [rust]\n").expect("seed");
        let config = EngineConfig {
            profile_path: Some(path),
            ..Default::default()
        };
        let profile = config.load_profile().expect("profile");
        assert_eq!(profile.name, "Ada");
        assert_eq!(profile.skills, vec!["rust"]);
    }
}
