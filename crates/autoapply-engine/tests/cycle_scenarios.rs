use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autoapply_adapters::{
    AdapterError, AdapterRegistry, ApplyOutcome, MatchScorer, PostingStream, SourceAdapter,
};
use autoapply_core::{JobPosting, MatchResult, Outcome, Profile, ScoreSource, SearchQuery};
use autoapply_engine::{CyclePhase, EngineConfig, EngineError, Orchestrator};
use autoapply_storage::StatsStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

enum Behaviour {
    Postings(Vec<JobPosting>),
    Fails,
    Hangs,
}

struct BoardStub {
    id: String,
    behaviour: Behaviour,
    applied: Mutex<Vec<String>>,
}

impl BoardStub {
    fn with_titles(id: &str, titles: &[&str]) -> Arc<Self> {
        let postings = titles
            .iter()
            .map(|title| JobPosting {
                source_id: id.to_string(),
                external_url: format!("https://{id}.test/jobs/{}", title.to_lowercase().replace(' ', "-")),
                title: title.to_string(),
                company: "Acme".into(),
                raw_text: format!("{title} remote rust python"),
                discovered_at: Utc::now(),
            })
            .collect();
        Arc::new(Self::new(id, Behaviour::Postings(postings)))
    }

    fn new(id: &str, behaviour: Behaviour) -> Self {
        Self {
            id: id.to_string(),
            behaviour,
            applied: Mutex::new(Vec::new()),
        }
    }

    fn applied(&self) -> Vec<String> {
        self.applied.lock().expect("lock").clone()
    }
}

#[async_trait]
impl SourceAdapter for BoardStub {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn search(&self, _query: &SearchQuery) -> PostingStream {
        match &self.behaviour {
            Behaviour::Postings(postings) => stream::iter(postings.clone().into_iter().map(Ok)).boxed(),
            Behaviour::Fails => stream::iter(vec![Err(AdapterError::source(&self.id, "503 from board"))]).boxed(),
            Behaviour::Hangs => stream::pending().boxed(),
        }
    }

    async fn apply(&self, posting: &JobPosting, _profile: &Profile, _cover_letter: &str) -> ApplyOutcome {
        self.applied.lock().expect("lock").push(posting.title.clone());
        ApplyOutcome::Succeeded
    }
}

/// Scores by exact title; unknown titles score zero.
struct TitleScorer(HashMap<String, f64>);

impl TitleScorer {
    fn new(scores: &[(&str, f64)]) -> Arc<dyn MatchScorer> {
        Arc::new(Self(scores.iter().map(|(t, s)| (t.to_string(), *s)).collect()))
    }
}

#[async_trait]
impl MatchScorer for TitleScorer {
    fn name(&self) -> &str {
        "title-table"
    }

    async fn score(&self, posting: &JobPosting, _profile: &Profile) -> Result<MatchResult, AdapterError> {
        let score = self.0.get(&posting.title).copied().unwrap_or(0.0);
        Ok(MatchResult::new(posting.fingerprint(), score, score >= 70.0, "table", ScoreSource::Remote))
    }
}

struct DownScorer;

#[async_trait]
impl MatchScorer for DownScorer {
    fn name(&self) -> &str {
        "down"
    }

    async fn score(&self, _posting: &JobPosting, _profile: &Profile) -> Result<MatchResult, AdapterError> {
        Err(AdapterError::ScorerUnavailable("connection refused".into()))
    }
}

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        search_interval: 0.15,
        max_applications_per_cycle: 2,
        max_concurrent_applications: 1,
        application_delay: 0.0,
        min_match_score: 70,
        retry_delay: 0.01,
        attempt_timeout: 5.0,
        source_timeout: 5.0,
        shutdown_grace_timeout: 1.0,
        state_dir: dir.path().join("state"),
        reports_dir: dir.path().join("reports"),
        outbox_dir: dir.path().join("state/outbox"),
        ..EngineConfig::default()
    }
}

fn profile() -> Profile {
    Profile {
        name: "Ada Lovelace".into(),
        email: "ada@example.test".into(),
        skills: vec!["rust".into(), "python".into()],
        ..Profile::default()
    }
}

fn registry(adapters: &[Arc<BoardStub>]) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(Arc::clone(adapter) as Arc<dyn SourceAdapter>);
    }
    registry
}

fn three_roles() -> Arc<BoardStub> {
    BoardStub::with_titles("board", &["Role A", "Role B", "Role C"])
}

fn role_scores() -> Arc<dyn MatchScorer> {
    TitleScorer::new(&[("Role A", 90.0), ("Role B", 80.0), ("Role C", 60.0)])
}

#[tokio::test]
async fn top_scores_are_applied_once_and_never_again() {
    let dir = tempdir().expect("tempdir");
    let board = three_roles();
    let mut engine = Orchestrator::new(
        config(&dir),
        registry(&[Arc::clone(&board)]),
        Some(role_scores()),
        profile(),
        CancellationToken::new(),
    );
    engine.load().await.expect("load");

    let first = engine.run_cycle().await.expect("first cycle");
    assert_eq!(first.postings_seen, 3);
    assert_eq!(first.postings_scored, 3);
    assert_eq!(first.postings_applied, 2);
    assert_eq!(first.successes, 2);
    assert_eq!(board.applied(), vec!["Role A", "Role B"]);

    let store = engine.fingerprints();
    assert_eq!(store.len(), 2);
    assert!(store.records().iter().all(|r| r.outcome == Outcome::Succeeded));

    let second = engine.run_cycle().await.expect("second cycle");
    assert_eq!(second.cycle_number, 2);
    assert_eq!(second.postings_applied, 0);
    assert_eq!(second.duplicates_skipped, 2);
    assert_eq!(second.postings_scored, 1);
    assert_eq!(board.applied().len(), 2);
    assert_eq!(engine.state().totals().successes, 2);
}

#[tokio::test]
async fn restart_over_same_state_applies_nothing_twice() {
    let dir = tempdir().expect("tempdir");

    let first_board = three_roles();
    let mut first = Orchestrator::new(
        config(&dir),
        registry(&[Arc::clone(&first_board)]),
        Some(role_scores()),
        profile(),
        CancellationToken::new(),
    );
    let first_report = first.run_once().await.expect("first run");
    assert_eq!(first_report.totals.successes, 2);
    assert_eq!(first_board.applied().len(), 2);

    let second_board = three_roles();
    let mut second = Orchestrator::new(
        config(&dir),
        registry(&[Arc::clone(&second_board)]),
        Some(role_scores()),
        profile(),
        CancellationToken::new(),
    );
    let report = second.run_once().await.expect("second run");

    assert!(second_board.applied().is_empty());
    assert_eq!(report.total_cycles, 2);
    assert_eq!(report.totals.successes, 2);
    assert_eq!(report.applied_fingerprints, 2);
    let last = report.last_cycle.expect("last cycle");
    assert_eq!(last.cycle_number, 2);
    assert_eq!(last.duplicates_skipped, 2);

    let run_dir = dir.path().join("reports").join(&report.run_id);
    assert!(run_dir.join("final_report.json").exists());
    assert!(run_dir.join("final_report.md").exists());
    assert!(run_dir.join("snapshots/cycles.parquet").exists());
}

#[tokio::test]
async fn failing_and_hanging_sources_do_not_sink_the_cycle() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = config(&dir);
    cfg.source_timeout = 0.1;
    let healthy = three_roles();
    let broken = Arc::new(BoardStub::new("broken", Behaviour::Fails));
    let stuck = Arc::new(BoardStub::new("stuck", Behaviour::Hangs));

    let mut engine = Orchestrator::new(
        cfg,
        registry(&[broken, Arc::clone(&healthy), stuck]),
        Some(role_scores()),
        profile(),
        CancellationToken::new(),
    );
    engine.load().await.expect("load");
    let stats = engine.run_cycle().await.expect("cycle");

    assert_eq!(stats.source_failures, 2);
    assert_eq!(stats.postings_seen, 3);
    assert_eq!(stats.successes, 2);
    assert_eq!(healthy.applied(), vec!["Role A", "Role B"]);
}

#[tokio::test]
async fn unavailable_scorer_falls_back_to_heuristic() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = config(&dir);
    cfg.min_match_score = 0;
    cfg.max_applications_per_cycle = 10;
    let board = three_roles();

    let mut engine = Orchestrator::new(
        cfg,
        registry(&[Arc::clone(&board)]),
        Some(Arc::new(DownScorer)),
        profile(),
        CancellationToken::new(),
    );
    engine.load().await.expect("load");
    let stats = engine.run_cycle().await.expect("cycle");

    assert_eq!(stats.scorer_fallbacks, 3);
    assert_eq!(stats.postings_scored, 3);
    assert_eq!(stats.postings_applied, 3);
}

#[tokio::test]
async fn without_primary_scorer_no_fallback_is_counted() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = config(&dir);
    cfg.min_match_score = 0;
    let mut engine = Orchestrator::new(
        cfg,
        registry(&[three_roles()]),
        None,
        profile(),
        CancellationToken::new(),
    );
    engine.load().await.expect("load");
    let stats = engine.run_cycle().await.expect("cycle");

    assert_eq!(stats.scorer_fallbacks, 0);
    assert_eq!(stats.postings_scored, 3);
}

#[tokio::test]
async fn run_loop_paces_cycles_and_stops_on_shutdown() {
    let dir = tempdir().expect("tempdir");
    let shutdown = CancellationToken::new();
    let board = three_roles();
    let mut engine = Orchestrator::new(
        config(&dir),
        registry(&[board]),
        Some(role_scores()),
        profile(),
        shutdown.clone(),
    );
    let monitor = engine.subscribe();

    let canceller = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            shutdown.cancel();
        })
    };
    let report = engine.run().await.expect("run");
    canceller.await.expect("canceller");

    assert!(report.total_cycles >= 2, "expected at least two cycles, got {}", report.total_cycles);
    let history = engine.stats().snapshot().history.clone();
    for pair in history.windows(2) {
        let gap = pair[1].started_at - pair[0].started_at;
        assert!(
            gap.num_microseconds().unwrap_or(0) >= 149_000,
            "cycles started {gap} apart"
        );
    }

    let last = monitor.borrow().clone();
    assert_eq!(last.phase, CyclePhase::ShuttingDown);
    assert!(last.shutdown_requested);
}

#[tokio::test]
async fn shutdown_before_dispatch_applies_nothing() {
    let dir = tempdir().expect("tempdir");
    let shutdown = CancellationToken::new();
    let board = three_roles();
    let mut engine = Orchestrator::new(
        config(&dir),
        registry(&[Arc::clone(&board)]),
        Some(role_scores()),
        profile(),
        shutdown.clone(),
    );
    shutdown.cancel();

    let report = engine.run().await.expect("run");
    assert_eq!(report.total_cycles, 0);
    assert!(board.applied().is_empty());
}

#[tokio::test]
async fn stats_write_failures_are_retried_then_escalate() {
    let dir = tempdir().expect("tempdir");
    let config = EngineConfig {
        max_persistence_failures: 2,
        ..config(&dir)
    };
    let stats_dir = config.stats_dir();
    let mut engine = Orchestrator::new(
        config,
        registry(&[three_roles()]),
        Some(role_scores()),
        profile(),
        CancellationToken::new(),
    );
    engine.load().await.expect("load");

    // A plain file where the stats directory belongs makes every stats write fail.
    std::fs::create_dir_all(stats_dir.parent().expect("parent")).expect("state dir");
    std::fs::write(&stats_dir, b"blocked").expect("blocker");

    let first = engine.run_cycle().await.expect("one failed write is tolerated");
    assert_eq!(first.cycle_number, 1);
    assert!(engine.stats().has_unpersisted().await);
    assert_eq!(engine.stats().snapshot().history.len(), 1);

    std::fs::remove_file(&stats_dir).expect("unblock");
    engine.run_cycle().await.expect("second cycle");
    assert!(!engine.stats().has_unpersisted().await);
    let persisted = StatsStore::read_history_file(&stats_dir).await.expect("history");
    assert_eq!(
        persisted.iter().map(|c| c.cycle_number).collect::<Vec<_>>(),
        vec![1, 2]
    );

    std::fs::remove_dir_all(&stats_dir).expect("clear stats");
    std::fs::write(&stats_dir, b"blocked").expect("blocker");
    engine.run_cycle().await.expect("failure count was reset by the good write");
    match engine.run_cycle().await {
        Err(EngineError::Persistence {
            consecutive_failures, ..
        }) => assert_eq!(consecutive_failures, 2),
        other => panic!("expected a persistence error, got {other:?}"),
    }
}
