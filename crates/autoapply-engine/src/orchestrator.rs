//! The cycle state machine:
//! `IDLE -> SEARCHING -> SCORING -> FILTERING -> DISPATCHING -> REPORTING -> SLEEPING -> ...`,
//! ending in `SHUTTING_DOWN` once the shutdown token is cancelled.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use autoapply_adapters::{
    AdapterContext, AdapterError, AdapterRegistry, KeywordScorer, MatchScorer, PostingStream, RemoteScorer,
};
use autoapply_core::{CycleStats, Fingerprint, JobPosting, MatchResult, Profile, ScoreSource, SearchQuery};
use autoapply_storage::{FinalReport, FingerprintStore, HttpFetcher, OutboxStore, StatsStore};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::dispatcher::{DispatchItem, DispatchSettings, Dispatcher};
use crate::report;
use crate::state::{CyclePhase, MonitorReceiver, SystemState};
use crate::EngineError;

const SCORING_CONCURRENCY: usize = 4;

/// Keep postings at or above `min_score` that the store does not know yet, highest
/// score first. Equal scores keep their discovery order (source order, then position).
pub fn select_for_dispatch<F>(
    mut scored: Vec<DispatchItem>,
    min_score: u32,
    max_items: usize,
    already_recorded: F,
) -> Vec<DispatchItem>
where
    F: Fn(&Fingerprint) -> bool,
{
    scored.retain(|item| {
        let keep = u32::from(item.matched.score) >= min_score && !already_recorded(&item.matched.fingerprint);
        if !keep {
            debug!(
                fingerprint = %item.matched.fingerprint.short(),
                score = item.matched.score,
                "posting filtered out"
            );
        }
        keep
    });
    scored.sort_by(|a, b| b.matched.score.cmp(&a.matched.score));
    scored.truncate(max_items);
    scored
}

async fn collect_postings(stream: PostingStream) -> Result<Vec<JobPosting>, AdapterError> {
    stream.try_collect().await
}

pub struct Orchestrator {
    config: EngineConfig,
    adapters: AdapterRegistry,
    primary_scorer: Option<Arc<dyn MatchScorer>>,
    fallback_scorer: KeywordScorer,
    fingerprints: Arc<FingerprintStore>,
    stats: Arc<StatsStore>,
    dispatcher: Dispatcher,
    profile: Arc<Profile>,
    query: SearchQuery,
    state: SystemState,
    persistence_failures: u32,
    loaded: bool,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        adapters: AdapterRegistry,
        primary_scorer: Option<Arc<dyn MatchScorer>>,
        profile: Profile,
        shutdown: CancellationToken,
    ) -> Self {
        let fingerprints = Arc::new(FingerprintStore::new(config.fingerprint_dir()));
        let stats = Arc::new(StatsStore::new(config.stats_dir()));
        let profile = Arc::new(profile);
        let dispatcher = Dispatcher::new(
            DispatchSettings::from_config(&config),
            adapters.clone(),
            Arc::clone(&fingerprints),
            Arc::clone(&profile),
        );
        let min_score = u8::try_from(config.min_match_score).unwrap_or(100);
        Self {
            query: config.search_query(&profile),
            fallback_scorer: KeywordScorer::new(min_score),
            config,
            adapters,
            primary_scorer,
            fingerprints,
            stats,
            dispatcher,
            profile,
            state: SystemState::new(shutdown),
            persistence_failures: 0,
            loaded: false,
        }
    }

    /// Validate the configuration and build every collaborator it names.
    pub fn from_config(config: EngineConfig, shutdown: CancellationToken) -> Result<Self, EngineError> {
        config.validate()?;
        let profile = config.load_profile()?;
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config())
                .map_err(|e| EngineError::FatalConfig(format!("building http client: {e}")))?,
        );
        let ctx = AdapterContext {
            http: Arc::clone(&http),
            outbox: OutboxStore::new(&config.outbox_dir),
            base_dir: PathBuf::from("."),
        };
        let adapters = AdapterRegistry::from_specs(&config.sources, &config.enabled_sources, &ctx)
            .map_err(|e| EngineError::FatalConfig(e.to_string()))?;
        let min_score = u8::try_from(config.min_match_score).unwrap_or(100);
        let primary = config.scorer.endpoint.as_ref().map(|endpoint| {
            Arc::new(RemoteScorer::new(Arc::clone(&http), endpoint.clone(), min_score)) as Arc<dyn MatchScorer>
        });
        Ok(Self::new(config, adapters, primary, profile, shutdown))
    }

    pub fn subscribe(&self) -> MonitorReceiver {
        self.state.subscribe()
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn fingerprints(&self) -> Arc<FingerprintStore> {
        Arc::clone(&self.fingerprints)
    }

    pub fn stats(&self) -> Arc<StatsStore> {
        Arc::clone(&self.stats)
    }

    /// Load both stores and continue numbering from the persisted history.
    pub async fn load(&mut self) -> Result<(), EngineError> {
        let summary = self.fingerprints.load().await?;
        if summary.interrupted > 0 {
            warn!(
                interrupted = summary.interrupted,
                "applications interrupted by an earlier crash were recorded as shutdown failures"
            );
        }
        let cycles = self.stats.load().await?;
        let snapshot = self.stats.snapshot();
        self.state
            .restore(snapshot.totals.clone(), snapshot.last_cycle().cloned());
        info!(
            fingerprints = summary.records,
            skipped_lines = summary.skipped_lines,
            cycles,
            "persisted state loaded"
        );
        self.loaded = true;
        Ok(())
    }

    /// Cycle until shutdown is requested, then shut down and return the final report.
    pub async fn run(&mut self) -> Result<FinalReport, EngineError> {
        if !self.loaded {
            self.load().await?;
        }
        let shutdown = self.state.shutdown_token();
        info!(
            run_id = %self.state.run_id(),
            sources = ?self.adapters.source_ids(),
            interval_secs = self.config.search_interval,
            "continuous engine started"
        );

        while !shutdown.is_cancelled() {
            let stats = self.run_cycle().await?;
            if shutdown.is_cancelled() {
                break;
            }

            // Measured from the recorded start so consecutive starts are an interval apart.
            self.state.enter(CyclePhase::Sleeping);
            let elapsed = (Utc::now() - stats.started_at).to_std().unwrap_or_default();
            let remaining = self.config.search_interval().saturating_sub(elapsed);
            debug!(sleep_ms = remaining.as_millis() as u64, "sleeping until next cycle");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        self.shutdown().await
    }

    /// Exactly one cycle, then the shutdown sequence.
    pub async fn run_once(&mut self) -> Result<FinalReport, EngineError> {
        if !self.loaded {
            self.load().await?;
        }
        self.run_cycle().await?;
        self.shutdown().await
    }

    pub async fn run_cycle(&mut self) -> Result<CycleStats, EngineError> {
        let cycle = self.state.begin_cycle();
        let span = info_span!("cycle", cycle, run_id = %self.state.run_id());
        self.cycle_phases(cycle).instrument(span).await
    }

    async fn cycle_phases(&mut self, cycle: u64) -> Result<CycleStats, EngineError> {
        let shutdown = self.state.shutdown_token();
        let mut stats = CycleStats::begin(cycle);

        self.state.enter(CyclePhase::Searching);
        let discovered = self.search(&mut stats, &shutdown).await;
        stats.postings_seen = discovered.len() as u64;

        self.state.enter(CyclePhase::Scoring);
        let scored = self.score(discovered, &mut stats, &shutdown).await;

        self.state.enter(CyclePhase::Filtering);
        let fingerprints = Arc::clone(&self.fingerprints);
        let selected = select_for_dispatch(
            scored,
            self.config.min_match_score,
            self.config.max_applications_per_cycle,
            |fp| fingerprints.contains(fp),
        );

        self.state.enter(CyclePhase::Dispatching);
        let report = if shutdown.is_cancelled() {
            info!(skipped = selected.len(), "shutdown requested; nothing dispatched this cycle");
            Default::default()
        } else {
            self.state.set_dispatch_queue(selected.len());
            self.dispatcher.dispatch(selected, &shutdown).await
        };
        if report.journal_failures > 0 {
            warn!(
                failures = report.journal_failures,
                "some application records were not journaled; the cycle flush will retry"
            );
        }

        self.state.enter(CyclePhase::Reporting);
        stats.absorb_records(&report.records);
        stats.ended_at = Utc::now();
        self.report_cycle(&stats).await?;
        Ok(stats)
    }

    async fn search(&self, stats: &mut CycleStats, shutdown: &CancellationToken) -> Vec<JobPosting> {
        let timeout = self.config.source_timeout();
        let searches = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            let query = self.query.clone();
            async move {
                let source_id = adapter.source_id().to_string();
                let outcome = tokio::time::timeout(timeout, collect_postings(adapter.search(&query))).await;
                (source_id, outcome)
            }
        });

        let results = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("shutdown requested during search");
                return Vec::new();
            }
            results = futures::future::join_all(searches) => results,
        };

        let mut postings = Vec::new();
        for (source_id, outcome) in results {
            match outcome {
                Ok(Ok(found)) => {
                    info!(source_id = %source_id, found = found.len(), "source searched");
                    postings.extend(found);
                }
                Ok(Err(err)) => {
                    warn!(source_id = %source_id, error = %err, "source failed; it contributes no postings this cycle");
                    stats.source_failures += 1;
                }
                Err(_) => {
                    warn!(
                        source_id = %source_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "source timed out; it contributes no postings this cycle"
                    );
                    stats.source_failures += 1;
                }
            }
        }
        postings
    }

    /// Drop known and repeated fingerprints first, then score what is left.
    async fn score(
        &self,
        postings: Vec<JobPosting>,
        stats: &mut CycleStats,
        shutdown: &CancellationToken,
    ) -> Vec<DispatchItem> {
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for posting in postings {
            let fingerprint = posting.fingerprint();
            if self.fingerprints.contains(&fingerprint) || !seen.insert(fingerprint) {
                stats.duplicates_skipped += 1;
                continue;
            }
            fresh.push(posting);
        }

        let scored: Vec<(JobPosting, MatchResult, bool)> = stream::iter(fresh)
            .take_until(shutdown.cancelled())
            .map(|posting| async move {
                let (matched, fell_back) = self.score_one(&posting).await;
                (posting, matched, fell_back)
            })
            .buffered(SCORING_CONCURRENCY)
            .collect()
            .await;

        scored
            .into_iter()
            .map(|(posting, matched, fell_back)| {
                stats.postings_scored += 1;
                if fell_back {
                    stats.scorer_fallbacks += 1;
                }
                DispatchItem { posting, matched }
            })
            .collect()
    }

    async fn score_one(&self, posting: &JobPosting) -> (MatchResult, bool) {
        let fingerprint = posting.fingerprint();
        let mut fell_back = false;

        if let Some(primary) = &self.primary_scorer {
            let timeout = self.config.scorer_timeout();
            match tokio::time::timeout(timeout, primary.score(posting, &self.profile)).await {
                Ok(Ok(mut matched)) => {
                    matched.fingerprint = fingerprint;
                    return (matched, false);
                }
                Ok(Err(err)) => warn!(
                    fingerprint = %fingerprint.short(),
                    source_id = %posting.source_id,
                    scorer = primary.name(),
                    error = %err,
                    "scorer unavailable; using heuristic"
                ),
                Err(_) => warn!(
                    fingerprint = %fingerprint.short(),
                    source_id = %posting.source_id,
                    scorer = primary.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "scorer timed out; using heuristic"
                ),
            }
            fell_back = true;
        }

        let matched = match self.fallback_scorer.score(posting, &self.profile).await {
            Ok(matched) => matched,
            Err(err) => MatchResult::new(fingerprint, 0.0, false, err.to_string(), ScoreSource::Heuristic),
        };
        (matched, fell_back)
    }

    async fn report_cycle(&mut self, stats: &CycleStats) -> Result<(), EngineError> {
        self.state.complete_cycle(stats);
        info!(
            seen = stats.postings_seen,
            scored = stats.postings_scored,
            applied = stats.postings_applied,
            successes = stats.successes,
            failures = stats.failures,
            duplicates = stats.duplicates_skipped,
            source_failures = stats.source_failures,
            scorer_fallbacks = stats.scorer_fallbacks,
            duration_secs = stats.duration_secs(),
            "cycle complete"
        );
        let totals = self.state.totals();
        info!(
            cycles = totals.cycles,
            applied = totals.postings_applied,
            successes = totals.successes,
            failures = totals.failures,
            success_rate = format!("{:.1}%", totals.success_rate()),
            "running totals"
        );

        let recorded = self.stats.record(stats.clone()).await;
        let flushed = self.fingerprints.flush().await.map(|_| ());
        match recorded.and(flushed) {
            Ok(()) => {
                self.persistence_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.persistence_failures += 1;
                error!(
                    consecutive_failures = self.persistence_failures,
                    error = %err,
                    "persisting cycle state failed; it stays queued for the next flush"
                );
                if self.persistence_failures >= self.config.max_persistence_failures {
                    return Err(EngineError::Persistence {
                        consecutive_failures: self.persistence_failures,
                        source: err,
                    });
                }
                Ok(())
            }
        }
    }

    /// Flush both stores and write the final report. Store failures are fatal here.
    pub async fn shutdown(&mut self) -> Result<FinalReport, EngineError> {
        self.state.enter(CyclePhase::ShuttingDown);
        info!(run_id = %self.state.run_id(), "shutting down");

        self.stats.flush().await?;
        self.fingerprints.flush().await?;

        let final_report = self
            .stats
            .final_report(self.state.run_id(), self.fingerprints.records().len());
        let history = self.stats.snapshot();
        match report::write_final_report(&self.config.reports_dir, &final_report, &history.history).await {
            Ok(dir) => info!(path = %dir.display(), "final report written"),
            Err(err) => error!(error = %err, "writing final report failed"),
        }
        info!(
            cycles = final_report.total_cycles,
            successes = final_report.totals.successes,
            failures = final_report.totals.failures,
            success_rate = format!("{:.1}%", final_report.success_rate),
            "engine stopped"
        );
        Ok(final_report)
    }
}
