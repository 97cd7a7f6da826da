//! Bounded worker pool that applies to the postings a cycle selected.
//!
//! Workers drain a shared queue in priority order. Each item is reserved in the
//! fingerprint store first, journaled as `Pending`, attempted with a per-attempt
//! timeout and fixed-delay retries, and its terminal record is written to the store
//! before the worker takes the next item. Records flow back over a result channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use autoapply_adapters::{AdapterRegistry, ApplyOutcome, SourceAdapter};
use autoapply_core::{ApplicationRecord, Fingerprint, JobPosting, MatchResult, Profile, ReasonCode};
use autoapply_storage::FingerprintStore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::EngineConfig;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrent: usize,
    /// Pause after each application before the worker takes another item.
    pub application_delay: Duration,
    pub attempt_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub shutdown_grace: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_applications.max(1),
            application_delay: config.application_delay(),
            attempt_timeout: config.attempt_timeout(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub posting: JobPosting,
    pub matched: MatchResult,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Terminal records, in completion order.
    pub records: Vec<ApplicationRecord>,
    /// Items left in the queue because shutdown arrived first.
    pub not_started: usize,
    /// Journal writes that failed; the records stay in memory until the next flush.
    pub journal_failures: usize,
    /// True when the grace period expired and workers were aborted.
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
enum Flight {
    Attempting(ApplicationRecord),
    /// Terminal record decided, store write under way.
    Finalizing(ApplicationRecord),
}

type InFlight = Arc<Mutex<HashMap<Fingerprint, Flight>>>;

#[derive(Debug)]
enum WorkerEvent {
    Record(ApplicationRecord),
    JournalFailure,
    NotStarted,
}

#[derive(Clone)]
pub struct Dispatcher {
    settings: DispatchSettings,
    adapters: AdapterRegistry,
    fingerprints: Arc<FingerprintStore>,
    profile: Arc<Profile>,
}

impl Dispatcher {
    pub fn new(
        settings: DispatchSettings,
        adapters: AdapterRegistry,
        fingerprints: Arc<FingerprintStore>,
        profile: Arc<Profile>,
    ) -> Self {
        Self {
            settings,
            adapters,
            fingerprints,
            profile,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Apply to `items` in order with at most `max_concurrent` attempts in flight.
    pub async fn dispatch(&self, items: Vec<DispatchItem>, shutdown: &CancellationToken) -> DispatchReport {
        let total = items.len();
        let mut report = DispatchReport::default();
        if total == 0 {
            return report;
        }

        let (queue_tx, queue_rx) = mpsc::channel(total);
        for item in items {
            if queue_tx.try_send(item).is_err() {
                report.not_started += 1;
            }
        }
        drop(queue_tx);
        let queue = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let worker_count = self.settings.max_concurrent.max(1).min(total);
        debug!(items = total, workers = worker_count, "dispatch started");

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let worker = Worker {
                id,
                dispatcher: self.clone(),
                queue: Arc::clone(&queue),
                events: events_tx.clone(),
                in_flight: Arc::clone(&in_flight),
                shutdown: shutdown.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(events_tx);

        report.interrupted = await_workers(&mut workers, shutdown, self.settings.shutdown_grace).await;
        if report.interrupted {
            warn!(aborted = workers.len(), "shutdown grace period expired; abandoning in-flight applications");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        while let Ok(event) = events_rx.try_recv() {
            match event {
                WorkerEvent::Record(record) => report.records.push(record),
                WorkerEvent::JournalFailure => report.journal_failures += 1,
                WorkerEvent::NotStarted => report.not_started += 1,
            }
        }

        let leftovers: Vec<Flight> = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, flight)| flight)
            .collect();
        for flight in leftovers {
            let record = match flight {
                Flight::Finalizing(record) => record,
                Flight::Attempting(record) if report.interrupted => {
                    record.failed(ReasonCode::Shutdown, "abandoned after shutdown grace period")
                }
                Flight::Attempting(record) => record.failed(ReasonCode::Transient, "dispatch worker stopped unexpectedly"),
            };
            if let Err(err) = self.fingerprints.record(record.clone()).await {
                warn!(fingerprint = %record.fingerprint.short(), error = %err, "could not journal abandoned application");
                report.journal_failures += 1;
            }
            report.records.push(record);
        }

        let mut queue = queue.lock().await;
        while queue.try_recv().is_ok() {
            report.not_started += 1;
        }

        debug!(
            records = report.records.len(),
            not_started = report.not_started,
            interrupted = report.interrupted,
            "dispatch finished"
        );
        report
    }
}

/// Wait for every worker. Once shutdown is requested the wait is bounded by `grace`;
/// returns true when that bound expired with workers still running.
async fn await_workers(workers: &mut JoinSet<()>, shutdown: &CancellationToken, grace: Duration) -> bool {
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                None => return false,
                Some(Err(err)) if err.is_panic() => error!(error = %err, "dispatch worker panicked"),
                Some(_) => {}
            },
            _ = shutdown.cancelled() => break,
        }
    }

    info!(
        running = workers.len(),
        grace_ms = grace.as_millis() as u64,
        "shutdown requested; waiting for in-flight applications"
    );
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = workers.join_next() => if joined.is_none() {
                return false;
            },
            _ = &mut deadline => return true,
        }
    }
}

struct Worker {
    id: usize,
    dispatcher: Dispatcher,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchItem>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    in_flight: InFlight,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let next = self.queue.lock().await.recv().await;
            let Some(item) = next else {
                break;
            };
            if self.shutdown.is_cancelled() {
                let _ = self.events.send(WorkerEvent::NotStarted);
                break;
            }

            let applied = self.process(item).await;
            if applied && !self.dispatcher.settings.application_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.dispatcher.settings.application_delay) => {}
                }
            }
        }
        debug!(worker = self.id, "dispatch worker finished");
    }

    /// Returns true when the adapter was actually called.
    async fn process(&self, item: DispatchItem) -> bool {
        let fingerprint = item.matched.fingerprint.clone();
        let span = info_span!(
            "apply",
            fingerprint = %fingerprint.short(),
            source_id = %item.posting.source_id,
            score = item.matched.score
        );
        async {
            let store = &self.dispatcher.fingerprints;
            let pending = ApplicationRecord::pending(&item.posting, fingerprint.clone());

            if !store.try_reserve(&fingerprint) {
                debug!("fingerprint already owned; skipping");
                // Not written to the store: the owner's record must not be overwritten.
                let _ = self.events.send(WorkerEvent::Record(
                    pending.skipped(ReasonCode::Duplicate, "fingerprint already reserved"),
                ));
                return false;
            }

            let Some(adapter) = self.dispatcher.adapters.get(&item.posting.source_id) else {
                warn!("no enabled adapter for source; skipping");
                let note = format!("no enabled adapter for source {}", item.posting.source_id);
                self.finalize(pending.skipped(ReasonCode::NoAdapter, note)).await;
                return false;
            };

            if let Err(err) = store.record(pending.clone()).await {
                warn!(error = %err, "could not journal pending application; releasing reservation");
                store.release(&fingerprint);
                let _ = self.events.send(WorkerEvent::JournalFailure);
                return false;
            }

            let record = self.attempt(adapter.as_ref(), &item.posting, pending).await;
            self.finalize(record).await;
            true
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, adapter: &dyn SourceAdapter, posting: &JobPosting, mut record: ApplicationRecord) -> ApplicationRecord {
        let settings = &self.dispatcher.settings;
        let profile = self.dispatcher.profile.as_ref();
        let cover_letter = profile.render_cover_letter(posting);
        let max_attempts = settings.max_retries.saturating_add(1);

        loop {
            record.attempt_count += 1;
            let attempt = record.attempt_count;
            self.track(Flight::Attempting(record.clone()));

            let outcome = tokio::time::timeout(
                settings.attempt_timeout,
                adapter.apply(posting, profile, &cover_letter),
            )
            .await;
            let (reason, error) = match outcome {
                Ok(ApplyOutcome::Succeeded) => {
                    info!(attempt, "application succeeded");
                    return record.succeeded();
                }
                Ok(ApplyOutcome::PermanentlyInvalid(why)) => {
                    warn!(attempt, reason = %why, "posting rejected permanently");
                    return record.failed(ReasonCode::Permanent, why);
                }
                Ok(ApplyOutcome::Failed(why)) => (ReasonCode::Transient, why),
                Err(_) => (
                    ReasonCode::Timeout,
                    format!("attempt exceeded {} ms", settings.attempt_timeout.as_millis()),
                ),
            };

            if attempt >= max_attempts {
                warn!(attempt, reason = ?reason, error = %error, "retries exhausted");
                return record.failed(reason, error);
            }
            warn!(
                attempt,
                reason = ?reason,
                error = %error,
                retry_in_ms = settings.retry_delay.as_millis() as u64,
                "transient application failure; retrying"
            );
            record.last_error = Some(error.clone());

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!(attempt, "shutdown during retry backoff");
                    return record.failed(ReasonCode::Shutdown, format!("shutdown before retry; last error: {error}"));
                }
                _ = tokio::time::sleep(settings.retry_delay) => {}
            }
        }
    }

    /// Persist the terminal record, then hand it back. Removal from the in-flight map
    /// and the send happen without an await between them.
    async fn finalize(&self, record: ApplicationRecord) {
        self.track(Flight::Finalizing(record.clone()));
        if let Err(err) = self.dispatcher.fingerprints.record(record.clone()).await {
            warn!(error = %err, "could not journal application outcome; kept in memory until next flush");
            let _ = self.events.send(WorkerEvent::JournalFailure);
        }
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&record.fingerprint);
        let _ = self.events.send(WorkerEvent::Record(record));
    }

    fn track(&self, flight: Flight) {
        let fingerprint = match &flight {
            Flight::Attempting(record) | Flight::Finalizing(record) => record.fingerprint.clone(),
        };
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint, flight);
    }
}
