//! Process-wide run state owned by the orchestrator, and the read-only snapshot it
//! publishes for monitors.

use std::fmt;

use autoapply_core::{CycleStats, RunTotals};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    Idle,
    Searching,
    Scoring,
    Filtering,
    Dispatching,
    Reporting,
    Sleeping,
    ShuttingDown,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "IDLE",
            CyclePhase::Searching => "SEARCHING",
            CyclePhase::Scoring => "SCORING",
            CyclePhase::Filtering => "FILTERING",
            CyclePhase::Dispatching => "DISPATCHING",
            CyclePhase::Reporting => "REPORTING",
            CyclePhase::Sleeping => "SLEEPING",
            CyclePhase::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(name)
    }
}

/// What an external observer sees. Cheap to clone; never borrowed from the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub run_id: String,
    pub phase: CyclePhase,
    pub cycle_number: u64,
    pub totals: RunTotals,
    pub success_rate: f64,
    pub last_cycle: Option<CycleStats>,
    /// Postings handed to the dispatcher in the current cycle.
    pub dispatch_queue: usize,
    pub shutdown_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub type MonitorReceiver = watch::Receiver<MonitorSnapshot>;

#[derive(Debug)]
pub struct SystemState {
    run_id: String,
    started_at: DateTime<Utc>,
    cycle_number: u64,
    phase: CyclePhase,
    totals: RunTotals,
    last_cycle: Option<CycleStats>,
    dispatch_queue: usize,
    shutdown: CancellationToken,
    monitor: watch::Sender<MonitorSnapshot>,
}

impl SystemState {
    pub fn new(shutdown: CancellationToken) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let initial = MonitorSnapshot {
            run_id: run_id.clone(),
            phase: CyclePhase::Idle,
            cycle_number: 0,
            totals: RunTotals::default(),
            success_rate: 0.0,
            last_cycle: None,
            dispatch_queue: 0,
            shutdown_requested: shutdown.is_cancelled(),
            started_at,
            updated_at: started_at,
        };
        let (monitor, _) = watch::channel(initial);
        Self {
            run_id,
            started_at,
            cycle_number: 0,
            phase: CyclePhase::Idle,
            totals: RunTotals::default(),
            last_cycle: None,
            dispatch_queue: 0,
            shutdown,
            monitor,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cycle_number(&self) -> u64 {
        self.cycle_number
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn totals(&self) -> &RunTotals {
        &self.totals
    }

    pub fn subscribe(&self) -> MonitorReceiver {
        self.monitor.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Seed counters from persisted history so numbering continues across restarts.
    pub fn restore(&mut self, totals: RunTotals, last_cycle: Option<CycleStats>) {
        self.cycle_number = last_cycle.as_ref().map(|c| c.cycle_number).unwrap_or(0);
        self.totals = totals;
        self.last_cycle = last_cycle;
        self.publish();
    }

    pub fn enter(&mut self, phase: CyclePhase) {
        if self.phase != phase {
            debug!(cycle = self.cycle_number, from = %self.phase, to = %phase, "phase transition");
        }
        self.phase = phase;
        if phase != CyclePhase::Dispatching {
            self.dispatch_queue = 0;
        }
        self.publish();
    }

    pub fn begin_cycle(&mut self) -> u64 {
        self.cycle_number += 1;
        self.publish();
        self.cycle_number
    }

    pub fn set_dispatch_queue(&mut self, queued: usize) {
        self.dispatch_queue = queued;
        self.publish();
    }

    pub fn complete_cycle(&mut self, stats: &CycleStats) {
        self.totals.absorb(stats);
        self.last_cycle = Some(stats.clone());
        self.publish();
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            run_id: self.run_id.clone(),
            phase: self.phase,
            cycle_number: self.cycle_number,
            totals: self.totals.clone(),
            success_rate: self.totals.success_rate(),
            last_cycle: self.last_cycle.clone(),
            dispatch_queue: self.dispatch_queue,
            shutdown_requested: self.shutdown.is_cancelled(),
            started_at: self.started_at,
            updated_at: Utc::now(),
        }
    }

    fn publish(&self) {
        self.monitor.send_replace(self.snapshot());
    }
}
