//! Append-only cycle history plus a running-totals snapshot.
//!
//! Readers get an `Arc` to an immutable snapshot that is swapped whole on every write,
//! so a concurrent monitor sees either the previous or the next state.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use autoapply_core::{CycleStats, RunTotals};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{write_atomic, StoreError};

pub const HISTORY_FILE: &str = "cycles.jsonl";
pub const TOTALS_FILE: &str = "totals.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub totals: RunTotals,
    pub history: Vec<CycleStats>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    pub fn last_cycle(&self) -> Option<&CycleStats> {
        self.history.last()
    }

    pub fn next_cycle_number(&self) -> u64 {
        self.history.last().map(|c| c.cycle_number + 1).unwrap_or(1)
    }
}

/// What `totals.json` holds; also what an out-of-process monitor reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalsFile {
    pub totals: RunTotals,
    pub last_cycle: Option<CycleStats>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_cycles: u64,
    pub totals: RunTotals,
    pub success_rate: f64,
    pub applied_fingerprints: usize,
    pub last_cycle: Option<CycleStats>,
}

#[derive(Debug)]
pub struct StatsStore {
    root: PathBuf,
    current: RwLock<Arc<StatsSnapshot>>,
    unpersisted: Mutex<Vec<CycleStats>>,
}

impl StatsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: RwLock::new(Arc::new(StatsSnapshot::default())),
            unpersisted: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild history and totals from `cycles.jsonl`. Returns the number of cycles loaded.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let history = read_history(&self.root).await?;
        let mut totals = RunTotals::default();
        for cycle in &history {
            totals.absorb(cycle);
        }
        let count = history.len();
        self.swap(StatsSnapshot {
            totals,
            history,
            updated_at: Some(Utc::now()),
        });
        Ok(count)
    }

    /// Publish the cycle in memory immediately, then persist it along with any cycles
    /// a previous failed attempt left behind. On error the cycle stays queued for the
    /// next `record` or `flush`.
    pub async fn record(&self, stats: CycleStats) -> Result<(), StoreError> {
        let previous = self.snapshot();
        let mut next = StatsSnapshot::clone(&previous);
        next.totals.absorb(&stats);
        next.history.push(stats.clone());
        next.updated_at = Some(Utc::now());
        self.swap(next);

        self.unpersisted.lock().await.push(stats);
        self.flush().await
    }

    /// Persist queued cycles and rewrite the totals snapshot.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let mut queued = self.unpersisted.lock().await;
        if !queued.is_empty() {
            append_history(&self.root, &queued).await?;
            debug!(cycles = queued.len(), "cycle history appended");
            queued.clear();
        }
        drop(queued);

        let snapshot = self.snapshot();
        let totals = TotalsFile {
            totals: snapshot.totals.clone(),
            last_cycle: snapshot.last_cycle().cloned(),
            updated_at: snapshot.updated_at.unwrap_or_else(Utc::now),
        };
        let bytes = serde_json::to_vec_pretty(&totals)?;
        write_atomic(&self.root.join(TOTALS_FILE), &bytes).await
    }

    pub async fn has_unpersisted(&self) -> bool {
        !self.unpersisted.lock().await.is_empty()
    }

    /// Never blocks on persistence; only waits for a pointer swap.
    pub fn snapshot(&self) -> Arc<StatsSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn totals(&self) -> RunTotals {
        self.snapshot().totals.clone()
    }

    pub fn final_report(&self, run_id: &str, applied_fingerprints: usize) -> FinalReport {
        let snapshot = self.snapshot();
        FinalReport {
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            total_cycles: snapshot.totals.cycles,
            success_rate: snapshot.totals.success_rate(),
            totals: snapshot.totals.clone(),
            applied_fingerprints,
            last_cycle: snapshot.last_cycle().cloned(),
        }
    }

    /// Read the persisted totals without a running engine.
    pub async fn read_totals_file(root: &Path) -> Result<Option<TotalsFile>, StoreError> {
        let path = root.join(TOTALS_FILE);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(path, err)),
        }
    }

    /// Read the persisted cycle history without a running engine.
    pub async fn read_history_file(root: &Path) -> Result<Vec<CycleStats>, StoreError> {
        read_history(root).await
    }

    fn swap(&self, next: StatsSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

async fn read_history(root: &Path) -> Result<Vec<CycleStats>, StoreError> {
    let path = root.join(HISTORY_FILE);
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(path, err)),
    };

    let mut seen = HashSet::new();
    let mut history = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<CycleStats>(line) {
            // A retried append can repeat a cycle; the first copy is authoritative.
            Ok(cycle) if seen.insert(cycle.cycle_number) => history.push(cycle),
            Ok(_) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable cycle history line"),
        }
    }
    history.sort_by_key(|c| c.cycle_number);
    Ok(history)
}

async fn append_history(root: &Path, cycles: &[CycleStats]) -> Result<(), StoreError> {
    fs::create_dir_all(root)
        .await
        .map_err(|e| StoreError::io(root, e))?;
    let path = root.join(HISTORY_FILE);

    let mut buf = Vec::new();
    for cycle in cycles {
        serde_json::to_writer(&mut buf, cycle)?;
        buf.push(b'\n');
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| StoreError::io(&path, e))?;

    // Terminate a torn tail left by an interrupted append before adding new lines.
    let len = file
        .metadata()
        .await
        .map_err(|e| StoreError::io(&path, e))?
        .len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.read_exact(&mut last)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if last[0] != b'\n' {
            buf.insert(0, b'\n');
        }
    }

    file.write_all(&buf)
        .await
        .map_err(|e| StoreError::io(&path, e))?;
    file.sync_data()
        .await
        .map_err(|e| StoreError::io(&path, e))
}
