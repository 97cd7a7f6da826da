//! Durable set of fingerprints the engine has reserved or applied to.
//!
//! Layout under the store root:
//! - `fingerprints.json`: compacted snapshot (latest record per fingerprint), replaced atomically.
//! - `fingerprints.journal`: JSON lines appended and fsynced by `record`, truncated by `flush`.
//!
//! `load` replays the journal over the snapshot. Lines that do not parse (a torn append)
//! are skipped, so an interrupted write never takes earlier entries with it.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use autoapply_core::{ApplicationRecord, Fingerprint, Outcome, ReasonCode, FINGERPRINT_SCHEME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::StoreError;

pub const SNAPSHOT_FILE: &str = "fingerprints.json";
pub const JOURNAL_FILE: &str = "fingerprints.journal";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    scheme: String,
    compacted_at: DateTime<Utc>,
    records: Vec<ApplicationRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum JournalLine {
    Header { scheme: String },
    Entry(ApplicationRecord),
}

#[derive(Debug, Clone)]
enum Slot {
    Reserved,
    Recorded(ApplicationRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub records: usize,
    pub replayed: usize,
    pub skipped_lines: usize,
    /// Records still `Pending` on disk: the process died mid-application.
    pub interrupted: usize,
}

#[derive(Debug)]
pub struct FingerprintStore {
    root: PathBuf,
    slots: Arc<Mutex<HashMap<Fingerprint, Slot>>>,
    journal: Arc<Mutex<Option<File>>>,
}

impl FingerprintStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Arc::new(Mutex::new(HashMap::new())),
            journal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace in-memory state with what is on disk. Call before any cycle runs.
    pub async fn load(&self) -> Result<LoadSummary, StoreError> {
        let root = self.root.clone();
        let slots = Arc::clone(&self.slots);
        let journal = Arc::clone(&self.journal);
        tokio::task::spawn_blocking(move || load_blocking(&root, &slots, &journal)).await?
    }

    /// True once the fingerprint is reserved or recorded.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock_slots().contains_key(fingerprint)
    }

    /// Atomic check-and-reserve: exactly one caller wins per fingerprint, ever.
    pub fn try_reserve(&self, fingerprint: &Fingerprint) -> bool {
        let mut slots = self.lock_slots();
        if slots.contains_key(fingerprint) {
            return false;
        }
        slots.insert(fingerprint.clone(), Slot::Reserved);
        true
    }

    /// Drop a reservation that never reached a terminal record, so a later cycle may
    /// pick the posting up again. Terminal records are never released.
    pub fn release(&self, fingerprint: &Fingerprint) -> bool {
        let mut slots = self.lock_slots();
        let releasable = match slots.get(fingerprint) {
            Some(Slot::Reserved) => true,
            Some(Slot::Recorded(record)) => !record.is_terminal(),
            None => false,
        };
        if releasable {
            slots.remove(fingerprint);
        }
        releasable
    }

    /// Overwrites any earlier entry for the same fingerprint. Durable once this returns `Ok`.
    pub async fn record(&self, record: ApplicationRecord) -> Result<(), StoreError> {
        self.lock_slots()
            .insert(record.fingerprint.clone(), Slot::Recorded(record.clone()));

        let mut line = serde_json::to_vec(&JournalLine::Entry(record))?;
        line.push(b'\n');

        let root = self.root.clone();
        let journal = Arc::clone(&self.journal);
        tokio::task::spawn_blocking(move || {
            let mut guard = journal.lock().unwrap_or_else(PoisonError::into_inner);
            let path = root.join(JOURNAL_FILE);
            let file = ensure_journal(&root, &mut guard)?;
            file.write_all(&line).map_err(|e| StoreError::io(&path, e))?;
            file.sync_data().map_err(|e| StoreError::io(&path, e))
        })
        .await?
    }

    /// Compact: write every recorded entry to the snapshot, then truncate the journal.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let root = self.root.clone();
        let slots = Arc::clone(&self.slots);
        let journal = Arc::clone(&self.journal);
        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
            let mut journal_guard = journal.lock().unwrap_or_else(PoisonError::into_inner);
            let records = recorded_entries(&slots.lock().unwrap_or_else(PoisonError::into_inner));
            let count = records.len();

            let snapshot = Snapshot {
                scheme: FINGERPRINT_SCHEME.to_string(),
                compacted_at: Utc::now(),
                records,
            };
            let bytes = serde_json::to_vec_pretty(&snapshot)?;
            write_atomic_blocking(&root.join(SNAPSHOT_FILE), &bytes)?;

            let path = root.join(JOURNAL_FILE);
            let file = ensure_journal(&root, &mut journal_guard)?;
            file.set_len(0).map_err(|e| StoreError::io(&path, e))?;
            write_header(file, &path)?;
            debug!(records = count, "fingerprint store compacted");
            Ok(count)
        })
        .await?
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ApplicationRecord> {
        match self.lock_slots().get(fingerprint) {
            Some(Slot::Recorded(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// Every record persisted under `root`, sorted by fingerprint, exactly as written:
    /// `Pending` stays `Pending` and neither file is created, repaired or truncated.
    /// Safe to call while an engine owns the store.
    pub async fn read_records(root: impl Into<PathBuf>) -> Result<Vec<ApplicationRecord>, StoreError> {
        let root = root.into();
        tokio::task::spawn_blocking(move || {
            let mut records = read_on_disk(&root)?.records.into_values().collect::<Vec<_>>();
            records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
            Ok(records)
        })
        .await?
    }

    /// Recorded entries sorted by fingerprint.
    pub fn records(&self) -> Vec<ApplicationRecord> {
        recorded_entries(&self.lock_slots())
    }

    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<Fingerprint, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn recorded_entries(slots: &HashMap<Fingerprint, Slot>) -> Vec<ApplicationRecord> {
    let mut records = slots
        .values()
        .filter_map(|slot| match slot {
            Slot::Recorded(record) => Some(record.clone()),
            Slot::Reserved => None,
        })
        .collect::<Vec<_>>();
    records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    records
}

fn check_scheme(found: &str) -> Result<(), StoreError> {
    if found == FINGERPRINT_SCHEME {
        Ok(())
    } else {
        Err(StoreError::SchemeMismatch {
            found: found.to_string(),
            expected: FINGERPRINT_SCHEME.to_string(),
        })
    }
}

/// What the snapshot and journal hold, as written; nothing on disk is touched.
struct OnDisk {
    records: HashMap<Fingerprint, ApplicationRecord>,
    replayed: usize,
    skipped_lines: usize,
    torn_tail: bool,
}

fn read_on_disk(root: &Path) -> Result<OnDisk, StoreError> {
    let mut disk = OnDisk {
        records: HashMap::new(),
        replayed: 0,
        skipped_lines: 0,
        torn_tail: false,
    };

    let snapshot_path = root.join(SNAPSHOT_FILE);
    if snapshot_path.exists() {
        let bytes = fs::read(&snapshot_path).map_err(|e| StoreError::io(&snapshot_path, e))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        check_scheme(&snapshot.scheme)?;
        for record in snapshot.records {
            disk.records.insert(record.fingerprint.clone(), record);
        }
    }

    let journal_path = root.join(JOURNAL_FILE);
    if journal_path.exists() {
        let bytes = fs::read(&journal_path).map_err(|e| StoreError::io(&journal_path, e))?;
        disk.torn_tail = bytes.last().is_some_and(|b| *b != b'\n');
        for raw in bytes.split(|b| *b == b'\n') {
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<JournalLine>(raw) {
                Ok(JournalLine::Header { scheme }) => check_scheme(&scheme)?,
                Ok(JournalLine::Entry(record)) => {
                    disk.replayed += 1;
                    disk.records.insert(record.fingerprint.clone(), record);
                }
                Err(err) => {
                    disk.skipped_lines += 1;
                    warn!(path = %journal_path.display(), error = %err, "skipping unreadable fingerprint journal line");
                }
            }
        }
    }
    Ok(disk)
}

fn load_blocking(
    root: &Path,
    slots: &Mutex<HashMap<Fingerprint, Slot>>,
    journal: &Mutex<Option<File>>,
) -> Result<LoadSummary, StoreError> {
    fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
    let OnDisk {
        records: mut loaded,
        replayed,
        skipped_lines,
        torn_tail,
    } = read_on_disk(root)?;
    let mut summary = LoadSummary {
        replayed,
        skipped_lines,
        ..LoadSummary::default()
    };
    let journal_path = root.join(JOURNAL_FILE);

    for record in loaded.values_mut() {
        if record.outcome == Outcome::Pending {
            summary.interrupted += 1;
            warn!(fingerprint = %record.fingerprint.short(), source_id = %record.source_id, "application was interrupted by a restart; marking failed");
            *record = record
                .clone()
                .failed(ReasonCode::Shutdown, "interrupted before a terminal outcome was recorded");
        }
    }

    summary.records = loaded.len();
    *slots.lock().unwrap_or_else(PoisonError::into_inner) = loaded
        .into_iter()
        .map(|(fp, record)| (fp, Slot::Recorded(record)))
        .collect();

    let mut guard = journal.lock().unwrap_or_else(PoisonError::into_inner);
    *guard = None;
    let file = ensure_journal(root, &mut guard)?;
    if torn_tail {
        // Terminate the torn line so the next append starts clean.
        file.write_all(b"\n")
            .map_err(|e| StoreError::io(&journal_path, e))?;
        file.sync_data()
            .map_err(|e| StoreError::io(&journal_path, e))?;
    }
    Ok(summary)
}

fn ensure_journal<'a>(root: &Path, slot: &'a mut Option<File>) -> Result<&'a mut File, StoreError> {
    let file = match slot.take() {
        Some(file) => file,
        None => {
            fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
            let path = root.join(JOURNAL_FILE);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StoreError::io(&path, e))?;
            let len = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();
            if len == 0 {
                write_header(&mut file, &path)?;
            }
            file
        }
    };
    Ok(slot.insert(file))
}

fn write_header(file: &mut File, path: &Path) -> Result<(), StoreError> {
    let mut header = serde_json::to_vec(&JournalLine::Header {
        scheme: FINGERPRINT_SCHEME.to_string(),
    })?;
    header.push(b'\n');
    file.write_all(&header).map_err(|e| StoreError::io(path, e))?;
    file.sync_data().map_err(|e| StoreError::io(path, e))
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{SNAPSHOT_FILE}.{}.tmp", Uuid::new_v4()));
    let result = (|| {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(bytes).map_err(|e| StoreError::io(&temp_path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&temp_path, e))?;
        fs::rename(&temp_path, path).map_err(|e| StoreError::io(path, e))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    } else if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoapply_core::JobPosting;
    use tempfile::tempdir;

    fn posting(n: usize) -> JobPosting {
        JobPosting {
            source_id: "remotive".into(),
            external_url: format!("https://jobs.test/{n}"),
            title: format!("Engineer {n}"),
            company: "Acme".into(),
            raw_text: String::new(),
            discovered_at: Utc::now(),
        }
    }

    fn succeeded(n: usize) -> ApplicationRecord {
        let p = posting(n);
        ApplicationRecord::pending(&p, p.fingerprint()).succeeded()
    }

    #[tokio::test]
    async fn recorded_fingerprints_survive_restart() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        store.load().await.expect("load");
        let record = succeeded(1);
        let fp = record.fingerprint.clone();
        store.record(record).await.expect("record");
        assert!(store.contains(&fp));

        let reopened = FingerprintStore::new(dir.path());
        let summary = reopened.load().await.expect("reload");
        assert_eq!(summary.records, 1);
        assert_eq!(summary.replayed, 1);
        assert!(reopened.contains(&fp));
        assert_eq!(reopened.get(&fp).expect("record").outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn recording_twice_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        store.load().await.expect("load");
        let p = posting(7);
        let pending = ApplicationRecord::pending(&p, p.fingerprint());
        store.record(pending.clone()).await.expect("pending");
        store.record(pending.succeeded()).await.expect("terminal");
        assert_eq!(store.records().len(), 1);

        let reopened = FingerprintStore::new(dir.path());
        reopened.load().await.expect("reload");
        assert_eq!(reopened.records().len(), 1);
        assert_eq!(reopened.records()[0].outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn only_one_concurrent_reservation_wins() {
        let store = Arc::new(FingerprintStore::new(tempdir().expect("tempdir").path()));
        let fp = posting(3).fingerprint();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            let fp = fp.clone();
            handles.push(tokio::spawn(async move { store.try_reserve(&fp) }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(store.contains(&fp));
    }

    #[tokio::test]
    async fn release_only_frees_unfinished_reservations() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        let open = posting(1).fingerprint();
        assert!(store.try_reserve(&open));
        assert!(store.release(&open));
        assert!(!store.contains(&open));

        let record = succeeded(2);
        let done = record.fingerprint.clone();
        assert!(store.try_reserve(&done));
        store.record(record).await.expect("record");
        assert!(!store.release(&done));
        assert!(store.contains(&done));
    }

    #[tokio::test]
    async fn flush_compacts_journal_into_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        store.load().await.expect("load");
        for n in 0..5 {
            store.record(succeeded(n)).await.expect("record");
        }
        assert_eq!(store.flush().await.expect("flush"), 5);

        let journal = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).expect("journal");
        assert_eq!(journal.lines().count(), 1, "only the header remains");
        assert!(dir.path().join(SNAPSHOT_FILE).exists());

        let reopened = FingerprintStore::new(dir.path());
        let summary = reopened.load().await.expect("reload");
        assert_eq!(summary.records, 5);
        assert_eq!(summary.replayed, 0);
    }

    #[tokio::test]
    async fn torn_journal_line_does_not_lose_committed_entries() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        store.load().await.expect("load");
        store.record(succeeded(1)).await.expect("record");
        store.record(succeeded(2)).await.expect("record");
        drop(store);

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE))
            .expect("open journal");
        file.write_all(b"{\"fingerprint\":\"abc\",\"sour").expect("torn write");
        drop(file);

        let reopened = FingerprintStore::new(dir.path());
        let summary = reopened.load().await.expect("reload");
        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped_lines, 1);

        // Appends after the torn line stay readable.
        reopened.record(succeeded(3)).await.expect("record after tear");
        let again = FingerprintStore::new(dir.path());
        assert_eq!(again.load().await.expect("reload").records, 3);
    }

    #[tokio::test]
    async fn pending_entries_on_disk_become_shutdown_failures() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        store.load().await.expect("load");
        let p = posting(9);
        store
            .record(ApplicationRecord::pending(&p, p.fingerprint()))
            .await
            .expect("pending");

        let reopened = FingerprintStore::new(dir.path());
        let summary = reopened.load().await.expect("reload");
        assert_eq!(summary.interrupted, 1);
        let record = reopened.get(&p.fingerprint()).expect("record");
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.reason, Some(ReasonCode::Shutdown));
    }

    #[tokio::test]
    async fn read_records_leaves_files_and_outcomes_as_written() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        store.load().await.expect("load");
        store.record(succeeded(1)).await.expect("record");
        let p = posting(2);
        store
            .record(ApplicationRecord::pending(&p, p.fingerprint()))
            .await
            .expect("pending");

        let journal_path = dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&journal_path).expect("open journal");
        file.write_all(b"{\"fingerprint\":\"ab").expect("torn write");
        drop(file);
        let before = std::fs::read(&journal_path).expect("journal");

        let records = FingerprintStore::read_records(dir.path()).await.expect("read");
        assert_eq!(records.len(), 2);
        let pending = records
            .iter()
            .find(|r| r.fingerprint == p.fingerprint())
            .expect("pending record");
        assert_eq!(pending.outcome, Outcome::Pending);
        assert_eq!(pending.reason, None);
        assert_eq!(std::fs::read(&journal_path).expect("journal"), before);
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());
        assert_eq!(store.get(&p.fingerprint()).expect("live").outcome, Outcome::Pending);
    }

    #[tokio::test]
    async fn read_records_of_a_missing_store_is_empty() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("never-created");
        assert!(FingerprintStore::read_records(&root).await.expect("read").is_empty());
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn poisoned_lock_does_not_stop_the_store() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        store.load().await.expect("load");

        let slots = Arc::clone(&store.slots);
        let _ = std::thread::spawn(move || {
            let _guard = slots.lock().expect("first lock");
            panic!("holder died");
        })
        .join();
        assert!(store.slots.is_poisoned());

        let record = succeeded(1);
        let fp = record.fingerprint.clone();
        store.record(record).await.expect("record");
        assert!(store.contains(&fp));
        assert_eq!(store.flush().await.expect("flush"), 1);
    }

    #[tokio::test]
    async fn foreign_scheme_is_rejected() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(SNAPSHOT_FILE),
            br#"{"scheme":"v0:md5","compacted_at":"2026-01-01T00:00:00Z","records":[]}"#,
        )
        .expect("seed snapshot");
        let store = FingerprintStore::new(dir.path());
        let err = store.load().await.expect_err("scheme mismatch");
        assert!(matches!(err, StoreError::SchemeMismatch { .. }));
    }
}
