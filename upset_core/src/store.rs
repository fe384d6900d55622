//! The result store: campaign, result, injection, diff and event relations
//! keyed by auto-incrementing ids.

use crate::campaign::{
    Campaign, EventRecord, InjectionRecord, MemoryDiffRecord, RegisterDiffRecord, ResultRecord,
};
use crate::worker::CancellationToken;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{relation} {id} not found")]
    NotFound { relation: &'static str, id: u64 },

    #[error("No campaign found")]
    NoCampaign,

    #[error("Result store I/O error: {0}")]
    Io(String),

    #[error("Result store serialization error: {0}")]
    Serialization(String),

    #[error("Result store deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Serialization(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Inserts assign the record's `id`; updates replace the row with the same id.
pub trait ResultStore: Send + Sync {
    fn insert_campaign(&self, campaign: &mut Campaign) -> Result<(), StoreError>;
    fn update_campaign(&self, campaign: &Campaign) -> Result<(), StoreError>;
    /// The campaign with `id`, or the most recent one.
    fn campaign(&self, id: Option<u64>) -> Result<Campaign, StoreError>;

    fn insert_result(&self, result: &mut ResultRecord) -> Result<(), StoreError>;
    fn update_result(&self, result: &ResultRecord) -> Result<(), StoreError>;
    /// Deletes a result together with everything attached to it.
    fn delete_result(&self, id: u64) -> Result<(), StoreError>;
    fn result(&self, id: u64) -> Result<ResultRecord, StoreError>;
    fn results_for(&self, campaign_id: u64) -> Result<Vec<ResultRecord>, StoreError>;

    fn insert_injection(&self, injection: &mut InjectionRecord) -> Result<(), StoreError>;
    fn injections_for(&self, result_id: u64) -> Result<Vec<InjectionRecord>, StoreError>;

    fn insert_register_diff(&self, diff: &mut RegisterDiffRecord) -> Result<(), StoreError>;
    fn insert_memory_diff(&self, diff: &mut MemoryDiffRecord) -> Result<(), StoreError>;
    fn register_diffs_for(&self, result_id: u64) -> Result<Vec<RegisterDiffRecord>, StoreError>;

    fn insert_event(&self, event: &mut EventRecord) -> Result<(), StoreError>;
    fn events_for(&self, result_id: u64) -> Result<Vec<EventRecord>, StoreError>;

    /// Whether any injection, diff or event refers to the result.
    fn has_children(&self, result_id: u64) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Sequences {
    campaign: u64,
    result: u64,
    injection: u64,
    register_diff: u64,
    memory_diff: u64,
    event: u64,
}

/// A single row-level change. Writes are validated against the current
/// tables, persisted, and only then applied, so a failed write leaves the
/// tables untouched and a retry assigns the same ids again.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", content = "row", rename_all = "kebab-case")]
enum Change {
    Campaign(Campaign),
    Result(ResultRecord),
    Injection(InjectionRecord),
    RegisterDiff(RegisterDiffRecord),
    MemoryDiff(MemoryDiffRecord),
    Event(EventRecord),
    DeleteResult(u64),
}

/// Replaces the row with the same id or appends it. Sequences never move
/// backwards, so ids of deleted rows are not reused.
fn upsert<T>(rows: &mut Vec<T>, row: T, id: impl Fn(&T) -> u64, sequence: &mut u64) {
    let row_id = id(&row);
    *sequence = (*sequence).max(row_id);
    match rows.iter().position(|r| id(r) == row_id) {
        Some(i) => rows[i] = row,
        None => rows.push(row),
    }
}

#[derive(Debug, Default)]
struct Tables {
    sequences: Sequences,
    campaigns: Vec<Campaign>,
    results: Vec<ResultRecord>,
    injections: Vec<InjectionRecord>,
    register_diffs: Vec<RegisterDiffRecord>,
    memory_diffs: Vec<MemoryDiffRecord>,
    events: Vec<EventRecord>,
}

impl Tables {
    fn has_result(&self, id: u64) -> Result<(), StoreError> {
        if self.results.iter().any(|r| r.id == id) {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                relation: "Result",
                id,
            })
        }
    }

    fn apply(&mut self, change: Change) {
        let seq = &mut self.sequences;
        match change {
            Change::Campaign(row) => upsert(&mut self.campaigns, row, |c: &Campaign| c.id, &mut seq.campaign),
            Change::Result(row) => upsert(&mut self.results, row, |r: &ResultRecord| r.id, &mut seq.result),
            Change::Injection(row) => {
                upsert(&mut self.injections, row, |i: &InjectionRecord| i.id, &mut seq.injection)
            }
            Change::RegisterDiff(row) => upsert(
                &mut self.register_diffs,
                row,
                |d: &RegisterDiffRecord| d.id,
                &mut seq.register_diff,
            ),
            Change::MemoryDiff(row) => upsert(
                &mut self.memory_diffs,
                row,
                |d: &MemoryDiffRecord| d.id,
                &mut seq.memory_diff,
            ),
            Change::Event(row) => upsert(&mut self.events, row, |e: &EventRecord| e.id, &mut seq.event),
            Change::DeleteResult(id) => {
                self.results.retain(|r| r.id != id);
                self.injections.retain(|i| i.result_id != id);
                self.register_diffs.retain(|d| d.result_id != id);
                self.memory_diffs.retain(|d| d.result_id != id);
                self.events.retain(|e| e.result_id != Some(id));
            }
        }
    }
}

/// Shared row logic of the stores; a backend only decides how changes are
/// made durable.
trait TableBackend: Send + Sync {
    fn tables(&self) -> &Mutex<Tables>;

    fn persist(&self, _changes: &[Change]) -> Result<(), StoreError> {
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let tables = self.tables().lock().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    fn write(&self, f: impl FnOnce(&Tables) -> Result<Vec<Change>, StoreError>) -> Result<(), StoreError> {
        let mut tables = self.tables().lock().unwrap_or_else(PoisonError::into_inner);
        let changes = f(&tables)?;
        self.persist(&changes)?;
        for change in changes {
            tables.apply(change);
        }
        Ok(())
    }
}

impl<B: TableBackend> ResultStore for B {
    fn insert_campaign(&self, campaign: &mut Campaign) -> Result<(), StoreError> {
        self.write(|t| {
            campaign.id = t.sequences.campaign + 1;
            Ok(vec![Change::Campaign(campaign.clone())])
        })
    }

    fn update_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.write(|t| {
            if !t.campaigns.iter().any(|c| c.id == campaign.id) {
                return Err(StoreError::NotFound {
                    relation: "Campaign",
                    id: campaign.id,
                });
            }
            Ok(vec![Change::Campaign(campaign.clone())])
        })
    }

    fn campaign(&self, id: Option<u64>) -> Result<Campaign, StoreError> {
        self.read(|t| match id {
            Some(id) => t
                .campaigns
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or(StoreError::NotFound {
                    relation: "Campaign",
                    id,
                }),
            None => t
                .campaigns
                .iter()
                .max_by_key(|c| c.id)
                .cloned()
                .ok_or(StoreError::NoCampaign),
        })
    }

    fn insert_result(&self, result: &mut ResultRecord) -> Result<(), StoreError> {
        self.write(|t| {
            result.id = t.sequences.result + 1;
            Ok(vec![Change::Result(result.clone())])
        })
    }

    fn update_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
        self.write(|t| {
            t.has_result(result.id)?;
            Ok(vec![Change::Result(result.clone())])
        })
    }

    fn delete_result(&self, id: u64) -> Result<(), StoreError> {
        self.write(|t| {
            t.has_result(id)?;
            Ok(vec![Change::DeleteResult(id)])
        })
    }

    fn result(&self, id: u64) -> Result<ResultRecord, StoreError> {
        self.read(|t| {
            t.results
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .ok_or(StoreError::NotFound {
                    relation: "Result",
                    id,
                })
        })
    }

    fn results_for(&self, campaign_id: u64) -> Result<Vec<ResultRecord>, StoreError> {
        self.read(|t| {
            Ok(t.results
                .iter()
                .filter(|r| r.campaign_id == campaign_id)
                .cloned()
                .collect())
        })
    }

    fn insert_injection(&self, injection: &mut InjectionRecord) -> Result<(), StoreError> {
        self.write(|t| {
            injection.id = t.sequences.injection + 1;
            Ok(vec![Change::Injection(injection.clone())])
        })
    }

    fn injections_for(&self, result_id: u64) -> Result<Vec<InjectionRecord>, StoreError> {
        self.read(|t| {
            let mut injections: Vec<_> = t
                .injections
                .iter()
                .filter(|i| i.result_id == result_id)
                .cloned()
                .collect();
            injections.sort_by_key(|i| i.injection_number);
            Ok(injections)
        })
    }

    fn insert_register_diff(&self, diff: &mut RegisterDiffRecord) -> Result<(), StoreError> {
        self.write(|t| {
            diff.id = t.sequences.register_diff + 1;
            Ok(vec![Change::RegisterDiff(diff.clone())])
        })
    }

    fn insert_memory_diff(&self, diff: &mut MemoryDiffRecord) -> Result<(), StoreError> {
        self.write(|t| {
            diff.id = t.sequences.memory_diff + 1;
            Ok(vec![Change::MemoryDiff(diff.clone())])
        })
    }

    fn register_diffs_for(&self, result_id: u64) -> Result<Vec<RegisterDiffRecord>, StoreError> {
        self.read(|t| {
            Ok(t.register_diffs
                .iter()
                .filter(|d| d.result_id == result_id)
                .cloned()
                .collect())
        })
    }

    fn insert_event(&self, event: &mut EventRecord) -> Result<(), StoreError> {
        self.write(|t| {
            event.id = t.sequences.event + 1;
            Ok(vec![Change::Event(event.clone())])
        })
    }

    fn events_for(&self, result_id: u64) -> Result<Vec<EventRecord>, StoreError> {
        self.read(|t| {
            Ok(t.events
                .iter()
                .filter(|e| e.result_id == Some(result_id))
                .cloned()
                .collect())
        })
    }

    fn has_children(&self, result_id: u64) -> Result<bool, StoreError> {
        self.read(|t| {
            Ok(t.injections.iter().any(|i| i.result_id == result_id)
                || t.register_diffs.iter().any(|d| d.result_id == result_id)
                || t.memory_diffs.iter().any(|d| d.result_id == result_id)
                || t.events.iter().any(|e| e.result_id == Some(result_id)))
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    tables: Mutex<Tables>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableBackend for InMemoryResultStore {
    fn tables(&self) -> &Mutex<Tables> {
        &self.tables
    }
}

const JOURNAL_FILE: &str = "journal.jsonl";

/// Keeps every change as one JSON line in an append-only journal. Opening
/// the store replays the journal; a write costs one appended line.
#[derive(Debug)]
pub struct JsonResultStore {
    dir: PathBuf,
    journal: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonResultStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| {
            StoreError::Io(format!("Failed to create store directory {:?}: {}", dir, e))
        })?;
        let journal = dir.join(JOURNAL_FILE);
        let mut tables = Tables::default();
        for change in load_journal(&journal)? {
            tables.apply(change);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            journal,
            tables: Mutex::new(tables),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn load_journal(path: &Path) -> Result<Vec<Change>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)
        .map_err(|e| StoreError::Io(format!("Failed to open {:?}: {}", path, e)))?;
    let mut changes = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| StoreError::Io(format!("Failed to read {:?}: {}", path, e)))?;
        if line.trim().is_empty() {
            continue;
        }
        let change = serde_json::from_str(&line).map_err(|e| {
            StoreError::Deserialization(format!(
                "Failed to parse line {} of {:?}: {}. The file might be corrupted.",
                number + 1,
                path,
                e
            ))
        })?;
        changes.push(change);
    }
    Ok(changes)
}

impl TableBackend for JsonResultStore {
    fn tables(&self) -> &Mutex<Tables> {
        &self.tables
    }

    fn persist(&self, changes: &[Change]) -> Result<(), StoreError> {
        let mut batch = Vec::new();
        for change in changes {
            serde_json::to_writer(&mut batch, change).map_err(|e| {
                StoreError::Serialization(format!("Failed to serialize {:?}: {}", change, e))
            })?;
            batch.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)
            .map_err(|e| StoreError::Io(format!("Failed to open {:?}: {}", self.journal, e)))?;
        file.write_all(&batch)
            .map_err(|e| StoreError::Io(format!("Failed to append to {:?}: {}", self.journal, e)))
    }
}

/// Bounded retries with a fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Runs `operation` until it succeeds, fails with an error `retryable`
    /// rejects, the attempts run out or `cancel` fires. The last error is
    /// returned.
    pub fn run<T, E, F>(
        &self,
        what: &str,
        cancel: Option<&CancellationToken>,
        retryable: impl Fn(&E) -> bool,
        mut operation: F,
    ) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts || !retryable(&err) => return Err(err),
                Err(err) => {
                    warn!("{what} failed (attempt {attempt}/{attempts}): {err}");
                    let cancelled = match cancel {
                        Some(token) => token.sleep(self.backoff),
                        None => {
                            std::thread::sleep(self.backoff);
                            false
                        }
                    };
                    if cancelled {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Wraps a store so transient failures are retried before they surface.
pub struct RetryingStore {
    inner: Arc<dyn ResultStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ResultStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn retry<T>(
        &self,
        what: &str,
        mut operation: impl FnMut(&dyn ResultStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.policy
            .run(what, None, StoreError::is_transient, |_| operation(self.inner.as_ref()))
    }
}

impl ResultStore for RetryingStore {
    fn insert_campaign(&self, campaign: &mut Campaign) -> Result<(), StoreError> {
        self.retry("Inserting campaign", |s| s.insert_campaign(campaign))
    }

    fn update_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.retry("Updating campaign", |s| s.update_campaign(campaign))
    }

    fn campaign(&self, id: Option<u64>) -> Result<Campaign, StoreError> {
        self.retry("Reading campaign", |s| s.campaign(id))
    }

    fn insert_result(&self, result: &mut ResultRecord) -> Result<(), StoreError> {
        self.retry("Inserting result", |s| s.insert_result(result))
    }

    fn update_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
        self.retry("Updating result", |s| s.update_result(result))
    }

    fn delete_result(&self, id: u64) -> Result<(), StoreError> {
        self.retry("Deleting result", |s| s.delete_result(id))
    }

    fn result(&self, id: u64) -> Result<ResultRecord, StoreError> {
        self.retry("Reading result", |s| s.result(id))
    }

    fn results_for(&self, campaign_id: u64) -> Result<Vec<ResultRecord>, StoreError> {
        self.retry("Reading results", |s| s.results_for(campaign_id))
    }

    fn insert_injection(&self, injection: &mut InjectionRecord) -> Result<(), StoreError> {
        self.retry("Inserting injection", |s| s.insert_injection(injection))
    }

    fn injections_for(&self, result_id: u64) -> Result<Vec<InjectionRecord>, StoreError> {
        self.retry("Reading injections", |s| s.injections_for(result_id))
    }

    fn insert_register_diff(&self, diff: &mut RegisterDiffRecord) -> Result<(), StoreError> {
        self.retry("Inserting register diff", |s| s.insert_register_diff(diff))
    }

    fn insert_memory_diff(&self, diff: &mut MemoryDiffRecord) -> Result<(), StoreError> {
        self.retry("Inserting memory diff", |s| s.insert_memory_diff(diff))
    }

    fn register_diffs_for(&self, result_id: u64) -> Result<Vec<RegisterDiffRecord>, StoreError> {
        self.retry("Reading register diffs", |s| s.register_diffs_for(result_id))
    }

    fn insert_event(&self, event: &mut EventRecord) -> Result<(), StoreError> {
        self.retry("Inserting event", |s| s.insert_event(event))
    }

    fn events_for(&self, result_id: u64) -> Result<Vec<EventRecord>, StoreError> {
        self.retry("Reading events", |s| s.events_for(result_id))
    }

    fn has_children(&self, result_id: u64) -> Result<bool, StoreError> {
        self.retry("Reading result children", |s| s.has_children(result_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{EventLevel, Mode, OutcomeCategory, now_ms};
    use std::cell::Cell;
    use tempfile::tempdir;

    fn campaign() -> Campaign {
        Campaign::new("p2020", Mode::Simulated, "./app")
    }

    fn injection(result_id: u64, number: u32) -> InjectionRecord {
        InjectionRecord {
            id: 0,
            result_id,
            injection_number: number,
            checkpoint_number: Some(number),
            time: None,
            site: None,
            success: true,
            timestamp_ms: now_ms(),
        }
    }

    #[test]
    fn inserts_assign_increasing_ids() {
        let store = InMemoryResultStore::new();
        let mut c = campaign();
        store.insert_campaign(&mut c).unwrap();
        assert_eq!(c.id, 1);
        let mut first = ResultRecord::placeholder(c.id);
        let mut second = ResultRecord::placeholder(c.id);
        store.insert_result(&mut first).unwrap();
        store.insert_result(&mut second).unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(store.campaign(None).unwrap().id, 1);
        assert_eq!(store.results_for(c.id).unwrap().len(), 2);
    }

    #[test]
    fn delete_result_cascades_to_children() {
        let store = InMemoryResultStore::new();
        let mut result = ResultRecord::placeholder(1);
        store.insert_result(&mut result).unwrap();
        assert!(!store.has_children(result.id).unwrap());
        store.insert_injection(&mut injection(result.id, 1)).unwrap();
        let mut event = EventRecord::new(1, Some(result.id), EventLevel::Info, "DUT", "Command");
        store.insert_event(&mut event).unwrap();
        assert!(store.has_children(result.id).unwrap());

        store.delete_result(result.id).unwrap();
        assert!(store.injections_for(result.id).unwrap().is_empty());
        assert!(store.events_for(result.id).unwrap().is_empty());
        match store.result(result.id) {
            Err(StoreError::NotFound { relation, .. }) => assert_eq!(relation, "Result"),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn injections_are_returned_in_injection_order() {
        let store = InMemoryResultStore::new();
        store.insert_injection(&mut injection(4, 2)).unwrap();
        store.insert_injection(&mut injection(4, 1)).unwrap();
        store.insert_injection(&mut injection(5, 1)).unwrap();
        let numbers: Vec<_> = store
            .injections_for(4)
            .unwrap()
            .iter()
            .map(|i| i.injection_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let result_id = {
            let store = JsonResultStore::open(dir.path()).unwrap();
            let mut c = campaign();
            store.insert_campaign(&mut c).unwrap();
            let mut result = ResultRecord::placeholder(c.id);
            store.insert_result(&mut result).unwrap();
            result.set_outcome("Latent faults", OutcomeCategory::NoError);
            store.update_result(&result).unwrap();
            result.id
        };
        assert!(dir.path().join(JOURNAL_FILE).is_file());

        let store = JsonResultStore::open(dir.path()).unwrap();
        let result = store.result(result_id).unwrap();
        assert_eq!(result.outcome, "Latent faults");
        let mut next = ResultRecord::placeholder(1);
        store.insert_result(&mut next).unwrap();
        assert_eq!(next.id, result_id + 1);
    }

    #[test]
    fn corrupted_journal_fails_to_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(JOURNAL_FILE), "{ not json\n").unwrap();
        match JsonResultStore::open(dir.path()) {
            Err(StoreError::Deserialization(msg)) => assert!(msg.contains("corrupted")),
            other => panic!("Expected Deserialization error, got {other:?}"),
        }
    }

    #[test]
    fn each_change_appends_one_journal_line() {
        let dir = tempdir().unwrap();
        let store = JsonResultStore::open(dir.path()).unwrap();
        let journal = dir.path().join(JOURNAL_FILE);
        let mut result = ResultRecord::placeholder(1);
        store.insert_result(&mut result).unwrap();
        let first = fs::read_to_string(&journal).unwrap();
        store.insert_injection(&mut injection(result.id, 1)).unwrap();
        store.delete_result(result.id).unwrap();
        let after = fs::read_to_string(&journal).unwrap();
        assert!(after.starts_with(&first));
        assert_eq!(after.lines().count(), 3);
    }

    #[test]
    fn deleted_results_stay_deleted_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = JsonResultStore::open(dir.path()).unwrap();
            let mut result = ResultRecord::placeholder(1);
            store.insert_result(&mut result).unwrap();
            store.insert_injection(&mut injection(result.id, 1)).unwrap();
            store.delete_result(result.id).unwrap();
        }
        let store = JsonResultStore::open(dir.path()).unwrap();
        assert!(store.results_for(1).unwrap().is_empty());
        assert!(store.injections_for(1).unwrap().is_empty());
        let mut next = ResultRecord::placeholder(1);
        store.insert_result(&mut next).unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn failed_writes_leave_no_rows_behind() {
        let dir = tempdir().unwrap();
        let store = RetryingStore::new(
            Arc::new(JsonResultStore::open(dir.path()).unwrap()),
            RetryPolicy::new(3, Duration::ZERO),
        );
        let journal = dir.path().join(JOURNAL_FILE);
        fs::create_dir(&journal).unwrap();
        let mut placeholder = ResultRecord::placeholder(1);
        match store.insert_result(&mut placeholder) {
            Err(StoreError::Io(_)) => {}
            other => panic!("Expected Io error, got {other:?}"),
        }
        assert!(store.results_for(1).unwrap().is_empty());

        fs::remove_dir(&journal).unwrap();
        let mut result = ResultRecord::placeholder(1);
        store.insert_result(&mut result).unwrap();
        assert_eq!(result.id, 1);
        assert_eq!(store.results_for(1).unwrap().len(), 1);
        drop(store);

        let reopened = JsonResultStore::open(dir.path()).unwrap();
        let ids: Vec<_> = reopened.results_for(1).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn update_of_missing_result_changes_nothing() {
        let store = InMemoryResultStore::new();
        let mut ghost = ResultRecord::placeholder(1);
        ghost.id = 7;
        match store.update_result(&ghost) {
            Err(StoreError::NotFound { relation, id }) => assert_eq!((relation, id), ("Result", 7)),
            other => panic!("Expected NotFound, got {other:?}"),
        }
        assert!(store.results_for(1).unwrap().is_empty());
    }

    #[test]
    fn retry_policy_stops_at_attempt_limit() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let calls = Cell::new(0);
        let result: Result<(), StoreError> = policy.run("Flaky", None, StoreError::is_transient, |_| {
            calls.set(calls.get() + 1);
            Err(StoreError::Io("disk full".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_policy_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let calls = Cell::new(0);
        let result: Result<(), StoreError> = policy.run("Lookup", None, StoreError::is_transient, |_| {
            calls.set(calls.get() + 1);
            Err(StoreError::NoCampaign)
        });
        assert_eq!(result, Err(StoreError::NoCampaign));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_policy_returns_first_success() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let value = policy
            .run("Eventually", None, |_: &String| true, |attempt| {
                if attempt < 3 { Err(format!("attempt {attempt}")) } else { Ok(attempt) }
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn retrying_store_delegates() {
        let store = RetryingStore::new(
            Arc::new(InMemoryResultStore::new()),
            RetryPolicy::new(2, Duration::ZERO),
        );
        let mut c = campaign();
        store.insert_campaign(&mut c).unwrap();
        assert_eq!(store.campaign(Some(c.id)).unwrap().command, "./app");
        assert_eq!(store.campaign(Some(99)).unwrap_err(), StoreError::NotFound {
            relation: "Campaign",
            id: 99,
        });
    }
}
