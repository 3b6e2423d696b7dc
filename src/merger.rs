//! Folds Completed ledger records into the run's summary artifact.
//!
//! `summary.jsonl` holds one `{"id":…,"result":…}` row per line, sorted by ID. Merges only add rows:
//! rows already present are kept, and a row that disagrees with the ledger aborts the merge.

use crate::file_handler::{read_optional, with_storage_retries, write_atomic};
use crate::ledger::Ledger;
use crate::lock::FileLock;
use crate::FitRunError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const MERGE_LOCK_STALE: Duration = Duration::from_secs(600);
const MERGE_LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub id: String,
    pub result: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub rows: usize,
    pub added: usize,
    /// False when the artifact was already up to date and left untouched.
    pub written: bool,
}

#[derive(Debug, Clone)]
pub struct BatchMerger {
    ledger: Ledger,
}

impl BatchMerger {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Merge, waiting a bounded time for a concurrent merge to finish.
    pub fn merge(&self) -> Result<MergeReport, FitRunError> {
        let _lock = self.lock(MERGE_LOCK_WAIT)?;
        self.merge_locked(true)
    }

    /// Merge unless another process is merging right now.
    pub fn try_merge(&self) -> Result<Option<MergeReport>, FitRunError> {
        let lock_path = self.ledger.paths().merge_lock_path();
        match FileLock::try_acquire(&lock_path, MERGE_LOCK_STALE)? {
            Some(_lock) => self.merge_locked(true).map(Some),
            None => Ok(None),
        }
    }

    /// Regenerate the artifact from the ledger alone, discarding the current file.
    pub fn rebuild(&self) -> Result<MergeReport, FitRunError> {
        let _lock = self.lock(MERGE_LOCK_WAIT)?;
        self.merge_locked(false)
    }

    pub fn read_summary(&self) -> Result<BTreeMap<String, Value>, FitRunError> {
        let path = self.ledger.paths().summary_path();
        let Some(bytes) = with_storage_retries(|| read_optional(&path))? else {
            return Ok(BTreeMap::new());
        };

        let mut rows = BTreeMap::new();
        for line in String::from_utf8_lossy(&bytes).lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: SummaryRow = serde_json::from_str(line)?;
            if rows.insert(row.id.clone(), row.result).is_some() {
                return Err(FitRunError::MergeConflict { id: row.id });
            }
        }
        Ok(rows)
    }

    fn lock(&self, wait: Duration) -> Result<FileLock, FitRunError> {
        let lock_path = self.ledger.paths().merge_lock_path();
        FileLock::acquire(&lock_path, MERGE_LOCK_STALE, wait)?
            .ok_or_else(|| FitRunError::MergeBusy(self.ledger.paths().name().to_string()))
    }

    fn merge_locked(&self, keep_existing: bool) -> Result<MergeReport, FitRunError> {
        let path = self.ledger.paths().summary_path();
        let existing_bytes = with_storage_retries(|| read_optional(&path))?;
        let mut rows = if keep_existing { self.read_summary()? } else { BTreeMap::new() };
        let before = rows.len();

        for (id, result) in self.ledger.completed_results()? {
            match rows.get(&id) {
                Some(existing) if *existing != result => {
                    tracing::error!(run = self.ledger.paths().name(), id = %id, "summary row disagrees with ledger");
                    return Err(FitRunError::MergeConflict { id });
                }
                Some(_) => {}
                None => {
                    rows.insert(id, result);
                }
            }
        }

        let mut out = Vec::new();
        for (id, result) in rows.iter() {
            let row = SummaryRow { id: id.clone(), result: result.clone() };
            serde_json::to_writer(&mut out, &row)?;
            out.push(b'\n');
        }

        let report = MergeReport {
            rows: rows.len(),
            added: rows.len().saturating_sub(before),
            written: existing_bytes.as_deref() != Some(out.as_slice()),
        };
        if report.written {
            write_atomic(&path, &out)?;
        }
        tracing::info!(
            run = self.ledger.paths().name(),
            rows = report.rows,
            added = report.added,
            written = report.written,
            "merged summary"
        );
        Ok(report)
    }
}
