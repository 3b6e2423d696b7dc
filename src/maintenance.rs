//! Operator-invoked upkeep for a run: status, stale-claim detection, clean and purge.
//!
//! Nothing here runs automatically. A claim left behind by a dead worker stays Claimed until an
//! operator resets it with `reset_stale` or `clean`.

use crate::file_handler::{remove_if_exists, remove_temp_files, RunPaths};
use crate::ledger::{ClaimLease, Ledger, ObjectStatus};
use crate::registry::{signal_terminate, WorkerEntry, WorkerRegistry};
use crate::FitRunError;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::Duration;

/// Heartbeat age after which a worker is presumed dead.
pub const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub claimed: usize,
    pub unclaimed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub evicted_workers: Vec<WorkerEntry>,
    pub signalled: usize,
    pub reset_claims: Vec<ClaimLease>,
    pub removed_temp_files: usize,
    pub merge_lock_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    OwnerNotRegistered,
    HeartbeatExpired { age_secs: u64 },
    ProcessGone { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleClaim {
    pub lease: ClaimLease,
    pub reason: StaleReason,
}

impl StaleClaim {
    pub fn as_error(&self) -> FitRunError {
        FitRunError::StaleClaim {
            id: self.lease.id.clone(),
            owner: self.lease.owner.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunMaintenance {
    ledger: Ledger,
    registry: WorkerRegistry,
    grace: Duration,
}

impl RunMaintenance {
    pub fn new(paths: RunPaths) -> Self {
        Self {
            ledger: Ledger::new(paths.clone()),
            registry: WorkerRegistry::new(paths),
            grace: DEFAULT_STALE_GRACE,
        }
    }

    /// Heartbeat age past which `clean` no longer signals a worker's pid.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn report_status(&self) -> Result<StatusReport, FitRunError> {
        let mut report = StatusReport::default();
        for record in self.ledger.load_all()?.values() {
            report.total += 1;
            match record.status {
                ObjectStatus::Completed => report.completed += 1,
                ObjectStatus::Failed => report.failed += 1,
                ObjectStatus::Claimed => report.claimed += 1,
                ObjectStatus::Unclaimed => report.unclaimed += 1,
            }
        }
        Ok(report)
    }

    /// Claims whose owner looks dead. Detection only; nothing is changed.
    pub fn stale_claims(&self, grace: Duration) -> Result<Vec<StaleClaim>, FitRunError> {
        let workers: FxHashMap<String, _> = self
            .registry
            .workers()?
            .into_iter()
            .map(|w| (w.entry.token.clone(), w))
            .collect();

        let mut stale = Vec::new();
        for lease in self.ledger.claims()? {
            let reason = match workers.get(&lease.owner) {
                None => Some(StaleReason::OwnerNotRegistered),
                Some(worker) if worker.heartbeat_age > grace => Some(StaleReason::HeartbeatExpired {
                    age_secs: worker.heartbeat_age.as_secs(),
                }),
                Some(worker) if worker.entry.process_running() == Some(false) => {
                    Some(StaleReason::ProcessGone { pid: worker.entry.pid })
                }
                Some(_) => None,
            };
            if let Some(reason) = reason {
                stale.push(StaleClaim { lease, reason });
            }
        }
        Ok(stale)
    }

    /// Reset exactly the claims `stale_claims` reports, provided they have not changed hands since.
    pub fn reset_stale(&self, grace: Duration) -> Result<Vec<StaleClaim>, FitRunError> {
        let mut reset = Vec::new();
        for claim in self.stale_claims(grace)? {
            if self.ledger.remove_claim_if_owned(&claim.lease.id, &claim.lease.owner)? {
                tracing::warn!(
                    run = self.ledger.paths().name(),
                    id = %claim.lease.id,
                    owner = %claim.lease.owner,
                    reason = ?claim.reason,
                    "reset stale claim"
                );
                reset.push(claim);
            }
        }
        Ok(reset)
    }

    /// Stop every worker of the run and return all in-progress objects to Unclaimed.
    /// Completed and Failed records are never touched. Only local workers with a heartbeat within
    /// the grace period whose process is still theirs get SIGTERM.
    pub fn clean(&self) -> Result<CleanReport, FitRunError> {
        let run = self.ledger.paths().name().to_string();
        let mut report = CleanReport::default();

        for worker in self.registry.evict_all()? {
            let entry = worker.entry;
            let live = worker.heartbeat_age <= self.grace && entry.process_running() == Some(true);
            if live && signal_terminate(entry.pid) {
                report.signalled += 1;
            } else if !live {
                tracing::debug!(run = %run, worker = %entry.token, pid = entry.pid, "not signalling dead or remote worker");
            }
            tracing::info!(run = %run, worker = %entry.token, pid = entry.pid, "evicted worker");
            report.evicted_workers.push(entry);
        }

        for lease in self.ledger.claims()? {
            if let Some(lease) = self.ledger.reset_claim(&lease.id)? {
                report.reset_claims.push(lease);
            }
        }

        let paths = self.ledger.paths();
        for dir in [paths.claims_dir(), paths.outcomes_dir(), paths.workers_dir(), paths.root().to_path_buf()] {
            report.removed_temp_files += remove_temp_files(&dir)?;
        }
        report.merge_lock_removed = remove_if_exists(&paths.merge_lock_path())?;

        tracing::info!(
            run = %run,
            workers = report.evicted_workers.len(),
            signalled = report.signalled,
            claims = report.reset_claims.len(),
            "cleaned run"
        );
        Ok(report)
    }

    /// Clean, then delete the run directory entirely.
    pub fn purge(&self) -> Result<CleanReport, FitRunError> {
        let report = self.clean()?;
        std::fs::remove_dir_all(self.ledger.paths().root())?;
        tracing::info!(run = self.ledger.paths().name(), "purged run");
        Ok(report)
    }
}
