use crate::catalogue::CatalogueRun;
use crate::coordinator::{Claim, ClaimBatch, ClaimCoordinator};
use crate::fitter::Fitter;
use crate::ledger::{Ledger, ObjectStatus, Outcome};
use crate::merger::BatchMerger;
use crate::registry::{new_worker_token, WorkerRegistry};
use crate::FitRunError;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rand::Rng;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_MERGE_EVERY: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Completions between opportunistic merges.
    pub merge_every: usize,
    /// Objects claimed per scan.
    pub claim_batch: usize,
    pub heartbeat_interval: Duration,
    /// Upper bound of a random sleep before the first claim.
    pub start_jitter: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            merge_every: DEFAULT_MERGE_EVERY,
            claim_batch: 1,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            start_jitter: Duration::ZERO,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `FITRUN_BATCH_SIZE` and `FITRUN_HEARTBEAT_SECS`.
    pub fn from_env() -> Result<Self, FitRunError> {
        let mut config = Self::default();
        if let Some(batch) = env_number("FITRUN_BATCH_SIZE")? {
            config.merge_every = usize::try_from(batch)
                .map_err(|_| FitRunError::Config(format!("FITRUN_BATCH_SIZE out of range: {}", batch)))?;
        }
        if let Some(secs) = env_number("FITRUN_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FitRunError> {
        if self.merge_every == 0 {
            return Err(FitRunError::Config("batch size must be at least 1".into()));
        }
        if self.claim_batch == 0 {
            return Err(FitRunError::Config("claim batch must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(FitRunError::Config("heartbeat interval must be positive".into()));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u64>, FitRunError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FitRunError::Config(format!("{} is not a number: {:?}", key, value))),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Nothing unclaimed was left.
    Exhausted,
    /// The registry entry was removed by maintenance.
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub token: String,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub lost_races: usize,
    pub merges: usize,
    pub exit: WorkerExit,
}

pub struct Worker {
    run_name: String,
    token: String,
    fit_config: Value,
    config: WorkerConfig,
    ledger: Ledger,
    registry: WorkerRegistry,
    merger: BatchMerger,
}

impl Worker {
    pub fn new(run: &CatalogueRun, config: WorkerConfig) -> Self {
        Self::with_token(run, config, new_worker_token())
    }

    pub fn with_token(run: &CatalogueRun, config: WorkerConfig, token: impl Into<String>) -> Self {
        let ledger = Ledger::new(run.paths().clone());
        Self {
            run_name: run.name().to_string(),
            token: token.into(),
            fit_config: run.config().clone(),
            config,
            registry: WorkerRegistry::new(run.paths().clone()),
            merger: BatchMerger::new(ledger.clone()),
            ledger,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Claim, fit and record until the run is exhausted or the worker is evicted.
    ///
    /// Storage errors end the worker; claims in hand stay Claimed for maintenance to reset.
    pub fn run(&self, fitter: &dyn Fitter) -> Result<WorkerReport, FitRunError> {
        self.config.validate()?;
        if !self.config.start_jitter.is_zero() {
            let max_ms = self.config.start_jitter.as_millis() as u64;
            let delay = rand::thread_rng().gen_range(0..=max_ms);
            std::thread::sleep(Duration::from_millis(delay));
        }

        self.registry.register(&self.token)?;
        tracing::info!(run = %self.run_name, worker = %self.token, "worker started");

        let result = std::thread::scope(|scope| {
            let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
            scope.spawn(move || self.heartbeat_loop(stop_rx));
            let result = self.work_loop(fitter);
            drop(stop_tx);
            result
        });

        if let Err(err) = self.registry.deregister(&self.token) {
            tracing::warn!(run = %self.run_name, worker = %self.token, error = %err, "failed to deregister");
        }
        match &result {
            Ok(report) => tracing::info!(
                run = %self.run_name,
                worker = %self.token,
                completed = report.completed,
                failed = report.failed,
                exit = ?report.exit,
                "worker finished"
            ),
            Err(err) => tracing::error!(run = %self.run_name, worker = %self.token, error = %err, "worker aborted"),
        }
        result
    }

    fn heartbeat_loop(&self, stop: Receiver<()>) {
        loop {
            match stop.recv_timeout(self.config.heartbeat_interval) {
                Err(RecvTimeoutError::Timeout) => match self.registry.heartbeat(&self.token) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        tracing::debug!(worker = %self.token, "registry entry gone, heartbeat stopped");
                        return;
                    }
                    Err(err) => tracing::warn!(worker = %self.token, error = %err, "heartbeat failed"),
                },
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn work_loop(&self, fitter: &dyn Fitter) -> Result<WorkerReport, FitRunError> {
        let coordinator = ClaimCoordinator::new(self.ledger.clone(), self.token.clone());
        let mut report = WorkerReport {
            token: self.token.clone(),
            claimed: 0,
            completed: 0,
            failed: 0,
            lost_races: 0,
            merges: 0,
            exit: WorkerExit::Exhausted,
        };
        let mut since_merge = 0;

        loop {
            if !self.registry.is_registered(&self.token)? {
                report.exit = WorkerExit::Evicted;
                return Ok(report);
            }

            let (batch, stats) = coordinator.claim_next(self.config.claim_batch)?;
            report.lost_races += stats.lost_races;
            let claims = match batch {
                ClaimBatch::Claimed(claims) => claims,
                ClaimBatch::Exhausted => {
                    self.final_merge(&mut report)?;
                    report.exit = WorkerExit::Exhausted;
                    return Ok(report);
                }
            };
            report.claimed += claims.len();

            let mut pending = claims.into_iter();
            while let Some(claim) = pending.next() {
                if !self.registry.is_registered(&self.token)? {
                    self.release_all(std::iter::once(claim).chain(pending))?;
                    report.exit = WorkerExit::Evicted;
                    return Ok(report);
                }

                let outcome = match fitter.fit(&claim.id, &self.fit_config) {
                    Ok(result) => Outcome::Completed { result },
                    Err(failure) => {
                        tracing::warn!(
                            run = %self.run_name,
                            worker = %self.token,
                            id = %claim.id,
                            "{}",
                            FitRunError::FitFailure(failure.message.clone())
                        );
                        Outcome::Failed { error: failure.message }
                    }
                };

                match self.ledger.record_result(&claim.id, &self.token, outcome) {
                    Ok(record) if record.status == ObjectStatus::Completed => {
                        report.completed += 1;
                        since_merge += 1;
                    }
                    Ok(_) => report.failed += 1,
                    Err(err @ (FitRunError::NotClaimOwner { .. } | FitRunError::AlreadyRecorded { .. })) => {
                        tracing::warn!(
                            run = %self.run_name,
                            worker = %self.token,
                            id = %claim.id,
                            error = %err,
                            "result discarded"
                        );
                    }
                    Err(err) => return Err(err),
                }

                if since_merge >= self.config.merge_every {
                    since_merge = 0;
                    if self.merger.try_merge()?.is_some() {
                        report.merges += 1;
                    }
                }
            }
        }
    }

    /// Hand back claims that were never fitted. Ones already reset by maintenance are skipped.
    fn release_all(&self, claims: impl Iterator<Item = Claim>) -> Result<(), FitRunError> {
        for claim in claims {
            match self.ledger.release_claim(&claim.id, &self.token) {
                Ok(_) | Err(FitRunError::NotClaimOwner { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn final_merge(&self, report: &mut WorkerReport) -> Result<(), FitRunError> {
        match self.merger.merge() {
            Ok(_) => {
                report.merges += 1;
                Ok(())
            }
            Err(FitRunError::MergeBusy(run)) => {
                tracing::warn!(run = %run, worker = %self.token, "final merge skipped, lock held elsewhere");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_handler::StateConfig;
    use crate::fitter::FitFailure;
    use serde_json::json;

    fn run(temp_dir: &tempfile::TempDir, ids: &[&str]) -> CatalogueRun {
        let state = StateConfig::custom(temp_dir.path().to_path_buf());
        CatalogueRun::create_or_resume(&state, "work", ids.iter().copied(), json!({"nwalkers": 16})).unwrap()
    }

    fn config(merge_every: usize) -> WorkerConfig {
        WorkerConfig {
            merge_every,
            heartbeat_interval: Duration::from_millis(20),
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn test_worker_drains_run_and_merges() {
        let temp_dir = tempfile::tempdir().unwrap();
        let run = run(&temp_dir, &["a", "b", "c", "d", "e"]);
        let worker = Worker::with_token(&run, config(2), "w1");

        let fitter = |id: &str, config: &Value| -> Result<Value, FitFailure> {
            Ok(json!({"id": id, "nwalkers": config["nwalkers"]}))
        };
        let report = worker.run(&fitter).unwrap();

        assert_eq!(report.exit, WorkerExit::Exhausted);
        assert_eq!(report.claimed, 5);
        assert_eq!(report.completed, 5);
        assert_eq!(report.merges, 3);

        let summary = BatchMerger::new(Ledger::new(run.paths().clone())).read_summary().unwrap();
        assert_eq!(summary.len(), 5);
        assert_eq!(summary["c"], json!({"id": "c", "nwalkers": 16}));

        let registry = WorkerRegistry::new(run.paths().clone());
        assert!(!registry.is_registered("w1").unwrap(), "deregisters on exit");
    }

    #[test]
    fn test_fit_failures_are_recorded_not_retried() {
        let temp_dir = tempfile::tempdir().unwrap();
        let run = run(&temp_dir, &["good", "bad"]);
        let worker = Worker::with_token(&run, config(10), "w1");

        let fitter = |id: &str, _: &Value| -> Result<Value, FitFailure> {
            if id == "bad" {
                Err(FitFailure::new("chain did not converge"))
            } else {
                Ok(json!(1))
            }
        };
        let report = worker.run(&fitter).unwrap();
        assert_eq!((report.completed, report.failed), (1, 1));

        let record = Ledger::new(run.paths().clone()).record("bad").unwrap();
        assert_eq!(record.status, ObjectStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("chain did not converge"));

        // A second worker finds nothing left to do
        let again = Worker::with_token(&run, config(10), "w2").run(&fitter).unwrap();
        assert_eq!(again.claimed, 0);
        assert_eq!(again.exit, WorkerExit::Exhausted);
    }

    #[test]
    fn test_eviction_stops_before_next_claim() {
        let temp_dir = tempfile::tempdir().unwrap();
        let run = run(&temp_dir, &["a", "b", "c", "d"]);
        let registry = WorkerRegistry::new(run.paths().clone());
        let worker = Worker::with_token(&run, config(10), "w1");

        let fitter = |id: &str, _: &Value| -> Result<Value, FitFailure> {
            if id == "b" {
                registry.evict_all().unwrap();
            }
            Ok(json!(id))
        };
        let report = worker.run(&fitter).unwrap();

        assert_eq!(report.exit, WorkerExit::Evicted);
        assert_eq!(report.completed, 2);
        let records = Ledger::new(run.paths().clone()).load_all().unwrap();
        assert_eq!(records["c"].status, ObjectStatus::Unclaimed);
        assert_eq!(records["d"].status, ObjectStatus::Unclaimed);
    }

    #[test]
    fn test_evicted_worker_releases_unfitted_batch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let run = run(&temp_dir, &["a", "b", "c", "d"]);
        let registry = WorkerRegistry::new(run.paths().clone());
        let config = WorkerConfig { claim_batch: 3, ..config(10) };
        let worker = Worker::with_token(&run, config, "w1");

        let fitter = |_: &str, _: &Value| -> Result<Value, FitFailure> {
            // Evicted without a clean: claims stay owned until released
            registry.deregister("w1").unwrap();
            Ok(json!(0))
        };
        let report = worker.run(&fitter).unwrap();

        assert_eq!(report.exit, WorkerExit::Evicted);
        assert_eq!((report.claimed, report.completed), (3, 1));
        let ledger = Ledger::new(run.paths().clone());
        assert!(ledger.claims().unwrap().is_empty());
        assert_eq!(ledger.list_by_status(ObjectStatus::Unclaimed).unwrap().len(), 3);
    }

    #[test]
    fn test_heartbeat_refreshes_registry_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let run = run(&temp_dir, &["slow"]);
        let registry = WorkerRegistry::new(run.paths().clone());
        let worker = Worker::with_token(&run, config(10), "w1");

        let fitter = |_: &str, _: &Value| -> Result<Value, FitFailure> {
            let entry = run.paths().worker_path("w1");
            let old = std::time::SystemTime::now() - Duration::from_secs(3600);
            filetime::set_file_mtime(&entry, filetime::FileTime::from_system_time(old)).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            let age = registry.get("w1").unwrap().unwrap().heartbeat_age;
            Ok(json!(age.as_secs()))
        };
        worker.run(&fitter).unwrap();

        let summary = BatchMerger::new(Ledger::new(run.paths().clone())).read_summary().unwrap();
        assert!(summary["slow"].as_u64().unwrap() < 60, "heartbeat thread touched the entry");
    }

    #[test]
    fn test_env_config_rejects_garbage() {
        assert!(env_number("FITRUN_TEST_UNSET_VARIABLE").unwrap().is_none());
        let bad = WorkerConfig { merge_every: 0, ..WorkerConfig::default() };
        assert!(matches!(bad.validate(), Err(FitRunError::Config(_))));
    }
}
