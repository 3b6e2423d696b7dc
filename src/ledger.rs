//! Durable per-object status for one run.
//!
//! Status is derived from two files per object:
//! - `outcomes/<key>.json` present: Completed or Failed (terminal, never overwritten)
//! - otherwise `claims/<key>.claim` present: Claimed
//! - otherwise: Unclaimed
//!
//! Claims are published with an exclusive hard link, so exactly one of any number of racing
//! processes wins. A worker publishes its outcome before deleting its claim, which keeps the
//! object out of the unclaimed pool for the whole transition.

use crate::catalogue::read_manifest;
use crate::file_handler::{
    list_stems, now_ms, object_id_from_key, object_key, publish_no_clobber, read_optional, remove_if_exists,
    sync_dir, take_file, with_storage_retries, RunPaths,
};
use crate::registry::host_name;
use crate::FitRunError;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CLAIM_EXT: &str = "claim";
const OUTCOME_EXT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    Unclaimed,
    Claimed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub id: String,
    pub owner: String,
    pub pid: u32,
    pub host: String,
    pub claimed_at_ms: u64,
}

/// What a fit produced for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed { result: Value },
    Failed { error: String },
}

impl Outcome {
    pub fn status(&self) -> ObjectStatus {
        match self {
            Outcome::Completed { .. } => ObjectStatus::Completed,
            Outcome::Failed { .. } => ObjectStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OutcomeRecord {
    id: String,
    owner: String,
    finished_at_ms: u64,
    #[serde(flatten)]
    outcome: Outcome,
}

/// Just the ID of a claim or outcome file, for keys that cannot be decoded.
#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: String,
    pub status: ObjectStatus,
    pub claim_owner: Option<String>,
    pub claim_timestamp: Option<u64>,
    pub result: Option<Value>,
    pub failure: Option<String>,
    /// Worker that recorded the outcome (Completed/Failed only).
    pub recorded_by: Option<String>,
    pub last_updated: Option<u64>,
}

impl ObjectRecord {
    fn unclaimed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: ObjectStatus::Unclaimed,
            claim_owner: None,
            claim_timestamp: None,
            result: None,
            failure: None,
            recorded_by: None,
            last_updated: None,
        }
    }

    fn claimed(lease: ClaimLease) -> Self {
        Self {
            status: ObjectStatus::Claimed,
            claim_owner: Some(lease.owner),
            claim_timestamp: Some(lease.claimed_at_ms),
            last_updated: Some(lease.claimed_at_ms),
            ..Self::unclaimed(&lease.id)
        }
    }

    fn finished(record: OutcomeRecord) -> Self {
        let base = Self {
            recorded_by: Some(record.owner),
            last_updated: Some(record.finished_at_ms),
            ..Self::unclaimed(&record.id)
        };
        match record.outcome {
            Outcome::Completed { result } => Self {
                status: ObjectStatus::Completed,
                result: Some(result),
                ..base
            },
            Outcome::Failed { error } => Self {
                status: ObjectStatus::Failed,
                failure: Some(error),
                ..base
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    paths: RunPaths,
}

impl Ledger {
    pub fn new(paths: RunPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Current record for one object.
    pub fn record(&self, id: &str) -> Result<ObjectRecord, FitRunError> {
        if let Some(outcome) = self.read_outcome(id)? {
            return Ok(ObjectRecord::finished(outcome));
        }
        if let Some(lease) = self.read_claim(id)? {
            return Ok(ObjectRecord::claimed(lease));
        }
        Ok(ObjectRecord::unclaimed(id))
    }

    /// Records for the requested IDs. IDs the ledger has never seen are Unclaimed.
    pub fn load<I, S>(&self, ids: I) -> Result<BTreeMap<String, ObjectRecord>, FitRunError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (finished, claimed) = self.listed_keys()?;

        let mut records = BTreeMap::new();
        for id in ids {
            let id = id.as_ref();
            let key = object_key(id);
            let record = if finished.contains(&key) || claimed.contains(&key) {
                // Re-read: the directory listing may already be stale.
                self.record(id)?
            } else {
                ObjectRecord::unclaimed(id)
            };
            records.insert(id.to_string(), record);
        }
        Ok(records)
    }

    /// Every object in the run manifest, plus any object with ledger files of its own.
    pub fn load_all(&self) -> Result<BTreeMap<String, ObjectRecord>, FitRunError> {
        let manifest = read_manifest(&self.paths)?;
        let mut ids: FxHashSet<String> = manifest.ids.into_iter().collect();
        for (dir, ext) in [(self.paths.outcomes_dir(), OUTCOME_EXT), (self.paths.claims_dir(), CLAIM_EXT)] {
            for key in with_storage_retries(|| list_stems(&dir, ext))? {
                let id = match object_id_from_key(&key) {
                    Some(id) => Some(id),
                    None => read_json::<IdOnly>(&keyed_path(&dir, &key, ext))?.map(|f| f.id),
                };
                ids.extend(id);
            }
        }
        self.load(ids)
    }

    /// Manifest IDs with neither a claim nor an outcome file, ascending. Decided from directory
    /// listings alone; `try_claim` has the final word.
    pub fn unclaimed_ids(&self) -> Result<Vec<String>, FitRunError> {
        let manifest = read_manifest(&self.paths)?;
        let (finished, claimed) = self.listed_keys()?;
        Ok(manifest
            .ids
            .into_iter()
            .filter(|id| {
                let key = object_key(id);
                !finished.contains(&key) && !claimed.contains(&key)
            })
            .collect())
    }

    /// Unclaimed → Claimed(token). Returns false, leaving the record as it was, when the object
    /// is already claimed or finished.
    pub fn try_claim(&self, id: &str, token: &str) -> Result<bool, FitRunError> {
        if self.outcome_exists(id)? {
            return Ok(false);
        }

        let lease = ClaimLease {
            id: id.to_string(),
            owner: token.to_string(),
            pid: std::process::id(),
            host: host_name(),
            claimed_at_ms: now_ms(),
        };
        let claim_path = self.paths.claim_path(id);
        if !publish_no_clobber(&claim_path, &serde_json::to_vec(&lease)?)? {
            tracing::debug!(id, worker = token, "{}", FitRunError::ClaimRace(id.to_string()));
            return Ok(false);
        }

        // An outcome may have landed between the first check and our claim
        if self.outcome_exists(id)? {
            self.remove_claim_if_owned(id, token)?;
            return Ok(false);
        }

        tracing::debug!(id, worker = token, "claimed");
        Ok(true)
    }

    /// Claimed(token) → Completed/Failed.
    pub fn record_result(
        &self,
        id: &str,
        token: &str,
        outcome: Outcome,
    ) -> Result<ObjectRecord, FitRunError> {
        self.verify_owner(id, token)?;

        let record = OutcomeRecord {
            id: id.to_string(),
            owner: token.to_string(),
            finished_at_ms: now_ms(),
            outcome,
        };
        let published =
            publish_no_clobber(&self.paths.outcome_path(id), &serde_json::to_vec(&record)?)?;
        self.remove_claim_if_owned(id, token)?;
        if !published {
            return Err(FitRunError::AlreadyRecorded { id: id.to_string() });
        }

        tracing::debug!(id, worker = token, status = ?record.outcome.status(), "recorded");
        Ok(ObjectRecord::finished(record))
    }

    /// Give back a claim without recording anything.
    pub fn release_claim(&self, id: &str, token: &str) -> Result<bool, FitRunError> {
        self.verify_owner(id, token)?;
        self.remove_claim_if_owned(id, token)
    }

    /// Claimed → Unclaimed regardless of owner. Maintenance only.
    pub fn reset_claim(&self, id: &str) -> Result<Option<ClaimLease>, FitRunError> {
        let claim_path = self.paths.claim_path(id);
        let Some(taken) = with_storage_retries(|| take_file(&claim_path))? else {
            return Ok(None);
        };
        let lease = read_json(&taken);
        remove_if_exists(&taken)?;
        sync_dir(&self.paths.claims_dir())?;
        lease
    }

    /// All records with `status`, ordered by ID.
    pub fn list_by_status(&self, status: ObjectStatus) -> Result<Vec<ObjectRecord>, FitRunError> {
        Ok(self
            .load_all()?
            .into_values()
            .filter(|record| record.status == status)
            .collect())
    }

    /// Every live claim, ordered by ID.
    pub fn claims(&self) -> Result<Vec<ClaimLease>, FitRunError> {
        let claim_dir = self.paths.claims_dir();
        let mut leases = Vec::new();
        for key in with_storage_retries(|| list_stems(&claim_dir, CLAIM_EXT))? {
            if let Some(lease) = read_json::<ClaimLease>(&keyed_path(&claim_dir, &key, CLAIM_EXT))? {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(leases)
    }

    /// Results of every Completed object. Reads outcome files only, so in-flight claims are
    /// never observed.
    pub fn completed_results(&self) -> Result<BTreeMap<String, Value>, FitRunError> {
        let outcome_dir = self.paths.outcomes_dir();
        let mut results = BTreeMap::new();
        for key in with_storage_retries(|| list_stems(&outcome_dir, OUTCOME_EXT))? {
            if let Some(OutcomeRecord { id, outcome: Outcome::Completed { result }, .. }) =
                read_json(&keyed_path(&outcome_dir, &key, OUTCOME_EXT))?
            {
                results.insert(id, result);
            }
        }
        Ok(results)
    }

    fn verify_owner(&self, id: &str, token: &str) -> Result<(), FitRunError> {
        match self.read_claim(id)? {
            Some(lease) if lease.owner == token => Ok(()),
            _ => Err(FitRunError::NotClaimOwner {
                id: id.to_string(),
                token: token.to_string(),
            }),
        }
    }

    /// Remove the claim only if `token` holds it. The claim is first moved aside so a successor's
    /// claim published meanwhile is never the one deleted.
    pub(crate) fn remove_claim_if_owned(&self, id: &str, token: &str) -> Result<bool, FitRunError> {
        if !matches!(self.read_claim(id)?, Some(lease) if lease.owner == token) {
            return Ok(false);
        }
        let claim_path = self.paths.claim_path(id);
        let Some(taken) = with_storage_retries(|| take_file(&claim_path))? else {
            return Ok(false);
        };
        let owned = match read_json::<ClaimLease>(&taken) {
            Ok(lease) => lease.is_some_and(|lease| lease.owner == token),
            Err(err) => {
                restore_claim(id, &taken, &claim_path)?;
                return Err(err);
            }
        };
        if owned {
            remove_if_exists(&taken)?;
            sync_dir(&self.paths.claims_dir())?;
        } else {
            restore_claim(id, &taken, &claim_path)?;
        }
        Ok(owned)
    }

    /// Outcome and claim key sets from the directory listings.
    fn listed_keys(&self) -> Result<(FxHashSet<String>, FxHashSet<String>), FitRunError> {
        let outcome_dir = self.paths.outcomes_dir();
        let claim_dir = self.paths.claims_dir();
        let finished = with_storage_retries(|| list_stems(&outcome_dir, OUTCOME_EXT))?.into_iter().collect();
        let claimed = with_storage_retries(|| list_stems(&claim_dir, CLAIM_EXT))?.into_iter().collect();
        Ok((finished, claimed))
    }

    fn outcome_exists(&self, id: &str) -> Result<bool, FitRunError> {
        let path = self.paths.outcome_path(id);
        Ok(with_storage_retries(|| path.try_exists())?)
    }

    fn read_claim(&self, id: &str) -> Result<Option<ClaimLease>, FitRunError> {
        read_json(&self.paths.claim_path(id))
    }

    fn read_outcome(&self, id: &str) -> Result<Option<OutcomeRecord>, FitRunError> {
        read_json(&self.paths.outcome_path(id))
    }
}

fn keyed_path(dir: &Path, key: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", key, ext))
}

/// Put a claim that was moved aside back under its public name.
fn restore_claim(id: &str, taken: &Path, claim_path: &Path) -> Result<(), FitRunError> {
    let linked = std::fs::hard_link(taken, claim_path);
    remove_if_exists(taken)?;
    match linked {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::warn!(id, "claim was retaken while set aside; keeping the newer one");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, FitRunError> {
    match with_storage_retries(|| read_optional(path))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}
