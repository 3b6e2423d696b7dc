use crate::ledger::Ledger;
use crate::FitRunError;

/// An object this worker now holds the claim for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimBatch {
    Claimed(Vec<Claim>),
    /// No unclaimed object was left to take.
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimStats {
    pub lost_races: usize,
}

/// Turns "give me the next N objects" into won claims.
#[derive(Debug, Clone)]
pub struct ClaimCoordinator {
    ledger: Ledger,
    token: String,
}

impl ClaimCoordinator {
    pub fn new(ledger: Ledger, token: impl Into<String>) -> Self {
        Self { ledger, token: token.into() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Scan Unclaimed objects by ascending ID and claim up to `n` of them. Candidates come from
    /// directory listings without opening any ledger file. A lost race moves on to the next
    /// candidate. Never waits: an empty scan reports `Exhausted`.
    pub fn claim_next(&self, n: usize) -> Result<(ClaimBatch, ClaimStats), FitRunError> {
        let mut stats = ClaimStats::default();
        if n == 0 {
            return Ok((ClaimBatch::Claimed(Vec::new()), stats));
        }

        let mut claims = Vec::with_capacity(n);
        for id in self.ledger.unclaimed_ids()? {
            if self.ledger.try_claim(&id, &self.token)? {
                claims.push(Claim { id, token: self.token.clone() });
                if claims.len() == n {
                    break;
                }
            } else {
                stats.lost_races += 1;
            }
        }

        if claims.is_empty() {
            Ok((ClaimBatch::Exhausted, stats))
        } else {
            Ok((ClaimBatch::Claimed(claims), stats))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::CatalogueRun;
    use crate::file_handler::StateConfig;
    use crate::ledger::{ObjectStatus, Outcome};
    use serde_json::json;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    fn setup(temp_dir: &tempfile::TempDir, ids: Vec<String>) -> Ledger {
        let state = StateConfig::custom(temp_dir.path().to_path_buf());
        let run = CatalogueRun::create_or_resume(&state, "coord", ids, json!({})).unwrap();
        Ledger::new(run.paths().clone())
    }

    #[test]
    fn test_claims_in_ascending_id_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = setup(&temp_dir, vec!["c".into(), "a".into(), "b".into()]);
        let coordinator = ClaimCoordinator::new(ledger.clone(), "w1");

        let (batch, _) = coordinator.claim_next(2).unwrap();
        let ClaimBatch::Claimed(claims) = batch else { panic!("expected claims") };
        let ids: Vec<_> = claims.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let (batch, _) = coordinator.claim_next(2).unwrap();
        let ClaimBatch::Claimed(claims) = batch else { panic!("expected claims") };
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id, "c");
    }

    #[test]
    fn test_exhausted_when_everything_taken() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = setup(&temp_dir, vec!["a".into(), "b".into()]);

        assert!(ledger.try_claim("a", "other").unwrap());
        assert!(ledger.try_claim("b", "other").unwrap());
        ledger.record_result("b", "other", Outcome::Completed { result: json!(2) }).unwrap();

        let coordinator = ClaimCoordinator::new(ledger, "w1");
        let (batch, _) = coordinator.claim_next(1).unwrap();
        assert_eq!(batch, ClaimBatch::Exhausted);
    }

    #[test]
    fn test_concurrent_claimers_never_share_an_object() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..40).map(|i| format!("obj{:03}", i)).collect();
        let ledger = setup(&temp_dir, ids.clone());

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let won = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let coordinator = ClaimCoordinator::new(ledger.clone(), format!("w{}", w));
                let barrier = barrier.clone();
                let won = won.clone();
                thread::spawn(move || {
                    barrier.wait();
                    loop {
                        match coordinator.claim_next(1).unwrap() {
                            (ClaimBatch::Claimed(claims), _) => {
                                won.lock().unwrap().extend(claims.into_iter().map(|c| c.id));
                            }
                            (ClaimBatch::Exhausted, _) => break,
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut won = won.lock().unwrap().clone();
        won.sort();
        assert_eq!(won, ids, "every object claimed exactly once");
        assert_eq!(ledger.claims().unwrap().len(), ids.len());
    }

    #[test]
    fn test_claim_next_opens_no_finished_or_claimed_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..50).map(|i| format!("obj{:03}", i)).collect();
        let ledger = setup(&temp_dir, ids);

        for i in 0..48 {
            let id = format!("obj{:03}", i);
            assert!(ledger.try_claim(&id, "other").unwrap());
            if i % 2 == 0 {
                ledger.record_result(&id, "other", Outcome::Completed { result: json!(i) }).unwrap();
            }
        }
        // Unreadable ledger files would fail any scan that parses them
        for i in 0..48 {
            let id = format!("obj{:03}", i);
            let path = if i % 2 == 0 { ledger.paths().outcome_path(&id) } else { ledger.paths().claim_path(&id) };
            std::fs::write(path, "not json").unwrap();
        }

        let coordinator = ClaimCoordinator::new(ledger.clone(), "w1");
        let (batch, stats) = coordinator.claim_next(5).unwrap();
        let ClaimBatch::Claimed(claims) = batch else { panic!("expected claims") };
        let ids: Vec<_> = claims.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["obj048", "obj049"]);
        assert_eq!(stats.lost_races, 0);
        assert_eq!(ledger.record("obj049").unwrap().status, ObjectStatus::Claimed);
    }
}
