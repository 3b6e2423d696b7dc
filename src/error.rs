use std::fmt;

#[derive(Debug)]
pub enum FitRunError {
    /// Another process won the exclusive create for this object.
    ClaimRace(String),
    Storage(std::io::Error),
    FitFailure(String),
    StaleClaim { id: String, owner: String },
    MergeConflict { id: String },
    MergeBusy(String),
    NotClaimOwner { id: String, token: String },
    AlreadyRecorded { id: String },
    InvalidRunName(String),
    UnknownRun(String),
    Serialization(serde_json::Error),
    Config(String),
}

impl FitRunError {
    /// Storage errors are fatal to a worker; everything else is handled per object.
    pub fn is_storage(&self) -> bool {
        matches!(self, FitRunError::Storage(_))
    }
}

impl fmt::Display for FitRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitRunError::ClaimRace(id) => write!(f, "Claim race lost for object {}", id),
            FitRunError::Storage(e) => write!(f, "Storage error: {}", e),
            FitRunError::FitFailure(e) => write!(f, "Fit failed: {}", e),
            FitRunError::StaleClaim { id, owner } => {
                write!(f, "Stale claim on object {} held by {}", id, owner)
            }
            FitRunError::MergeConflict { id } => write!(
                f,
                "Merge conflict: summary row for object {} disagrees with the ledger",
                id
            ),
            FitRunError::MergeBusy(run) => write!(f, "Merge lock for run {} is held", run),
            FitRunError::NotClaimOwner { id, token } => {
                write!(f, "Worker {} does not hold the claim on object {}", token, id)
            }
            FitRunError::AlreadyRecorded { id } => {
                write!(f, "Object {} already has a recorded outcome", id)
            }
            FitRunError::InvalidRunName(name) => write!(f, "Invalid run name: {:?}", name),
            FitRunError::UnknownRun(name) => write!(f, "Run {} does not exist", name),
            FitRunError::Serialization(e) => write!(f, "Serialization error: {}", e),
            FitRunError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for FitRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FitRunError::Storage(e) => Some(e),
            FitRunError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FitRunError {
    fn from(err: std::io::Error) -> Self {
        FitRunError::Storage(err)
    }
}

impl From<serde_json::Error> for FitRunError {
    fn from(err: serde_json::Error) -> Self {
        FitRunError::Serialization(err)
    }
}

impl From<String> for FitRunError {
    fn from(err: String) -> Self {
        FitRunError::Config(err)
    }
}

impl From<&str> for FitRunError {
    fn from(err: &str) -> Self {
        FitRunError::Config(err.to_string())
    }
}
