//! Run manifest: the ID list and fit configuration a run was started with.

use crate::file_handler::{
    publish_no_clobber, read_optional, with_storage_retries, write_atomic, RunPaths, StateConfig,
};
use crate::lock::FileLock;
use crate::FitRunError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

const MANIFEST_LOCK_STALE: Duration = Duration::from_secs(60);
const MANIFEST_LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_name: String,
    pub ids: Vec<String>,
    pub config: Value,
    pub created_at_ms: u64,
}

/// A named run over a fixed ID list and configuration.
#[derive(Debug, Clone)]
pub struct CatalogueRun {
    paths: RunPaths,
    manifest: RunManifest,
}

impl CatalogueRun {
    /// Start a run, or resume it if the name already exists. New IDs are appended to an existing
    /// run; the stored configuration always wins over `config`.
    pub fn create_or_resume<I, S>(
        state: &StateConfig,
        run_name: &str,
        ids: I,
        config: Value,
    ) -> Result<Self, FitRunError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = state.run(run_name)?;
        paths.ensure_layout()?;
        let ids: Vec<String> = ids.into_iter().map(Into::into).sorted().dedup().collect();

        let fresh = RunManifest {
            run_name: run_name.to_string(),
            ids: ids.clone(),
            config: config.clone(),
            created_at_ms: crate::file_handler::now_ms(),
        };
        if publish_no_clobber(&paths.manifest_path(), &serde_json::to_vec_pretty(&fresh)?)? {
            tracing::info!(run = run_name, objects = fresh.ids.len(), "created run");
            return Ok(Self { paths, manifest: fresh });
        }

        let lock_path = paths.root().join("manifest.lock");
        let _lock = FileLock::acquire(&lock_path, MANIFEST_LOCK_STALE, MANIFEST_LOCK_WAIT)?
            .ok_or_else(|| FitRunError::Config(format!("manifest of run {} is locked", run_name)))?;

        let mut manifest = read_manifest(&paths)?;
        if manifest.config != config && !config.is_null() {
            tracing::warn!(run = run_name, "configuration differs from the stored one; keeping stored");
        }

        let before = manifest.ids.len();
        manifest.ids = manifest.ids.into_iter().merge(ids).dedup().collect();
        let added = manifest.ids.len() - before;
        if added > 0 {
            write_atomic(&paths.manifest_path(), &serde_json::to_vec_pretty(&manifest)?)?;
        }
        tracing::info!(run = run_name, objects = manifest.ids.len(), added, "resumed run");

        Ok(Self { paths, manifest })
    }

    /// Open an existing run without changing it.
    pub fn open(state: &StateConfig, run_name: &str) -> Result<Self, FitRunError> {
        let paths = state.run(run_name)?;
        let manifest = read_manifest(&paths)?;
        Ok(Self { paths, manifest })
    }

    pub fn name(&self) -> &str {
        self.paths.name()
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn ids(&self) -> &[String] {
        &self.manifest.ids
    }

    pub fn config(&self) -> &Value {
        &self.manifest.config
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }
}

/// One ID per line. Surrounding whitespace, blank lines and `#` comments are ignored.
pub fn read_id_file(path: &Path) -> Result<Vec<String>, FitRunError> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// The fit configuration document, or `null` when no file is given.
pub fn read_config_file(path: Option<&Path>) -> Result<Value, FitRunError> {
    match path {
        Some(path) => Ok(serde_json::from_slice(&std::fs::read(path)?)?),
        None => Ok(Value::Null),
    }
}

pub(crate) fn read_manifest(paths: &RunPaths) -> Result<RunManifest, FitRunError> {
    let bytes = with_storage_retries(|| read_optional(&paths.manifest_path()))?
        .ok_or_else(|| FitRunError::UnknownRun(paths.name().to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}
