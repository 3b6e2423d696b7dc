use crate::FitRunError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const STORAGE_ATTEMPTS: usize = 3;
const STORAGE_BACKOFF_MS: u64 = 50;
const MAX_RUN_NAME_LEN: usize = 128;
const ENCODED_KEY_PREFIX: &str = "b64_";
const DIGEST_KEY_PREFIX: &str = "h_";
/// Longest key used on disk. Leaves room for extensions and temp suffixes under NAME_MAX.
const MAX_KEY_LEN: usize = 128;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Configuration for state directory locations
#[derive(Clone, Debug)]
pub struct StateConfig {
    pub base_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl StateConfig {
    /// `FITRUN_STATE_DIR`, falling back to `./fitrun_state`
    pub fn from_env() -> Self {
        let base_dir = std::env::var("FITRUN_STATE_DIR")
            .ok()
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| "./fitrun_state".to_string());
        Self { base_dir: PathBuf::from(base_dir) }
    }

    /// Custom configuration for tests
    pub fn custom(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    /// Paths for one run. Does not touch the filesystem.
    pub fn run(&self, run_name: &str) -> Result<RunPaths, FitRunError> {
        validate_run_name(run_name)?;
        Ok(RunPaths {
            name: run_name.to_string(),
            root: self.runs_dir().join(run_name),
        })
    }
}

/// On-disk layout of a single run. Every path is keyed by the run name so runs never collide.
#[derive(Clone, Debug)]
pub struct RunPaths {
    name: String,
    root: PathBuf,
}

impl RunPaths {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn claims_dir(&self) -> PathBuf {
        self.root.join("claims")
    }

    pub fn outcomes_dir(&self) -> PathBuf {
        self.root.join("outcomes")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary.jsonl")
    }

    pub fn merge_lock_path(&self) -> PathBuf {
        self.root.join("merge.lock")
    }

    pub fn claim_path(&self, id: &str) -> PathBuf {
        self.claims_dir().join(format!("{}.claim", object_key(id)))
    }

    pub fn outcome_path(&self, id: &str) -> PathBuf {
        self.outcomes_dir().join(format!("{}.json", object_key(id)))
    }

    pub fn worker_path(&self, token: &str) -> PathBuf {
        self.workers_dir().join(format!("{}.json", object_key(token)))
    }

    pub fn exists(&self) -> bool {
        self.manifest_path().exists()
    }

    pub fn ensure_layout(&self) -> Result<(), FitRunError> {
        for dir in [self.claims_dir(), self.outcomes_dir(), self.workers_dir()] {
            ensure_directory_exists(&dir)?;
        }
        Ok(())
    }
}

pub fn validate_run_name(name: &str) -> Result<(), FitRunError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_RUN_NAME_LEN
        && !name.starts_with('.')
        && name.bytes().all(is_safe_byte);
    if valid {
        Ok(())
    } else {
        Err(FitRunError::InvalidRunName(name.to_string()))
    }
}

fn is_safe_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'
}

/// Filename-safe key for an object ID. Safe IDs are used verbatim so the ledger stays readable.
/// IDs too long to encode within [`MAX_KEY_LEN`] get a digest key; their files carry the real ID.
pub fn object_key(id: &str) -> String {
    let verbatim = !id.is_empty()
        && id.len() <= MAX_KEY_LEN
        && !id.starts_with('.')
        && !id.starts_with(ENCODED_KEY_PREFIX)
        && !id.starts_with(DIGEST_KEY_PREFIX)
        && id.bytes().all(is_safe_byte);
    if verbatim {
        return id.to_string();
    }
    let encoded = format!("{}{}", ENCODED_KEY_PREFIX, URL_SAFE_NO_PAD.encode(id.as_bytes()));
    if encoded.len() <= MAX_KEY_LEN {
        encoded
    } else {
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        format!("{}{:x}", DIGEST_KEY_PREFIX, hasher.finalize())
    }
}

/// Inverse of [`object_key`]. `None` for digest keys, whose ID lives only inside the file.
pub fn object_id_from_key(key: &str) -> Option<String> {
    if key.starts_with(DIGEST_KEY_PREFIX) {
        return None;
    }
    match key.strip_prefix(ENCODED_KEY_PREFIX) {
        Some(encoded) => {
            let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
            String::from_utf8(bytes).ok()
        }
        None => Some(key.to_string()),
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u64::MAX as u128) as u64
}

/// Ensures a directory exists by creating it if needed
pub fn ensure_directory_exists(path: &Path) -> Result<(), FitRunError> {
    fs::create_dir_all(path).map_err(FitRunError::Storage)
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ResourceBusy
    )
}

/// Run a storage operation, retrying transient failures a bounded number of times.
pub fn with_storage_retries<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < STORAGE_ATTEMPTS && is_transient(&err) => {
                tracing::debug!(attempt, error = %err, "retrying transient storage error");
                std::thread::sleep(Duration::from_millis(STORAGE_BACKOFF_MS * attempt as u64));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Flush directory entries so a create/rename/unlink survives a crash.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad filename"))?;
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut tmp = path.to_path_buf();
    tmp.set_file_name(format!(
        ".{}.tmp.{}.{}.{}",
        file_name,
        std::process::id(),
        now_ms(),
        seq
    ));
    Ok(tmp)
}

fn write_new_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = fs::OpenOptions::new().create_new(true).write(true).open(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

fn parent_of(path: &Path) -> io::Result<&Path> {
    path.parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path must have parent"))
}

/// Replace `path` atomically: readers see the old or the new bytes, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = parent_of(path)?;
    fs::create_dir_all(parent)?;
    let tmp = temp_path_for(path)?;
    write_new_synced(&tmp, bytes)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    sync_dir(parent)
}

/// Publish a fully written file at `path` unless one is already there.
/// Returns `Ok(false)` without touching the existing file when `path` exists.
pub fn publish_no_clobber(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let parent = parent_of(path)?;
    let tmp = temp_path_for(path)?;
    write_new_synced(&tmp, bytes)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => {
            sync_dir(parent)?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Move `path` to a private temp name so no other process can reach it by its public name.
/// `None` when nothing was there.
pub fn take_file(path: &Path) -> io::Result<Option<PathBuf>> {
    let taken = temp_path_for(path)?;
    match fs::rename(path, &taken) {
        Ok(()) => Ok(Some(taken)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// File stems in `dir` carrying `extension`. Hidden temp files are skipped.
pub fn list_stems(dir: &Path, extension: &str) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut stems = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        if let Some(stem) = name.strip_suffix(extension).and_then(|s| s.strip_suffix('.')) {
            stems.push(stem.to_string());
        }
    }
    Ok(stems)
}

/// Remove temp files left behind by writers that died mid-write.
pub fn remove_temp_files(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let is_temp = name
            .to_str()
            .map(|n| n.starts_with('.') && n.contains(".tmp."))
            .unwrap_or(false);
        if is_temp && entry.path().is_file() && remove_if_exists(&entry.path())? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Refresh a heartbeat file's mtime. Fails with `NotFound` rather than recreating a removed file.
pub fn touch_heartbeat(path: &Path) -> io::Result<()> {
    filetime::set_file_mtime(path, FileTime::now())
}

/// How long ago the heartbeat at `path` was last touched.
pub fn heartbeat_age(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now().duration_since(modified).unwrap_or_default())
}
