//! Per-run registry of live workers.
//!
//! Each worker owns `workers/<token>.json`; the file's mtime is its heartbeat. Removing the file is
//! the stop signal used by `clean`: a worker checks its entry before every claim and its heartbeat
//! thread refuses to recreate a removed entry.

use crate::file_handler::{
    heartbeat_age, list_stems, now_ms, read_optional, publish_no_clobber, remove_if_exists,
    touch_heartbeat, with_storage_retries, RunPaths,
};
use crate::FitRunError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub token: String,
    pub pid: u32,
    pub host: String,
    pub started_at_ms: u64,
    /// Kernel start time of `pid`, telling a reused pid apart from the worker itself.
    #[serde(default)]
    pub process_start: Option<u64>,
}

impl WorkerEntry {
    pub fn for_current_process(token: &str) -> Self {
        let pid = std::process::id();
        Self {
            token: token.to_string(),
            pid,
            host: host_name(),
            started_at_ms: now_ms(),
            process_start: process_start_ticks(pid),
        }
    }

    pub fn is_local(&self) -> bool {
        self.host == host_name()
    }

    /// `Some(false)` when the worker's process is gone from this host, including when its pid now
    /// belongs to another process. `None` for remote workers or where it cannot be told.
    pub fn process_running(&self) -> Option<bool> {
        if !self.is_local() {
            return None;
        }
        if !process_alive(self.pid)? {
            return Some(false);
        }
        match (self.process_start, process_start_ticks(self.pid)) {
            (Some(recorded), Some(current)) => Some(recorded == current),
            _ => Some(true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredWorker {
    pub entry: WorkerEntry,
    pub heartbeat_age: Duration,
}

/// This machine's host name: gethostname(2), then `HOSTNAME`, then `localhost`.
pub fn host_name() -> String {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        system_host_name()
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "localhost".to_string())
    })
    .clone()
}

fn system_host_name() -> Option<String> {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: gethostname writes at most `buf.len()` bytes into the buffer.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc != 0 {
            return None;
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8(buf[..len].to_vec()).ok()
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Start time of `pid` in clock ticks since boot (field 22 of `/proc/<pid>/stat`).
pub fn process_start_ticks(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        // The command name may contain spaces; fields after it start at field 3.
        let (_, rest) = stat.rsplit_once(')')?;
        rest.split_whitespace().nth(19)?.parse().ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// Process-unique worker token: `FITRUN_WORKER_ID` if set, else `<host>-<pid>`, always suffixed with
/// a per-process sequence and the creation time so threads and restarts never share a token.
pub fn new_worker_token() -> String {
    let base = std::env::var("FITRUN_WORKER_ID")
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("{}-{}", host_name(), std::process::id()));
    let seq = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", base, seq, now_ms())
}

#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    paths: RunPaths,
}

impl WorkerRegistry {
    pub fn new(paths: RunPaths) -> Self {
        Self { paths }
    }

    pub fn register(&self, token: &str) -> Result<WorkerEntry, FitRunError> {
        let entry = WorkerEntry::for_current_process(token);
        let path = self.paths.worker_path(token);
        if !publish_no_clobber(&path, &serde_json::to_vec(&entry)?)? {
            return Err(FitRunError::Config(format!("worker token {} already registered", token)));
        }
        Ok(entry)
    }

    pub fn deregister(&self, token: &str) -> Result<bool, FitRunError> {
        Ok(remove_if_exists(&self.paths.worker_path(token))?)
    }

    pub fn is_registered(&self, token: &str) -> Result<bool, FitRunError> {
        let path = self.paths.worker_path(token);
        Ok(with_storage_retries(|| path.try_exists())?)
    }

    /// Touch the heartbeat. `NotFound` means the entry was removed by maintenance.
    pub fn heartbeat(&self, token: &str) -> std::io::Result<()> {
        touch_heartbeat(&self.paths.worker_path(token))
    }

    pub fn get(&self, token: &str) -> Result<Option<RegisteredWorker>, FitRunError> {
        read_worker(&self.paths.worker_path(token))
    }

    pub fn workers(&self) -> Result<Vec<RegisteredWorker>, FitRunError> {
        let dir = self.paths.workers_dir();
        let keys = with_storage_retries(|| list_stems(&dir, "json"))?;
        let mut workers = Vec::with_capacity(keys.len());
        for key in keys {
            // Read by path: long tokens have digest keys that do not decode
            if let Some(worker) = read_worker(&dir.join(format!("{}.json", key)))? {
                workers.push(worker);
            }
        }
        workers.sort_by(|a, b| a.entry.token.cmp(&b.entry.token));
        Ok(workers)
    }

    /// Remove every entry and return what was removed. Running workers stop before their next claim.
    pub fn evict_all(&self) -> Result<Vec<RegisteredWorker>, FitRunError> {
        let mut evicted = Vec::new();
        for worker in self.workers()? {
            if self.deregister(&worker.entry.token)? {
                evicted.push(worker);
            }
        }
        Ok(evicted)
    }
}

fn read_worker(path: &Path) -> Result<Option<RegisteredWorker>, FitRunError> {
    let Some(bytes) = with_storage_retries(|| read_optional(path))? else {
        return Ok(None);
    };
    let entry: WorkerEntry = match serde_json::from_slice(&bytes) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable worker entry");
            return Ok(None);
        }
    };
    match heartbeat_age(path) {
        Ok(heartbeat_age) => Ok(Some(RegisteredWorker { entry, heartbeat_age })),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// `Some(alive)` for a local pid, `None` where liveness cannot be probed.
pub fn process_alive(pid: u32) -> Option<bool> {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return None;
        };
        if pid <= 0 {
            return None;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return Some(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EPERM) => Some(true),
            Some(libc::ESRCH) => Some(false),
            _ => None,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        None
    }
}

/// Best-effort SIGTERM. Never signals the calling process itself.
pub fn signal_terminate(pid: u32) -> bool {
    if pid == std::process::id() {
        return false;
    }
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: plain kill(2) on a positive pid taken from the registry.
        unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_handler::StateConfig;

    fn registry(temp_dir: &tempfile::TempDir) -> WorkerRegistry {
        let state = StateConfig::custom(temp_dir.path().to_path_buf());
        let paths = state.run("reg").unwrap();
        paths.ensure_layout().unwrap();
        WorkerRegistry::new(paths)
    }

    #[test]
    fn test_tokens_are_unique_within_process() {
        let a = new_worker_token();
        let b = new_worker_token();
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_list_and_evict() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = registry(&temp_dir);

        let entry = registry.register("w-1").unwrap();
        assert_eq!(entry.pid, std::process::id());
        assert!(entry.is_local());
        registry.register("w-2").unwrap();
        assert!(registry.register("w-1").is_err());

        let workers = registry.workers().unwrap();
        assert_eq!(workers.len(), 2);
        assert!(workers[0].heartbeat_age < Duration::from_secs(60));

        let evicted = registry.evict_all().unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(!registry.is_registered("w-1").unwrap());
        assert_eq!(
            registry.heartbeat("w-1").unwrap_err().kind(),
            std::io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_host_name_comes_from_the_system() {
        if cfg!(unix) {
            let system = system_host_name().unwrap();
            assert!(!system.is_empty());
            assert_eq!(host_name(), system);
        }
    }

    #[test]
    fn test_long_tokens_are_listed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = registry(&temp_dir);
        let token = format!("cluster-node-{}", "7".repeat(200));

        registry.register(&token).unwrap();
        let workers = registry.workers().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].entry.token, token);
        assert_eq!(registry.evict_all().unwrap().len(), 1);
    }

    #[test]
    fn test_remote_entry_is_never_probed() {
        let entry = WorkerEntry {
            host: format!("{}-elsewhere", host_name()),
            ..WorkerEntry::for_current_process("remote")
        };
        assert!(!entry.is_local());
        assert_eq!(entry.process_running(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reused_pid_is_not_the_worker() {
        let entry = WorkerEntry::for_current_process("w");
        assert!(entry.process_start.is_some());
        assert_eq!(entry.process_running(), Some(true));

        let reused = WorkerEntry { process_start: entry.process_start.map(|t| t + 1), ..entry };
        assert_eq!(reused.process_running(), Some(false));
    }

    #[test]
    fn test_own_process_is_alive_and_never_signalled() {
        if cfg!(unix) {
            assert_eq!(process_alive(std::process::id()), Some(true));
        }
        assert!(!signal_terminate(std::process::id()));
    }
}
