use crate::file_handler::{heartbeat_age, now_ms, publish_no_clobber, read_optional, remove_if_exists};
use crate::registry::host_name;
use crate::FitRunError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Run-scoped exclusive lock backed by a file published without clobbering. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    content: String,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Leave the file alone if ours was reaped and the lock retaken.
        match read_optional(&self.path) {
            Ok(Some(bytes)) if bytes == self.content.as_bytes() => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(None) => {}
            Ok(Some(_)) => tracing::warn!(lock = %self.path.display(), "lock was taken over before release"),
            Err(err) => tracing::warn!(lock = %self.path.display(), error = %err, "could not release lock"),
        }
    }
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Single attempt. A lock older than `stale_after` is reaped and retaken once.
    pub fn try_acquire(path: &Path, stale_after: Duration) -> Result<Option<FileLock>, FitRunError> {
        let content = lock_file_content(now_ms());
        if publish_no_clobber(path, content.as_bytes())? {
            return Ok(Some(FileLock { path: path.to_path_buf(), content }));
        }

        if stale_after.is_zero() {
            return Ok(None);
        }
        let Some(stale) = stale_lock(path, stale_after)? else {
            return Ok(None);
        };

        // Only reap the exact lock judged stale, not one retaken meanwhile
        if read_optional(path)?.as_deref() != Some(stale.as_slice()) {
            return Ok(None);
        }
        tracing::warn!(lock = %path.display(), "reaping stale lock");
        remove_if_exists(path)?;
        if publish_no_clobber(path, content.as_bytes())? {
            Ok(Some(FileLock { path: path.to_path_buf(), content }))
        } else {
            Ok(None)
        }
    }

    /// Poll until the lock is free or `wait` elapses.
    pub fn acquire(
        path: &Path,
        stale_after: Duration,
        wait: Duration,
    ) -> Result<Option<FileLock>, FitRunError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path, stale_after)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn lock_file_content(unix_time_ms: u64) -> String {
    format!(
        "unix_time_ms={unix_time_ms}\npid={}\nhost={}\nseq={}\n",
        std::process::id(),
        host_name(),
        LOCK_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// The lock's bytes if it is older than `stale_after`.
fn stale_lock(path: &Path, stale_after: Duration) -> Result<Option<Vec<u8>>, FitRunError> {
    // Vanished between our create attempt and now: let the caller retry normally.
    let Some(bytes) = read_optional(path)? else {
        return Ok(None);
    };
    let lock_ms = String::from_utf8_lossy(&bytes)
        .lines()
        .find_map(|line| line.strip_prefix("unix_time_ms="))
        .and_then(|v| v.trim().parse::<u64>().ok());

    let stale = match lock_ms {
        Some(lock_ms) => now_ms().saturating_sub(lock_ms) > stale_after.as_millis() as u64,
        // Foreign or damaged lock file: fall back to its mtime
        None => match heartbeat_age(path) {
            Ok(age) => age > stale_after,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        },
    };
    Ok(stale.then_some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_lock_allows_single_winner() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = Arc::new(temp_dir.path().join("merge.lock"));
        let threads = 12;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let guard = FileLock::try_acquire(&path, Duration::from_secs(60)).unwrap();
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(!path.exists(), "lock should be released on drop");
    }

    #[test]
    fn test_stale_lock_is_reaped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("merge.lock");
        std::fs::write(&path, lock_file_content(0)).unwrap();

        assert!(FileLock::try_acquire(&path, Duration::ZERO).unwrap().is_none());
        let guard = FileLock::try_acquire(&path, Duration::from_secs(60)).unwrap();
        assert!(guard.is_some());
    }

    #[test]
    fn test_damaged_lock_uses_mtime() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("merge.lock");
        std::fs::write(&path, "").unwrap();
        assert!(FileLock::try_acquire(&path, Duration::from_secs(60)).unwrap().is_none());

        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(old)).unwrap();
        assert!(FileLock::try_acquire(&path, Duration::from_secs(60)).unwrap().is_some());
    }

    #[test]
    fn test_drop_leaves_a_retaken_lock_alone() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("merge.lock");
        let first = FileLock::try_acquire(&path, Duration::from_secs(60)).unwrap().unwrap();

        // Reaped as stale and retaken by another holder
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, lock_file_content(now_ms() + 1)).unwrap();
        let successor = std::fs::read(&path).unwrap();

        drop(first);
        assert_eq!(std::fs::read(&path).unwrap(), successor);
        assert!(FileLock::try_acquire(&path, Duration::from_secs(60)).unwrap().is_none());
    }

    #[test]
    fn test_acquire_times_out_while_held() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("merge.lock");
        let _held = FileLock::try_acquire(&path, Duration::from_secs(60)).unwrap().unwrap();

        let second =
            FileLock::acquire(&path, Duration::from_secs(60), Duration::from_millis(250)).unwrap();
        assert!(second.is_none());
    }
}
