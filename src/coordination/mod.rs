//! Coordinated access to a shared metadata file.
//!
//! Cooperating readers and writers of one path are serialized by an advisory
//! lock file plus an in-process per-path mutex, and every write is an atomic
//! temp-then-rename replace. A reader that overlaps a write therefore sees
//! the pre-write or post-write bytes, never a torn file. Writers that do not
//! use this protocol are not protected against.

use crate::core::{Result, StoreError};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Duration as TokioDuration, sleep, timeout};

/// Lock acquisition behavior for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinationPolicy {
    pub acquire_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CoordinationPolicy {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 2_000,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl CoordinationPolicy {
    fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Holds both halves of the coordination while alive. Dropping it releases
/// the in-process mutex and removes the lock file.
struct CoordinationGuard {
    lock_path: PathBuf,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for CoordinationGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Serializes readers and writers of shared paths. One coordinator is meant
/// to be shared by every in-process participant touching the same files;
/// participants in other processes cooperate through the lock-file protocol.
pub struct FileCoordinator {
    policy: CoordinationPolicy,
    guards: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileCoordinator {
    pub fn new(policy: CoordinationPolicy) -> Self {
        Self {
            policy,
            guards: StdMutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &CoordinationPolicy {
        &self.policy
    }

    fn path_mutex(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut guards = self
            .guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guards
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn lock_path_for(path: &Path) -> PathBuf {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(".lock");
        PathBuf::from(raw)
    }

    async fn acquire(&self, path: &Path) -> Result<CoordinationGuard> {
        let timeout_ms = self.policy.acquire_timeout_ms;

        let permit = timeout(
            TokioDuration::from_millis(timeout_ms),
            self.path_mutex(path).lock_owned(),
        )
        .await
        .map_err(|_| {
            StoreError::CoordinationError(format!(
                "Could not acquire access to '{}' within {}ms",
                path.display(),
                timeout_ms
            ))
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::IoError(err.to_string()))?;
        }

        let lock_path = Self::lock_path_for(path);
        let started = Instant::now();
        let mut attempt = 1u32;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => break,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if started.elapsed().as_millis() as u64 >= timeout_ms {
                        return Err(StoreError::CoordinationError(format!(
                            "Lock file '{}' still held after {}ms",
                            lock_path.display(),
                            timeout_ms
                        )));
                    }
                    sleep(TokioDuration::from_millis(self.policy.backoff_ms(attempt))).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(StoreError::IoError(err.to_string())),
            }
        }

        Ok(CoordinationGuard {
            lock_path,
            _permit: permit,
        })
    }

    /// Reads the full contents of `path` under coordination. A missing file
    /// is `StoreError::NotFound`; the caller decides what to substitute.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let _guard = self.acquire(path).await?;

        match fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.display().to_string()))
            }
            Err(err) => Err(StoreError::IoError(err.to_string())),
        }
    }

    /// Replaces `path` with `bytes` under coordination: the payload lands in
    /// a sibling temp file, is flushed and synced, then renamed over `path`.
    pub async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let _guard = self.acquire(path).await?;

        let tmp_path = path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|err| StoreError::IoError(err.to_string()))?;

        tmp.write_all(bytes)
            .await
            .map_err(|err| StoreError::IoError(err.to_string()))?;
        tmp.flush()
            .await
            .map_err(|err| StoreError::IoError(err.to_string()))?;
        tmp.sync_data()
            .await
            .map_err(|err| StoreError::IoError(err.to_string()))?;
        drop(tmp);

        fs::rename(&tmp_path, path)
            .await
            .map_err(|err| StoreError::IoError(err.to_string()))?;

        Ok(())
    }
}

impl Default for FileCoordinator {
    fn default() -> Self {
        Self::new(CoordinationPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = CoordinationPolicy {
            acquire_timeout_ms: 2_000,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        };
        assert_eq!(policy.backoff_ms(1), 5);
        assert_eq!(policy.backoff_ms(2), 10);
        assert_eq!(policy.backoff_ms(3), 20);
        assert_eq!(policy.backoff_ms(10), 250);
    }

    #[test]
    fn lock_path_appends_full_suffix() {
        let lock = FileCoordinator::lock_path_for(Path::new("/tmp/feeds/metadata.bin"));
        assert_eq!(lock, PathBuf::from("/tmp/feeds/metadata.bin.lock"));
    }
}
