//! Cross-process sandbox lock.
//!
//! An exclusive `flock(2)` on `{runtime_root}/{sandbox_id}/lock` serializes
//! every mutating sequence on a sandbox. The kernel drops the lock when the
//! descriptor is closed, so a crashed holder never leaves it behind.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use vcbox_shared::errors::{VcError, VcResult};
use vcbox_shared::layout::{ResourceKind, ResourceScope, StoreLayout};

/// Handle on the lock file of one sandbox.
#[derive(Clone, Debug)]
pub struct SandboxLock {
    sandbox_id: String,
    path: PathBuf,
}

impl SandboxLock {
    pub fn new(layout: &StoreLayout, sandbox_id: &str) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            path: layout.lock_path(sandbox_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn not_found(&self) -> VcError {
        VcError::NotFound {
            kind: ResourceKind::Lock,
            scope: ResourceScope::sandbox(&self.sandbox_id),
        }
    }

    fn open(&self) -> VcResult<File> {
        OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => self.not_found(),
                _ => VcError::io(format!("open lock {}", self.path.display()), e),
            })
    }

    /// Whether `file` is still the lock file at `path`.
    ///
    /// A holder that removes the sandbox unlinks the file while others may be
    /// waiting on it; their lock is then on an orphaned inode.
    fn is_current(&self, file: &File) -> VcResult<bool> {
        let held = file
            .metadata()
            .map_err(|e| VcError::io(format!("stat lock {}", self.path.display()), e))?;
        match std::fs::metadata(&self.path) {
            Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VcError::io(format!("stat lock {}", self.path.display()), e)),
        }
    }

    fn lock(&self, arg: FlockArg) -> VcResult<LockGuard> {
        let file = self.open()?;
        match Flock::lock(file, arg) {
            Ok(flock) => {
                if !self.is_current(&flock)? {
                    tracing::debug!(
                        sandbox_id = %self.sandbox_id,
                        "Lock file removed while waiting"
                    );
                    return Err(self.not_found());
                }
                tracing::debug!(sandbox_id = %self.sandbox_id, "Acquired sandbox lock");
                Ok(LockGuard {
                    sandbox_id: self.sandbox_id.clone(),
                    flock: Some(flock),
                })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(VcError::Locked {
                sandbox_id: self.sandbox_id.clone(),
            }),
            Err((_, errno)) => Err(VcError::io(
                format!("flock {}", self.path.display()),
                std::io::Error::from(errno),
            )),
        }
    }

    /// Block until the exclusive lock is held.
    ///
    /// Fails with `NotFound` if the sandbox was removed while waiting.
    pub fn acquire(&self) -> VcResult<LockGuard> {
        self.lock(FlockArg::LockExclusive)
    }

    /// Take the lock only if nobody holds it, failing with `Locked` otherwise.
    pub fn try_acquire(&self) -> VcResult<LockGuard> {
        self.lock(FlockArg::LockExclusiveNonblock)
    }

    /// [`acquire`](Self::acquire) on the blocking pool.
    pub async fn acquire_async(&self) -> VcResult<LockGuard> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire())
            .await
            .map_err(|e| VcError::Internal(format!("lock task failed: {}", e)))?
    }
}

/// Held sandbox lock, released on drop.
pub struct LockGuard {
    sandbox_id: String,
    flock: Option<Flock<File>>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("sandbox_id", &self.sandbox_id)
            .field("held", &self.flock.is_some())
            .finish()
    }
}

impl LockGuard {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Release the lock now instead of at drop.
    ///
    /// Never fails: if the explicit unlock errors, closing the descriptor
    /// still releases the lock.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(flock) = self.flock.take() {
            match flock.unlock() {
                Ok(_file) => {
                    tracing::debug!(sandbox_id = %self.sandbox_id, "Released sandbox lock");
                }
                Err((flock, errno)) => {
                    tracing::warn!(
                        sandbox_id = %self.sandbox_id,
                        error = %errno,
                        "Explicit unlock failed, closing lock descriptor"
                    );
                    drop(flock);
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(sandbox_id: &str) -> (TempDir, SandboxLock) {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path().join("config"), dir.path().join("run"));
        let lock = SandboxLock::new(&layout, sandbox_id);
        std::fs::create_dir_all(lock.path().parent().unwrap()).unwrap();
        File::create(lock.path()).unwrap();
        (dir, lock)
    }

    #[test]
    fn test_second_holder_fails_until_release() {
        let (_dir, lock) = setup("sb");

        let first = lock.try_acquire().unwrap();
        assert_eq!(first.sandbox_id(), "sb");
        assert!(matches!(lock.try_acquire(), Err(VcError::Locked { .. })));

        drop(first);
        let second = lock.try_acquire().unwrap();
        second.release();
        assert!(lock.try_acquire().is_ok());
    }

    #[test]
    fn test_blocking_acquire_waits_for_holder() {
        let (_dir, lock) = setup("sb");
        let held = lock.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = lock.clone();
        let handle = std::thread::spawn(move || {
            let guard = waiter.acquire().unwrap();
            tx.send(()).unwrap();
            drop(guard);
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        held.release();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_release_after_failed_operation() {
        let (_dir, lock) = setup("sb");

        let result: VcResult<()> = (|| {
            let _guard = lock.acquire()?;
            Err(VcError::Internal("operation failed".into()))
        })();
        assert!(result.is_err());
        assert!(lock.try_acquire().is_ok());
    }

    #[test]
    fn test_missing_lock_file() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path().join("config"), dir.path().join("run"));
        let lock = SandboxLock::new(&layout, "ghost");
        assert!(matches!(
            lock.try_acquire(),
            Err(VcError::NotFound {
                kind: ResourceKind::Lock,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_async_acquire() {
        let (_dir, lock) = setup("sb");
        let guard = lock.acquire_async().await.unwrap();
        assert!(matches!(lock.try_acquire(), Err(VcError::Locked { .. })));
        drop(guard);
    }

    #[test]
    fn test_waiter_fails_when_lock_file_removed() {
        let (_dir, lock) = setup("sb");
        let held = lock.acquire().unwrap();

        let waiter = lock.clone();
        let handle = std::thread::spawn(move || waiter.acquire().map(drop));

        std::thread::sleep(Duration::from_millis(100));
        std::fs::remove_file(lock.path()).unwrap();
        held.release();

        assert!(matches!(
            handle.join().unwrap(),
            Err(VcError::NotFound {
                kind: ResourceKind::Lock,
                ..
            })
        ));
    }
}
