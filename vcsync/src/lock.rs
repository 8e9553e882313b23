//! Exclusive lock over the local state of one workspace.
//!
//! Two layers are involved: an in-process lock shared by every engine of the
//! process (registry keyed by metadata folder) and an advisory lock file for
//! other processes. A process waiting for the lock file drops a marker file
//! next to it, which is how the holder learns a yield is wanted.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::context::Context;

const LOCK_FILE_NAME: &str = "workspace.lock";
const YIELD_REQUEST_EXTENSION: &str = "yield";
/// How long a yielding holder waits for an in-process waiter to take its turn
const IN_PROCESS_TURN_TIMEOUT: Duration = Duration::from_secs(1);
/// Grace period given to another process after releasing the lock file
const CROSS_PROCESS_TURN_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Unable to prepare lock folder {0}: {1}")]
    Folder(PathBuf, io::Error),
    #[error("Unable to lock {0}: {1}")]
    LockFile(PathBuf, io::Error),
}

#[derive(Default)]
struct LockInner {
    held: bool,
    acquisitions: u64,
}

#[derive(Default)]
struct LockState {
    inner: Mutex<LockInner>,
    available: Condvar,
    waiters: AtomicUsize,
}

impl LockState {
    fn acquire(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        while inner.held {
            self.available.wait(&mut inner);
        }
        inner.held = true;
        inner.acquisitions += 1;
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.held = false;
        self.available.notify_all();
    }

    /// Release then take back the lock, letting a waiter (if any) have it first
    fn yield_turn(&self) {
        let mut inner = self.inner.lock();
        let acquisitions = inner.acquisitions;
        inner.held = false;
        self.available.notify_all();

        while inner.held
            || (self.waiters.load(Ordering::SeqCst) > 0 && inner.acquisitions == acquisitions)
        {
            if self
                .available
                .wait_for(&mut inner, IN_PROCESS_TURN_TIMEOUT)
                .timed_out()
                && !inner.held
            {
                break;
            }
        }

        inner.held = true;
        inner.acquisitions += 1;
    }

    fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }
}

/// Process wide set of workspace locks.
#[derive(Default)]
pub struct LockRegistry {
    states: Mutex<HashMap<PathBuf, Arc<LockState>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the workspace is exclusively ours
    pub fn acquire(&self, context: &Context) -> Result<WorkspaceLock, LockError> {
        let state = self
            .states
            .lock()
            .entry(context.metadata_path.clone())
            .or_default()
            .clone();

        fs::create_dir_all(&context.metadata_path)
            .map_err(|error| LockError::Folder(context.metadata_path.clone(), error))?;

        state.acquire();
        let lock_path = context.metadata_path.join(LOCK_FILE_NAME);
        match lock_file(&lock_path, &context.metadata_path) {
            Ok(file) => {
                log::debug!("[{}] Workspace lock acquired", context.workspace_name);
                Ok(WorkspaceLock {
                    state,
                    file: Some(file),
                    lock_path,
                    metadata_path: context.metadata_path.clone(),
                    workspace_name: context.workspace_name.clone(),
                })
            }
            Err(error) => {
                state.release();
                Err(error)
            }
        }
    }
}

fn lock_file(lock_path: &Path, metadata_path: &Path) -> Result<File, LockError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|error| LockError::LockFile(lock_path.to_path_buf(), error))?;

    if file.try_lock_exclusive().is_ok() {
        return Ok(file);
    }

    // Someone else holds it: ask for a yield while we wait
    let request_path =
        metadata_path.join(format!("{}.{}", Uuid::new_v4(), YIELD_REQUEST_EXTENSION));
    if let Err(error) = File::create(&request_path) {
        log::warn!(
            "Unable to create yield request {}: {}",
            request_path.display(),
            error
        );
    }
    let locked = file.lock_exclusive();
    if let Err(error) = fs::remove_file(&request_path) {
        if error.kind() != io::ErrorKind::NotFound {
            log::warn!(
                "Unable to remove yield request {}: {}",
                request_path.display(),
                error
            );
        }
    }
    locked.map_err(|error| LockError::LockFile(lock_path.to_path_buf(), error))?;

    Ok(file)
}

/// Held workspace lock, released on drop.
pub struct WorkspaceLock {
    state: Arc<LockState>,
    file: Option<File>,
    lock_path: PathBuf,
    metadata_path: PathBuf,
    workspace_name: String,
}

impl WorkspaceLock {
    /// True when another thread of this process, or another process, waits
    /// for this workspace.
    pub fn is_yield_requested(&self) -> bool {
        self.state.has_waiters() || self.has_cross_process_request()
    }

    fn has_cross_process_request(&self) -> bool {
        match fs::read_dir(&self.metadata_path) {
            Ok(entries) => entries.filter_map(|entry| entry.ok()).any(|entry| {
                entry.path().extension().and_then(|v| v.to_str()) == Some(YIELD_REQUEST_EXTENSION)
            }),
            Err(error) => {
                log::debug!(
                    "Unable to list {} for yield requests: {}",
                    self.metadata_path.display(),
                    error
                );
                false
            }
        }
    }

    /// Briefly release the lock so a waiter can make progress, then take it
    /// back. Callers must have drained transfers and flushed pending writes.
    pub fn yield_lock(&mut self) -> Result<(), LockError> {
        log::debug!("[{}] Yield workspace lock", self.workspace_name);
        let cross_process = self.has_cross_process_request();

        if let Some(file) = self.file.take() {
            if let Err(error) = file.unlock() {
                log::warn!(
                    "[{}] Unable to unlock {}: {}",
                    self.workspace_name,
                    self.lock_path.display(),
                    error
                );
            }
        }
        self.state.yield_turn();

        if cross_process {
            thread::sleep(CROSS_PROCESS_TURN_DELAY);
        }

        match lock_file(&self.lock_path, &self.metadata_path) {
            Ok(file) => {
                self.file = Some(file);
                Ok(())
            }
            Err(error) => {
                self.state.release();
                Err(error)
            }
        }
    }

    pub fn close(self) {
        drop(self)
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(error) = file.unlock() {
                log::warn!(
                    "[{}] Unable to unlock {}: {}",
                    self.workspace_name,
                    self.lock_path.display(),
                    error
                );
            }
            self.state.release();
            log::debug!("[{}] Workspace lock released", self.workspace_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{context, tmpdir};
    use std::{
        sync::atomic::AtomicBool,
        time::Instant,
    };

    #[test]
    fn test_acquire_is_exclusive_in_process() {
        let root = tmpdir();
        let context = context(&root);
        let registry = Arc::new(LockRegistry::new());
        let lock = registry.acquire(&context).unwrap();
        assert!(!lock.is_yield_requested());

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let registry = registry.clone();
            let context = context.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let _lock = registry.acquire(&context).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        while !lock.is_yield_requested() {
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!acquired.load(Ordering::SeqCst));

        lock.close();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_yield_gives_waiter_a_turn() {
        let root = tmpdir();
        let context = context(&root);
        let registry = Arc::new(LockRegistry::new());
        let mut lock = registry.acquire(&context).unwrap();

        let turns = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let registry = registry.clone();
            let context = context.clone();
            let turns = turns.clone();
            thread::spawn(move || {
                let _lock = registry.acquire(&context).unwrap();
                turns.fetch_add(1, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        while !lock.is_yield_requested() {
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }

        lock.yield_lock().unwrap();
        // Waiter had its turn before we got the lock back
        assert_eq!(turns.load(Ordering::SeqCst), 1);
        assert!(!lock.is_yield_requested());
        waiter.join().unwrap();
    }

    #[test]
    fn test_cross_process_request_marker() {
        let root = tmpdir();
        let context = context(&root);
        let registry = LockRegistry::new();
        let lock = registry.acquire(&context).unwrap();
        assert!(!lock.is_yield_requested());

        let marker = context.metadata_path.join("other.yield");
        File::create(&marker).unwrap();
        assert!(lock.is_yield_requested());
        fs::remove_file(marker).unwrap();
        assert!(!lock.is_yield_requested());
    }
}
