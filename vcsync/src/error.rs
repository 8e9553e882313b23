use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use thiserror::Error;
use vcsync_core::{client::TransportError, operation::OperationError};

use crate::{
    baseline::BaselineError, lock::LockError, pool::PoolError, queue::QueueError, state::TableError,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Operation canceled")]
    Canceled,
    #[error("Fatal error: {0:#}")]
    Fatal(Arc<anyhow::Error>),
    #[error("Unable to upload changes: {0:#}")]
    Checkin(Arc<anyhow::Error>),
    #[error("Unable to read {0}: {1}")]
    LocalItemUnreadable(PathBuf, String),
    #[error("Workspace lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Baseline error: {0}")]
    Baseline(#[from] BaselineError),
    #[error("Local version table error: {0}")]
    Table(#[from] TableError),
    #[error("Local version update error: {0}")]
    Queue(#[from] QueueError),
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Invalid operation: {0}")]
    InvalidOperation(#[from] OperationError),
    #[error("Unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, EngineError::Canceled)
    }
}

/// Write-once holder of the first unrecoverable error of a batch. Later
/// errors are logged and dropped.
#[derive(Debug, Default)]
pub struct FatalErrorSlot {
    error: OnceLock<Arc<anyhow::Error>>,
}

impl FatalErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return true if this error is the one retained
    pub fn set(&self, error: anyhow::Error) -> bool {
        match self.error.set(Arc::new(error)) {
            Ok(_) => true,
            Err(ignored) => {
                log::debug!("Ignore fatal error (one is already set): {:#}", ignored);
                false
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.error.get().is_some()
    }

    pub fn get(&self) -> Option<Arc<anyhow::Error>> {
        self.error.get().cloned()
    }

    pub fn throw_if_set(&self) -> Result<(), EngineError> {
        match self.get() {
            Some(error) => Err(EngineError::Fatal(error)),
            None => Ok(()),
        }
    }
}
