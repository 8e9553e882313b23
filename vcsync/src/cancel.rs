use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::EngineError;

/// Cooperative cancellation flag shared by a controlling thread and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn throw_if_canceled(&self) -> Result<(), EngineError> {
        if self.is_canceled() {
            return Err(EngineError::Canceled);
        }
        Ok(())
    }
}
