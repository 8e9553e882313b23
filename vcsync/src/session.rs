use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Weak},
};

use anyhow::Result;
use parking_lot::Mutex;
use vcsync_core::{client::Transport, config::EngineConfig};

use crate::{
    baseline::BaselineCache, context::Context, lock::LockRegistry, pool::WorkerPool,
    state::TableError,
};

/// Resources shared by every engine of one client: the transport, the
/// transfer pool capping concurrency process wide, the workspace locks and
/// the baseline caches.
pub struct Session {
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    locks: LockRegistry,
    baselines: Mutex<HashMap<PathBuf, Weak<BaselineCache>>>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, config: &EngineConfig) -> Result<Self> {
        log::debug!(
            "Start session with {} transfer workers",
            config.max_transfer_workers
        );
        Ok(Self {
            transport,
            pool: Arc::new(WorkerPool::new(config.max_transfer_workers)?),
            locks: LockRegistry::new(),
            baselines: Mutex::new(HashMap::new()),
        })
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Baseline cache of the workspace, built on first use and kept while
    /// an engine holds it. Server workspaces keep no baseline folder.
    pub fn baselines(&self, context: &Context) -> Result<Arc<BaselineCache>, TableError> {
        let mut baselines = self.baselines.lock();
        if let Some(cache) = baselines
            .get(&context.metadata_path)
            .and_then(Weak::upgrade)
        {
            return Ok(cache);
        }

        let cache = Arc::new(if context.is_local() {
            BaselineCache::load(context)?
        } else {
            BaselineCache::new(context, vec![])
        });
        baselines.retain(|_, cache| cache.strong_count() > 0);
        baselines.insert(context.metadata_path.clone(), Arc::downgrade(&cache));
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{context, tmpdir};
    use vcsync_core::client::MockTransport;

    #[test]
    fn test_baselines_shared_while_alive() {
        // Given
        let context = context(&tmpdir());
        let session = Session::new(Arc::new(MockTransport::new()), &context.config).unwrap();

        // When
        let first = session.baselines(&context).unwrap();
        let second = session.baselines(&context).unwrap();

        // Then
        assert!(Arc::ptr_eq(&first, &second));
        drop(first);
        drop(second);
        assert!(session.baselines.lock()[&context.metadata_path]
            .upgrade()
            .is_none());
    }
}
