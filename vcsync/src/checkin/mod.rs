//! Checkin engine: sends the content of pending edits to the server.
//!
//! Content filters are applied on a private copy, the working copy file is
//! never modified. An edit whose content the server already holds is not
//! sent again.
use std::{path::Path, sync::Arc};

use anyhow::anyhow;
use vcsync_core::{
    change::PendingChange,
    client::UploadRequest,
    types::{BaselineId, ServerItem},
    utils::{md5_file, same_hash},
};

use crate::{
    attributes::AttributesCache,
    baseline::BaselineCache,
    cancel::CancelFlag,
    context::Context,
    error::{EngineError, FatalErrorSlot},
    filter::prepare_upload,
    lock::WorkspaceLock,
    pool::{CompletionService, WorkerStatus},
    session::Session,
    util,
};

use self::upload::{UploadLimits, UploadWorker};

pub mod upload;

/// Outcome of one upload invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStatus {
    pub num_uploaded: usize,
    pub num_skipped: usize,
    /// Baselines written from the uploaded content, to be recorded once
    /// the check-in is committed
    pub baselines: Vec<(ServerItem, BaselineId)>,
}

pub struct CheckinEngine {
    session: Arc<Session>,
}

impl CheckinEngine {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Upload the content of `changes`. Baselines are saved (and the
    /// workspace locked for the whole upload) only for a real check-in of a
    /// local workspace.
    pub fn upload(
        &self,
        context: &Context,
        changes: &[PendingChange],
        for_shelve: bool,
        save_baselines: bool,
        cancel: &CancelFlag,
    ) -> Result<UploadStatus, EngineError> {
        let save_baselines = save_baselines && !for_shelve && context.is_local();
        log::info!(
            "[{}] Upload {} pending changes{}",
            context.workspace_name,
            changes.len(),
            if for_shelve { " to shelve" } else { "" }
        );

        let lock = if save_baselines {
            Some(self.session.locks().acquire(context)?)
        } else {
            None
        };
        let baselines = if save_baselines {
            Some(self.session.baselines(context)?)
        } else {
            None
        };

        let mut uploads = Uploads {
            context,
            session: &self.session,
            baselines,
            attributes: AttributesCache::new(context.case_insensitive()),
            cancel: cancel.clone(),
            fatal: Arc::new(FatalErrorSlot::new()),
            completions: CompletionService::new(self.session.pool()),
            lock,
            status: UploadStatus::default(),
        };

        let dispatched = uploads.dispatch(changes);
        uploads.wait_for_completions();
        let outcome = dispatched
            .and_then(|_| cancel.throw_if_canceled())
            .and_then(|_| match uploads.fatal.get() {
                Some(error) => Err(EngineError::Checkin(error)),
                None => Ok(()),
            });
        if let Err(error) = outcome {
            uploads.discard_baselines();
            return Err(error);
        }

        let status = uploads.status;
        log::info!(
            "[{}] Upload done: {} uploaded, {} already on server",
            context.workspace_name,
            status.num_uploaded,
            status.num_skipped
        );
        Ok(status)
    }
}

/// State of one upload invocation
struct Uploads<'a> {
    context: &'a Context,
    session: &'a Session,
    baselines: Option<Arc<BaselineCache>>,
    attributes: AttributesCache,
    cancel: CancelFlag,
    fatal: Arc<FatalErrorSlot>,
    completions: CompletionService,
    lock: Option<WorkspaceLock>,
    status: UploadStatus,
}

impl<'a> Uploads<'a> {
    fn dispatch(&mut self, changes: &[PendingChange]) -> Result<(), EngineError> {
        let yield_count = self.context.config.upload_yield_count.max(1);
        let mut uploaded = 0;

        for change in changes {
            self.cancel.throw_if_canceled()?;
            if let Some(error) = self.fatal.get() {
                return Err(EngineError::Checkin(error));
            }
            if !change.requires_upload() {
                continue;
            }

            let local_item = change.local_item.as_deref().ok_or_else(|| {
                EngineError::Checkin(Arc::new(anyhow!(
                    "No local file for pending change {}",
                    change.server_item
                )))
            })?;

            if self.lock.is_some() {
                if uploaded % yield_count == 0 {
                    self.yield_if_requested()?;
                }
                uploaded += 1;
            }
            self.upload_file(change, local_item)?;
        }
        Ok(())
    }

    fn yield_if_requested(&mut self) -> Result<(), EngineError> {
        let requested = self
            .lock
            .as_ref()
            .map_or(false, WorkspaceLock::is_yield_requested);
        if !requested {
            return Ok(());
        }

        self.wait_for_completions();
        if let Some(lock) = self.lock.as_mut() {
            lock.yield_lock()?;
        }
        Ok(())
    }

    fn upload_file(&mut self, change: &PendingChange, local_item: &Path) -> Result<(), EngineError> {
        if !local_item.exists() && !util::is_symlink(local_item) {
            return Err(EngineError::LocalItemUnreadable(
                local_item.to_path_buf(),
                "the file no longer exists".to_string(),
            ));
        }

        let attributes = self.attributes.attributes_for(local_item);
        let prepared = prepare_upload(
            local_item,
            &attributes,
            change.encoding,
            change.properties.symlink,
        )
        .map_err(|error| EngineError::Checkin(Arc::new(error)))?;
        let hash = md5_file(&prepared.path).map_err(|error| {
            EngineError::LocalItemUnreadable(local_item.to_path_buf(), error.to_string())
        })?;

        if same_hash(change.server_hash(), &hash) {
            log::debug!(
                "[{}] Skip upload of {}, the server holds this content",
                self.context.workspace_name,
                change.server_item
            );
            self.status.num_skipped += 1;
            return Ok(());
        }

        if let Some(baselines) = &self.baselines {
            let (baseline_id, sink) = baselines.store(&prepared.path, Some(local_item))?;
            if !sink.is_degraded() {
                self.status
                    .baselines
                    .push((change.server_item.clone(), baseline_id));
            }
        }

        let config = &self.context.config;
        let request = UploadRequest {
            workspace: self.context.workspace_name.clone(),
            server_item: change.server_item.clone(),
            content_hash: hash.to_vec(),
            total_length: util::file_length(&prepared.path).unwrap_or(0),
        };
        let worker = UploadWorker::new(
            self.session.transport(),
            request,
            prepared,
            UploadLimits {
                chunk_size: config.upload_chunk_size,
                file_attempts: config.upload_file_attempts.max(1),
                chunk_attempts: config.upload_chunk_attempts.max(1),
            },
            self.cancel.clone(),
            self.fatal.clone(),
        );
        self.completions.submit(move || worker.run())?;
        self.status.num_uploaded += 1;
        Ok(())
    }

    /// Remove the baselines written by an upload which did not complete
    fn discard_baselines(&mut self) {
        let written = std::mem::take(&mut self.status.baselines);
        if let Some(baselines) = &self.baselines {
            for (server_item, baseline_id) in written {
                log::debug!(
                    "[{}] Discard baseline of {}",
                    self.context.workspace_name,
                    server_item
                );
                baselines.delete_baseline(&baseline_id);
            }
        }
    }

    fn wait_for_completions(&mut self) {
        let workspace_name = &self.context.workspace_name;
        let fatal = &self.fatal;
        self.completions.wait_for_completions(
            |status| {
                if status != WorkerStatus::Normal {
                    log::debug!(
                        "[{}] Upload worker ended with status {}",
                        workspace_name,
                        status
                    );
                }
            },
            |error| {
                log::warn!("[{}] Upload worker failed: {:#}", workspace_name, error);
                fatal.set(error);
            },
        );
    }
}
