use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use vcsync_core::{
    client::TransportError,
    types::{BaselineId, ChangeType},
    update::{ClientLocalVersionUpdate, LocalVersionUpdate},
};

use crate::{
    attributes::AttributesCache,
    baseline::BaselineSink,
    filter::{apply_get_filters, Materialized},
    pool::WorkerStatus,
    util::{self, DiskAttributes},
};

use super::{
    action::Action,
    batch::Batch,
    process::{create_parent, delete_source, stamp_check_in_time},
};

#[derive(Debug, Error)]
enum DownloadError {
    #[error("Unable to download {0}: {1}")]
    Transport(PathBuf, TransportError),
    #[error("Unable to write {0}: {1:#}")]
    Target(PathBuf, anyhow::Error),
    #[error("Download canceled")]
    Canceled,
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Fetch the content of one get operation and put it at its target
pub struct DownloadWorker {
    batch: Arc<Batch>,
    action: Arc<Action>,
    existing: DiskAttributes,
    baseline_id: Option<BaselineId>,
}

impl DownloadWorker {
    pub fn new(
        batch: Arc<Batch>,
        action: Arc<Action>,
        existing: DiskAttributes,
        baseline_id: Option<BaselineId>,
    ) -> Self {
        Self {
            batch,
            action,
            existing,
            baseline_id,
        }
    }

    pub fn run(self) -> anyhow::Result<WorkerStatus> {
        if self.batch.cancel.is_canceled() {
            return Ok(WorkerStatus::Canceled);
        }

        match self.download() {
            Ok(()) => Ok(WorkerStatus::Normal),
            Err(DownloadError::Canceled) => Ok(WorkerStatus::Canceled),
            Err(DownloadError::Unexpected(error)) => {
                log::error!(
                    "[{}] Download of {} failed: {:#}",
                    self.batch.workspace_name(),
                    self.action.describe(),
                    error
                );
                self.batch.fatal.set(error);
                Ok(WorkerStatus::Error)
            }
            Err(error) => {
                self.batch
                    .on_non_fatal_error(Some(self.action.as_ref()), error.to_string());
                Ok(WorkerStatus::Normal)
            }
        }
    }

    fn download(&self) -> Result<(), DownloadError> {
        let operation = &self.action.operation;
        let (target, download_url) = match (
            self.action.target_local_item(),
            operation.download_url.as_deref(),
        ) {
            (Some(target), Some(download_url)) => (target, download_url),
            _ => {
                return Err(DownloadError::Unexpected(anyhow::anyhow!(
                    "Nothing to download for {}",
                    self.action.describe()
                )))
            }
        };
        let target_error = |error: anyhow::Error| DownloadError::Target(target.to_path_buf(), error);

        create_parent(target).map_err(target_error)?;
        let folder = target.parent().unwrap_or_else(|| Path::new("."));
        let temporary = tempfile::Builder::new()
            .prefix(".vcsync")
            .suffix(".tmp")
            .tempfile_in(folder)
            .map_err(|error| target_error(error.into()))?;

        self.batch
            .transport
            .download(download_url, temporary.path())
            .map_err(|error| DownloadError::Transport(target.to_path_buf(), error))?;
        if self.batch.cancel.is_canceled() {
            return Err(DownloadError::Canceled);
        }

        let baseline_generated = match &self.baseline_id {
            Some(baseline_id) => self.save_baseline(baseline_id, temporary.path(), target)?,
            None => false,
        };

        let attributes = self.batch.attributes.attributes_for(target);
        let materialized = apply_get_filters(
            temporary.path(),
            &attributes,
            operation.encoding,
            operation.is_symlink(),
        )
        .map_err(target_error)?;

        util::delete_file(target).map_err(|error| target_error(error.into()))?;
        let symlink = match materialized {
            Materialized::File => {
                temporary
                    .persist(target)
                    .map_err(|error| target_error(error.error.into()))?;
                false
            }
            Materialized::Symlink(link_target) => {
                util::create_symlink(&link_target, target)
                    .map_err(|error| target_error(error.into()))?;
                true
            }
        };

        let effective = self.action.effective_change_type();
        if !symlink {
            if attributes.executable || operation.properties.executable {
                util::set_executable(target, true).map_err(|error| target_error(error.into()))?;
            }
            if !effective.contains(ChangeType::EDIT) || operation.is_undo() {
                stamp_check_in_time(&self.batch, &self.action, target);
                if !self.batch.context.is_local() {
                    util::set_read_only(target, true).map_err(|error| target_error(error.into()))?;
                }
            }
        }

        self.acknowledge(target, baseline_generated)?;

        if self.existing.exists {
            delete_source(&self.action, self.batch.context.case_insensitive())
                .map_err(target_error)?;
        }
        if AttributesCache::is_attributes_file(target) {
            if let Some(folder) = target.parent() {
                self.batch.attributes.invalidate(folder);
            }
        }
        self.action.set_download_completed();
        Ok(())
    }

    /// Copy the server bytes to a new baseline, false when the baseline
    /// could not be kept
    fn save_baseline(
        &self,
        baseline_id: &BaselineId,
        downloaded: &Path,
        target: &Path,
    ) -> Result<bool, DownloadError> {
        let mut sink = self.batch.baselines.create_file(baseline_id, Some(target));
        if sink.is_degraded() {
            return Ok(false);
        }

        let copied = File::open(downloaded).and_then(|mut source| {
            let completed = util::copy_cancelable(&mut source, &mut sink, &self.batch.cancel)?;
            sink.flush()?;
            Ok(completed)
        });
        let outcome = match copied {
            Ok(true) => return Ok(true),
            Ok(false) => Err(DownloadError::Canceled),
            Err(error) => {
                log::warn!(
                    "[{}] Unable to write baseline of {}: {}",
                    self.batch.workspace_name(),
                    target.display(),
                    error
                );
                Ok(false)
            }
        };

        if let BaselineSink::Stored(_, location) = &sink {
            if let Err(error) = util::delete_file(location) {
                log::warn!("Unable to delete {}: {}", location.display(), error);
            }
        }
        outcome
    }

    fn acknowledge(&self, target: &Path, baseline_generated: bool) -> Result<(), DownloadError> {
        let operation = &self.action.operation;
        let server_item = match operation.row_server_item() {
            Some(server_item) => server_item.clone(),
            None => {
                log::warn!(
                    "[{}] No server item for {}, local version not updated",
                    self.batch.workspace_name(),
                    self.action.describe()
                );
                return Ok(());
            }
        };

        // A baseline which could not be kept is fetched again on flush
        let download_url = match self.baseline_id {
            Some(_) if !baseline_generated => operation.download_url.clone(),
            _ => None,
        };
        let (hash_value, length, baseline_id) = if baseline_generated {
            (
                operation.hash_value.clone(),
                util::file_length(target),
                self.baseline_id,
            )
        } else {
            (None, None, None)
        };
        let update = LocalVersionUpdate::Client(ClientLocalVersionUpdate {
            source_server_item: server_item,
            item_id: operation.item_id,
            target_local_item: Some(target.to_path_buf()),
            local_version: operation.version_server,
            version_date: operation.version_server_date,
            encoding: operation.encoding,
            hash_value,
            length,
            baseline_id,
            download_url,
            keep_row_on_delete: false,
            properties: operation.properties,
        });
        self.batch
            .queue_update(update)
            .map_err(|error| DownloadError::Unexpected(error.into()))
    }
}
