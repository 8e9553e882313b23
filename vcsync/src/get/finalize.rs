use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    error::EngineError,
    path::is_directory_empty,
    state::with_local_version_table,
    util::{self, DiskAttributes},
};

use super::{
    action::Action,
    process::{Processor, RetryEntry},
    status::OperationStatus,
};

impl Processor {
    /// Remove the folders queued for deletion, children first. A folder
    /// still holding files is retried in the next round.
    pub(super) fn finish_directory_deletions(&mut self) -> Result<(), EngineError> {
        let deletes: Vec<Arc<Action>> = self.deletes.values().cloned().collect();
        for delete in deletes {
            self.batch.cancel.throw_if_canceled()?;

            let current = match delete.current_local_item() {
                Some(current) => current,
                None => continue,
            };
            if self.dont_delete.contains_key(&self.key(&current)) {
                continue;
            }

            if let Err(error) = self.finish_directory_deletion(&delete, &current) {
                self.on_item_error(&delete, error);
            }
        }
        Ok(())
    }

    fn finish_directory_deletion(&mut self, delete: &Arc<Action>, current: &Path) -> Result<()> {
        let batch = self.batch.clone();
        let options = batch.options;

        if batch.keeps_baselines() && batch.baselines.is_immediate_parent_of_baseline_folder(current) {
            with_local_version_table(&batch.context, |table| {
                batch.baselines.prune_folders_beneath(table, current)
            })?;
        }

        let attributes = DiskAttributes::of(Some(current));
        let removable = options.preview
            || options.no_disk_update
            || !attributes.exists
            || is_directory_empty(current)?;
        if !removable {
            self.retry(OperationStatus::SourceDirectoryNotEmpty, delete, None);
            return Ok(());
        }

        let delete_as_undo_add = options.delete_undone_adds && delete.is_undo_of_add();
        let target_of_same_action = delete.target_local_item().map_or(false, |target| {
            self.dont_delete
                .get(&self.key(target))
                .map_or(false, |action| Arc::ptr_eq(action, delete))
        });
        if !delete_as_undo_add && !target_of_same_action {
            batch.record_event(OperationStatus::Deleting, delete);
            if !options.preview {
                batch.queue_local_version_update(delete, None, delete.operation.version_local, false)?;
            }
        }

        delete.set_download_completed();
        self.existing_local.remove(&self.key(current));
        let deleted = if !options.preview && !options.no_disk_update && attributes.exists {
            remove_folder(current, &attributes)
        } else {
            Ok(())
        };
        delete.clear_local_item();
        deleted
    }

    /// Report what is still in the retry list once rounds stopped
    pub(super) fn report_retries(&mut self, retries: Vec<RetryEntry>) -> Result<(), EngineError> {
        let batch = self.batch.clone();
        for entry in retries {
            if entry.status == OperationStatus::SourceDirectoryNotEmpty {
                let target_kept = entry
                    .action
                    .target_local_item()
                    .map_or(false, |target| self.dont_delete.contains_key(&self.key(target)));
                if target_kept {
                    batch.on_non_fatal_error(
                        Some(entry.action.as_ref()),
                        format!(
                            "Unable to delete {}, the folder is not empty",
                            entry.action.describe()
                        ),
                    );
                    continue;
                }
                if !batch.options.preview && entry.action.target_local_item().is_none() {
                    batch.queue_local_version_update(
                        &entry.action,
                        None,
                        entry.action.operation.version_local,
                        false,
                    )?;
                }
            }

            batch.add_warning(entry.status, &entry.action, entry.blocking.as_deref());
        }
        Ok(())
    }
}

fn remove_folder(path: &Path, attributes: &DiskAttributes) -> Result<()> {
    if attributes.is_plain_dir() {
        fs::remove_dir(path).context(format!("Delete folder {}", path.display()))
    } else {
        util::delete_file(path).context(format!("Delete {}", path.display()))
    }
}
