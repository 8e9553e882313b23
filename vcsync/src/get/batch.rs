use std::{path::Path, sync::Arc};

use parking_lot::Mutex;
use vcsync_core::{
    client::Transport,
    operation::GetOperation,
    types::{GetOptions, ServerItem, VersionNumber},
    update::{ClientLocalVersionUpdate, LocalVersionUpdate},
};

use crate::{
    attributes::AttributesCache,
    baseline::BaselineCache,
    cancel::CancelFlag,
    context::Context,
    error::FatalErrorSlot,
    queue::{QueueError, UpdateLocalVersionQueue},
};

use super::{
    action::Action,
    status::{ConflictReason, GetEvent, GetStatus, ItemReference, OperationStatus},
};

/// State of one get invocation shared by the controlling thread and the
/// download workers.
pub struct Batch {
    pub context: Context,
    pub options: GetOptions,
    pub transport: Arc<dyn Transport>,
    pub baselines: Arc<BaselineCache>,
    pub attributes: AttributesCache,
    pub queue: UpdateLocalVersionQueue,
    pub cancel: CancelFlag,
    pub fatal: FatalErrorSlot,
    status: Mutex<GetStatus>,
}

impl Batch {
    pub fn new(
        context: Context,
        options: GetOptions,
        transport: Arc<dyn Transport>,
        baselines: Arc<BaselineCache>,
        queue: UpdateLocalVersionQueue,
        cancel: CancelFlag,
    ) -> Self {
        let attributes = AttributesCache::new(context.case_insensitive());
        Self {
            context,
            options,
            transport,
            baselines,
            attributes,
            queue,
            cancel,
            fatal: FatalErrorSlot::new(),
            status: Mutex::new(GetStatus::default()),
        }
    }

    pub fn workspace_name(&self) -> &str {
        &self.context.workspace_name
    }

    /// Baselines are only kept for workspaces whose local version table is
    /// authoritative
    pub fn keeps_baselines(&self) -> bool {
        self.context.is_local()
    }

    pub fn status(&self) -> GetStatus {
        self.status.lock().clone()
    }

    pub fn set_num_operations(&self, num_operations: usize) {
        self.status.lock().num_operations = num_operations;
    }

    pub fn set_canceled(&self) {
        self.status.lock().canceled = true;
    }

    pub fn record_event(&self, status: OperationStatus, action: &Action) {
        log::debug!(
            "[{}] {} {}",
            self.workspace_name(),
            status,
            action.describe()
        );
        self.status.lock().events.push(GetEvent::Completed {
            status,
            item: ItemReference::from(action),
        });
    }

    pub fn add_conflict(&self, action: &Action, reason: ConflictReason) {
        log::info!(
            "[{}] Conflict ({}) on {}",
            self.workspace_name(),
            reason,
            action.describe()
        );
        let mut status = self.status.lock();
        status.num_conflicts += 1;
        status.events.push(GetEvent::Conflict {
            reason,
            item: ItemReference::from(action),
        });
    }

    /// Final warning, once retries stopped making progress
    pub fn add_warning(&self, status: OperationStatus, action: &Action, blocking: Option<&Action>) {
        log::warn!(
            "[{}] {} on {}",
            self.workspace_name(),
            status,
            action.describe()
        );
        let mut get_status = self.status.lock();
        get_status.num_warnings += 1;
        if status.is_resolvable() && !self.options.preview {
            get_status.have_resolvable_warnings = true;
        }
        get_status.events.push(GetEvent::Warning {
            status,
            item: ItemReference::from(action),
            blocking: blocking.map(ItemReference::from),
        });
    }

    /// Warning which does not stop the batch, nor count as a retry
    pub fn add_unable_to_refresh(&self, action: &Action) {
        let mut status = self.status.lock();
        status.num_warnings += 1;
        status.events.push(GetEvent::Warning {
            status: OperationStatus::UnableToRefresh,
            item: ItemReference::from(action),
            blocking: None,
        });
    }

    pub fn on_non_fatal_error(&self, action: Option<&Action>, message: String) {
        log::error!("[{}] {}", self.workspace_name(), message);
        let mut status = self.status.lock();
        status.num_failures += 1;
        status.events.push(GetEvent::NonFatalError {
            item: action.map(ItemReference::from),
            message,
        });
    }

    pub fn queue_update(&self, update: LocalVersionUpdate) -> Result<(), QueueError> {
        self.queue.queue(update)?;
        self.status.lock().num_updated += 1;
        Ok(())
    }

    /// Record that `action` now sits at `target_local_item` (absent: removed)
    /// at `version`. Nothing is queued when that is already what the local
    /// version table says, unless `force`.
    pub fn queue_local_version_update(
        &self,
        action: &Action,
        target_local_item: Option<&Path>,
        version: VersionNumber,
        force: bool,
    ) -> Result<(), QueueError> {
        let operation = &action.operation;
        let source_local_item = operation.source_local_item.as_deref();
        let changed = version != operation.version_local
            || match target_local_item {
                Some(target) => Some(target) != source_local_item,
                None => source_local_item.is_some(),
            };
        if !force && !changed {
            return Ok(());
        }

        let server_item = match operation.row_server_item() {
            Some(server_item) => server_item.clone(),
            None => {
                log::warn!(
                    "[{}] No server item for {}, local version not updated",
                    self.workspace_name(),
                    action.describe()
                );
                return Ok(());
            }
        };
        let keep_row_on_delete = operation.keep_row_on_delete();

        if keep_row_on_delete
            && operation.source_local_item.is_none()
            && operation.target_local_item.is_none()
        {
            return self.queue_update(LocalVersionUpdate::InitiallyDeleted {
                source_server_item: server_item,
                item_id: operation.item_id,
                local_version: operation.version_server,
                encoding: operation.encoding,
                download_url: operation.download_url.clone(),
            });
        }

        if version == 0 && operation.version_local == 0 {
            if let Some(source) = source_local_item {
                if Some(source) != operation.target_local_item.as_deref() {
                    self.queue.queue(LocalVersionUpdate::MoveUncommitted {
                        source_local_item: source.to_path_buf(),
                        target_server_item: server_item.clone(),
                    })?;
                }
            }
        }

        self.queue_update(LocalVersionUpdate::Client(client_update(
            operation,
            server_item,
            target_local_item,
            version,
        )))
    }
}

/// Row update recording `operation` at `target_local_item` and `version`,
/// content details left for the table to keep or fetch
pub fn client_update(
    operation: &GetOperation,
    server_item: ServerItem,
    target_local_item: Option<&Path>,
    version: VersionNumber,
) -> ClientLocalVersionUpdate {
    ClientLocalVersionUpdate {
        source_server_item: server_item,
        item_id: operation.item_id,
        target_local_item: target_local_item.map(Path::to_path_buf),
        local_version: version,
        version_date: operation.version_server_date,
        encoding: operation.encoding,
        hash_value: None,
        length: None,
        baseline_id: None,
        download_url: operation.download_url.clone(),
        keep_row_on_delete: operation.keep_row_on_delete(),
        properties: operation.properties,
    }
}
