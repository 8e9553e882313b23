use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context as AnyhowContext, Result};
use vcsync_core::{
    types::{ChangeType, ItemType, ProcessType},
    utils::{md5_file, same_hash},
};

use crate::{
    attributes::AttributesCache,
    baseline::BaselineCache,
    error::EngineError,
    lock::WorkspaceLock,
    path::{last_part_equals, paths_equal, PathKey},
    pool::{CompletionService, PoolError, WorkerStatus},
    queue::QueueError,
    util::{self, DiskAttributes},
};

use super::{
    action::Action,
    batch::Batch,
    download::DownloadWorker,
    status::{ConflictReason, OperationStatus},
};

/// An operation which could not be applied this round
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub status: OperationStatus,
    pub action: Arc<Action>,
    /// Operation standing in the way, if any
    pub blocking: Option<Arc<Action>>,
}

/// What was found on disk for one operation, before applying it
struct Situation {
    current: Option<PathBuf>,
    existing: DiskAttributes,
    existing_local_exists: bool,
    target_attributes: DiskAttributes,
    new_local_exists: bool,
    case_rename: bool,
    delete_as_undo_add: bool,
    /// Operation whose current local item is our target
    occupant: Option<Arc<Action>>,
}

/// Applies the actions of one get invocation, round after round. The maps
/// survive between rounds, the retry list is rebuilt by each round.
pub struct Processor {
    pub(super) batch: Arc<Batch>,
    completions: CompletionService,
    lock: Option<WorkspaceLock>,
    pub(super) existing_local: HashMap<PathKey, Arc<Action>>,
    /// Folders to remove once file work is done, deepest first
    pub(super) deletes: BTreeMap<Reverse<PathKey>, Arc<Action>>,
    /// Folders which are the target of an operation of this batch
    pub(super) dont_delete: HashMap<PathKey, Arc<Action>>,
    pub(super) retries: Vec<RetryEntry>,
}

impl Processor {
    pub fn new(
        batch: Arc<Batch>,
        completions: CompletionService,
        lock: Option<WorkspaceLock>,
        existing_local: HashMap<PathKey, Arc<Action>>,
    ) -> Self {
        Self {
            batch,
            completions,
            lock,
            existing_local,
            deletes: BTreeMap::new(),
            dont_delete: HashMap::new(),
            retries: vec![],
        }
    }

    pub(super) fn key(&self, path: &Path) -> PathKey {
        PathKey::new(path, self.batch.context.case_insensitive())
    }

    /// Run rounds until nothing is left to retry or a round did not reduce
    /// the retry list. Remaining retries are then reported as warnings.
    pub fn run(&mut self, actions: Vec<Arc<Action>>) -> Result<(), EngineError> {
        let ignored = actions.iter().filter(|action| action.is_ignore()).count();
        self.batch.set_num_operations(actions.len() - ignored);

        let mut actions = actions;
        let mut round = 1;
        loop {
            let retries = self.round(&actions)?;
            if self.batch.options.preview
                || retries.is_empty()
                || retries.len() >= actions.len()
            {
                return self.report_retries(retries);
            }

            round += 1;
            log::debug!(
                "[{}] Round {}: retry {} operations",
                self.batch.workspace_name(),
                round,
                retries.len()
            );
            actions = retries.into_iter().map(|entry| entry.action).collect();
        }
    }

    fn round(&mut self, actions: &[Arc<Action>]) -> Result<Vec<RetryEntry>, EngineError> {
        let dispatched = self.dispatch(actions);
        self.wait_for_completions();
        dispatched?;
        self.batch.cancel.throw_if_canceled()?;
        self.batch.fatal.throw_if_set()?;

        self.finish_directory_deletions()?;
        Ok(std::mem::take(&mut self.retries))
    }

    fn dispatch(&mut self, actions: &[Arc<Action>]) -> Result<(), EngineError> {
        let unit_of_work = self.batch.context.config.process_unit_of_work.max(1);
        for (index, action) in actions.iter().enumerate() {
            if index > 0 && index % unit_of_work == 0 {
                self.yield_if_requested()?;
            }
            if action.is_ignore() {
                continue;
            }
            self.batch.cancel.throw_if_canceled()?;
            self.batch.fatal.throw_if_set()?;

            self.process_operation(action);
        }
        Ok(())
    }

    /// Give the workspace lock to a waiter, between two checkpoints where no
    /// transfer is running and every update is written
    fn yield_if_requested(&mut self) -> Result<(), EngineError> {
        let requested = self
            .lock
            .as_ref()
            .map_or(false, WorkspaceLock::is_yield_requested);
        if !requested {
            return Ok(());
        }

        self.wait_for_completions();
        self.batch.queue.flush()?;
        if let Some(lock) = self.lock.as_mut() {
            lock.yield_lock()?;
        }
        Ok(())
    }

    pub(super) fn wait_for_completions(&mut self) {
        let batch = self.batch.clone();
        self.completions.wait_for_completions(
            |status| {
                if status != WorkerStatus::Normal {
                    log::debug!(
                        "[{}] Download worker ended with status {}",
                        batch.workspace_name(),
                        status
                    );
                }
            },
            |error| {
                log::error!(
                    "[{}] Download worker failed: {:#}",
                    batch.workspace_name(),
                    error
                );
                batch.fatal.set(error);
            },
        );
    }

    pub(super) fn retry(
        &mut self,
        status: OperationStatus,
        action: &Arc<Action>,
        blocking: Option<Arc<Action>>,
    ) {
        log::debug!(
            "[{}] {} on {}, retry later",
            self.batch.workspace_name(),
            status,
            action.describe()
        );
        self.retries.push(RetryEntry {
            status,
            action: action.clone(),
            blocking,
        });
    }

    fn process_operation(&mut self, action: &Arc<Action>) {
        if let Err(error) = self.try_process_operation(action) {
            self.on_item_error(action, error);
        }
    }

    /// Failing to record progress or to hand work to the pool ends the
    /// batch, anything else only abandons this item
    pub(super) fn on_item_error(&self, action: &Action, error: anyhow::Error) {
        if error.is::<QueueError>() || error.is::<PoolError>() {
            self.batch.fatal.set(error);
        } else {
            self.batch
                .on_non_fatal_error(Some(action), format!("{:#}", error));
        }
    }

    fn try_process_operation(&mut self, action: &Arc<Action>) -> Result<()> {
        let batch = self.batch.clone();
        let options = batch.options;
        let case_insensitive = batch.context.case_insensitive();

        if action.is_download_completed() {
            return Ok(());
        }
        if action.operation.has_conflict() {
            batch.add_conflict(action, ConflictReason::Server);
            return Ok(());
        }

        let process_type = action.process_type();
        let change_type = action.operation.change_type;
        if process_type == ProcessType::Undo
            && change_type.contains(ChangeType::EDIT)
            && !change_type.contains(ChangeType::ADD)
        {
            action.set_ok_to_overwrite();
        }

        let case_rename = action.is_case_changing_rename();
        let current = action.current_local_item();
        let existing = DiskAttributes::of(current.as_deref());
        let mut existing_local_exists = existing.exists;
        let target = action.target_local_item().map(Path::to_path_buf);

        // A folder sits where the file was
        if action.item_type() == ItemType::File && existing.is_plain_dir() {
            let moved = match (&current, &target) {
                (Some(current), Some(target)) => !paths_equal(current, target, case_insensitive),
                _ => true,
            };
            if action.is_delete() || moved {
                existing_local_exists = false;
            }
        }

        let target_attributes = DiskAttributes::of(target.as_deref());
        let new_local_exists = target_attributes.exists;
        let type_mismatch = match action.item_type() {
            ItemType::File => target_attributes.is_plain_dir(),
            ItemType::Folder => new_local_exists && !target_attributes.is_dir,
            ItemType::Any => false,
        };
        if type_mismatch && !case_rename {
            // Nothing in this batch accounts for the item at our target
            let occupied_by_other = target.as_deref().map_or(false, |target| {
                self.existing_local
                    .get(&self.key(target))
                    .map_or(false, |occupant| !Arc::ptr_eq(occupant, action))
            });
            if !occupied_by_other {
                batch.add_conflict(action, ConflictReason::ItemTypeMismatch);
                return Ok(());
            }
            if action.item_type() == ItemType::File {
                // The folder of another operation, gone once directory
                // deletions are done
                self.retry(OperationStatus::TargetIsDirectory, action, None);
                return Ok(());
            }
        }

        let mut occupant = None;
        if let Some(target) = &target {
            let key = self.key(target);
            if let Some(target_action) = self.existing_local.get(&key).cloned() {
                if !Arc::ptr_eq(&target_action, action) && !case_rename {
                    if new_local_exists
                        && !matches!(
                            process_type,
                            ProcessType::Unshelve
                                | ProcessType::Merge
                                | ProcessType::Rollback
                                | ProcessType::Undo
                        )
                        && !target_action.effective_change_type().is_none()
                    {
                        self.retry(
                            OperationStatus::TargetLocalPending,
                            action,
                            Some(target_action),
                        );
                        return Ok(());
                    }

                    if new_local_exists
                        && !options.overwrite
                        && !target_attributes.is_symlink
                        && self.is_writable_file_conflict(action, target, &target_attributes)
                    {
                        self.retry(OperationStatus::TargetWritable, action, None);
                        return Ok(());
                    }

                    // The file at our target belongs to another operation:
                    // take its place
                    if target_action.item_type() == ItemType::File {
                        if target_action.is_delete() && !target_action.is_download_completed() {
                            if !options.preview {
                                batch.queue_local_version_update(
                                    &target_action,
                                    None,
                                    target_action.operation.version_local,
                                    false,
                                )?;
                            }
                            target_action.set_download_completed();
                            batch.record_event(OperationStatus::Deleting, &target_action);
                        }
                        target_action.clear_local_item();
                        self.existing_local.remove(&key);
                    }
                }
                occupant = Some(target_action);
            }
        }

        let situation = Situation {
            current,
            existing,
            existing_local_exists,
            target_attributes,
            new_local_exists,
            case_rename,
            delete_as_undo_add: options.delete_undone_adds && action.is_undo_of_add(),
            occupant,
        };

        match target {
            Some(target) if action.item_type() == ItemType::Folder => {
                self.process_folder(action, situation, &target)
            }
            Some(target) => self.process_file(action, situation, &target),
            None => self.process_delete(action, situation),
        }
    }

    fn process_folder(&mut self, action: &Arc<Action>, situation: Situation, target: &Path) -> Result<()> {
        let batch = self.batch.clone();
        let options = batch.options;
        let case_insensitive = batch.context.case_insensitive();

        if !options.overwrite
            && situation.new_local_exists
            && self.is_writable_file_conflict(action, target, &situation.target_attributes)
        {
            self.retry(OperationStatus::TargetWritable, action, None);
            return Ok(());
        }

        // A file at our target reached this point only as the content of
        // another operation, which gave its place
        let mut new_local_exists = situation.new_local_exists;
        if !options.preview
            && !options.no_disk_update
            && new_local_exists
            && !situation.target_attributes.is_dir
        {
            util::delete_file(target)
                .context(format!("Delete file in place of folder {}", target.display()))?;
            new_local_exists = false;
        }

        let source = if situation.case_rename && situation.existing_local_exists {
            situation.current.clone()
        } else if new_local_exists {
            // Folder deleted from our target under another case: reuse it
            situation
                .occupant
                .as_ref()
                .filter(|occupant| occupant.item_type() == ItemType::Folder && occupant.is_delete())
                .and_then(|occupant| occupant.current_local_item())
                .filter(|occupant_path| !last_part_equals(occupant_path, target))
        } else {
            None
        };

        if !options.preview && (!new_local_exists || source.is_some()) {
            match &source {
                Some(source) => fs::rename(source, target).context(format!(
                    "Rename folder {} to {}",
                    source.display(),
                    target.display()
                ))?,
                None if !options.no_disk_update => {
                    if let Err(error) = fs::create_dir_all(target) {
                        if !target.is_dir() {
                            return Err(error)
                                .context(format!("Create folder {}", target.display()));
                        }
                    }
                }
                None => {}
            }
        }

        let target_key = self.key(target);
        if situation.delete_as_undo_add {
            self.deletes.insert(Reverse(target_key), action.clone());
        } else {
            self.dont_delete
                .entry(target_key)
                .or_insert_with(|| action.clone());
        }

        let version_server = action.operation.version_server;
        let moved_from = situation
            .current
            .as_deref()
            .filter(|current| situation.existing_local_exists && !paths_equal(current, target, case_insensitive));
        if let Some(current) = moved_from {
            let key = Reverse(self.key(current));
            self.deletes.entry(key).or_insert_with(|| action.clone());
            batch.record_event(replacing_or_getting(new_local_exists), action);
            if !options.preview {
                batch.queue_local_version_update(action, Some(target), version_server, false)?;
                action.set_download_completed();
            }
            return Ok(());
        }

        batch.record_event(replacing_or_getting(new_local_exists), action);
        let pended_add = matches!(action.process_type(), ProcessType::Pend | ProcessType::Undo)
            && action.effective_change_type().contains(ChangeType::ADD);
        if !options.preview && !pended_add {
            // A folder without a row in a local workspace table gets one
            let force = batch.context.is_local() && action.local_version_entry().is_none();
            batch.queue_local_version_update(action, Some(target), version_server, force)?;
            action.set_download_completed();
        }
        Ok(())
    }

    fn process_file(&mut self, action: &Arc<Action>, situation: Situation, target: &Path) -> Result<()> {
        let batch = self.batch.clone();
        let options = batch.options;
        let operation = &action.operation;
        let process_type = action.process_type();
        let effective = action.effective_change_type();

        let reusable = situation.existing_local_exists
            && ((effective.contains(ChangeType::EDIT)
                && operation.version_local == operation.version_server)
                || (!options.get_all && !action.is_new_content_needed()));
        if let (true, Some(current)) = (reusable, situation.current.as_deref()) {
            return self.reuse_local_content(action, &situation, current, target);
        }

        if effective.contains(ChangeType::ADD) && !action.is_new_content_needed() {
            if matches!(process_type, ProcessType::Pend | ProcessType::Undo) {
                batch.record_event(OperationStatus::Getting, action);
            }
            if !options.no_disk_update
                && process_type != ProcessType::Undo
                && (!options.preview || process_type != ProcessType::Pend)
            {
                batch.on_non_fatal_error(
                    Some(action.as_ref()),
                    format!("Added item {} is missing locally", target.display()),
                );
            }
            return Ok(());
        }

        if !options.overwrite
            && !batch.context.is_local()
            && situation.existing_local_exists
            && !situation.existing.read_only
            && !situation.existing.is_symlink
            && !action.is_ok_to_overwrite()
            && !situation.case_rename
            && !situation
                .current
                .as_deref()
                .map_or(false, |current| local_content_is_redundant(current, operation.hash_value.as_deref()))
        {
            self.retry(OperationStatus::SourceWritable, action, None);
            return Ok(());
        }

        if !options.overwrite
            && situation.new_local_exists
            && !situation.case_rename
            && !situation.target_attributes.is_symlink
            && self.is_writable_file_conflict(action, target, &situation.target_attributes)
        {
            self.retry(OperationStatus::TargetWritable, action, None);
            return Ok(());
        }

        batch.record_event(replacing_or_getting(situation.current.is_some()), action);
        if options.preview {
            return Ok(());
        }

        let baseline_restore = operation
            .baseline_id
            .filter(|_| operation.is_undo() && operation.download_url.is_none());
        if let Some(baseline_id) = baseline_restore {
            if !options.no_disk_update {
                create_parent(target)?;
                batch.baselines.copy_baseline_to_target(
                    &baseline_id,
                    target,
                    None,
                    operation.hash_value.as_deref(),
                    operation.is_symlink(),
                )?;
                stamp_check_in_time(&batch, action, target);
            }
            batch.queue_local_version_update(action, Some(target), operation.version_server, false)?;
            if situation.existing_local_exists {
                delete_source(action, batch.context.case_insensitive())?;
            }
            action.set_download_completed();
            return Ok(());
        }

        if operation.download_url.is_some() {
            return self.get_file(action, situation.existing, target);
        }

        batch.on_non_fatal_error(
            Some(action.as_ref()),
            format!("No content available for {}", target.display()),
        );
        Ok(())
    }

    /// The content already on disk is the wanted one: keep it in place, or
    /// move it to the target
    fn reuse_local_content(
        &mut self,
        action: &Arc<Action>,
        situation: &Situation,
        current: &Path,
        target: &Path,
    ) -> Result<()> {
        let batch = self.batch.clone();
        let options = batch.options;
        let process_type = action.process_type();
        let version_server = action.operation.version_server;

        if paths_equal(current, target, true) {
            if action.effective_change_type().contains(ChangeType::EDIT) && options.get_all {
                batch.add_unable_to_refresh(action);
            } else {
                if !options.preview && situation.case_rename && !options.no_disk_update {
                    fs::rename(current, target).context(format!(
                        "Rename {} to {}",
                        current.display(),
                        target.display()
                    ))?;
                }
                if process_type != ProcessType::Get || situation.case_rename {
                    batch.record_event(OperationStatus::Getting, action);
                }
            }

            if !options.preview {
                if situation.delete_as_undo_add {
                    util::delete_file(target)
                        .context(format!("Delete undone add {}", target.display()))?;
                    action.set_download_completed();
                } else if !(process_type == ProcessType::Undo
                    && action.operation.change_type.contains(ChangeType::ADD))
                {
                    batch.queue_local_version_update(action, Some(target), version_server, false)?;
                    action.set_download_completed();
                }
            }
            return Ok(());
        }

        if !options.overwrite
            && situation.new_local_exists
            && !options.no_disk_update
            && self.is_writable_file_conflict(action, target, &situation.target_attributes)
        {
            self.retry(OperationStatus::TargetWritable, action, None);
            return Ok(());
        }

        if !options.preview && !situation.delete_as_undo_add && !options.no_disk_update {
            move_content(current, target, &situation.existing)?;
            if !situation.existing.is_symlink {
                stamp_check_in_time(&batch, action, target);
            }
        }
        batch.record_event(replacing_or_getting(situation.new_local_exists), action);
        if options.preview {
            return Ok(());
        }

        action.set_download_completed();
        batch.queue_local_version_update(action, Some(target), version_server, false)?;
        delete_source(action, batch.context.case_insensitive())
    }

    fn process_delete(&mut self, action: &Arc<Action>, situation: Situation) -> Result<()> {
        let batch = self.batch.clone();
        let options = batch.options;

        let is_folder = action.item_type() == ItemType::Folder
            || (action.item_type() == ItemType::Any && situation.existing.is_plain_dir());
        if is_folder {
            match &situation.current {
                Some(current) => {
                    let key = Reverse(self.key(current));
                    self.deletes.entry(key).or_insert_with(|| action.clone());
                }
                None => {
                    batch.record_event(OperationStatus::Deleting, action);
                    action.set_download_completed();
                }
            }
            return Ok(());
        }

        if !options.overwrite
            && situation.existing_local_exists
            && !batch.context.is_local()
            && !situation.existing.read_only
            && !situation.existing.is_symlink
            && !action.is_ok_to_overwrite()
        {
            self.retry(OperationStatus::SourceWritable, action, None);
            return Ok(());
        }

        batch.record_event(OperationStatus::Deleting, action);
        if options.preview {
            return Ok(());
        }

        if situation.existing_local_exists && !options.no_disk_update {
            delete_source(action, batch.context.case_insensitive())?;
        }
        let operation = &action.operation;
        let version = if operation.version_server != 0 {
            operation.version_server
        } else {
            operation.version_local
        };
        batch.queue_local_version_update(action, None, version, false)?;
        action.set_download_completed();
        Ok(())
    }

    /// Download the content, on the pool or right here for an attributes
    /// file whose siblings wait for its entries
    fn get_file(&mut self, action: &Arc<Action>, existing: DiskAttributes, target: &Path) -> Result<()> {
        let batch = self.batch.clone();
        if batch.options.no_disk_update {
            batch.queue_local_version_update(
                action,
                Some(target),
                action.operation.version_server,
                false,
            )?;
            action.set_download_completed();
            return Ok(());
        }

        let baseline_id = (batch.keeps_baselines()
            && !action.effective_change_type().contains(ChangeType::EDIT))
        .then(BaselineCache::new_baseline_id);
        let worker = DownloadWorker::new(batch, action.clone(), existing, baseline_id);

        if AttributesCache::is_attributes_file(target) {
            let status = worker.run()?;
            if status != WorkerStatus::Normal {
                log::debug!(
                    "[{}] Attributes file download ended with status {}",
                    self.batch.workspace_name(),
                    status
                );
            }
            return Ok(());
        }

        self.completions.submit(move || worker.run())?;
        Ok(())
    }

    /// True when the file at `target` holds local work which a get would
    /// destroy
    fn is_writable_file_conflict(
        &self,
        action: &Action,
        target: &Path,
        attributes: &DiskAttributes,
    ) -> bool {
        let case_insensitive = self.batch.context.case_insensitive();
        if action.is_ok_to_overwrite()
            && action
                .operation
                .source_local_item
                .as_deref()
                .map_or(false, |source| paths_equal(source, target, case_insensitive))
        {
            return false;
        }

        if attributes.is_dir {
            return false;
        }
        if self.batch.context.is_local() {
            let modified = match action.local_version_entry() {
                None => true,
                Some(entry) => {
                    entry.length != util::file_length(target)
                        || entry.last_modified != util::last_modified_millis(target).ok()
                }
            };
            if !modified {
                return false;
            }
        } else if attributes.read_only {
            return false;
        }

        !local_content_is_redundant(target, action.operation.hash_value.as_deref())
    }
}

fn replacing_or_getting(replacing: bool) -> OperationStatus {
    if replacing {
        OperationStatus::Replacing
    } else {
        OperationStatus::Getting
    }
}

/// The file at `path` already holds the content described by `hash`
pub(super) fn local_content_is_redundant(path: &Path, hash: Option<&[u8]>) -> bool {
    match hash {
        Some(hash) if !hash.is_empty() => md5_file(path)
            .map(|local_hash| same_hash(Some(hash), &local_hash))
            .unwrap_or(false),
        _ => false,
    }
}

pub(super) fn create_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        if parent.exists() && !parent.is_dir() {
            return Err(anyhow!(
                "Unable to create folder {}, a file exists with that name",
                parent.display()
            ));
        }
        fs::create_dir_all(parent).context(format!("Create folder {}", parent.display()))?;
    }
    Ok(())
}

/// Stamp `target` with the check-in date when the workspace is configured so
pub(super) fn stamp_check_in_time(batch: &Batch, action: &Action, target: &Path) {
    let operation = &action.operation;
    if !batch.context.config.set_file_time_to_checkin || operation.version_server == 0 {
        return;
    }
    if let Some(date) = operation.version_server_date {
        if let Err(error) = util::set_last_modified(target, date) {
            log::warn!(
                "[{}] Unable to set modification time of {}: {}",
                batch.workspace_name(),
                target.display(),
                error
            );
        }
    }
}

fn move_content(current: &Path, target: &Path, existing: &DiskAttributes) -> Result<()> {
    util::delete_file(target).context(format!("Delete {}", target.display()))?;
    create_parent(target)?;

    if existing.is_symlink {
        let link_target = util::read_link_target(current)
            .context(format!("Read link {}", current.display()))?;
        return util::create_symlink(&link_target, target)
            .context(format!("Create link {}", target.display()));
    }

    if fs::rename(current, target).is_err() {
        fs::copy(current, target).context(format!(
            "Copy {} to {}",
            current.display(),
            target.display()
        ))?;
    }
    Ok(())
}

/// Remove what is left at the current local item of `action` once its
/// content reached the target
pub(super) fn delete_source(action: &Action, case_insensitive: bool) -> Result<()> {
    let current = match action.current_local_item() {
        Some(current) => current,
        None => return Ok(()),
    };
    if let Some(target) = action.target_local_item() {
        if paths_equal(&current, target, case_insensitive) {
            return Ok(());
        }
    }

    let attributes = DiskAttributes::of(Some(&current));
    if !attributes.exists {
        return Ok(());
    }

    if attributes.is_plain_dir() {
        if action.item_type() == ItemType::File {
            return Err(anyhow!(
                "Unable to delete {}, a folder exists with that name",
                current.display()
            ));
        }
        return fs::remove_dir(&current).context(format!("Delete folder {}", current.display()));
    }

    util::delete_file(&current).context(format!("Delete {}", current.display()))
}
