use std::{
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use vcsync_core::{
    operation::GetOperation,
    types::{ChangeType, ItemType, ProcessType},
};

use crate::{path::paths_equal, state::LocalVersionEntry};

/// A get operation as tracked during one batch. Flags are shared with the
/// transfer workers.
pub struct Action {
    pub operation: GetOperation,
    current_local_item: Mutex<Option<PathBuf>>,
    /// Local version row found at the target local item (local workspaces)
    local_version_entry: Mutex<Option<LocalVersionEntry>>,
    download_completed: AtomicBool,
    ok_to_overwrite: AtomicBool,
    ignore: AtomicBool,
}

impl Action {
    pub fn new(operation: GetOperation) -> Self {
        let current_local_item = operation.source_local_item.clone();
        Self {
            operation,
            current_local_item: Mutex::new(current_local_item),
            local_version_entry: Mutex::new(None),
            download_completed: AtomicBool::new(false),
            ok_to_overwrite: AtomicBool::new(false),
            ignore: AtomicBool::new(false),
        }
    }

    /// Where the item is on disk right now, `None` once another operation
    /// took over its path
    pub fn current_local_item(&self) -> Option<PathBuf> {
        self.current_local_item.lock().clone()
    }

    pub fn clear_local_item(&self) {
        *self.current_local_item.lock() = None;
    }

    pub fn target_local_item(&self) -> Option<&Path> {
        self.operation.target_local_item.as_deref()
    }

    pub fn local_version_entry(&self) -> Option<LocalVersionEntry> {
        self.local_version_entry.lock().clone()
    }

    pub fn set_local_version_entry(&self, entry: Option<LocalVersionEntry>) {
        *self.local_version_entry.lock() = entry;
    }

    pub fn is_download_completed(&self) -> bool {
        self.download_completed.load(Ordering::SeqCst)
    }

    pub fn set_download_completed(&self) {
        self.download_completed.store(true, Ordering::SeqCst)
    }

    pub fn is_ok_to_overwrite(&self) -> bool {
        self.ok_to_overwrite.load(Ordering::SeqCst)
    }

    pub fn set_ok_to_overwrite(&self) {
        self.ok_to_overwrite.store(true, Ordering::SeqCst)
    }

    pub fn is_ignore(&self) -> bool {
        self.ignore.load(Ordering::SeqCst)
    }

    pub fn set_ignore(&self) {
        self.ignore.store(true, Ordering::SeqCst)
    }

    pub fn process_type(&self) -> ProcessType {
        self.operation.process_type
    }

    pub fn item_type(&self) -> ItemType {
        self.operation.item_type
    }

    pub fn is_delete(&self) -> bool {
        self.operation.is_delete()
    }

    pub fn effective_change_type(&self) -> ChangeType {
        self.operation.effective_change_type()
    }

    pub fn is_new_content_needed(&self) -> bool {
        self.operation
            .is_new_content_needed(self.current_local_item().as_deref())
    }

    /// Source and target only differ by case. This is inferred from the paths
    /// alone, whatever the case sensitivity of the file system.
    pub fn is_case_changing_rename(&self) -> bool {
        match (&self.operation.source_local_item, &self.operation.target_local_item) {
            (Some(source), Some(target)) => {
                !paths_equal(source, target, false) && paths_equal(source, target, true)
            }
            _ => false,
        }
    }

    /// Undo of an add, deleting the file, requested with `delete_undone_adds`
    pub fn is_undo_of_add(&self) -> bool {
        self.process_type() == ProcessType::Undo
            && self.operation.change_type.contains(ChangeType::ADD)
    }

    pub fn describe(&self) -> String {
        let path = self
            .target_local_item()
            .map(Path::to_path_buf)
            .or_else(|| self.operation.source_local_item.clone())
            .unwrap_or_default();
        format!("{} ({})", path.display(), self.operation.item_id)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("item_id", &self.operation.item_id)
            .field("current_local_item", &self.current_local_item())
            .field("target_local_item", &self.operation.target_local_item)
            .field("download_completed", &self.is_download_completed())
            .finish()
    }
}
