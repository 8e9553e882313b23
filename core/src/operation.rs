use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    BaselineId, ChangeType, FileEncoding, ItemId, ItemType, ProcessType, ServerItem,
    VersionNumber,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Get,
    Checkin,
    Local,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    pub kind: ConflictKind,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemProperties {
    #[serde(default)]
    pub symlink: bool,
    #[serde(default)]
    pub executable: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OperationError {
    #[error("Operation for item {0} has neither source nor target local item")]
    NoLocalItem(ItemId),
}

/// Server computed instruction describing the change one item needs on local disk.
///
/// `source_local_item` is where the item currently is, `target_local_item`
/// where it must be. An absent target means the item must be deleted, an
/// absent source means it must be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetOperation {
    pub item_id: ItemId,
    #[serde(default)]
    pub source_local_item: Option<PathBuf>,
    #[serde(default)]
    pub target_local_item: Option<PathBuf>,
    #[serde(default)]
    pub source_server_item: Option<ServerItem>,
    #[serde(default)]
    pub target_server_item: Option<ServerItem>,
    #[serde(default)]
    pub version_local: VersionNumber,
    #[serde(default)]
    pub version_server: VersionNumber,
    #[serde(default)]
    pub version_server_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub item_type: ItemType,
    #[serde(default)]
    pub change_type: ChangeType,
    #[serde(default)]
    pub encoding: FileEncoding,
    #[serde(default)]
    pub hash_value: Option<Vec<u8>>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub baseline_id: Option<BaselineId>,
    #[serde(default)]
    pub conflict: Option<ConflictDescriptor>,
    #[serde(default)]
    pub properties: ItemProperties,
    #[serde(default = "default_process_type")]
    pub process_type: ProcessType,
}

fn default_process_type() -> ProcessType {
    ProcessType::Get
}

impl GetOperation {
    pub fn new(item_id: ItemId, item_type: ItemType) -> Self {
        Self {
            item_id,
            source_local_item: None,
            target_local_item: None,
            source_server_item: None,
            target_server_item: None,
            version_local: 0,
            version_server: 0,
            version_server_date: None,
            item_type,
            change_type: ChangeType::NONE,
            encoding: FileEncoding::Binary,
            hash_value: None,
            download_url: None,
            baseline_id: None,
            conflict: None,
            properties: ItemProperties::default(),
            process_type: ProcessType::Get,
        }
    }

    /// Source and target may not be both absent, unless the operation only
    /// records a pending change against an item never present on disk.
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.source_local_item.is_none()
            && self.target_local_item.is_none()
            && !self.keep_row_on_delete()
        {
            return Err(OperationError::NoLocalItem(self.item_id));
        }
        Ok(())
    }

    /// A delete of an item with a pending change keeps its local version row
    /// (marked deleted) so the change can still be undone.
    pub fn keep_row_on_delete(&self) -> bool {
        !self.is_undo() && !self.change_type.is_none()
    }

    pub fn is_delete(&self) -> bool {
        self.target_local_item.is_none()
    }

    pub fn is_undo(&self) -> bool {
        self.process_type == ProcessType::Undo
    }

    pub fn has_conflict(&self) -> bool {
        self.conflict.is_some()
    }

    /// Change type seen by the get logic: an undo only keeps what it
    /// resurrects (adds keep everything, branches become plain branches).
    pub fn effective_change_type(&self) -> ChangeType {
        if !self.is_undo() {
            return self.change_type;
        }

        if self.change_type.contains(ChangeType::ADD) {
            self.change_type
        } else if self.change_type.contains(ChangeType::BRANCH) {
            ChangeType::BRANCH
        } else {
            ChangeType::NONE
        }
    }

    pub fn is_new_content_needed(&self, current_local_item: Option<&Path>) -> bool {
        if self.download_url.is_none() && !(self.is_undo() && self.baseline_id.is_some()) {
            return false;
        }

        if self.is_undo()
            && self.change_type.intersects(ChangeType::EDIT | ChangeType::DELETE)
            && !self.change_type.intersects(ChangeType::ADD | ChangeType::BRANCH)
        {
            return true;
        }

        self.version_local != self.version_server
            || (current_local_item.is_none() && self.target_local_item.is_some())
    }

    /// Server item used to key the local version row: committed items are
    /// filed under their source path, uncommitted ones under their target.
    pub fn row_server_item(&self) -> Option<&ServerItem> {
        self.source_server_item
            .as_ref()
            .or(self.target_server_item.as_ref())
    }

    pub fn is_symlink(&self) -> bool {
        self.properties.symlink
    }
}
