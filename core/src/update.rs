use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::{
    operation::ItemProperties,
    types::{BaselineId, FileEncoding, ItemId, ServerItem, VersionNumber},
};

/// Instruction telling the local version table (and, for server workspaces,
/// the server) where an item now lives on disk and at which version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientLocalVersionUpdate {
    pub source_server_item: ServerItem,
    pub item_id: ItemId,
    /// `None` when the item was removed from disk
    pub target_local_item: Option<PathBuf>,
    pub local_version: VersionNumber,
    pub version_date: Option<DateTime<Utc>>,
    pub encoding: FileEncoding,
    pub hash_value: Option<Vec<u8>>,
    pub length: Option<u64>,
    pub baseline_id: Option<BaselineId>,
    pub download_url: Option<String>,
    pub keep_row_on_delete: bool,
    pub properties: ItemProperties,
}

impl ClientLocalVersionUpdate {
    pub fn is_committed(&self) -> bool {
        self.local_version != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalVersionUpdate {
    Client(ClientLocalVersionUpdate),
    /// An uncommitted item (pending add) moved on disk, re-file the row found
    /// at `source_local_item` under `target_server_item` before the client
    /// update is applied.
    MoveUncommitted {
        source_local_item: PathBuf,
        target_server_item: ServerItem,
    },
    /// Item is recorded as deleted without ever being on disk, so that a
    /// pending change against it can still be undone offline.
    InitiallyDeleted {
        source_server_item: ServerItem,
        item_id: ItemId,
        local_version: VersionNumber,
        encoding: FileEncoding,
        download_url: Option<String>,
    },
}

impl LocalVersionUpdate {
    pub fn is_committed(&self) -> bool {
        match self {
            LocalVersionUpdate::Client(update) => update.is_committed(),
            LocalVersionUpdate::InitiallyDeleted { local_version, .. } => *local_version != 0,
            LocalVersionUpdate::MoveUncommitted { .. } => false,
        }
    }

    /// Only client updates mean something to the server, the others only
    /// maintain the local version table
    pub fn is_send_to_server(&self) -> bool {
        matches!(self, LocalVersionUpdate::Client(_))
    }

    pub fn item_id(&self) -> Option<ItemId> {
        match self {
            LocalVersionUpdate::Client(update) => Some(update.item_id),
            LocalVersionUpdate::InitiallyDeleted { item_id, .. } => Some(*item_id),
            LocalVersionUpdate::MoveUncommitted { .. } => None,
        }
    }

    pub fn server_item(&self) -> &ServerItem {
        match self {
            LocalVersionUpdate::Client(update) => &update.source_server_item,
            LocalVersionUpdate::InitiallyDeleted {
                source_server_item, ..
            } => source_server_item,
            LocalVersionUpdate::MoveUncommitted {
                target_server_item, ..
            } => target_server_item,
        }
    }
}
