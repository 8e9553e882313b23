use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::{
    operation::ItemProperties,
    types::{ChangeType, FileEncoding, ItemId, ItemType, ServerItem},
};

/// A locally pending change as handed to the upload logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub server_item: ServerItem,
    #[serde(default)]
    pub local_item: Option<PathBuf>,
    pub item_id: ItemId,
    #[serde(default)]
    pub item_type: ItemType,
    #[serde(default)]
    pub change_type: ChangeType,
    #[serde(default)]
    pub encoding: FileEncoding,
    /// Hash of the content the server already holds for this pending change
    #[serde(default)]
    pub upload_content_hash: Option<Vec<u8>>,
    /// Hash of the committed version
    #[serde(default)]
    pub hash_value: Option<Vec<u8>>,
    #[serde(default)]
    pub properties: ItemProperties,
}

impl PendingChange {
    pub fn new(server_item: &str, item_id: ItemId, change_type: ChangeType) -> Self {
        Self {
            server_item: server_item.to_string(),
            local_item: None,
            item_id,
            item_type: ItemType::File,
            change_type,
            encoding: FileEncoding::Binary,
            upload_content_hash: None,
            hash_value: None,
            properties: ItemProperties::default(),
        }
    }

    /// Hash the server holds for this change, preferring a previously
    /// uploaded content over the committed one.
    pub fn server_hash(&self) -> Option<&[u8]> {
        match &self.upload_content_hash {
            Some(hash) if !hash.is_empty() => Some(hash),
            _ => self.hash_value.as_deref().filter(|hash| !hash.is_empty()),
        }
    }

    pub fn requires_upload(&self) -> bool {
        self.change_type.contains(ChangeType::EDIT)
            && !(self.change_type.contains(ChangeType::MERGE)
                && self.change_type.contains(ChangeType::DELETE))
    }
}
