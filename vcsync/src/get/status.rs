use std::path::PathBuf;

use strum_macros::Display;
use vcsync_core::types::{ItemId, ServerItem};

use super::action::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OperationStatus {
    Getting,
    Replacing,
    Deleting,
    Conflict,
    SourceWritable,
    TargetWritable,
    TargetLocalPending,
    TargetIsDirectory,
    SourceDirectoryNotEmpty,
    UnableToRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConflictReason {
    /// Reported by the server with the operation
    Server,
    /// A folder stands where a file is expected, or a file where a folder is
    ItemTypeMismatch,
}

impl OperationStatus {
    /// Warnings the user can resolve as a local conflict
    pub fn is_resolvable(&self) -> bool {
        matches!(
            self,
            OperationStatus::SourceWritable
                | OperationStatus::TargetWritable
                | OperationStatus::TargetLocalPending
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReference {
    pub item_id: ItemId,
    pub server_item: Option<ServerItem>,
    pub source_local_item: Option<PathBuf>,
    pub target_local_item: Option<PathBuf>,
}

impl From<&Action> for ItemReference {
    fn from(action: &Action) -> Self {
        Self {
            item_id: action.operation.item_id,
            server_item: action
                .operation
                .target_server_item
                .clone()
                .or_else(|| action.operation.source_server_item.clone()),
            source_local_item: action.operation.source_local_item.clone(),
            target_local_item: action.operation.target_local_item.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetEvent {
    /// Item was (or, in preview, would be) got, replaced or deleted
    Completed {
        status: OperationStatus,
        item: ItemReference,
    },
    Conflict {
        reason: ConflictReason,
        item: ItemReference,
    },
    Warning {
        status: OperationStatus,
        item: ItemReference,
        /// Operation standing in the way, if any
        blocking: Option<ItemReference>,
    },
    NonFatalError {
        item: Option<ItemReference>,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetStatus {
    pub num_operations: usize,
    pub num_updated: usize,
    pub num_conflicts: usize,
    pub num_warnings: usize,
    pub num_failures: usize,
    pub have_resolvable_warnings: bool,
    pub canceled: bool,
    pub events: Vec<GetEvent>,
}

impl GetStatus {
    pub fn is_no_action_needed(&self) -> bool {
        self.num_operations == 0
    }

    pub fn warnings(&self) -> Vec<&GetEvent> {
        self.events
            .iter()
            .filter(|event| matches!(event, GetEvent::Warning { .. }))
            .collect()
    }

    pub fn conflicts(&self) -> Vec<(ConflictReason, &ItemReference)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                GetEvent::Conflict { reason, item } => Some((*reason, item)),
                _ => None,
            })
            .collect()
    }

    pub fn non_fatal_errors(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                GetEvent::NonFatalError { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self, status: OperationStatus) -> Vec<&ItemReference> {
        self.events
            .iter()
            .filter_map(|event| match event {
                GetEvent::Completed {
                    status: event_status,
                    item,
                } if *event_status == status => Some(item),
                _ => None,
            })
            .collect()
    }
}
