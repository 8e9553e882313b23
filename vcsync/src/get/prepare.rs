use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};

use itertools::Itertools;
use vcsync_core::{operation::GetOperation, types::ItemId};

use crate::{
    path::{server_sort_key, PathKey},
    state::{with_local_version_table, TableError},
};

use super::{action::Action, batch::Batch};

/// Dispatch order: creations and edits top-down by target (an attributes
/// file before its siblings), then pure deletions bottom-up.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey {
    Target(Vec<String>, ItemId),
    Delete(Reverse<PathKey>, ItemId),
}

impl SortKey {
    pub fn new(operation: &GetOperation) -> Self {
        if let Some(target_server_item) = &operation.target_server_item {
            return SortKey::Target(server_sort_key(target_server_item), operation.item_id);
        }
        if let Some(target_local_item) = &operation.target_local_item {
            return SortKey::Target(
                server_sort_key(&local_as_server_path(target_local_item)),
                operation.item_id,
            );
        }
        let source = operation
            .source_local_item
            .as_deref()
            .map(|path| PathKey::new(path, true))
            .unwrap_or_else(|| PathKey::new(Path::new(""), true));
        SortKey::Delete(Reverse(source), operation.item_id)
    }
}

fn local_as_server_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .join("/")
}

/// Merge a pure deletion and a pure creation of the same item into a single
/// move. A case only rename reported as delete + create is then applied as
/// one rename.
pub fn pair_moves(operations: Vec<GetOperation>) -> Vec<GetOperation> {
    let mut creations: HashMap<ItemId, usize> = HashMap::new();
    for (index, operation) in operations.iter().enumerate() {
        if operation.source_local_item.is_none() && operation.target_local_item.is_some() {
            creations.entry(operation.item_id).or_insert(index);
        }
    }

    let mut merged: HashMap<usize, GetOperation> = HashMap::new();
    let mut consumed = vec![false; operations.len()];
    for (index, operation) in operations.iter().enumerate() {
        if operation.source_local_item.is_none() || operation.target_local_item.is_some() {
            continue;
        }
        let creation_index = match creations.remove(&operation.item_id) {
            Some(creation_index) => creation_index,
            None => continue,
        };

        let mut moved = operations[creation_index].clone();
        moved.source_local_item = operation.source_local_item.clone();
        moved.version_local = operation.version_local;
        if operation.source_server_item.is_some() {
            moved.source_server_item = operation.source_server_item.clone();
        }
        log::debug!(
            "Pair deletion and creation of item {} into a move",
            operation.item_id
        );
        consumed[index] = true;
        merged.insert(creation_index, moved);
    }

    operations
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !consumed[*index])
        .map(|(index, operation)| merged.remove(&index).unwrap_or(operation))
        .collect()
}

/// Operations of one batch, ordered and indexed by the local item they
/// currently occupy
pub struct Prepared {
    pub actions: Vec<Arc<Action>>,
    pub existing_local: HashMap<PathKey, Arc<Action>>,
}

/// Build the ordered list of actions from one or more arrays of operations.
/// When several arrays are given, operations on the same local item are
/// deduplicated: by current local item (preferring the one with a target)
/// and, for creations, by target local item.
pub fn prepare(batch: &Batch, results: Vec<Vec<GetOperation>>) -> Result<Prepared, TableError> {
    let case_insensitive = batch.context.case_insensitive();
    let multiple = results.len() > 1;

    let mut operations = vec![];
    for operation in pair_moves(results.into_iter().flatten().collect()) {
        if let Err(error) = operation.validate() {
            batch.on_non_fatal_error(None, error.to_string());
            continue;
        }
        operations.push(operation);
    }

    let mut existing_local: HashMap<PathKey, Arc<Action>> = HashMap::new();
    let mut new_local: BTreeMap<PathKey, Arc<Action>> = BTreeMap::new();
    let mut kept = vec![];
    for operation in operations {
        let action = Arc::new(Action::new(operation));

        match action.operation.source_local_item.clone() {
            Some(source) => {
                let key = PathKey::new(&source, case_insensitive);
                match existing_local.get(&key) {
                    None => {
                        existing_local.insert(key, action.clone());
                        kept.push(action);
                    }
                    Some(existing) if multiple => {
                        if existing.operation.target_local_item.is_none()
                            && action.operation.target_local_item.is_some()
                        {
                            let replaced = existing.clone();
                            kept.retain(|kept_action| !Arc::ptr_eq(kept_action, &replaced));
                            existing_local.insert(key, action.clone());
                            kept.push(action);
                        }
                    }
                    Some(_) => {
                        batch.on_non_fatal_error(
                            Some(&action),
                            format!(
                                "Two operations for the same local path {}, another get may be required",
                                source.display()
                            ),
                        );
                        kept.push(action);
                    }
                }
            }
            None if multiple => {
                if let Some(target) = action.target_local_item() {
                    let key = PathKey::new(target, case_insensitive);
                    if !new_local.contains_key(&key) {
                        new_local.insert(key, action.clone());
                        kept.push(action);
                    }
                }
            }
            None => kept.push(action),
        }
    }

    let mut actions = kept;
    actions.sort_by_cached_key(|action| SortKey::new(&action.operation));

    if batch.context.is_local() {
        with_local_version_table(&batch.context, |table| {
            for action in &actions {
                if let Some(target) = action.target_local_item() {
                    action.set_local_version_entry(table.get_by_local_item(target)?);
                }
            }
            Ok(())
        })?;
    }

    Ok(Prepared {
        actions,
        existing_local,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{create_file, create_folder, delete, tmpdir};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use vcsync_core::types::ItemType;

    #[test]
    fn test_sort_folders_first_deletes_bottom_up() {
        let root = PathBuf::from("/w");
        let mut operations = vec![
            delete(5, ItemType::Folder, "$/old", &root.join("old"), 1),
            create_file(2, "$/proj/b.txt", &root.join("proj/b.txt"), 1, "b"),
            delete(6, ItemType::File, "$/old/a.txt", &root.join("old/a.txt"), 1),
            create_file(3, "$/proj/.vcattributes", &root.join("proj/.vcattributes"), 1, "c"),
            create_folder(1, "$/proj", &root.join("proj"), 1),
        ];

        operations.sort_by_cached_key(SortKey::new);

        let ids: Vec<i32> = operations.iter().map(|o| o.item_id.0).collect();
        assert_eq!(ids, vec![1, 3, 2, 6, 5]);
    }

    #[test]
    fn test_pair_moves() {
        let root = tmpdir();
        let operations = vec![
            delete(1, ItemType::File, "$/proj/Old.txt", &root.join("proj/Old.txt"), 4),
            create_file(1, "$/proj/old.txt", &root.join("proj/old.txt"), 4, "u"),
            delete(2, ItemType::File, "$/proj/gone.txt", &root.join("proj/gone.txt"), 4),
        ];

        let paired = pair_moves(operations);

        assert_eq!(paired.len(), 2);
        assert_eq!(paired[0].item_id, ItemId(1));
        assert_eq!(paired[0].source_local_item, Some(root.join("proj/Old.txt")));
        assert_eq!(paired[0].target_local_item, Some(root.join("proj/old.txt")));
        assert_eq!(paired[0].version_local, 4);
        assert_eq!(paired[0].source_server_item.as_deref(), Some("$/proj/Old.txt"));
        assert_eq!(paired[1].item_id, ItemId(2));
    }
}
