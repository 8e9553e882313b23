use std::{collections::HashSet, path::PathBuf};

use anyhow::{Context, Result};
use vcsync_core::{
    types::{BaselineId, FileEncoding, ItemId, VersionNumber},
    update::{ClientLocalVersionUpdate, LocalVersionUpdate},
};

use crate::{baseline::BaselineCache, util};

use super::{LocalVersionEntry, LocalVersionTable};

/// Baseline content to fetch once the transaction which assigned its id
/// is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineRequest {
    pub server_item: String,
    pub committed: bool,
    pub baseline_id: BaselineId,
    pub download_url: String,
    pub target_local_item: Option<PathBuf>,
    pub hash_value: Option<Vec<u8>>,
}

/// Apply updates in submission order. Baselines of rows displaced by a local
/// path collision are collected in `displaced` (an id re-used by a later row
/// is taken out again).
pub fn apply_updates(
    table: &LocalVersionTable,
    baselines: &BaselineCache,
    updates: &[LocalVersionUpdate],
    displaced: &mut HashSet<BaselineId>,
) -> Result<Vec<BaselineRequest>> {
    let mut requests = vec![];

    for update in updates {
        match update {
            LocalVersionUpdate::Client(update) => {
                if let Some(request) = apply_client_update(table, baselines, update, displaced)
                    .context(format!("Apply update of {}", update.source_server_item))?
                {
                    requests.push(request);
                }
            }
            LocalVersionUpdate::MoveUncommitted {
                source_local_item,
                target_server_item,
            } => apply_move_uncommitted(table, source_local_item, target_server_item).context(
                format!("Move uncommitted {}", source_local_item.display()),
            )?,
            LocalVersionUpdate::InitiallyDeleted {
                source_server_item,
                item_id,
                local_version,
                encoding,
                download_url,
            } => {
                if let Some(request) = apply_initially_deleted(
                    table,
                    baselines,
                    source_server_item,
                    *item_id,
                    *local_version,
                    *encoding,
                    download_url.as_deref(),
                )
                .context(format!("Record {} as deleted", source_server_item))?
                {
                    requests.push(request);
                }
            }
        }
    }

    Ok(requests)
}

fn apply_client_update(
    table: &LocalVersionTable,
    baselines: &BaselineCache,
    update: &ClientLocalVersionUpdate,
    displaced: &mut HashSet<BaselineId>,
) -> Result<Option<BaselineRequest>> {
    let committed = update.is_committed();
    let existing = table.get_by_server_item(&update.source_server_item, committed)?;

    let target = match &update.target_local_item {
        Some(target) => target,
        None => {
            if let Some(existing) = existing {
                if update.keep_row_on_delete {
                    let mut deleted = existing;
                    deleted.is_deleted = true;
                    deleted.local_item = None;
                    table.insert_or_replace(&deleted)?;
                } else {
                    table.remove(&existing.server_item, existing.is_committed())?;
                    if let Some(baseline_id) = existing.baseline_id {
                        baselines.delete_baseline(&baseline_id);
                    }
                }
            }
            return Ok(None);
        }
    };

    if let Some(collision) = table.get_by_local_item(target)? {
        let same_row = existing.as_ref().map_or(false, |existing| {
            existing.server_item == collision.server_item
                && existing.is_committed() == collision.is_committed()
        });
        if !same_row {
            if let Some(baseline_id) = collision.baseline_id {
                displaced.insert(baseline_id);
            }
            table.remove(&collision.server_item, collision.is_committed())?;
        }
    }

    let mut entry = LocalVersionEntry {
        server_item: update.source_server_item.clone(),
        local_item: Some(target.clone()),
        item_id: update.item_id,
        version: update.local_version,
        version_date: update.version_date,
        encoding: update.encoding,
        hash_value: update.hash_value.clone(),
        length: update.length,
        last_modified: None,
        baseline_id: update.baseline_id,
        is_deleted: false,
        missing_baseline: false,
        pending_reconcile: true,
        properties: update.properties,
    };

    if let Some(existing) = &existing {
        // Same version: what is not carried by the update is still valid
        if existing.version == entry.version {
            entry.hash_value = entry.hash_value.or_else(|| existing.hash_value.clone());
            entry.length = entry.length.or(existing.length);
            entry.version_date = entry.version_date.or(existing.version_date);
            if entry.baseline_id.is_none()
                && entry.length == existing.length
                && entry.hash_value == existing.hash_value
            {
                entry.baseline_id = existing.baseline_id;
            }
        }

        if let Some(existing_baseline) = existing.baseline_id {
            if entry.baseline_id.is_none()
                && existing.length.is_some()
                && existing.length == entry.length
                && existing.hash_value.is_some()
                && existing.hash_value == entry.hash_value
            {
                entry.baseline_id = Some(existing_baseline);
            } else if entry.baseline_id != Some(existing_baseline) {
                baselines.delete_baseline(&existing_baseline);
            }
        }
    }

    if !entry.is_folder() && target.exists() {
        entry.last_modified = util::last_modified_millis(target).ok();
    }

    let mut request = None;
    match entry.baseline_id {
        Some(baseline_id) => {
            displaced.remove(&baseline_id);
        }
        None => {
            if !entry.is_folder() && (entry.version != 0 || update.download_url.is_some()) {
                entry.missing_baseline = true;
                if let Some(download_url) = &update.download_url {
                    let baseline_id = BaselineCache::new_baseline_id();
                    entry.baseline_id = Some(baseline_id);
                    request = Some(BaselineRequest {
                        server_item: entry.server_item.clone(),
                        committed,
                        baseline_id,
                        download_url: download_url.clone(),
                        target_local_item: Some(target.clone()),
                        hash_value: entry.hash_value.clone(),
                    });
                }
            }
        }
    }

    table.insert_or_replace(&entry)?;
    Ok(request)
}

fn apply_move_uncommitted(
    table: &LocalVersionTable,
    source_local_item: &std::path::Path,
    target_server_item: &str,
) -> Result<()> {
    if let Some(mut entry) = table.get_by_local_item(source_local_item)? {
        if !entry.is_committed() && !entry.server_item.eq_ignore_ascii_case(target_server_item) {
            table.remove(&entry.server_item, false)?;
            entry.server_item = target_server_item.to_string();
            entry.pending_reconcile = true;
            table.insert_or_replace(&entry)?;
        }
    }
    Ok(())
}

fn apply_initially_deleted(
    table: &LocalVersionTable,
    baselines: &BaselineCache,
    server_item: &str,
    item_id: ItemId,
    local_version: VersionNumber,
    encoding: FileEncoding,
    download_url: Option<&str>,
) -> Result<Option<BaselineRequest>> {
    let committed = local_version != 0;
    if let Some(existing) = table.get_by_server_item(server_item, committed)? {
        if let Some(baseline_id) = existing.baseline_id {
            baselines.delete_baseline(&baseline_id);
        }
    }

    let mut entry = LocalVersionEntry::new(server_item, item_id, local_version);
    entry.encoding = encoding;
    entry.is_deleted = true;
    entry.pending_reconcile = true;

    let mut request = None;
    if !encoding.is_folder() && committed {
        entry.missing_baseline = true;
        if let Some(download_url) = download_url {
            let baseline_id = BaselineCache::new_baseline_id();
            entry.baseline_id = Some(baseline_id);
            request = Some(BaselineRequest {
                server_item: server_item.to_string(),
                committed,
                baseline_id,
                download_url: download_url.to_string(),
                target_local_item: None,
                hash_value: None,
            });
        }
    }

    table.insert_or_replace(&entry)?;
    Ok(request)
}

/// The server now knows about these updates: clear their pending reconcile flag
pub fn acknowledge(table: &LocalVersionTable, updates: &[LocalVersionUpdate]) -> Result<()> {
    for update in updates {
        match update {
            LocalVersionUpdate::Client(_) | LocalVersionUpdate::InitiallyDeleted { .. } => {
                table.mark_reconciled(update.server_item(), update.is_committed())?
            }
            LocalVersionUpdate::MoveUncommitted { .. } => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::Context,
        state::with_local_version_table,
        tests::{client_update, context, tmpdir},
    };
    use pretty_assertions::assert_eq;
    use std::fs;

    fn apply(
        context: &Context,
        baselines: &BaselineCache,
        updates: Vec<LocalVersionUpdate>,
        displaced: &mut HashSet<BaselineId>,
    ) -> Vec<BaselineRequest> {
        with_local_version_table(context, |table| {
            apply_updates(table, baselines, &updates, displaced)
        })
        .unwrap()
    }

    fn entries(context: &Context) -> Vec<LocalVersionEntry> {
        with_local_version_table(context, |table| table.entries()).unwrap()
    }

    #[test]
    fn test_new_row_requests_baseline() {
        // Given
        let context = context(&tmpdir());
        let baselines = BaselineCache::new(&context, vec![]);
        let target = context.root.join("a.txt");
        fs::write(&target, b"a").unwrap();
        let mut update = client_update("$/proj/a.txt", 1, Some(&target), 5);
        update.download_url = Some("a".to_string());

        // When
        let requests = apply(
            &context,
            &baselines,
            vec![LocalVersionUpdate::Client(update)],
            &mut HashSet::new(),
        );

        // Then
        let entries = entries(&context);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].pending_reconcile);
        assert!(entries[0].missing_baseline);
        assert!(entries[0].last_modified.is_some());
        assert_eq!(requests.len(), 1);
        assert_eq!(Some(requests[0].baseline_id), entries[0].baseline_id);
    }

    #[test]
    fn test_folder_never_gets_baseline() {
        let context = context(&tmpdir());
        let baselines = BaselineCache::new(&context, vec![]);
        let mut update = client_update("$/proj", 1, Some(&context.root.join("proj")), 5);
        update.encoding = FileEncoding::Folder;
        update.download_url = Some("proj".to_string());

        let requests = apply(
            &context,
            &baselines,
            vec![LocalVersionUpdate::Client(update)],
            &mut HashSet::new(),
        );

        assert!(requests.is_empty());
        assert_eq!(entries(&context)[0].baseline_id, None);
        assert!(!entries(&context)[0].missing_baseline);
    }

    #[test]
    fn test_move_keeps_baseline_of_same_version() {
        // Given
        let context = context(&tmpdir());
        let baselines = BaselineCache::new(&context, vec![]);
        let mut first = client_update("$/proj/a.txt", 1, Some(&context.root.join("a.txt")), 5);
        first.baseline_id = Some(BaselineId([1; 16]));
        first.hash_value = Some(vec![9; 16]);
        first.length = Some(3);
        apply(
            &context,
            &baselines,
            vec![LocalVersionUpdate::Client(first)],
            &mut HashSet::new(),
        );

        // When
        let moved = client_update("$/proj/a.txt", 1, Some(&context.root.join("b.txt")), 5);
        let requests = apply(
            &context,
            &baselines,
            vec![LocalVersionUpdate::Client(moved)],
            &mut HashSet::new(),
        );

        // Then
        assert!(requests.is_empty());
        let entries = entries(&context);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local_item, Some(context.root.join("b.txt")));
        assert_eq!(entries[0].baseline_id, Some(BaselineId([1; 16])));
        assert_eq!(entries[0].length, Some(3));
    }

    #[test]
    fn test_local_path_collision_displaces_row() {
        // Given
        let context = context(&tmpdir());
        let baselines = BaselineCache::new(&context, vec![]);
        let target = context.root.join("a.txt");
        let mut old = client_update("$/proj/old.txt", 1, Some(&target), 5);
        old.baseline_id = Some(BaselineId([1; 16]));
        let new = client_update("$/proj/a.txt", 2, Some(&target), 7);
        let mut displaced = HashSet::new();

        // When
        apply(
            &context,
            &baselines,
            vec![
                LocalVersionUpdate::Client(old),
                LocalVersionUpdate::Client(new),
            ],
            &mut displaced,
        );

        // Then
        let entries = entries(&context);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server_item, "$/proj/a.txt");
        assert_eq!(displaced, HashSet::from([BaselineId([1; 16])]));
    }

    #[test]
    fn test_delete_keeps_or_removes_row() {
        // Given
        let context = context(&tmpdir());
        let baselines = BaselineCache::new(&context, vec![]);
        let a = client_update("$/a", 1, Some(&context.root.join("a")), 5);
        let b = client_update("$/b", 2, Some(&context.root.join("b")), 5);
        apply(
            &context,
            &baselines,
            vec![LocalVersionUpdate::Client(a), LocalVersionUpdate::Client(b)],
            &mut HashSet::new(),
        );

        // When
        let mut delete_a = client_update("$/a", 1, None, 5);
        delete_a.keep_row_on_delete = true;
        let delete_b = client_update("$/b", 2, None, 5);
        apply(
            &context,
            &baselines,
            vec![
                LocalVersionUpdate::Client(delete_a),
                LocalVersionUpdate::Client(delete_b),
            ],
            &mut HashSet::new(),
        );

        // Then
        let entries = entries(&context);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server_item, "$/a");
        assert!(entries[0].is_deleted);
        assert_eq!(entries[0].local_item, None);
    }

    #[test]
    fn test_move_uncommitted_refiles_row() {
        // Given
        let context = context(&tmpdir());
        let baselines = BaselineCache::new(&context, vec![]);
        let source = context.root.join("new.txt");
        let add = client_update("$/new.txt", 0, Some(&source), 0);
        apply(
            &context,
            &baselines,
            vec![LocalVersionUpdate::Client(add)],
            &mut HashSet::new(),
        );

        // When
        let target = context.root.join("renamed.txt");
        apply(
            &context,
            &baselines,
            vec![
                LocalVersionUpdate::MoveUncommitted {
                    source_local_item: source,
                    target_server_item: "$/renamed.txt".to_string(),
                },
                LocalVersionUpdate::Client(client_update("$/renamed.txt", 0, Some(&target), 0)),
            ],
            &mut HashSet::new(),
        );

        // Then
        let entries = entries(&context);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server_item, "$/renamed.txt");
        assert_eq!(entries[0].local_item, Some(target));
    }

    #[test]
    fn test_initially_deleted_and_acknowledge() {
        // Given
        let context = context(&tmpdir());
        let baselines = BaselineCache::new(&context, vec![]);
        let update = LocalVersionUpdate::InitiallyDeleted {
            source_server_item: "$/gone.txt".to_string(),
            item_id: ItemId(4),
            local_version: 3,
            encoding: FileEncoding::Text,
            download_url: Some("gone".to_string()),
        };

        // When
        let requests = apply(&context, &baselines, vec![update.clone()], &mut HashSet::new());
        with_local_version_table(&context, |table| acknowledge(table, &[update.clone()]))
            .unwrap();

        // Then
        assert_eq!(requests.len(), 1);
        let entries = entries(&context);
        assert!(entries[0].is_deleted);
        assert_eq!(entries[0].local_item, None);
        assert!(!entries[0].pending_reconcile);
    }
}
