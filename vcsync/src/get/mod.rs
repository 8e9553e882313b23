//! Get engine: brings the working copy to the state described by the
//! server's get operations.
//!
//! Operations are ordered (folders before their content, deletions children
//! first) and applied by a single controlling thread. Downloads run on the
//! session transfer pool. Operations which cannot be applied yet are
//! retried in following rounds while rounds make progress, what remains is
//! reported as warnings. Local version updates are queued as items complete
//! and written when the queue closes, whatever the outcome.
use std::sync::Arc;

use vcsync_core::{
    operation::GetOperation,
    types::GetOptions,
    update::LocalVersionUpdate,
};

use crate::{
    cancel::CancelFlag,
    context::Context,
    error::EngineError,
    path::paths_equal,
    pool::CompletionService,
    queue::{QueueOptions, QueueThresholds, UpdateLocalVersionQueue},
    session::Session,
};

use self::{
    action::Action,
    batch::{client_update, Batch},
    prepare::prepare,
    process::Processor,
};

pub mod action;
pub mod batch;
mod download;
mod finalize;
pub mod prepare;
pub mod process;
pub mod status;

pub use status::{ConflictReason, GetEvent, GetStatus, ItemReference, OperationStatus};

pub struct GetEngine {
    session: Arc<Session>,
}

impl GetEngine {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Apply one or more arrays of get operations to the workspace of
    /// `context`. Per item problems are reported in the returned status, a
    /// cancellation or a fatal error fails the whole call once every queued
    /// local version update is written.
    pub fn process(
        &self,
        context: &Context,
        results: Vec<Vec<GetOperation>>,
        options: GetOptions,
        cancel: &CancelFlag,
    ) -> Result<GetStatus, EngineError> {
        log::info!(
            "[{}] Process {} get operations",
            context.workspace_name,
            results.iter().map(Vec::len).sum::<usize>()
        );

        let lock = if context.is_local() {
            Some(self.session.locks().acquire(context)?)
        } else {
            None
        };
        let baselines = self.session.baselines(context)?;
        let queue = UpdateLocalVersionQueue::new(
            context.clone(),
            self.session.transport(),
            baselines.clone(),
            QueueOptions::UpdateBoth,
            QueueThresholds::from_context(context),
        );
        let batch = Arc::new(Batch::new(
            context.clone(),
            options,
            self.session.transport(),
            baselines,
            queue,
            cancel.clone(),
        ));

        let mut processor = None;
        let outcome = prepare(&batch, results)
            .map_err(EngineError::from)
            .and_then(|prepared| {
                if options.remap && context.is_local() {
                    self.remap(&batch, &prepared.actions)?;
                }
                processor
                    .insert(Processor::new(
                        batch.clone(),
                        CompletionService::new(self.session.pool()),
                        lock,
                        prepared.existing_local,
                    ))
                    .run(prepared.actions)
            });

        let closed = batch.queue.close();
        // Releases the workspace lock, after the queue is written
        drop(processor);

        match outcome {
            Ok(()) => {
                closed?;
                let status = batch.status();
                log::info!(
                    "[{}] Get done: {} operations, {} updated, {} conflicts, {} warnings, {} failures",
                    context.workspace_name,
                    status.num_operations,
                    status.num_updated,
                    status.num_conflicts,
                    status.num_warnings,
                    status.num_failures
                );
                Ok(status)
            }
            Err(EngineError::Canceled) => {
                log::info!("[{}] Get canceled", context.workspace_name);
                batch.set_canceled();
                closed?;
                Err(EngineError::Canceled)
            }
            Err(error) => {
                if let Err(close_error) = closed {
                    log::error!(
                        "[{}] Unable to write local version updates: {}",
                        context.workspace_name,
                        close_error
                    );
                }
                Err(error)
            }
        }
    }

    /// Acknowledge unchanged items in bulk and take them out of the batch
    fn remap(&self, batch: &Batch, actions: &[Arc<Action>]) -> Result<(), EngineError> {
        let context = &batch.context;
        let queue = UpdateLocalVersionQueue::new(
            context.clone(),
            self.session.transport(),
            batch.baselines.clone(),
            QueueOptions::UpdateLocal,
            QueueThresholds::remap(context),
        );

        let mut remapped = 0;
        let queued: Result<(), EngineError> = actions.iter().try_for_each(|action| {
            let operation = &action.operation;
            let unchanged = operation.version_local == operation.version_server
                && !operation.has_conflict()
                && match (&operation.source_local_item, &operation.target_local_item) {
                    (Some(source), Some(target)) => paths_equal(source, target, false),
                    _ => false,
                };
            let server_item = match operation.row_server_item() {
                Some(server_item) if unchanged => server_item.clone(),
                _ => return Ok(()),
            };

            queue.queue(LocalVersionUpdate::Client(client_update(
                operation,
                server_item,
                operation.target_local_item.as_deref(),
                operation.version_server,
            )))?;
            action.set_ignore();
            remapped += 1;
            Ok(())
        });
        let closed = queue.close();
        queued?;
        closed?;

        log::debug!(
            "[{}] Remapped {} unchanged items",
            context.workspace_name,
            remapped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::with_local_version_table,
        tests::{context, create_file, create_folder, delete, disk_entries, local_context, tmpdir},
        util,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::{collections::HashMap, fs, path::Path};
    use vcsync_core::{
        client::{MockTransport, TransportError},
        operation::{ConflictDescriptor, ConflictKind},
        types::{ItemId, ItemType},
    };

    type Acknowledged = Arc<Mutex<Vec<LocalVersionUpdate>>>;

    /// Transport serving `contents` by download handle and recording
    /// acknowledged updates
    fn transport(contents: &[(&str, &[u8])], acknowledged: &Acknowledged) -> MockTransport {
        let contents: HashMap<String, Vec<u8>> = contents
            .iter()
            .map(|(handle, content)| (handle.to_string(), content.to_vec()))
            .collect();
        let acknowledged = acknowledged.clone();

        let mut transport = MockTransport::new();
        transport
            .expect_download()
            .returning(move |download_url, destination| match contents.get(download_url) {
                Some(content) => {
                    fs::write(destination, content)?;
                    Ok(content.len() as u64)
                }
                None => Err(TransportError::NotFound(download_url.to_string())),
            });
        transport
            .expect_update_local_version()
            .returning(move |_, updates| {
                acknowledged.lock().extend(updates.iter().cloned());
                Ok(())
            });
        transport
    }

    fn engine(transport: MockTransport, context: &Context) -> GetEngine {
        GetEngine::new(Arc::new(
            Session::new(Arc::new(transport), &context.config).unwrap(),
        ))
    }

    fn acknowledged_targets(acknowledged: &Acknowledged, root: &Path) -> Vec<Option<String>> {
        acknowledged
            .lock()
            .iter()
            .map(|update| match update {
                LocalVersionUpdate::Client(update) => update
                    .target_local_item
                    .as_ref()
                    .map(|target| target.strip_prefix(root).unwrap().display().to_string()),
                _ => None,
            })
            .collect()
    }

    fn synced(mut operation: GetOperation) -> GetOperation {
        operation.source_local_item = operation.target_local_item.clone();
        operation.version_local = operation.version_server;
        operation
    }

    #[test]
    fn test_folder_and_file() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[("a", b"hello")], &acknowledged), &context);
        let operations = vec![
            create_file(2, "$/proj/a.txt", &root.join("proj/a.txt"), 5, "a"),
            create_folder(1, "$/proj", &root.join("proj"), 5),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(disk_entries(&root), vec!["proj", "proj/a.txt"]);
        assert_eq!(fs::read(root.join("proj/a.txt")).unwrap(), b"hello");
        assert!(util::is_read_only(&root.join("proj/a.txt")));
        assert_eq!(status.num_operations, 2);
        assert_eq!(status.num_updated, 2);
        assert_eq!(status.num_warnings, 0);
        assert_eq!(status.completed(OperationStatus::Getting).len(), 2);
        assert_eq!(
            acknowledged_targets(&acknowledged, &root),
            vec![Some("proj".to_string()), Some("proj/a.txt".to_string())]
        );
    }

    #[test]
    fn test_synced_batch_is_a_no_op() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::create_dir_all(root.join("proj")).unwrap();
        fs::write(root.join("proj/a.txt"), b"hello").unwrap();
        util::set_read_only(&root.join("proj/a.txt"), true).unwrap();
        let modified = util::last_modified_millis(&root.join("proj/a.txt")).unwrap();
        let mut transport = MockTransport::new();
        transport.expect_download().never();
        transport.expect_update_local_version().never();
        let engine = engine(transport, &context);
        let operations = vec![
            synced(create_folder(1, "$/proj", &root.join("proj"), 5)),
            synced(create_file(2, "$/proj/a.txt", &root.join("proj/a.txt"), 5, "a")),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_updated, 0);
        assert_eq!(status.num_warnings, 0);
        assert_eq!(status.num_failures, 0);
        assert_eq!(disk_entries(&root), vec!["proj", "proj/a.txt"]);
        assert_eq!(
            util::last_modified_millis(&root.join("proj/a.txt")).unwrap(),
            modified
        );
    }

    #[test]
    fn test_case_only_rename_is_a_single_rename() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::create_dir_all(root.join("proj")).unwrap();
        fs::write(root.join("proj/Old.txt"), b"content").unwrap();
        let acknowledged = Acknowledged::default();
        let acknowledged_clone = acknowledged.clone();
        let mut transport = MockTransport::new();
        transport.expect_download().never();
        transport
            .expect_update_local_version()
            .returning(move |_, updates| {
                acknowledged_clone.lock().extend(updates.iter().cloned());
                Ok(())
            });
        let engine = engine(transport, &context);
        let operations = vec![
            delete(1, ItemType::File, "$/proj/Old.txt", &root.join("proj/Old.txt"), 4),
            create_file(1, "$/proj/old.txt", &root.join("proj/old.txt"), 4, "u"),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(disk_entries(&root), vec!["proj", "proj/old.txt"]);
        assert_eq!(fs::read(root.join("proj/old.txt")).unwrap(), b"content");
        assert_eq!(status.num_operations, 1);
        assert_eq!(status.num_updated, 1);
        assert_eq!(
            acknowledged_targets(&acknowledged, &root),
            vec![Some("proj/old.txt".to_string())]
        );
    }

    #[test]
    fn test_child_deleted_before_parent() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::create_dir_all(root.join("old")).unwrap();
        fs::write(root.join("old/a.txt"), b"a").unwrap();
        util::set_read_only(&root.join("old/a.txt"), true).unwrap();
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[], &acknowledged), &context);
        let operations = vec![
            delete(5, ItemType::Folder, "$/old", &root.join("old"), 1),
            delete(6, ItemType::File, "$/old/a.txt", &root.join("old/a.txt"), 1),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert!(disk_entries(&root).is_empty());
        let deleted: Vec<ItemId> = status
            .completed(OperationStatus::Deleting)
            .iter()
            .map(|item| item.item_id)
            .collect();
        assert_eq!(deleted, vec![ItemId(6), ItemId(5)]);
        assert_eq!(status.num_updated, 2);
        assert_eq!(status.num_warnings, 0);
    }

    #[test]
    fn test_not_empty_folder_is_a_warning() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::create_dir_all(root.join("old")).unwrap();
        fs::write(root.join("old/private.txt"), b"mine").unwrap();
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[], &acknowledged), &context);
        let operations = vec![delete(5, ItemType::Folder, "$/old", &root.join("old"), 1)];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(disk_entries(&root), vec!["old", "old/private.txt"]);
        assert_eq!(status.num_warnings, 1);
        assert!(matches!(
            status.warnings()[0],
            GetEvent::Warning {
                status: OperationStatus::SourceDirectoryNotEmpty,
                ..
            }
        ));
        // The server still learns the folder is gone from the workspace
        assert_eq!(acknowledged_targets(&acknowledged, &root), vec![None]);
    }

    #[test]
    fn test_mutually_blocked_swap_ends_as_warnings() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::write(root.join("a.txt"), b"local a").unwrap();
        fs::write(root.join("b.txt"), b"local b").unwrap();
        let mut transport = MockTransport::new();
        transport.expect_download().never();
        let engine = engine(transport, &context);
        let mut a_to_b = create_file(1, "$/b.txt", &root.join("b.txt"), 2, "a");
        a_to_b.source_local_item = Some(root.join("a.txt"));
        a_to_b.version_local = 2;
        let mut b_to_a = create_file(2, "$/a.txt", &root.join("a.txt"), 2, "b");
        b_to_a.source_local_item = Some(root.join("b.txt"));
        b_to_a.version_local = 2;
        let operations = vec![a_to_b, b_to_a];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_warnings, 2);
        assert!(status.have_resolvable_warnings);
        assert!(status.warnings().iter().all(|warning| matches!(
            warning,
            GetEvent::Warning {
                status: OperationStatus::TargetWritable,
                ..
            }
        )));
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"local a");
        assert_eq!(fs::read(root.join("b.txt")).unwrap(), b"local b");
    }

    #[test]
    fn test_target_with_server_content_is_replaced() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::write(root.join("a.txt"), b"same").unwrap();
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[("a", b"same")], &acknowledged), &context);
        let mut operation = create_file(1, "$/a.txt", &root.join("a.txt"), 2, "a");
        operation.hash_value = Some(md5::compute(b"same").0.to_vec());

        // When
        let status = engine
            .process(&context, vec![vec![operation]], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_warnings, 0);
        assert_eq!(status.num_updated, 1);
        assert!(util::is_read_only(&root.join("a.txt")));
    }

    #[test]
    fn test_conflict_is_recorded_not_applied() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        let mut transport = MockTransport::new();
        transport.expect_download().never();
        let engine = engine(transport, &context);
        let mut operation = create_file(1, "$/a.txt", &root.join("a.txt"), 2, "a");
        operation.conflict = Some(ConflictDescriptor {
            kind: ConflictKind::Get,
            message: None,
        });

        // When
        let status = engine
            .process(&context, vec![vec![operation]], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_conflicts, 1);
        assert_eq!(status.num_updated, 0);
        assert!(disk_entries(&root).is_empty());
    }

    #[test]
    fn test_preview_leaves_disk_alone() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        let mut transport = MockTransport::new();
        transport.expect_download().never();
        transport.expect_update_local_version().never();
        let engine = engine(transport, &context);
        let operations = vec![
            create_folder(1, "$/proj", &root.join("proj"), 5),
            create_file(2, "$/proj/a.txt", &root.join("proj/a.txt"), 5, "a"),
        ];
        let options = GetOptions {
            preview: true,
            ..Default::default()
        };

        // When
        let status = engine
            .process(&context, vec![operations], options, &CancelFlag::new())
            .unwrap();

        // Then
        assert!(disk_entries(&root).is_empty());
        assert_eq!(status.completed(OperationStatus::Getting).len(), 2);
        assert_eq!(status.num_updated, 0);
    }

    #[test]
    fn test_download_failure_is_not_fatal() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[("b", b"b")], &acknowledged), &context);
        let operations = vec![
            create_file(1, "$/a.txt", &root.join("a.txt"), 2, "missing"),
            create_file(2, "$/b.txt", &root.join("b.txt"), 2, "b"),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_failures, 1);
        assert_eq!(disk_entries(&root), vec!["b.txt"]);
        assert_eq!(acknowledged_targets(&acknowledged, &root), vec![Some("b.txt".to_string())]);
    }

    #[test]
    fn test_cancel_writes_queued_updates() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        let cancel = CancelFlag::new();
        let acknowledged = Acknowledged::default();
        let acknowledged_clone = acknowledged.clone();
        let canceler = cancel.clone();
        let mut transport = MockTransport::new();
        transport
            .expect_download()
            .returning(move |_, destination| {
                fs::write(destination, b"a")?;
                canceler.cancel();
                Ok(1)
            });
        transport
            .expect_update_local_version()
            .returning(move |_, updates| {
                acknowledged_clone.lock().extend(updates.iter().cloned());
                Ok(())
            });
        let engine = engine(transport, &context);
        let operations = vec![
            create_folder(1, "$/proj", &root.join("proj"), 5),
            create_file(2, "$/proj/a.txt", &root.join("proj/a.txt"), 5, "a"),
        ];

        // When
        let result = engine.process(&context, vec![operations], GetOptions::default(), &cancel);

        // Then
        assert!(matches!(result, Err(EngineError::Canceled)));
        assert_eq!(
            acknowledged_targets(&acknowledged, &root),
            vec![Some("proj".to_string())]
        );
        assert!(!root.join("proj/a.txt").exists());
    }

    #[test]
    fn test_local_workspace_keeps_baselines() {
        // Given
        let root = tmpdir();
        let context = local_context(&root);
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[("a", b"hello")], &acknowledged), &context);
        let mut operation = create_file(2, "$/a.txt", &root.join("a.txt"), 5, "a");
        operation.hash_value = Some(md5::compute(b"hello").0.to_vec());

        // When
        let status = engine
            .process(&context, vec![vec![operation]], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_updated, 1);
        assert!(!util::is_read_only(&root.join("a.txt")));
        let entry = with_local_version_table(&context, |table| {
            table.get_by_local_item(&root.join("a.txt"))
        })
        .unwrap()
        .unwrap();
        assert_eq!(entry.version, 5);
        let baseline_id = entry.baseline_id.unwrap();
        let baselines = crate::baseline::BaselineCache::load(&context).unwrap();
        assert_eq!(baselines.materialize(&baseline_id).unwrap(), b"hello");
    }

    #[test]
    fn test_remap_acknowledges_unchanged_items() {
        // Given
        let root = tmpdir();
        let context = local_context(&root);
        fs::write(root.join("a.txt"), b"a").unwrap();
        let mut transport = MockTransport::new();
        transport.expect_download().never();
        transport.expect_update_local_version().never();
        let engine = engine(transport, &context);
        let operations = vec![synced(create_file(1, "$/a.txt", &root.join("a.txt"), 3, "a"))];
        let options = GetOptions {
            remap: true,
            ..Default::default()
        };

        // When
        let status = engine
            .process(&context, vec![operations], options, &CancelFlag::new())
            .unwrap();

        // Then
        assert!(status.is_no_action_needed());
        let entry = with_local_version_table(&context, |table| {
            table.get_by_local_item(&root.join("a.txt"))
        })
        .unwrap()
        .unwrap();
        assert_eq!(entry.version, 3);
    }

    #[test]
    fn test_folder_in_place_of_file_is_a_conflict() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::create_dir_all(root.join("a.txt")).unwrap();
        let mut transport = MockTransport::new();
        transport.expect_download().never();
        transport.expect_update_local_version().never();
        let engine = engine(transport, &context);
        let operations = vec![create_file(1, "$/a.txt", &root.join("a.txt"), 2, "a")];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_conflicts, 1);
        assert_eq!(status.num_warnings, 0);
        assert_eq!(status.conflicts()[0].0, ConflictReason::ItemTypeMismatch);
        assert!(root.join("a.txt").is_dir());
    }

    #[test]
    fn test_file_in_place_of_folder_is_a_conflict() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::write(root.join("proj"), b"keep me").unwrap();
        util::set_read_only(&root.join("proj"), true).unwrap();
        let mut transport = MockTransport::new();
        transport.expect_update_local_version().never();
        let engine = engine(transport, &context);
        let operations = vec![create_folder(1, "$/proj", &root.join("proj"), 2)];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_conflicts, 1);
        assert_eq!(status.conflicts()[0].0, ConflictReason::ItemTypeMismatch);
        assert_eq!(fs::read(root.join("proj")).unwrap(), b"keep me");
    }

    #[test]
    fn test_file_replaces_folder_deleted_in_same_batch() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::create_dir_all(root.join("old")).unwrap();
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[("new", b"new")], &acknowledged), &context);
        let operations = vec![
            delete(1, ItemType::Folder, "$/old", &root.join("old"), 1),
            create_file(2, "$/old", &root.join("old"), 2, "new"),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_conflicts, 0);
        assert_eq!(status.num_warnings, 0);
        assert_eq!(fs::read(root.join("old")).unwrap(), b"new");
        assert_eq!(status.num_updated, 2);
    }

    #[test]
    fn test_yield_writes_updates_before_giving_the_lock() {
        // Given
        let root = tmpdir();
        let mut context = local_context(&root);
        context.config.process_unit_of_work = 1;
        fs::create_dir_all(&context.metadata_path).unwrap();
        let yield_request = context.metadata_path.join("waiting.yield");
        fs::write(&yield_request, b"").unwrap();
        let acknowledged = Acknowledged::default();
        let acknowledged_clone = acknowledged.clone();
        let acknowledged_at_download = Arc::new(Mutex::new(vec![]));
        let acknowledged_at_download_clone = acknowledged_at_download.clone();
        let acknowledged_reader = acknowledged.clone();
        let mut transport = MockTransport::new();
        transport
            .expect_download()
            .returning(move |download_url, destination| {
                acknowledged_at_download_clone
                    .lock()
                    .push(acknowledged_reader.lock().len());
                fs::write(destination, download_url)?;
                Ok(download_url.len() as u64)
            });
        transport
            .expect_update_local_version()
            .returning(move |_, updates| {
                acknowledged_clone.lock().extend(updates.iter().cloned());
                Ok(())
            });
        let engine = engine(transport, &context);
        let operations = vec![
            create_file(1, "$/a.txt", &root.join("a.txt"), 2, "a"),
            create_file(2, "$/b.txt", &root.join("b.txt"), 2, "b"),
            create_file(3, "$/c.txt", &root.join("c.txt"), 2, "c"),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(*acknowledged_at_download.lock(), vec![0, 1, 2]);
        assert_eq!(status.num_updated, 3);
        assert_eq!(
            acknowledged_targets(&acknowledged, &root),
            vec![
                Some("a.txt".to_string()),
                Some("b.txt".to_string()),
                Some("c.txt".to_string())
            ]
        );
        assert_eq!(fs::read(root.join("c.txt")).unwrap(), b"c");
        assert!(yield_request.exists());
    }

    #[test]
    fn test_batches_are_deduplicated() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::write(root.join("b.txt"), b"b").unwrap();
        util::set_read_only(&root.join("b.txt"), true).unwrap();
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[("a", b"a")], &acknowledged), &context);
        let mut moved = create_file(2, "$/c.txt", &root.join("c.txt"), 2, "c");
        moved.source_local_item = Some(root.join("b.txt"));
        moved.version_local = 2;
        let results = vec![
            vec![
                create_file(1, "$/a.txt", &root.join("a.txt"), 2, "a"),
                delete(2, ItemType::File, "$/b.txt", &root.join("b.txt"), 2),
            ],
            vec![create_file(1, "$/a.txt", &root.join("a.txt"), 2, "a"), moved],
        ];

        // When
        let status = engine
            .process(&context, results, GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_operations, 2);
        assert_eq!(status.num_failures, 0);
        assert_eq!(disk_entries(&root), vec!["a.txt", "c.txt"]);
        assert_eq!(fs::read(root.join("c.txt")).unwrap(), b"b");
    }

    #[test]
    fn test_creation_takes_the_place_of_a_deleted_file() {
        // Given
        let root = tmpdir();
        let context = context(&root);
        fs::write(root.join("a.txt"), b"old").unwrap();
        util::set_read_only(&root.join("a.txt"), true).unwrap();
        let acknowledged = Acknowledged::default();
        let engine = engine(transport(&[("new", b"new")], &acknowledged), &context);
        let operations = vec![
            delete(1, ItemType::File, "$/old.txt", &root.join("a.txt"), 1),
            create_file(2, "$/a.txt", &root.join("a.txt"), 2, "new"),
        ];

        // When
        let status = engine
            .process(&context, vec![operations], GetOptions::default(), &CancelFlag::new())
            .unwrap();

        // Then
        assert_eq!(status.num_operations, 2);
        assert_eq!(status.num_updated, 2);
        assert_eq!(status.num_warnings, 0);
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"new");
        let deleted: Vec<ItemId> = status
            .completed(OperationStatus::Deleting)
            .iter()
            .map(|item| item.item_id)
            .collect();
        assert_eq!(deleted, vec![ItemId(1)]);
    }
}
