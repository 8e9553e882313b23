use std::fs;
use std::path::{Path, PathBuf};

use testdir::testdir;
use uuid::Uuid;
use vcsync_core::config::EngineConfig;
use vcsync_core::operation::{GetOperation, ItemProperties};
use vcsync_core::types::{FileEncoding, ItemId, ItemType, VersionNumber, WorkspaceLocation};
use vcsync_core::update::ClientLocalVersionUpdate;
use walkdir::WalkDir;

use crate::context::Context;

pub fn tmpdir() -> PathBuf {
    let path = testdir!().join(PathBuf::from(Uuid::new_v4().to_string()));
    fs::create_dir_all(&path).unwrap();
    path
}

fn config() -> EngineConfig {
    EngineConfig {
        max_transfer_workers: 2,
        case_insensitive_paths: false,
        ..EngineConfig::default()
    }
}

/// Server workspace rooted at `root`
pub fn context(root: &Path) -> Context {
    Context::new(
        "test".to_string(),
        root.to_path_buf(),
        WorkspaceLocation::Server,
        config(),
    )
}

/// Local workspace rooted at `root`
pub fn local_context(root: &Path) -> Context {
    Context::new(
        "test".to_string(),
        root.to_path_buf(),
        WorkspaceLocation::Local,
        config(),
    )
}

pub fn client_update(
    server_item: &str,
    item_id: i32,
    target_local_item: Option<&Path>,
    local_version: VersionNumber,
) -> ClientLocalVersionUpdate {
    ClientLocalVersionUpdate {
        source_server_item: server_item.to_string(),
        item_id: ItemId(item_id),
        target_local_item: target_local_item.map(Path::to_path_buf),
        local_version,
        version_date: None,
        encoding: FileEncoding::Binary,
        hash_value: None,
        length: None,
        baseline_id: None,
        download_url: None,
        keep_row_on_delete: false,
        properties: ItemProperties::default(),
    }
}

/// Get operation creating a folder at `target`
pub fn create_folder(item_id: i32, server_item: &str, target: &Path, version: VersionNumber) -> GetOperation {
    let mut operation = GetOperation::new(ItemId(item_id), ItemType::Folder);
    operation.target_local_item = Some(target.to_path_buf());
    operation.source_server_item = Some(server_item.to_string());
    operation.target_server_item = Some(server_item.to_string());
    operation.version_server = version;
    operation.encoding = FileEncoding::Folder;
    operation
}

/// Get operation downloading `download_url` at `target`
pub fn create_file(
    item_id: i32,
    server_item: &str,
    target: &Path,
    version: VersionNumber,
    download_url: &str,
) -> GetOperation {
    let mut operation = GetOperation::new(ItemId(item_id), ItemType::File);
    operation.target_local_item = Some(target.to_path_buf());
    operation.source_server_item = Some(server_item.to_string());
    operation.target_server_item = Some(server_item.to_string());
    operation.version_server = version;
    operation.download_url = Some(download_url.to_string());
    operation
}

/// Get operation removing the item found at `source`
pub fn delete(
    item_id: i32,
    item_type: ItemType,
    server_item: &str,
    source: &Path,
    version: VersionNumber,
) -> GetOperation {
    let mut operation = GetOperation::new(ItemId(item_id), item_type);
    operation.source_local_item = Some(source.to_path_buf());
    operation.source_server_item = Some(server_item.to_string());
    operation.version_local = version;
    operation.version_server = version;
    if item_type == ItemType::Folder {
        operation.encoding = FileEncoding::Folder;
    }
    operation
}

/// Relative paths (files and folders) found under `root`, metadata and
/// baseline folders excluded
pub fn disk_entries(root: &Path) -> Vec<String> {
    let mut entries: Vec<String> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !name.starts_with(".vc")
        })
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .display()
                .to_string()
        })
        .collect();
    entries.sort();
    entries
}
