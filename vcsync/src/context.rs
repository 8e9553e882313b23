use std::fmt;
use std::path::{Path, PathBuf};

use vcsync_core::{config::EngineConfig, types::WorkspaceLocation};

pub const METADATA_FOLDER_NAME: &str = ".vcsync";
pub const DB_NAME: &str = "local_version.sqlite";

/// Everything the engines need to know about one workspace.
#[derive(Clone)]
pub struct Context {
    pub workspace_name: String,
    pub root: PathBuf,
    pub metadata_path: PathBuf,
    pub location: WorkspaceLocation,
    pub config: EngineConfig,
}

impl Context {
    pub fn new(
        workspace_name: String,
        root: PathBuf,
        location: WorkspaceLocation,
        config: EngineConfig,
    ) -> Self {
        let metadata_path = root.join(METADATA_FOLDER_NAME);
        Self {
            workspace_name,
            root,
            metadata_path,
            location,
            config,
        }
    }

    pub fn with_metadata_path(mut self, metadata_path: PathBuf) -> Self {
        self.metadata_path = metadata_path;
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.metadata_path.join(DB_NAME)
    }

    pub fn is_local(&self) -> bool {
        self.location == WorkspaceLocation::Local
    }

    pub fn case_insensitive(&self) -> bool {
        self.config.case_insensitive_paths
    }

    /// True for paths the engines own inside the workspace (metadata folder)
    pub fn is_metadata(&self, path: &Path) -> bool {
        path.starts_with(&self.metadata_path)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("workspace_name", &self.workspace_name)
            .field("root", &self.root)
            .field("metadata_path", &self.metadata_path)
            .field("location", &self.location)
            .finish()
    }
}
