use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as AnyhowContext, Result};
use env_logger::Env;
use serde_derive::Deserialize;
use structopt::StructOpt;
use vcsync::{
    cancel::CancelFlag, checkin::CheckinEngine, context::Context, get::GetEngine, session::Session,
};
use vcsync_core::{
    change::PendingChange,
    client::DirectoryTransport,
    config::EngineConfig,
    operation::GetOperation,
    types::{GetOptions, WorkspaceLocation},
};

#[derive(StructOpt, Debug)]
#[structopt(name = "vcsync")]
enum Opt {
    /// Apply a batch of get operations to a workspace
    Get {
        #[structopt(long, parse(from_os_str))]
        workspace: PathBuf,

        /// Json file holding the get operations
        #[structopt(long, parse(from_os_str))]
        batch: PathBuf,

        /// Folder holding downloadable content (defaults to the batch file folder)
        #[structopt(long, parse(from_os_str))]
        store: Option<PathBuf>,

        #[structopt(long)]
        preview: bool,

        #[structopt(long)]
        overwrite: bool,

        /// The workspace local version table is authoritative
        #[structopt(long)]
        local: bool,
    },
    /// Upload the content of pending changes into a store folder
    Upload {
        #[structopt(long, parse(from_os_str))]
        workspace: PathBuf,

        /// Json file holding the pending changes
        #[structopt(long, parse(from_os_str))]
        changes: PathBuf,

        #[structopt(long, parse(from_os_str))]
        store: PathBuf,
    },
}

/// A batch file holds one array of operations or several of them
#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Single(Vec<GetOperation>),
    Multiple(Vec<Vec<GetOperation>>),
}

fn context(workspace: &Path, location: WorkspaceLocation, config: EngineConfig) -> Result<Context> {
    let root = fs::canonicalize(workspace)
        .context(format!("Unable to find workspace {}", workspace.display()))?;
    let workspace_name = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "workspace".to_string());
    Ok(Context::new(workspace_name, root, location, config))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).context(format!("Read {}", path.display()))?;
    serde_json::from_str(&content).context(format!("Parse {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let config = EngineConfig::from_env()?;
    let cancel = CancelFlag::new();

    match Opt::from_args() {
        Opt::Get {
            workspace,
            batch,
            store,
            preview,
            overwrite,
            local,
        } => {
            let location = if local {
                WorkspaceLocation::Local
            } else {
                WorkspaceLocation::Server
            };
            let context = context(&workspace, location, config.clone())?;
            let store = match store {
                Some(store) => store,
                None => batch
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            let results = match read_json::<BatchFile>(&batch)? {
                BatchFile::Single(operations) => vec![operations],
                BatchFile::Multiple(results) => results,
            };
            let options = GetOptions {
                preview,
                overwrite,
                ..Default::default()
            };

            let session = Session::new(Arc::new(DirectoryTransport::new(store)), &config)?;
            let status = GetEngine::new(Arc::new(session)).process(&context, results, options, &cancel)?;
            println!(
                "operations: {}, updated: {}, conflicts: {}, warnings: {}, failures: {}",
                status.num_operations,
                status.num_updated,
                status.num_conflicts,
                status.num_warnings,
                status.num_failures
            );
            for message in status.non_fatal_errors() {
                println!("error: {}", message);
            }
        }
        Opt::Upload {
            workspace,
            changes,
            store,
        } => {
            let context = context(&workspace, WorkspaceLocation::Server, config.clone())?;
            let changes: Vec<PendingChange> = read_json(&changes)?;

            let session = Session::new(Arc::new(DirectoryTransport::new(store)), &config)?;
            let status = CheckinEngine::new(Arc::new(session)).upload(
                &context, &changes, false, false, &cancel,
            )?;
            println!(
                "uploaded: {}, already on server: {}",
                status.num_uploaded, status.num_skipped
            );
        }
    }

    log::info!("Exit application");
    Ok(())
}
