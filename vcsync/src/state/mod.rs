use std::{fs, path::PathBuf, time::Duration};

use rusqlite::Connection;
use thiserror::Error;

use crate::context::Context;

pub mod apply;
pub mod disk;

pub use disk::{LocalVersionEntry, LocalVersionTable};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Unable to open local version table {0}: {1}")]
    Open(PathBuf, String),
    #[error("Local version table error: {0:#}")]
    Query(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for TableError {
    fn from(error: rusqlite::Error) -> Self {
        TableError::Query(error.into())
    }
}

/// Open the workspace local version table, give it to `f` inside a single
/// transaction and commit when `f` succeeds. Any error (or panic) rolls the
/// transaction back.
pub fn with_local_version_table<T, F>(context: &Context, f: F) -> Result<T, TableError>
where
    F: FnOnce(&LocalVersionTable) -> anyhow::Result<T>,
{
    let database_path = context.database_path();
    fs::create_dir_all(&context.metadata_path)
        .map_err(|error| TableError::Open(database_path.clone(), error.to_string()))?;
    let mut connection = Connection::open(&database_path)
        .map_err(|error| TableError::Open(database_path.clone(), error.to_string()))?;
    connection.busy_timeout(Duration::from_secs(30))?;

    let transaction = connection.transaction()?;
    let value = {
        let table = LocalVersionTable::new(&transaction, context.case_insensitive());
        table.create_tables()?;
        f(&table)?
    };
    transaction.commit()?;

    Ok(value)
}
