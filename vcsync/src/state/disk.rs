use std::{path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use vcsync_core::{
    operation::ItemProperties,
    types::{BaselineId, FileEncoding, ItemId, ServerItem, VersionNumber},
};

use crate::{
    baseline::folder::{BaselineFolder, BaselineFolderState},
    path::PathKey,
};

const ENTRY_COLUMNS: &str = "server_item, local_item, item_id, version, version_date, encoding, \
     hash, length, last_modified, baseline_id, is_deleted, missing_baseline, pending_reconcile, \
     executable, symlink";

/// One row of the local version table: what the workspace last synced for an item.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVersionEntry {
    pub server_item: ServerItem,
    pub local_item: Option<PathBuf>,
    pub item_id: ItemId,
    pub version: VersionNumber,
    pub version_date: Option<DateTime<Utc>>,
    pub encoding: FileEncoding,
    pub hash_value: Option<Vec<u8>>,
    pub length: Option<u64>,
    /// Milliseconds since epoch of the local file when it was last synced
    pub last_modified: Option<i64>,
    pub baseline_id: Option<BaselineId>,
    pub is_deleted: bool,
    pub missing_baseline: bool,
    pub pending_reconcile: bool,
    pub properties: ItemProperties,
}

impl LocalVersionEntry {
    pub fn new(server_item: &str, item_id: ItemId, version: VersionNumber) -> Self {
        Self {
            server_item: server_item.to_string(),
            local_item: None,
            item_id,
            version,
            version_date: None,
            encoding: FileEncoding::Binary,
            hash_value: None,
            length: None,
            last_modified: None,
            baseline_id: None,
            is_deleted: false,
            missing_baseline: false,
            pending_reconcile: false,
            properties: ItemProperties::default(),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.version != 0
    }

    pub fn is_folder(&self) -> bool {
        self.encoding.is_folder()
    }
}

/// Local version table, always used inside one transaction
/// (see [`super::with_local_version_table`]).
pub struct LocalVersionTable<'a> {
    connection: &'a Connection,
    case_insensitive: bool,
}

impl<'a> LocalVersionTable<'a> {
    pub fn new(connection: &'a Connection, case_insensitive: bool) -> Self {
        Self {
            connection,
            case_insensitive,
        }
    }

    pub fn create_tables(&self) -> Result<()> {
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS local_version (
                server_item TEXT NOT NULL COLLATE NOCASE,
                committed INTEGER NOT NULL,
                local_item TEXT,
                local_item_key TEXT,
                item_id INTEGER NOT NULL,
                version INTEGER NOT NULL,
                version_date TEXT,
                encoding TEXT NOT NULL,
                hash BLOB,
                length INTEGER NOT NULL,
                last_modified INTEGER,
                baseline_id TEXT,
                is_deleted INTEGER NOT NULL,
                missing_baseline INTEGER NOT NULL,
                pending_reconcile INTEGER NOT NULL,
                executable INTEGER NOT NULL,
                symlink INTEGER NOT NULL,
                PRIMARY KEY (server_item, committed)
            );",
                [],
            )
            .context("Create local_version table")?;
        self.connection
            .execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_local_version_local_item ON local_version (local_item_key)",
                [],
            )
            .context("Create local_item index")?;
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS baseline_folder (
                path TEXT PRIMARY KEY,
                partition TEXT NOT NULL,
                state TEXT NOT NULL
            );",
                [],
            )
            .context("Create baseline_folder table")?;
        Ok(())
    }

    fn local_item_key(&self, local_item: &std::path::Path) -> String {
        PathKey::new(local_item, self.case_insensitive).to_string()
    }

    fn entry_from_row(row: &Row) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            server_item: row.get(0)?,
            local_item: row.get(1)?,
            item_id: row.get(2)?,
            version: row.get(3)?,
            version_date: row.get(4)?,
            encoding: row.get(5)?,
            hash: row.get(6)?,
            length: row.get(7)?,
            last_modified: row.get(8)?,
            baseline_id: row.get(9)?,
            is_deleted: row.get(10)?,
            missing_baseline: row.get(11)?,
            pending_reconcile: row.get(12)?,
            executable: row.get(13)?,
            symlink: row.get(14)?,
        })
    }

    fn query_entry(&self, sql: &str, param: &str) -> Result<Option<LocalVersionEntry>> {
        match self
            .connection
            .query_row(sql, params![param], Self::entry_from_row)
        {
            Ok(raw) => Ok(Some(raw.try_into()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(error) => bail!(error),
        }
    }

    pub fn get_by_server_item(
        &self,
        server_item: &str,
        committed: bool,
    ) -> Result<Option<LocalVersionEntry>> {
        match self.connection.query_row(
            &format!(
                "SELECT {} FROM local_version WHERE server_item = ? AND committed = ?",
                ENTRY_COLUMNS
            ),
            params![server_item, committed],
            Self::entry_from_row,
        ) {
            Ok(raw) => Ok(Some(raw.try_into()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(error) => bail!("Read entry {} from db but : {}", server_item, error),
        }
    }

    pub fn get_by_local_item(
        &self,
        local_item: &std::path::Path,
    ) -> Result<Option<LocalVersionEntry>> {
        self.query_entry(
            &format!(
                "SELECT {} FROM local_version WHERE local_item_key = ?",
                ENTRY_COLUMNS
            ),
            &self.local_item_key(local_item),
        )
        .context(format!("Read entry for {}", local_item.display()))
    }

    pub fn entries(&self) -> Result<Vec<LocalVersionEntry>> {
        let mut statement = self.connection.prepare(&format!(
            "SELECT {} FROM local_version ORDER BY server_item",
            ENTRY_COLUMNS
        ))?;
        let raws = statement
            .query_map([], Self::entry_from_row)?
            .collect::<rusqlite::Result<Vec<RawEntry>>>()?;
        raws.into_iter().map(LocalVersionEntry::try_from).collect()
    }

    pub fn entries_missing_baseline(&self) -> Result<Vec<LocalVersionEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.missing_baseline)
            .collect())
    }

    /// Insert the entry, replacing any row with the same server item and
    /// commit state
    pub fn insert_or_replace(&self, entry: &LocalVersionEntry) -> Result<()> {
        let local_item_key = entry
            .local_item
            .as_ref()
            .map(|local_item| self.local_item_key(local_item));
        self.connection
            .execute(
                "INSERT OR REPLACE INTO local_version (
                    server_item, committed, local_item, local_item_key, item_id, version,
                    version_date, encoding, hash, length, last_modified, baseline_id,
                    is_deleted, missing_baseline, pending_reconcile, executable, symlink
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    entry.server_item,
                    entry.is_committed(),
                    entry
                        .local_item
                        .as_ref()
                        .map(|local_item| local_item.display().to_string()),
                    local_item_key,
                    entry.item_id.0,
                    entry.version,
                    entry.version_date.map(|date| date.to_rfc3339()),
                    entry.encoding.to_string(),
                    entry.hash_value,
                    entry.length.map(|length| length as i64).unwrap_or(-1),
                    entry.last_modified,
                    entry.baseline_id.map(|id| id.to_string()),
                    entry.is_deleted,
                    entry.missing_baseline,
                    entry.pending_reconcile,
                    entry.properties.executable,
                    entry.properties.symlink,
                ],
            )
            .context(format!("Write entry {}", entry.server_item))?;
        Ok(())
    }

    pub fn remove(&self, server_item: &str, committed: bool) -> Result<()> {
        self.connection
            .execute(
                "DELETE FROM local_version WHERE server_item = ? AND committed = ?",
                params![server_item, committed],
            )
            .context(format!("Delete entry {}", server_item))?;
        Ok(())
    }

    pub fn mark_reconciled(&self, server_item: &str, committed: bool) -> Result<()> {
        self.connection
            .execute(
                "UPDATE local_version SET pending_reconcile = 0 WHERE server_item = ? AND committed = ?",
                params![server_item, committed],
            )
            .context(format!("Mark {} as reconciled", server_item))?;
        Ok(())
    }

    pub fn set_missing_baseline(
        &self,
        server_item: &str,
        committed: bool,
        missing: bool,
    ) -> Result<()> {
        self.connection
            .execute(
                "UPDATE local_version SET missing_baseline = ? WHERE server_item = ? AND committed = ?",
                params![missing, server_item, committed],
            )
            .context(format!("Update missing baseline flag of {}", server_item))?;
        Ok(())
    }

    pub fn baseline_folders(&self) -> Result<Vec<BaselineFolder>> {
        let mut statement = self
            .connection
            .prepare("SELECT path, partition, state FROM baseline_folder ORDER BY path")?;
        let raws = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raws.into_iter()
            .map(|(path, partition, state)| {
                Ok(BaselineFolder {
                    path: PathBuf::from(path),
                    partition,
                    state: BaselineFolderState::from_str(&state)
                        .context(format!("Decode baseline folder state '{}'", state))?,
                })
            })
            .collect()
    }

    pub fn set_baseline_folders(&self, folders: &[BaselineFolder]) -> Result<()> {
        self.connection
            .execute("DELETE FROM baseline_folder", [])
            .context("Clear baseline folders")?;
        for folder in folders {
            self.connection
                .execute(
                    "INSERT INTO baseline_folder (path, partition, state) VALUES (?, ?, ?)",
                    params![
                        folder.path.display().to_string(),
                        folder.partition,
                        folder.state.to_string()
                    ],
                )
                .context(format!("Insert baseline folder {}", folder.path.display()))?;
        }
        Ok(())
    }
}

struct RawEntry {
    server_item: String,
    local_item: Option<String>,
    item_id: i32,
    version: i32,
    version_date: Option<String>,
    encoding: String,
    hash: Option<Vec<u8>>,
    length: i64,
    last_modified: Option<i64>,
    baseline_id: Option<String>,
    is_deleted: bool,
    missing_baseline: bool,
    pending_reconcile: bool,
    executable: bool,
    symlink: bool,
}

impl TryFrom<RawEntry> for LocalVersionEntry {
    type Error = anyhow::Error;

    fn try_from(raw: RawEntry) -> Result<Self> {
        let version_date = match raw.version_date {
            Some(raw_date) => Some(
                DateTime::parse_from_rfc3339(&raw_date)
                    .context(format!("Decode version date '{}'", raw_date))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        let baseline_id = match raw.baseline_id {
            Some(raw_id) => Some(BaselineId::from_str(&raw_id)?),
            None => None,
        };

        Ok(Self {
            server_item: raw.server_item,
            local_item: raw.local_item.map(PathBuf::from),
            item_id: ItemId(raw.item_id),
            version: raw.version,
            version_date,
            encoding: FileEncoding::from_str(&raw.encoding)
                .context(format!("Decode encoding '{}'", raw.encoding))?,
            hash_value: raw.hash,
            length: u64::try_from(raw.length).ok(),
            last_modified: raw.last_modified,
            baseline_id,
            is_deleted: raw.is_deleted,
            missing_baseline: raw.missing_baseline,
            pending_reconcile: raw.pending_reconcile,
            properties: ItemProperties {
                symlink: raw.symlink,
                executable: raw.executable,
            },
        })
    }
}
