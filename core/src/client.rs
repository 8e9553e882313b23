use std::{
    fs::{self, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use mockall::automock;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{types::ServerItem, update::LocalVersionUpdate};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Download handle '{0}' not found")]
    NotFound(String),
    #[error("Connection error: `{0}`")]
    ConnectionError(String),
    #[error("Request rejected: `{0}`")]
    Rejected(String),
    #[error("Io error: `{0}`")]
    IoError(String),
    #[error("Unknown error: `{0}`")]
    Unknown(String),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::IoError(format!("{}", error))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(error: serde_json::Error) -> Self {
        TransportError::Unknown(format!("{}", error))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub workspace: String,
    pub server_item: ServerItem,
    pub content_hash: Vec<u8>,
    pub total_length: u64,
}

/// Remote side of the synchronization: moves bytes and records what the
/// client has on disk when the server is authoritative.
#[automock]
pub trait Transport: Send + Sync {
    /// Write content designated by `download_url` into `destination`,
    /// return written bytes count.
    fn download(&self, download_url: &str, destination: &Path) -> Result<u64, TransportError>;
    fn upload_chunk(
        &self,
        request: &UploadRequest,
        offset: u64,
        chunk: &[u8],
    ) -> Result<(), TransportError>;
    fn update_local_version(
        &self,
        workspace: &str,
        updates: &[LocalVersionUpdate],
    ) -> Result<(), TransportError>;
}

/// Transport backed by a plain directory: download handles are file names
/// inside the store, uploads are written under their server path and
/// acknowledgements are appended as json lines.
pub struct DirectoryTransport {
    store: PathBuf,
}

pub const ACKNOWLEDGEMENTS_FILE_NAME: &str = "acknowledged.jsonl";

impl DirectoryTransport {
    pub fn new(store: PathBuf) -> Self {
        Self { store }
    }

    pub fn uploaded_path(&self, server_item: &str) -> PathBuf {
        let relative = server_item.trim_start_matches('$').trim_start_matches('/');
        self.store.join("uploads").join(relative)
    }
}

impl Transport for DirectoryTransport {
    fn download(&self, download_url: &str, destination: &Path) -> Result<u64, TransportError> {
        let source = self.store.join(download_url);
        if !source.is_file() {
            return Err(TransportError::NotFound(download_url.to_string()));
        }
        Ok(fs::copy(source, destination)?)
    }

    fn upload_chunk(
        &self,
        request: &UploadRequest,
        offset: u64,
        chunk: &[u8],
    ) -> Result<(), TransportError> {
        let path = self.uploaded_path(&request.server_item);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(chunk)?;
        Ok(())
    }

    fn update_local_version(
        &self,
        workspace: &str,
        updates: &[LocalVersionUpdate],
    ) -> Result<(), TransportError> {
        fs::create_dir_all(&self.store)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.store.join(ACKNOWLEDGEMENTS_FILE_NAME))?;
        for update in updates {
            let line = serde_json::json!({"workspace": workspace, "update": update});
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}
