use std::{
    fs::File,
    io::{self, Read},
    sync::Arc,
};

use thiserror::Error;
use vcsync_core::client::{Transport, TransportError, UploadRequest};

use crate::{cancel::CancelFlag, error::FatalErrorSlot, filter::PreparedUpload, pool::WorkerStatus};

/// Chunk sizes this small disable chunking
const MIN_CHUNK_SIZE: usize = 3;

#[derive(Debug, Error)]
enum UploadError {
    #[error("Upload canceled")]
    Canceled,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Unable to read upload content: {0}")]
    Io(#[from] io::Error),
}

impl UploadError {
    fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transport(TransportError::ConnectionError(_)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub chunk_size: usize,
    pub file_attempts: usize,
    pub chunk_attempts: usize,
}

/// Send the content of one pending change, chunk by chunk. The prepared
/// file (and its temporary copy, if any) lives as long as the worker.
pub struct UploadWorker {
    transport: Arc<dyn Transport>,
    request: UploadRequest,
    prepared: PreparedUpload,
    limits: UploadLimits,
    cancel: CancelFlag,
    fatal: Arc<FatalErrorSlot>,
}

impl UploadWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        request: UploadRequest,
        prepared: PreparedUpload,
        limits: UploadLimits,
        cancel: CancelFlag,
        fatal: Arc<FatalErrorSlot>,
    ) -> Self {
        Self {
            transport,
            request,
            prepared,
            limits,
            cancel,
            fatal,
        }
    }

    pub fn run(self) -> anyhow::Result<WorkerStatus> {
        if self.cancel.is_canceled() {
            return Ok(WorkerStatus::Canceled);
        }

        match self.upload() {
            Ok(()) => Ok(WorkerStatus::Normal),
            Err(UploadError::Canceled) => Ok(WorkerStatus::Canceled),
            Err(error) => {
                log::error!(
                    "[{}] Upload of {} failed: {}",
                    self.request.workspace,
                    self.request.server_item,
                    error
                );
                self.fatal.set(anyhow::anyhow!(
                    "Unable to upload {}: {}",
                    self.request.server_item,
                    error
                ));
                Ok(WorkerStatus::Error)
            }
        }
    }

    fn upload(&self) -> Result<(), UploadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancel.is_canceled() {
                return Err(UploadError::Canceled);
            }

            match self.upload_file() {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() && attempt < self.limits.file_attempts => {
                    log::warn!(
                        "[{}] Attempt {} to upload {} failed, retry: {}",
                        self.request.workspace,
                        attempt,
                        self.request.server_item,
                        error
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn chunk_size(&self) -> u64 {
        let total = self.request.total_length;
        if self.limits.chunk_size < MIN_CHUNK_SIZE {
            return total;
        }
        total.min(self.limits.chunk_size as u64)
    }

    /// Send the whole file from its first byte
    fn upload_file(&self) -> Result<(), UploadError> {
        let total = self.request.total_length;
        let chunk_size = self.chunk_size();
        let mut file = File::open(&self.prepared.path)?;
        let mut buffer = vec![0; chunk_size as usize];

        let mut offset = 0;
        loop {
            let length = chunk_size.min(total - offset);
            let chunk = &mut buffer[..length as usize];
            file.read_exact(chunk)?;
            self.upload_chunk(offset, chunk, length == total)?;

            offset += length;
            if offset >= total {
                return Ok(());
            }
        }
    }

    fn upload_chunk(&self, offset: u64, chunk: &[u8], whole_file: bool) -> Result<(), UploadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancel.is_canceled() {
                return Err(UploadError::Canceled);
            }

            let error = match self.transport.upload_chunk(&self.request, offset, chunk) {
                Ok(()) => return Ok(()),
                Err(error) => UploadError::from(error),
            };
            if whole_file || !error.is_retryable() || attempt >= self.limits.chunk_attempts {
                return Err(error);
            }
            log::debug!(
                "[{}] Retry chunk at {} of {}: {}",
                self.request.workspace,
                offset,
                self.request.server_item,
                error
            );
        }
    }
}
