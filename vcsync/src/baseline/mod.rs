//! Baseline content cache.
//!
//! Baselines are copies of file content as of the last sync, stored under
//! registered baseline folders (`<folder>/<partition>/<id>.rw`) or, when no
//! folder is usable, under the workspace metadata directory. The folder list
//! is persisted with the local version table and every change to it happens
//! inside a table transaction.
use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context as AnyhowContext, Result};
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;
use vcsync_core::{types::BaselineId, utils::md5_file};
use walkdir::WalkDir;

use crate::{
    context::Context,
    path::PathKey,
    state::{with_local_version_table, LocalVersionTable, TableError},
    util,
};

use self::folder::{
    create_folder_structure, partition_for_path, path_for, with_extension, BaselineFolder,
    BaselineFolderState, GZIP_EXTENSION, RAW_EXTENSION,
};

pub mod folder;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("No baseline available to restore {0}")]
    Missing(PathBuf),
    #[error("Baseline for {0} is corrupt: {1}")]
    Corrupt(PathBuf, String),
    #[error("Baseline i/o error on {0}: {1}")]
    Io(PathBuf, io::Error),
}

/// Where new baseline bytes are written. When the baseline folder can't be
/// written a temporary file (if any can be created) takes its place and the
/// baseline is `Degraded`: the content is accepted but not kept.
pub enum BaselineSink {
    Stored(File, PathBuf),
    Degraded(Option<NamedTempFile>),
}

impl BaselineSink {
    pub fn is_degraded(&self) -> bool {
        matches!(self, BaselineSink::Degraded(_))
    }
}

impl Write for BaselineSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BaselineSink::Stored(file, _) => file.write(buf),
            BaselineSink::Degraded(Some(file)) => file.write(buf),
            BaselineSink::Degraded(None) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BaselineSink::Stored(file, _) => file.flush(),
            BaselineSink::Degraded(Some(file)) => file.flush(),
            BaselineSink::Degraded(None) => Ok(()),
        }
    }
}

pub struct BaselineCache {
    fallback_root: PathBuf,
    partitions: usize,
    case_insensitive: bool,
    folders: RwLock<Vec<BaselineFolder>>,
}

impl BaselineCache {
    pub fn new(context: &Context, folders: Vec<BaselineFolder>) -> Self {
        Self {
            fallback_root: context.metadata_path.clone(),
            partitions: context.config.baseline_partitions,
            case_insensitive: context.case_insensitive(),
            folders: RwLock::new(folders),
        }
    }

    /// Build the cache from the folders registered in the local version table
    pub fn load(context: &Context) -> Result<Self, TableError> {
        let folders = with_local_version_table(context, |table| table.baseline_folders())?;
        Ok(Self::new(context, folders))
    }

    pub fn new_baseline_id() -> BaselineId {
        BaselineId(*Uuid::new_v4().as_bytes())
    }

    pub fn folders(&self) -> Vec<BaselineFolder> {
        self.folders.read().clone()
    }

    pub fn update_from(&self, folders: Vec<BaselineFolder>) {
        *self.folders.write() = folders;
    }

    fn folder_for_partition<'a>(
        folders: &'a [BaselineFolder],
        partition: &str,
    ) -> Option<&'a BaselineFolder> {
        folders
            .iter()
            .find(|folder| folder.is_valid() && folder.partition == partition)
    }

    /// Path (with extension) where a new baseline for `target_local_item`
    /// must be written. Partition folders are created on demand.
    pub fn new_baseline_location(
        &self,
        id: &BaselineId,
        target_local_item: Option<&Path>,
    ) -> Result<PathBuf, BaselineError> {
        let folders = self.folders.read();
        let folder = target_local_item
            .and_then(|target| Self::folder_for_partition(&folders, &partition_for_path(target)))
            .or_else(|| folders.iter().find(|folder| folder.is_valid()));
        let root = match folder {
            Some(folder) => folder.path.clone(),
            None => self.fallback_root.clone(),
        };

        let location = with_extension(&path_for(&root, id, self.partitions), RAW_EXTENSION);
        if let Some(parent) = location.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| BaselineError::Io(parent.to_path_buf(), error))?;
        }
        Ok(location)
    }

    fn candidate_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .folders
            .read()
            .iter()
            .map(|folder| folder.path.clone())
            .collect();
        roots.push(self.fallback_root.clone());
        roots
    }

    /// Location of an existing baseline
    pub fn baseline_location(&self, id: &BaselineId) -> Option<PathBuf> {
        self.candidate_roots()
            .into_iter()
            .map(|root| with_extension(&path_for(&root, id, self.partitions), RAW_EXTENSION))
            .find(|location| location.is_file())
    }

    pub fn create_file(&self, id: &BaselineId, target_local_item: Option<&Path>) -> BaselineSink {
        let created = self
            .new_baseline_location(id, target_local_item)
            .and_then(|location| {
                File::create(&location)
                    .map(|file| BaselineSink::Stored(file, location.clone()))
                    .map_err(|error| BaselineError::Io(location, error))
            });

        match created {
            Ok(sink) => sink,
            Err(error) => match NamedTempFile::new() {
                Ok(temporary) => {
                    log::info!(
                        "Could not create baseline {}, using temporary file {}: {}",
                        id,
                        temporary.path().display(),
                        error
                    );
                    BaselineSink::Degraded(Some(temporary))
                }
                Err(temp_error) => {
                    log::warn!(
                        "Could not create baseline {} ({}) nor a temporary file ({})",
                        id,
                        error,
                        temp_error
                    );
                    BaselineSink::Degraded(None)
                }
            },
        }
    }

    /// Copy `local_path` (or its link target for a symbolic link) into a new
    /// baseline. Storing is best effort: when the baseline can't be written
    /// the returned sink is `Degraded` and nothing is kept under the id.
    pub fn store(
        &self,
        local_path: &Path,
        target_local_item: Option<&Path>,
    ) -> Result<(BaselineId, BaselineSink), BaselineError> {
        let content_error = |error| BaselineError::Io(local_path.to_path_buf(), error);
        let mut content: Box<dyn Read> = if util::is_symlink(local_path) {
            let link_target = util::read_link_target(local_path).map_err(content_error)?;
            Box::new(io::Cursor::new(link_target.into_bytes()))
        } else {
            Box::new(File::open(local_path).map_err(content_error)?)
        };

        let id = Self::new_baseline_id();
        let mut sink = self.create_file(&id, target_local_item);
        let written = io::copy(&mut content, &mut sink).and_then(|_| sink.flush());

        match written {
            Ok(()) => {
                if sink.is_degraded() {
                    log::warn!(
                        "Baseline of {} is not kept, the baseline folder can't be written",
                        local_path.display()
                    );
                }
                Ok((id, sink))
            }
            Err(error) => {
                log::warn!(
                    "Unable to write baseline of {}: {}",
                    local_path.display(),
                    error
                );
                if let BaselineSink::Stored(_, location) = &sink {
                    if let Err(error) = util::delete_file(location) {
                        log::warn!("Unable to delete {}: {}", location.display(), error);
                    }
                }
                Ok((id, BaselineSink::Degraded(None)))
            }
        }
    }

    pub fn materialize(&self, id: &BaselineId) -> Result<Vec<u8>, BaselineError> {
        let location = self
            .baseline_location(id)
            .ok_or_else(|| BaselineError::Missing(PathBuf::from(id.to_string())))?;
        let mut content = vec![];
        File::open(&location)
            .and_then(|mut file| file.read_to_end(&mut content))
            .map_err(|error| BaselineError::Io(location, error))?;
        Ok(content)
    }

    /// Restore `target` from a baseline, checking its length and hash when
    /// known. A baseline failing these checks is deleted.
    pub fn copy_baseline_to_target(
        &self,
        id: &BaselineId,
        target: &Path,
        expected_length: Option<u64>,
        expected_hash: Option<&[u8]>,
        symlink: bool,
    ) -> Result<(), BaselineError> {
        util::delete_file(target).map_err(|error| BaselineError::Io(target.to_path_buf(), error))?;

        let location = self
            .baseline_location(id)
            .ok_or_else(|| BaselineError::Missing(target.to_path_buf()))?;

        if let Err(error) = self.check_baseline(&location, target, expected_length, expected_hash) {
            if let Err(delete_error) = util::delete_file(&location) {
                log::warn!(
                    "Unable to delete corrupt baseline {}: {}",
                    location.display(),
                    delete_error
                );
            }
            return Err(error);
        }

        if symlink {
            let link_target = fs::read_to_string(&location)
                .map_err(|error| BaselineError::Io(location.clone(), error))?;
            util::create_symlink(&link_target, target)
                .map_err(|error| BaselineError::Io(target.to_path_buf(), error))?;
        } else {
            fs::copy(&location, target)
                .map_err(|error| BaselineError::Io(target.to_path_buf(), error))?;
        }

        Ok(())
    }

    fn check_baseline(
        &self,
        location: &Path,
        target: &Path,
        expected_length: Option<u64>,
        expected_hash: Option<&[u8]>,
    ) -> Result<(), BaselineError> {
        if let Some(expected_length) = expected_length {
            let length = util::file_length(location).unwrap_or_default();
            if length != expected_length {
                return Err(BaselineError::Corrupt(
                    target.to_path_buf(),
                    format!("length is {}, expected {}", length, expected_length),
                ));
            }
        }

        if let Some(expected_hash) = expected_hash.filter(|hash| hash.len() == 16) {
            let hash = md5_file(location)
                .map_err(|error| BaselineError::Io(location.to_path_buf(), error))?;
            if hash != expected_hash {
                return Err(BaselineError::Corrupt(
                    target.to_path_buf(),
                    "hash value does not match".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Remove every copy of a baseline (compressed or raw)
    pub fn delete_baseline(&self, id: &BaselineId) {
        for root in self.candidate_roots() {
            let location = path_for(&root, id, self.partitions);
            for extension in [GZIP_EXTENSION, RAW_EXTENSION] {
                if let Err(error) = util::delete_file(&with_extension(&location, extension)) {
                    log::warn!("Unable to delete baseline {}: {}", id, error);
                }
            }
        }
    }

    pub fn is_immediate_parent_of_baseline_folder(&self, path: &Path) -> bool {
        let key = PathKey::new(path, self.case_insensitive);
        self.folders
            .read()
            .iter()
            .any(|folder| key.is_direct_parent_of(&PathKey::new(&folder.path, self.case_insensitive)))
    }

    /// Unregister the baseline folders directly inside `path` (moving their
    /// baselines elsewhere) so that `path` can be deleted.
    pub fn prune_folders_beneath(&self, table: &LocalVersionTable, path: &Path) -> Result<()> {
        let key = PathKey::new(path, self.case_insensitive);
        let mut folders = table.baseline_folders()?;

        while let Some(index) = folders.iter().position(|folder| {
            folder.is_valid()
                && key.is_direct_parent_of(&PathKey::new(&folder.path, self.case_insensitive))
        }) {
            self.remove_folder(&mut folders, index);
        }

        table.set_baseline_folders(&folders)?;
        self.update_from(folders);
        Ok(())
    }

    fn remove_folder(&self, folders: &mut Vec<BaselineFolder>, index: usize) {
        let removed = folders[index].clone();
        let replacement = folders
            .iter()
            .enumerate()
            .filter(|(other, folder)| *other != index && folder.is_valid())
            .map(|(_, folder)| folder)
            .find(|folder| folder.partition == removed.partition)
            .or_else(|| {
                folders
                    .iter()
                    .enumerate()
                    .find(|(other, folder)| *other != index && folder.is_valid())
                    .map(|(_, folder)| folder)
            })
            .map(|folder| folder.path.clone())
            .unwrap_or_else(|| self.fallback_root.clone());

        match self.move_folder_structure(&removed.path, &replacement) {
            Ok(_) => {
                if let Err(error) = fs::remove_dir_all(&removed.path) {
                    if error.kind() != io::ErrorKind::NotFound {
                        log::warn!(
                            "Unable to delete baseline folder {}: {}",
                            removed.path.display(),
                            error
                        );
                    }
                }
                folders.remove(index);
            }
            Err(error) => {
                log::warn!(
                    "Unable to move baselines out of {}: {:#}",
                    removed.path.display(),
                    error
                );
                folders[index].state = BaselineFolderState::Stale;
            }
        }
    }

    fn move_folder_structure(&self, from: &Path, to: &Path) -> Result<()> {
        if !from.exists() {
            return Ok(());
        }

        create_folder_structure(to, self.partitions)
            .context(format!("Create baseline folder {}", to.display()))?;
        for entry in WalkDir::new(from).min_depth(2).max_depth(2) {
            let entry = entry.context(format!("Walk into {}", from.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(from)
                .context("Compute baseline relative path")?;
            let destination = to.join(relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(entry.path(), &destination).context(format!(
                "Move baseline {} to {}",
                entry.path().display(),
                destination.display()
            ))?;
        }

        Ok(())
    }

    /// Bring the registered folders in line with the disk: retry removal of
    /// stale folders, forget vanished ones and make sure the workspace root
    /// partition has a valid folder.
    pub fn maintain(&self, table: &LocalVersionTable, root: &Path) -> Result<()> {
        let mut folders = table.baseline_folders()?;

        while let Some(index) = folders
            .iter()
            .position(|folder| folder.state == BaselineFolderState::Stale && !folder.path.exists())
        {
            folders.remove(index);
        }
        let stale: Vec<usize> = folders
            .iter()
            .enumerate()
            .filter(|(_, folder)| folder.state == BaselineFolderState::Stale)
            .map(|(index, _)| index)
            .rev()
            .collect();
        for index in stale {
            self.remove_folder(&mut folders, index);
        }

        folders.retain(|folder| !folder.is_valid() || folder.path.is_dir());

        let partition = partition_for_path(root);
        if Self::folder_for_partition(&folders, &partition).is_none() {
            if let Some(folder) = BaselineFolder::create(root, self.partitions) {
                log::info!("Created baseline folder {}", folder.path.display());
                folders.push(folder);
            }
        }

        table.set_baseline_folders(&folders)?;
        self.update_from(folders);
        Ok(())
    }
}
