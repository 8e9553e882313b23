use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Result as AnyHowResult;
use chrono::{DateTime, Utc};

use crate::cancel::CancelFlag;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub fn last_modified_timestamp(path: &Path) -> AnyHowResult<Duration> {
    let metadata = path.metadata()?;
    let modified = metadata.modified()?;
    Ok(modified.duration_since(UNIX_EPOCH)?)
}

/// Modification time in milliseconds, as stored in the local version table
pub fn last_modified_millis(path: &Path) -> AnyHowResult<i64> {
    Ok(last_modified_timestamp(path)?.as_millis() as i64)
}

pub fn set_last_modified(path: &Path, date: DateTime<Utc>) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::from(date))
}

pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|metadata| metadata.file_type().is_symlink())
        .unwrap_or(false)
}

/// True for an existing file which can't be written (a missing file is not
/// read only)
pub fn is_read_only(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.permissions().readonly())
        .unwrap_or(false)
}

pub fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    if permissions.readonly() != read_only {
        permissions.set_readonly(read_only);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

/// Snapshot of what lies at a local path, symbolic links not followed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskAttributes {
    pub exists: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub read_only: bool,
}

impl DiskAttributes {
    pub fn of(path: Option<&Path>) -> Self {
        let metadata = match path.map(fs::symlink_metadata) {
            Some(Ok(metadata)) => metadata,
            _ => return Self::default(),
        };
        Self {
            exists: true,
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            read_only: metadata.permissions().readonly(),
        }
    }

    /// An actual directory, not a link to one
    pub fn is_plain_dir(&self) -> bool {
        self.is_dir && !self.is_symlink
    }
}

pub fn file_length(path: &Path) -> Option<u64> {
    fs::symlink_metadata(path).ok().map(|metadata| metadata.len())
}

/// Remove a file or a symbolic link, a missing one is not an error
pub fn delete_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::PermissionDenied && is_read_only(path) => {
            set_read_only(path, false)?;
            fs::remove_file(path)
        }
        Err(error) => Err(error),
    }
}

pub fn read_link_target(path: &Path) -> io::Result<String> {
    Ok(fs::read_link(path)?.to_string_lossy().to_string())
}

#[cfg(unix)]
pub fn create_symlink(link_target: &str, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link_target, path)
}

#[cfg(windows)]
pub fn create_symlink(link_target: &str, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(link_target, path)
}

#[cfg(unix)]
pub fn set_executable(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    let new_mode = if executable {
        mode | ((mode & 0o444) >> 2)
    } else {
        mode & !0o111
    };
    if new_mode != mode {
        permissions.set_mode(new_mode);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}

/// Copy `reader` into `writer`, checking `cancel` between chunks. Returns
/// false when the copy was abandoned.
pub fn copy_cancelable(
    reader: &mut impl Read,
    writer: &mut impl Write,
    cancel: &CancelFlag,
) -> io::Result<bool> {
    let mut buffer = vec![0; COPY_BUFFER_SIZE];
    loop {
        if cancel.is_canceled() {
            return Ok(false);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(true),
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        writer.write_all(&buffer[..read])?;
    }
}
