//! Content filters between the working copy and the server representation
//! of a file: end of line conversion, AppleSingle packing and symbolic link
//! markers.
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use vcsync_core::types::FileEncoding;

use crate::{
    attributes::{EolStyle, FileAttributes},
    path::file_name_str,
    util,
};

use self::apple::AppleSingle;

pub mod apple;

/// Rewrite every line ending of `content` (`\r\n`, `\r` or `\n`) with the one
/// of `style`.
pub fn convert_eol(content: &[u8], style: EolStyle) -> Vec<u8> {
    let line_ending = match style.line_ending() {
        Some(line_ending) => line_ending,
        None => return content.to_vec(),
    };

    let mut output = Vec::with_capacity(content.len());
    let mut index = 0;
    while index < content.len() {
        match content[index] {
            b'\r' => {
                output.extend_from_slice(line_ending);
                if content.get(index + 1) == Some(&b'\n') {
                    index += 1;
                }
            }
            b'\n' => output.extend_from_slice(line_ending),
            byte => output.push(byte),
        }
        index += 1;
    }
    output
}

/// What a downloaded file must become on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    File,
    /// Downloaded content is the target of a symbolic link
    Symlink(String),
}

/// Filter a downloaded file in place, before it replaces the target
pub fn apply_get_filters(
    downloaded: &Path,
    attributes: &FileAttributes,
    encoding: FileEncoding,
    symlink: bool,
) -> Result<Materialized> {
    if symlink || attributes.symlink {
        let link_target = fs::read_to_string(downloaded).context(format!(
            "Read link target from {}",
            downloaded.display()
        ))?;
        return Ok(Materialized::Symlink(link_target.trim_end().to_string()));
    }

    if attributes.apple_transform {
        let raw = fs::read(downloaded).context(format!("Read {}", downloaded.display()))?;
        match AppleSingle::decode(&raw) {
            Ok(container) => {
                if container.resource_fork.is_some() {
                    log::debug!(
                        "Drop resource fork of {}, not supported on this platform",
                        downloaded.display()
                    );
                }
                fs::write(downloaded, container.data_fork)
                    .context(format!("Write data fork of {}", downloaded.display()))?;
            }
            Err(error) => log::warn!(
                "Keep {} as is, not an AppleSingle content: {}",
                downloaded.display(),
                error
            ),
        }
    }

    if let Some(style) = attributes.client_eol.filter(|_| encoding.is_text()) {
        if style != EolStyle::None {
            let raw = fs::read(downloaded).context(format!("Read {}", downloaded.display()))?;
            fs::write(downloaded, convert_eol(&raw, style))
                .context(format!("Convert line endings of {}", downloaded.display()))?;
        }
    }

    Ok(Materialized::File)
}

/// File to upload for a pending change. When a filter changed the content
/// the bytes live in a private temporary file, removed on drop.
pub struct PreparedUpload {
    pub path: PathBuf,
    temporary: Option<NamedTempFile>,
}

impl PreparedUpload {
    pub fn is_filtered(&self) -> bool {
        self.temporary.is_some()
    }

    fn filtered(content: &[u8]) -> Result<Self> {
        let mut temporary = NamedTempFile::new().context("Create upload temporary file")?;
        temporary
            .write_all(content)
            .context("Write upload temporary file")?;
        Ok(Self {
            path: temporary.path().to_path_buf(),
            temporary: Some(temporary),
        })
    }
}

/// Apply check-in filters to `local_item`. The working copy file is only read.
pub fn prepare_upload(
    local_item: &Path,
    attributes: &FileAttributes,
    encoding: FileEncoding,
    symlink: bool,
) -> Result<PreparedUpload> {
    if util::is_symlink(local_item) || symlink || attributes.symlink {
        let link_target = util::read_link_target(local_item)
            .context(format!("Read link {}", local_item.display()))?;
        return PreparedUpload::filtered(link_target.as_bytes());
    }

    let server_eol = attributes
        .server_eol
        .filter(|style| encoding.is_text() && *style != EolStyle::None);
    if !attributes.apple_transform && server_eol.is_none() {
        return Ok(PreparedUpload {
            path: local_item.to_path_buf(),
            temporary: None,
        });
    }

    let mut content = fs::read(local_item).context(format!("Read {}", local_item.display()))?;
    if let Some(style) = server_eol {
        content = convert_eol(&content, style);
    }
    if attributes.apple_transform {
        content = AppleSingle {
            data_fork: content,
            resource_fork: None,
            real_name: Some(file_name_str(local_item)),
        }
        .encode();
    }

    PreparedUpload::filtered(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tmpdir;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case(b"a\r\nb\rc\nd", EolStyle::Lf, b"a\nb\nc\nd".to_vec())]
    #[case(b"a\nb\r\n", EolStyle::Crlf, b"a\r\nb\r\n".to_vec())]
    #[case(b"a\r\n\r\nb", EolStyle::Cr, b"a\r\rb".to_vec())]
    #[case(b"a\r\nb", EolStyle::None, b"a\r\nb".to_vec())]
    fn test_convert_eol(#[case] content: &[u8], #[case] style: EolStyle, #[case] expected: Vec<u8>) {
        assert_eq!(convert_eol(content, style), expected);
    }

    #[test]
    fn test_get_filters_convert_text_only() {
        // Given
        let folder = tmpdir();
        let text = folder.join("a.txt");
        let binary = folder.join("a.bin");
        fs::write(&text, b"a\r\nb").unwrap();
        fs::write(&binary, b"a\r\nb").unwrap();
        let attributes = FileAttributes {
            client_eol: Some(EolStyle::Lf),
            ..Default::default()
        };

        // When
        apply_get_filters(&text, &attributes, FileEncoding::Text, false).unwrap();
        apply_get_filters(&binary, &attributes, FileEncoding::Binary, false).unwrap();

        // Then
        assert_eq!(fs::read(&text).unwrap(), b"a\nb");
        assert_eq!(fs::read(&binary).unwrap(), b"a\r\nb");
    }

    #[test]
    fn test_get_filters_symlink_and_apple() {
        let folder = tmpdir();
        let link = folder.join("link");
        fs::write(&link, b"../target\n").unwrap();
        assert_eq!(
            apply_get_filters(&link, &FileAttributes::default(), FileEncoding::Binary, true)
                .unwrap(),
            Materialized::Symlink("../target".to_string())
        );

        let packed = folder.join("packed");
        let container = AppleSingle {
            data_fork: b"data".to_vec(),
            resource_fork: Some(b"rsrc".to_vec()),
            real_name: None,
        };
        fs::write(&packed, container.encode()).unwrap();
        let attributes = FileAttributes {
            apple_transform: true,
            ..Default::default()
        };
        apply_get_filters(&packed, &attributes, FileEncoding::Binary, false).unwrap();
        assert_eq!(fs::read(&packed).unwrap(), b"data");
    }

    #[test]
    fn test_prepare_upload_never_touches_working_copy() {
        // Given
        let folder = tmpdir();
        let local_item = folder.join("a.txt");
        fs::write(&local_item, b"a\nb\n").unwrap();
        let attributes = FileAttributes {
            server_eol: Some(EolStyle::Crlf),
            ..Default::default()
        };

        // When
        let untouched =
            prepare_upload(&local_item, &FileAttributes::default(), FileEncoding::Text, false)
                .unwrap();
        let prepared = prepare_upload(&local_item, &attributes, FileEncoding::Text, false).unwrap();

        // Then
        assert!(!untouched.is_filtered());
        assert_eq!(untouched.path, local_item);
        assert!(prepared.is_filtered());
        assert_eq!(fs::read(&prepared.path).unwrap(), b"a\r\nb\r\n");
        assert_eq!(fs::read(&local_item).unwrap(), b"a\nb\n");

        let temporary = prepared.path.clone();
        drop(prepared);
        assert!(!temporary.exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_prepare_upload_materializes_symlink() {
        let folder = tmpdir();
        let link = folder.join("link");
        util::create_symlink("target.txt", &link).unwrap();

        let prepared =
            prepare_upload(&link, &FileAttributes::default(), FileEncoding::Binary, false).unwrap();

        assert_eq!(fs::read(&prepared.path).unwrap(), b"target.txt");
    }
}
