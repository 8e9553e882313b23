use std::{
    collections::HashMap,
    convert::TryFrom,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use parking_lot::Mutex;
use regex::Regex;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use vcsync_core::ATTRIBUTES_FILE_NAME;

use crate::path::{file_name_str, PathKey};

#[derive(Error, Debug)]
pub enum AttributesError {
    #[error("Io error: {0}")]
    IoError(#[from] io::Error),
    #[error("Line {0}: {1}")]
    Syntax(usize, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EolStyle {
    Lf,
    Crlf,
    Cr,
    /// Platform line ending
    Native,
    /// Leave content untouched
    None,
}

impl EolStyle {
    pub fn line_ending(&self) -> Option<&'static [u8]> {
        match self {
            EolStyle::Lf => Some(b"\n"),
            EolStyle::Crlf => Some(b"\r\n"),
            EolStyle::Cr => Some(b"\r"),
            EolStyle::Native if cfg!(windows) => Some(b"\r\n"),
            EolStyle::Native => Some(b"\n"),
            EolStyle::None => None,
        }
    }
}

/// Content filters configured for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes {
    pub executable: bool,
    pub client_eol: Option<EolStyle>,
    pub server_eol: Option<EolStyle>,
    pub apple_transform: bool,
    pub symlink: bool,
}

impl FromStr for FileAttributes {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut attributes = FileAttributes::default();

        for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name.trim().to_lowercase(), Some(value.trim())),
                None => (part.to_lowercase(), None),
            };

            match (name.as_str(), value) {
                ("x", None) => attributes.executable = true,
                ("symlink", None) => attributes.symlink = true,
                ("clienteol", Some(value)) => {
                    attributes.client_eol = Some(parse_eol(value)?);
                }
                ("servereol", Some(value)) => {
                    attributes.server_eol = Some(parse_eol(value)?);
                }
                ("transform", Some(value)) if value.eq_ignore_ascii_case("apple") => {
                    attributes.apple_transform = true
                }
                _ => return Err(format!("Unknown attribute '{}'", part)),
            }
        }

        Ok(attributes)
    }
}

fn parse_eol(value: &str) -> Result<EolStyle, String> {
    EolStyle::from_str(&value.to_lowercase())
        .map_err(|_| format!("Unknown end of line style '{}'", value))
}

/// Translate a `*`/`?` file name pattern into a case insensitive regex
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("(?i)^{}$", escaped))
}

/// Parsed content of an attributes file. First matching entry wins.
#[derive(Debug, Clone, Default)]
pub struct AttributesFile {
    entries: Vec<(Regex, FileAttributes)>,
}

impl TryFrom<&str> for AttributesFile {
    type Error = AttributesError;

    fn try_from(content: &str) -> Result<Self, Self::Error> {
        let mut entries = vec![];

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (pattern, raw_attributes) = line.split_once(':').ok_or_else(|| {
                AttributesError::Syntax(index + 1, format!("Missing ':' in '{}'", line))
            })?;
            let regex = compile_pattern(pattern.trim())
                .map_err(|error| AttributesError::Syntax(index + 1, error.to_string()))?;
            let attributes = raw_attributes
                .parse()
                .map_err(|error| AttributesError::Syntax(index + 1, error))?;
            entries.push((regex, attributes));
        }

        Ok(Self { entries })
    }
}

impl AttributesFile {
    pub fn load(path: &Path) -> Result<Option<Self>, AttributesError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => return Ok(None),
                _ => return Err(AttributesError::IoError(error)),
            },
        };
        Ok(Some(Self::try_from(content.as_str())?))
    }

    pub fn find(&self, file_name: &str) -> Option<FileAttributes> {
        self.entries
            .iter()
            .find(|(regex, _)| regex.is_match(file_name))
            .map(|(_, attributes)| *attributes)
    }
}

/// Attributes files read so far, by folder. A folder whose attributes file
/// changes (downloaded, deleted) must be invalidated.
pub struct AttributesCache {
    case_insensitive: bool,
    files: Mutex<HashMap<PathKey, Option<Arc<AttributesFile>>>>,
}

impl AttributesCache {
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_attributes_file(path: &Path) -> bool {
        file_name_str(path).eq_ignore_ascii_case(ATTRIBUTES_FILE_NAME)
    }

    /// Attributes of `local_item` according to the attributes file of its
    /// folder. The attributes file itself never has attributes.
    pub fn attributes_for(&self, local_item: &Path) -> FileAttributes {
        if Self::is_attributes_file(local_item) {
            return FileAttributes::default();
        }
        let folder = match local_item.parent() {
            Some(folder) => folder,
            None => return FileAttributes::default(),
        };

        self.file_for_folder(folder)
            .and_then(|file| file.find(&file_name_str(local_item)))
            .unwrap_or_default()
    }

    fn file_for_folder(&self, folder: &Path) -> Option<Arc<AttributesFile>> {
        let key = PathKey::new(folder, self.case_insensitive);
        let mut files = self.files.lock();
        if let Some(file) = files.get(&key) {
            return file.clone();
        }

        let path: PathBuf = folder.join(ATTRIBUTES_FILE_NAME);
        let file = match AttributesFile::load(&path) {
            Ok(file) => file.map(Arc::new),
            Err(error) => {
                log::warn!("Ignore attributes file {}: {}", path.display(), error);
                None
            }
        };
        files.insert(key, file.clone());
        file
    }

    pub fn invalidate(&self, folder: &Path) {
        self.files
            .lock()
            .remove(&PathKey::new(folder, self.case_insensitive));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tmpdir;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case("*.sh", "build.sh", true)]
    #[case("*.sh", "BUILD.SH", true)]
    #[case("*.sh", "build.shx", false)]
    #[case("make?", "make1", true)]
    #[case("make?", "make", false)]
    #[case("a.b", "axb", false)]
    fn test_compile_pattern(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(compile_pattern(pattern).unwrap().is_match(name), expected);
    }

    #[test]
    fn test_parse_first_match_wins() {
        let raw = "# scripts\n*.sh: x, clienteol=lf\n*: servereol=crlf\nlink: symlink\n";
        let file = AttributesFile::try_from(raw).unwrap();

        assert_eq!(
            file.find("run.sh"),
            Some(FileAttributes {
                executable: true,
                client_eol: Some(EolStyle::Lf),
                ..Default::default()
            })
        );
        // `*` catches it before the `link` entry
        assert_eq!(
            file.find("link"),
            Some(FileAttributes {
                server_eol: Some(EolStyle::Crlf),
                ..Default::default()
            })
        );
    }

    #[rstest]
    #[case("*.sh")]
    #[case("*.sh: y")]
    #[case("*.sh: clienteol=dos")]
    fn test_parse_errors(#[case] raw: &str) {
        assert!(matches!(
            AttributesFile::try_from(raw),
            Err(AttributesError::Syntax(1, _))
        ));
    }

    #[test]
    fn test_cache_reads_and_invalidates() {
        // Given
        let folder = tmpdir();
        let cache = AttributesCache::new(false);
        assert_eq!(
            cache.attributes_for(&folder.join("a.sh")),
            FileAttributes::default()
        );

        // When
        fs::write(folder.join(ATTRIBUTES_FILE_NAME), "*.sh: x\n").unwrap();

        // Then
        assert!(!cache.attributes_for(&folder.join("a.sh")).executable);
        cache.invalidate(&folder);
        assert!(cache.attributes_for(&folder.join("a.sh")).executable);
        assert_eq!(
            cache.attributes_for(&folder.join(ATTRIBUTES_FILE_NAME)),
            FileAttributes::default()
        );
    }
}
