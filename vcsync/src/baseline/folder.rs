use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use strum_macros::{Display, EnumString};
use vcsync_core::types::BaselineId;

#[cfg(windows)]
pub const BASELINE_FOLDER_NAME: &str = "$vc";
#[cfg(not(windows))]
pub const BASELINE_FOLDER_NAME: &str = ".vc";

pub const RAW_EXTENSION: &str = "rw";
pub const GZIP_EXTENSION: &str = "gz";
/// How many times the baseline folder name is permuted (`.vc`, `.vc1` ...)
pub const FOLDER_NAME_PERMUTATIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BaselineFolderState {
    Valid,
    /// Folder should be removed but still holds baselines
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineFolder {
    pub path: PathBuf,
    /// Root (volume) of the files whose baselines go in this folder
    pub partition: String,
    pub state: BaselineFolderState,
}

impl BaselineFolder {
    /// Lay down a new baseline folder inside `local_folder`, using the first
    /// free permutation of the folder name.
    pub fn create(local_folder: &Path, partitions: usize) -> Option<Self> {
        if !local_folder.is_dir() {
            return None;
        }

        for name in potential_folder_names() {
            let proposed = local_folder.join(&name);
            if proposed.exists() {
                continue;
            }

            return match create_folder_structure(&proposed, partitions) {
                Ok(_) => Some(Self {
                    path: proposed,
                    partition: partition_for_path(local_folder),
                    state: BaselineFolderState::Valid,
                }),
                Err(error) => {
                    log::warn!(
                        "Unable to create baseline folder {}: {}",
                        proposed.display(),
                        error
                    );
                    None
                }
            };
        }

        None
    }

    pub fn is_valid(&self) -> bool {
        self.state == BaselineFolderState::Valid
    }

    pub fn path_for(&self, id: &BaselineId, partitions: usize) -> PathBuf {
        path_for(&self.path, id, partitions)
    }
}

pub fn potential_folder_names() -> Vec<String> {
    (0..FOLDER_NAME_PERMUTATIONS)
        .map(|index| match index {
            0 => BASELINE_FOLDER_NAME.to_string(),
            _ => format!("{}{}", BASELINE_FOLDER_NAME, index),
        })
        .collect()
}

pub fn is_potential_folder_name(name: &str) -> bool {
    potential_folder_names()
        .iter()
        .any(|potential| potential.eq_ignore_ascii_case(name))
}

pub fn create_folder_structure(path: &Path, partitions: usize) -> io::Result<()> {
    for partition in 0..partitions.max(1) {
        fs::create_dir_all(path.join(partition.to_string()))?;
    }
    Ok(())
}

/// Location of a baseline below `root`, without extension
pub fn path_for(root: &Path, id: &BaselineId, partitions: usize) -> PathBuf {
    root.join(id.partition(partitions).to_string())
        .join(id.to_string())
}

pub fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut path = path.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

/// Root (volume) of a path, `/` on unix like systems
pub fn partition_for_path(path: &Path) -> String {
    path.components()
        .take_while(|component| matches!(component, Component::Prefix(_) | Component::RootDir))
        .collect::<PathBuf>()
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tmpdir;
    use rstest::*;

    #[rstest]
    #[case(".vc", true)]
    #[case(".VC3", true)]
    #[case(".vc15", true)]
    #[case(".vc16", false)]
    #[case("vc", false)]
    #[cfg(not(windows))]
    fn test_is_potential_folder_name(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_potential_folder_name(name), expected);
    }

    #[test]
    fn test_create_permutes_name() {
        // Given
        let workspace = tmpdir();
        fs::create_dir_all(workspace.join(BASELINE_FOLDER_NAME)).unwrap();

        // When
        let folder = BaselineFolder::create(&workspace, 16).unwrap();

        // Then
        assert_eq!(
            folder.path,
            workspace.join(format!("{}1", BASELINE_FOLDER_NAME))
        );
        assert!(folder.path.join("15").is_dir());
        assert!(folder.is_valid());
    }

    #[test]
    fn test_path_for() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x21;
        let id = BaselineId(bytes);

        assert_eq!(
            with_extension(&path_for(Path::new("/ws/.vc"), &id, 16), RAW_EXTENSION),
            PathBuf::from(format!("/ws/.vc/1/{}.rw", id))
        );
    }
}
