use std::{
    cmp::Ordering,
    fmt::Display,
    fs, io,
    path::{Component, Path, PathBuf},
};

use vcsync_core::ATTRIBUTES_FILE_NAME;

/// Comparable form of a local path. Components are compared one by one so
/// that a folder always sorts before its children ("top-down"); iterating a
/// map keyed by `PathKey` in reverse gives the "bottom-up" order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathKey(Vec<String>);

impl PathKey {
    pub fn new(path: &Path, case_insensitive: bool) -> Self {
        Self(
            path.components()
                .filter(|component| !matches!(component, Component::CurDir))
                .map(|component| {
                    let part = component.as_os_str().to_string_lossy();
                    if case_insensitive {
                        part.to_lowercase()
                    } else {
                        part.to_string()
                    }
                })
                .collect(),
        )
    }

    pub fn is_parent_of(&self, other: &PathKey) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.0)
    }

    pub fn is_direct_parent_of(&self, other: &PathKey) -> bool {
        other.0.len() == self.0.len() + 1 && other.0.starts_with(&self.0)
    }
}

impl Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

pub fn paths_equal(a: &Path, b: &Path, case_insensitive: bool) -> bool {
    PathKey::new(a, case_insensitive) == PathKey::new(b, case_insensitive)
}

/// Last path component compared with case sensitivity
pub fn last_part_equals(a: &Path, b: &Path) -> bool {
    a.file_name() == b.file_name()
}

/// `a` and `b` live in the same folder and their names only differ by case.
pub fn is_case_only_change(a: &Path, b: &Path) -> bool {
    if !paths_equal(a, b, true) {
        return false;
    }
    let same_parent = match (a.parent(), b.parent()) {
        (Some(a_parent), Some(b_parent)) => paths_equal(a_parent, b_parent, false),
        _ => false,
    };
    same_parent && a.file_name() != b.file_name()
}

pub fn is_directory_empty(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

fn server_components(server_item: &str) -> Vec<String> {
    server_item
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_lowercase())
        .collect()
}

/// Top-down comparison of server paths (they are case insensitive).
pub fn compare_server_items_top_down(a: &str, b: &str) -> Ordering {
    server_components(a).cmp(&server_components(b))
}

/// Sort key of a server path where an attributes file sorts before every
/// sibling (and every sibling's children) so it is fetched first.
pub fn server_sort_key(server_item: &str) -> Vec<String> {
    let mut components = server_components(server_item);
    if let Some(last) = components.last_mut() {
        if last == ATTRIBUTES_FILE_NAME {
            last.clear();
        }
    }
    components
}

pub fn server_parent(server_item: &str) -> Option<&str> {
    let trimmed = server_item.trim_end_matches('/');
    trimmed.rfind('/').map(|index| &trimmed[..index])
}

pub fn file_name_str(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn with_file_name_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
