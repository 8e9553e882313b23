use std::{
    fmt::Display,
    ops::{BitOr, BitOrAssign},
    str::FromStr,
};

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};
use thiserror::Error;

pub type VersionNumber = i32;
pub type ServerItem = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct ItemId(pub i32);

impl Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{}", self.0))
    }
}

/// Opaque identifier of a baseline content file (16 random bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct BaselineId(pub [u8; 16]);

impl BaselineId {
    pub fn partition(&self, partitions: usize) -> usize {
        self.0[0] as usize % partitions.max(1)
    }
}

impl Display for BaselineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
#[error("Invalid baseline id '{0}'")]
pub struct ParseBaselineIdError(String);

impl FromStr for BaselineId {
    type Err = ParseBaselineIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(ParseBaselineIdError(s.to_string()));
        }

        let mut bytes = [0u8; 16];
        for (index, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[index * 2..index * 2 + 2], 16)
                .map_err(|_| ParseBaselineIdError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemType {
    #[default]
    Any,
    File,
    Folder,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileEncoding {
    #[default]
    Binary,
    Text,
    Folder,
}

impl FileEncoding {
    pub fn is_text(&self) -> bool {
        matches!(self, FileEncoding::Text)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, FileEncoding::Folder)
    }
}

/// Bit set of pending change kinds carried by a get operation or a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Hash)]
pub struct ChangeType(pub u32);

impl ChangeType {
    pub const NONE: ChangeType = ChangeType(0);
    pub const ADD: ChangeType = ChangeType(1);
    pub const EDIT: ChangeType = ChangeType(1 << 1);
    pub const ENCODING: ChangeType = ChangeType(1 << 2);
    pub const RENAME: ChangeType = ChangeType(1 << 3);
    pub const DELETE: ChangeType = ChangeType(1 << 4);
    pub const UNDELETE: ChangeType = ChangeType(1 << 5);
    pub const BRANCH: ChangeType = ChangeType(1 << 6);
    pub const MERGE: ChangeType = ChangeType(1 << 7);
    pub const LOCK: ChangeType = ChangeType(1 << 8);
    pub const PROPERTY: ChangeType = ChangeType(1 << 9);

    pub fn contains(&self, other: ChangeType) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: ChangeType) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn without(&self, other: ChangeType) -> ChangeType {
        ChangeType(self.0 & !other.0)
    }
}

impl BitOr for ChangeType {
    type Output = ChangeType;

    fn bitor(self, rhs: Self) -> Self::Output {
        ChangeType(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }

        let names = [
            (ChangeType::ADD, "add"),
            (ChangeType::EDIT, "edit"),
            (ChangeType::ENCODING, "encoding"),
            (ChangeType::RENAME, "rename"),
            (ChangeType::DELETE, "delete"),
            (ChangeType::UNDELETE, "undelete"),
            (ChangeType::BRANCH, "branch"),
            (ChangeType::MERGE, "merge"),
            (ChangeType::LOCK, "lock"),
            (ChangeType::PROPERTY, "property"),
        ];
        let parts: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&parts.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    Get,
    Undo,
    Merge,
    Unshelve,
    Rollback,
    Pend,
}

/// Where the authoritative local version table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
pub enum WorkspaceLocation {
    Local,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetOptions {
    pub preview: bool,
    pub get_all: bool,
    pub overwrite: bool,
    pub no_disk_update: bool,
    pub remap: bool,
    pub delete_undone_adds: bool,
}
