pub mod change;
pub mod client;
pub mod config;
pub mod operation;
pub mod types;
pub mod update;
pub mod utils;

/// Per directory file holding content filter attributes of its siblings
pub const ATTRIBUTES_FILE_NAME: &str = ".vcattributes";
