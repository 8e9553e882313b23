use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use ini::{Ini, Properties};

use crate::utils::strbool;

pub const DEFAULT_MAX_TRANSFER_WORKERS: usize = 8;
pub const DEFAULT_PROCESS_UNIT_OF_WORK: usize = 24;
pub const DEFAULT_UPLOAD_YIELD_COUNT: usize = 8;
pub const DEFAULT_QUEUE_FLUSH_TRIGGER: usize = 400;
pub const DEFAULT_QUEUE_MAX_LEVEL: usize = 1600;
pub const DEFAULT_QUEUE_TIME_TRIGGER_SECONDS: u64 = 15;
pub const DEFAULT_REMAP_FLUSH_TRIGGER: usize = 5000;
pub const DEFAULT_REMAP_MAX_LEVEL: usize = 10000;
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_UPLOAD_FILE_ATTEMPTS: usize = 2;
pub const DEFAULT_UPLOAD_CHUNK_ATTEMPTS: usize = 1;
pub const DEFAULT_BASELINE_PARTITIONS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_transfer_workers: usize,
    pub process_unit_of_work: usize,
    pub upload_yield_count: usize,
    pub queue_flush_trigger: usize,
    pub queue_max_level: usize,
    pub queue_time_trigger: Duration,
    pub remap_flush_trigger: usize,
    pub remap_max_level: usize,
    pub upload_chunk_size: usize,
    pub upload_file_attempts: usize,
    pub upload_chunk_attempts: usize,
    pub baseline_partitions: usize,
    pub case_insensitive_paths: bool,
    pub set_file_time_to_checkin: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transfer_workers: DEFAULT_MAX_TRANSFER_WORKERS,
            process_unit_of_work: DEFAULT_PROCESS_UNIT_OF_WORK,
            upload_yield_count: DEFAULT_UPLOAD_YIELD_COUNT,
            queue_flush_trigger: DEFAULT_QUEUE_FLUSH_TRIGGER,
            queue_max_level: DEFAULT_QUEUE_MAX_LEVEL,
            queue_time_trigger: Duration::from_secs(DEFAULT_QUEUE_TIME_TRIGGER_SECONDS),
            remap_flush_trigger: DEFAULT_REMAP_FLUSH_TRIGGER,
            remap_max_level: DEFAULT_REMAP_MAX_LEVEL,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            upload_file_attempts: DEFAULT_UPLOAD_FILE_ATTEMPTS,
            upload_chunk_attempts: DEFAULT_UPLOAD_CHUNK_ATTEMPTS,
            baseline_partitions: DEFAULT_BASELINE_PARTITIONS,
            case_insensitive_paths: cfg!(any(target_os = "windows", target_os = "macos")),
            set_file_time_to_checkin: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let user_home_folder_path = dirs::home_dir().context("Unable to determine home folder")?;
        let config_file_path = if cfg!(target_os = "windows") {
            user_home_folder_path
                .join("AppData")
                .join("Local")
                .join("vcsync.conf")
        } else {
            user_home_folder_path.join(".vcsync.conf")
        };

        if !config_file_path.exists() {
            log::debug!(
                "No config file at '{}', use default engine config",
                config_file_path.display()
            );
            return Ok(Self::default());
        }

        Self::from_file(&config_file_path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_ini = Ini::load_from_file(path).context(format!(
            "Error when loading config file at '{}'",
            path.display()
        ))?;
        Self::from_ini(config_ini)
    }

    pub fn from_ini(config_ini: Ini) -> Result<Self> {
        let mut config = Self::default();
        let engine = match config_ini.section(Some("engine")) {
            Some(engine) => engine,
            None => return Ok(config),
        };

        config.max_transfer_workers =
            read(engine, "max_transfer_workers", config.max_transfer_workers)?;
        config.process_unit_of_work =
            read(engine, "process_unit_of_work", config.process_unit_of_work)?;
        config.upload_yield_count = read(engine, "upload_yield_count", config.upload_yield_count)?;
        config.queue_flush_trigger =
            read(engine, "queue_flush_trigger", config.queue_flush_trigger)?;
        config.queue_max_level = read(engine, "queue_max_level", config.queue_max_level)?;
        config.queue_time_trigger = Duration::from_secs(read(
            engine,
            "queue_time_trigger",
            config.queue_time_trigger.as_secs(),
        )?);
        config.remap_flush_trigger =
            read(engine, "remap_flush_trigger", config.remap_flush_trigger)?;
        config.remap_max_level = read(engine, "remap_max_level", config.remap_max_level)?;
        config.upload_chunk_size = read(engine, "upload_chunk_size", config.upload_chunk_size)?;
        config.upload_file_attempts =
            read(engine, "upload_file_attempts", config.upload_file_attempts)?;
        config.upload_chunk_attempts =
            read(engine, "upload_chunk_attempts", config.upload_chunk_attempts)?;
        config.baseline_partitions =
            read(engine, "baseline_partitions", config.baseline_partitions)?;
        if let Some(value) = engine.get("case_insensitive_paths") {
            config.case_insensitive_paths = strbool(value)
        }
        if let Some(value) = engine.get("set_file_time_to_checkin") {
            config.set_file_time_to_checkin = strbool(value)
        }

        if config.queue_flush_trigger >= config.queue_max_level {
            anyhow::bail!(
                "queue_flush_trigger ({}) must be lower than queue_max_level ({})",
                config.queue_flush_trigger,
                config.queue_max_level
            )
        }
        if config.max_transfer_workers == 0 {
            anyhow::bail!("max_transfer_workers must be greater than zero")
        }

        Ok(config)
    }
}

fn read<T: FromStr>(section: &Properties, key: &str, default: T) -> Result<T> {
    match section.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .ok()
            .context(format!("Unable to read {} config from engine section", key)),
        None => Ok(default),
    }
}
