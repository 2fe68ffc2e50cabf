//! Configuration Management Module
//!
//! Persistent orchestrator settings (ports, paths, intervals, collaborators).

pub mod storage;
pub mod types;

pub use storage::{config_dir, settings_file, SettingsStorage, StorageError, SETTINGS_ENV};
pub use types::{Settings, SETTINGS_VERSION};
