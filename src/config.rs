//! Settings file and per-session configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::policy::{
    AllOf, ExcludeDotDirs, ExcludeDotfiles, ExcludeName, ExcludePath, ExcludePrefix,
    ExcludeSuffix,
};
use crate::protocol::{CHUNK_SIZE, HISTORY_FILE, HISTORY_TEMP_PREFIX};
use crate::transport::Role;

/// Contents of `settings.toml`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub role: Role,
    /// Offeror binds here; answerer dials here
    pub address: String,
    pub connect_timeout_secs: u64,
    pub ignore_dotfiles: bool,
    pub ignore_dot_dirs: bool,
    pub ignore_suffixes: Vec<String>,
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: Role::Offer,
            address: "0.0.0.0:9032".to_string(),
            connect_timeout_secs: 30,
            ignore_dotfiles: false,
            ignore_dot_dirs: false,
            ignore_suffixes: Vec::new(),
            log_file: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("Invalid settings: {}", path.display()))
    }
}

/// `$HOME/.config/pairsync/settings.toml`, or a relative fallback without HOME.
pub fn default_settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("pairsync")
        .join("settings.toml")
}

/// Everything the session driver needs besides the connection.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub root: PathBuf,
    pub debug: bool,
    pub log_file: Option<PathBuf>,
    pub chunk_size: usize,
    pub ignore_dotfiles: bool,
    pub ignore_dot_dirs: bool,
    pub ignore_suffixes: Vec<String>,
}

impl SyncConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debug: false,
            log_file: None,
            chunk_size: CHUNK_SIZE,
            ignore_dotfiles: false,
            ignore_dot_dirs: false,
            ignore_suffixes: Vec::new(),
        }
    }

    pub fn from_settings(root: impl Into<PathBuf>, settings: &Settings, debug: bool) -> Self {
        Self {
            debug,
            log_file: settings.log_file.clone(),
            ignore_dotfiles: settings.ignore_dotfiles,
            ignore_dot_dirs: settings.ignore_dot_dirs,
            ignore_suffixes: settings.ignore_suffixes.clone(),
            ..Self::new(root)
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    /// Snapshot policy: never the history file, a leftover history staging
    /// file or the root itself, plus the optional ignore rules.
    pub fn policy(&self) -> AllOf {
        let mut policy = AllOf::new()
            .and(ExcludeName(HISTORY_FILE.to_string()))
            .and(ExcludePrefix(HISTORY_TEMP_PREFIX.to_string()))
            .and(ExcludePath(self.root.clone()));
        if self.ignore_dotfiles {
            policy = policy.and(ExcludeDotfiles);
        }
        if self.ignore_dot_dirs {
            policy = policy.and(ExcludeDotDirs::under(self.root.clone()));
        }
        for suffix in &self.ignore_suffixes {
            policy = policy.and(ExcludeSuffix(suffix.clone()));
        }
        policy
    }
}
