// FlashLaunch Core - Configuration
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Constants, on-disk locations, the immutable configuration snapshot and the
//! command line interface

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::log_warn;

// Extension package constants
pub const MANIFEST_FILE_NAME: &str = "plugin.json";
pub const SUPPORTED_API_VERSION: i64 = 1;
pub const ENTRY_EXTENSION: &str = "lua";
pub const MAX_PLUGIN_ID_LENGTH: usize = 100;

// Environment variables
pub const DEV_PLUGINS_ENV: &str = "FLASHLAUNCH_DEV_PLUGINS_DIR";
pub const DATA_DIR_ENV: &str = "FLASHLAUNCH_DATA_DIR";

// Directory layout under the data root
pub const APP_DIR_NAME: &str = "FlashLaunch";
pub const USER_PLUGINS_DIR: &str = "plugins";
pub const INSTALL_PLUGINS_DIR: &str = "plugins";
pub const DEV_PLUGINS_DIR: &str = "plugins-dev";
pub const PLUGIN_DATA_DIR: &str = "plugin-data";
pub const CONFIG_FILE_NAME: &str = "config.toml";

// Timeouts
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;
/// Time a timed-out health-check call gets to observe its cancellation
pub const HEALTH_CHECK_DRAIN_GRACE_MS: u64 = 250;
/// Budget for a plugin's own `dispose` hook
pub const DISPOSE_TIMEOUT_MS: u64 = 200;

// Sandbox limits
pub const LUA_MEMORY_LIMIT: usize = 16 * 1024 * 1024;
/// Instructions between two interrupt checks inside a Lua state
pub const LUA_INTERRUPT_INTERVAL: u32 = 1_000;

/// Where the launcher keeps its data and where it is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub data_root: PathBuf,
    pub install_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_root: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            install_dir: install_dir.into(),
        }
    }

    /// Resolve the platform locations
    ///
    /// The data root is, in order: the explicit override, `FLASHLAUNCH_DATA_DIR`,
    /// the platform data directory joined with `FlashLaunch`.
    pub fn discover(data_root_override: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_root = match data_root_override {
            Some(path) => path,
            None => match std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
                Some(value) => PathBuf::from(value),
                None => dirs::data_dir()
                    .context("Failed to determine the platform data directory")?
                    .join(APP_DIR_NAME),
            },
        };
        let data_root = std::path::absolute(&data_root)
            .with_context(|| format!("Invalid data directory {:?}", data_root))?;

        let install_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .map_or_else(std::env::current_dir, Ok)
            .context("Failed to determine the install directory")?;

        Ok(Self::new(data_root, install_dir))
    }

    pub fn user_plugins_dir(&self) -> PathBuf {
        self.data_root.join(USER_PLUGINS_DIR)
    }

    pub fn install_plugins_dir(&self) -> PathBuf {
        self.install_dir.join(INSTALL_PLUGINS_DIR)
    }

    pub fn dev_plugins_dir(&self) -> PathBuf {
        self.data_root.join(DEV_PLUGINS_DIR)
    }

    /// Private data directory for one plugin, `safe_id` must already be sanitized
    pub fn plugin_data_dir(&self, safe_id: &str) -> PathBuf {
        self.data_root.join(PLUGIN_DATA_DIR).join(safe_id)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_root.join(CONFIG_FILE_NAME)
    }
}

/// Host configuration as read from `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Explicit enable state per plugin key; anything absent is enabled
    pub plugin_states: BTreeMap<String, bool>,
    pub load_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plugin_states: BTreeMap::new(),
            load_timeout_ms: DEFAULT_LOAD_TIMEOUT_MS,
            health_check_timeout_ms: DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Load the config file, falling back to defaults
    ///
    /// A missing file is normal; a broken one is logged and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                log_warn!("Ignoring configuration file: {:#}", e);
                Self::default()
            }
        }
    }

    /// Whether the plugin with `key` may take part in dispatch
    ///
    /// `legacy_key` is consulted when no state is stored under `key`.
    pub fn is_plugin_enabled(&self, key: &str, legacy_key: Option<&str>) -> bool {
        if key.trim().is_empty() {
            return false;
        }

        if let Some(state) = self.plugin_states.get(key) {
            return *state;
        }

        legacy_key
            .filter(|legacy| !legacy.trim().is_empty())
            .and_then(|legacy| self.plugin_states.get(legacy))
            .copied()
            .unwrap_or(true)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Copy-on-write holder of the current configuration snapshot
///
/// Readers get an `Arc` they can keep for as long as they like; updates build
/// a new snapshot and swap it in.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<AppConfig>>,
}

impl ConfigStore {
    pub fn new(config: AppConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<AppConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Apply `change` to a copy of the current snapshot and publish the copy
    pub fn update(&self, change: impl FnOnce(&mut AppConfig)) -> Arc<AppConfig> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = AppConfig::clone(&guard);
        change(&mut next);
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        next
    }

    pub fn set_plugin_enabled(&self, key: &str, enabled: bool) -> Arc<AppConfig> {
        self.update(|config| {
            config.plugin_states.insert(key.to_string(), enabled);
        })
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

/// Answers whether a plugin may take part in dispatch
pub trait PluginStateProvider: Send + Sync {
    fn is_enabled(&self, key: &str, legacy_key: Option<&str>) -> bool;
}

impl PluginStateProvider for AppConfig {
    fn is_enabled(&self, key: &str, legacy_key: Option<&str>) -> bool {
        self.is_plugin_enabled(key, legacy_key)
    }
}

impl PluginStateProvider for ConfigStore {
    fn is_enabled(&self, key: &str, legacy_key: Option<&str>) -> bool {
        self.snapshot().is_plugin_enabled(key, legacy_key)
    }
}

#[derive(Parser)]
#[command(author, version, about = "FlashLaunch plugin runtime and query engine")]
pub struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Enable trace output (extremely verbose)
    #[arg(short, long, global = true)]
    pub trace: bool,

    /// Format logs for journald
    #[arg(long, global = true)]
    pub journald: bool,

    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List active plugins
    List,

    /// Run one query across all enabled plugins
    Query {
        text: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a query and execute one of its results
    Execute {
        text: String,

        /// Position of the result in the ranked list
        #[arg(long, default_value_t = 0)]
        index: usize,
    },

    /// Load, exercise and discard every external plugin
    Health {
        /// Per-plugin timeout in milliseconds (defaults to the configured value)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive mode reading queries from stdin
    Repl,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plugin_enabled_defaults_to_true() {
        let config = AppConfig::default();
        assert!(config.is_plugin_enabled("sample.hello", None));
        assert!(!config.is_plugin_enabled("   ", None));
    }

    #[test]
    fn test_plugin_enabled_legacy_fallback() {
        let mut config = AppConfig::default();
        config.plugin_states.insert("Hello World".to_string(), false);
        assert!(!config.is_plugin_enabled("sample.hello", Some("Hello World")));

        config.plugin_states.insert("sample.hello".to_string(), true);
        assert!(config.is_plugin_enabled("sample.hello", Some("Hello World")));
    }

    #[test]
    fn test_config_store_snapshots_are_immutable() {
        let store = ConfigStore::default();
        let before = store.snapshot();
        store.set_plugin_enabled("sample.hello", false);

        assert!(before.is_plugin_enabled("sample.hello", None));
        assert!(!store.snapshot().is_plugin_enabled("sample.hello", None));
        assert!(!PluginStateProvider::is_enabled(&store, "sample.hello", None));
    }

    #[test]
    fn test_load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
load_timeout_ms = 750

[plugin_states]
"sample.hello" = false
"#,
        )
        .unwrap();

        let config = AppConfig::load_or_default(&path);
        assert_eq!(config.load_timeout(), Duration::from_millis(750));
        assert_eq!(config.health_check_timeout_ms, DEFAULT_HEALTH_CHECK_TIMEOUT_MS);
        assert!(!config.is_plugin_enabled("sample.hello", None));
    }

    #[test]
    fn test_broken_config_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "plugin_states = 12").unwrap();

        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
        assert_eq!(
            AppConfig::load_or_default(&temp_dir.path().join("missing.toml")),
            AppConfig::default()
        );
    }

    #[test]
    fn test_app_paths_layout() {
        let paths = AppPaths::new("/data/FlashLaunch", "/opt/flashlaunch");
        assert_eq!(paths.user_plugins_dir(), PathBuf::from("/data/FlashLaunch/plugins"));
        assert_eq!(paths.install_plugins_dir(), PathBuf::from("/opt/flashlaunch/plugins"));
        assert_eq!(paths.dev_plugins_dir(), PathBuf::from("/data/FlashLaunch/plugins-dev"));
        assert_eq!(
            paths.plugin_data_dir("sample.hello"),
            PathBuf::from("/data/FlashLaunch/plugin-data/sample.hello")
        );
    }
}
