//! # FlashLaunch Core
//!
//! Plugin runtime and query engine of the FlashLaunch command launcher:
//! - Discovery of extension packages in the plugin roots
//! - Manifest validation and security checks
//! - One isolated Lua state per extension, with cancellation and timeouts
//! - A cached plugin catalog with hot reload
//! - Concurrent query dispatch with score-based ranking
//! - An out-of-band health check for every extension
//!
//! ## Quick Start
//!
//! ```no_run
//! use flashlaunch_core::{Launcher, config::AppPaths};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let launcher = Launcher::builder(AppPaths::discover(None)?).build();
//!     let cancel = CancellationToken::new();
//!
//!     for result in launcher.dispatch("hello", &cancel).await? {
//!         println!("{:.2} {} ({})", result.score, result.title, result.owner_plugin_id);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Extension packages
//!
//! An extension is a directory below one of the plugin roots holding a
//! `plugin.json` manifest and the Lua entry file it names. See
//! [`plugins::lua_plugin`] for the plugin table contract and
//! `demos/plugins/hello_world` for a complete package.

pub mod config;
pub mod core;
pub mod plugins;

use std::sync::Arc;
use std::time::Duration;

use config::{AppConfig, AppPaths, ConfigStore, DEV_PLUGINS_ENV};
use core::query_processor::{DispatchError, ExecuteError, QueryDispatcher};
use core::session::QuerySession;
use core::stats::{DispatchStats, StatsState, create_stats_state, get_stats};
use plugins::api::{Plugin, SearchResult};
use plugins::health::{HealthCheckError, HealthCheckRunner, HealthCheckSummary};
use plugins::host::{ShellLauncher, SystemShell};
use plugins::loader::{PluginLoader, discovery_roots};
use plugins::registry::{PluginCatalog, PluginGeneration};

pub use core::fuzzy::score as fuzzy_score;

/// Host-side entry point tying catalog, dispatcher and health check together
pub struct Launcher {
    paths: AppPaths,
    config: Arc<ConfigStore>,
    loader: Arc<PluginLoader>,
    catalog: Arc<PluginCatalog>,
    dispatcher: Arc<QueryDispatcher>,
    health: HealthCheckRunner,
}

impl Launcher {
    pub fn builder(paths: AppPaths) -> LauncherBuilder {
        LauncherBuilder::new(paths)
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    pub fn plugin_roots(&self) -> &[std::path::PathBuf] {
        self.loader.roots()
    }

    pub fn stats_state(&self) -> &StatsState {
        self.dispatcher.stats()
    }

    pub async fn stats(&self) -> DispatchStats {
        get_stats(self.dispatcher.stats()).await
    }

    /// Current plugin generation, running discovery off the async workers if needed
    pub async fn get_plugins(&self) -> Arc<PluginGeneration> {
        let catalog = Arc::clone(&self.catalog);
        let joined = tokio::task::spawn_blocking(move || catalog.get_plugins()).await;
        match finished("Plugin discovery", joined) {
            Some(generation) => generation,
            None => self.catalog.get_plugins(),
        }
    }

    /// Invalidate the catalog and retire the previous external plugins
    pub async fn reload(&self) -> usize {
        let catalog = Arc::clone(&self.catalog);
        let joined = tokio::task::spawn_blocking(move || catalog.reload()).await;
        finished("Plugin reload", joined).unwrap_or_default()
    }

    pub async fn dispatch(
        &self,
        query: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<SearchResult>, DispatchError> {
        self.dispatcher.dispatch(query, cancel).await
    }

    pub async fn execute(
        &self,
        result: &SearchResult,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), ExecuteError> {
        self.dispatcher.execute(result, cancel).await
    }

    pub async fn run_health_check(
        &self,
        per_plugin_timeout: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<HealthCheckSummary, HealthCheckError> {
        self.health.run(per_plugin_timeout, cancel).await
    }

    /// New supersede-on-submit session over this launcher's dispatcher
    pub fn session(&self) -> QuerySession {
        QuerySession::new(Arc::clone(&self.dispatcher))
    }
}

/// Value of a blocking task, or `None` after logging why it never produced one
fn finished<T>(task: &str, joined: Result<T, tokio::task::JoinError>) -> Option<T> {
    match joined {
        Ok(value) => Some(value),
        Err(e) => {
            crate::log_error!("{} task failed: {}", task, e);
            None
        }
    }
}

pub struct LauncherBuilder {
    paths: AppPaths,
    config: Option<AppConfig>,
    builtins: Vec<Arc<dyn Plugin>>,
    shell: Arc<dyn ShellLauncher>,
    roots: Option<Vec<std::path::PathBuf>>,
}

impl LauncherBuilder {
    fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            config: None,
            builtins: Vec::new(),
            shell: Arc::new(SystemShell),
            roots: None,
        }
    }

    /// Use this configuration instead of reading `config.toml`
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn builtin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.builtins.push(plugin);
        self
    }

    pub fn shell(mut self, shell: Arc<dyn ShellLauncher>) -> Self {
        self.shell = shell;
        self
    }

    /// Replace the discovery roots derived from the paths and environment
    pub fn roots(mut self, roots: Vec<std::path::PathBuf>) -> Self {
        self.roots = Some(roots);
        self
    }

    pub fn build(self) -> Launcher {
        let config = self
            .config
            .unwrap_or_else(|| AppConfig::load_or_default(&self.paths.config_path()));
        let roots = self.roots.unwrap_or_else(|| {
            discovery_roots(&self.paths, std::env::var(DEV_PLUGINS_ENV).ok().as_deref())
        });

        let loader = Arc::new(PluginLoader::new(
            self.paths.clone(),
            roots,
            config.load_timeout(),
            Arc::clone(&self.shell),
        ));
        let catalog = Arc::new(PluginCatalog::new(
            self.builtins,
            loader.clone(),
            self.paths.clone(),
            self.shell,
        ));
        let config = Arc::new(ConfigStore::new(config));
        let dispatcher = Arc::new(QueryDispatcher::new(
            Arc::clone(&catalog),
            Arc::clone(&config),
            create_stats_state(),
        ));

        Launcher {
            paths: self.paths,
            config,
            health: HealthCheckRunner::new(Arc::clone(&loader)),
            loader,
            catalog,
            dispatcher,
        }
    }
}
