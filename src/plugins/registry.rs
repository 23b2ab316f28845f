//! Plugin catalog
//!
//! The catalog caches one [`PluginGeneration`]: the built-in plugins followed
//! by every external plugin the loader admitted. The first `get_plugins` call
//! after startup or after [`PluginCatalog::reload`] builds a new generation
//! while holding the cache lock, so concurrent callers wait for that single
//! build instead of starting their own discovery pass.
//!
//! Dispatches hold an `Arc` to the generation they started with. Reload only
//! detaches the generation from the cache and retires its external records;
//! it never waits for in-flight calls. A record whose boundary is busy is
//! disposed on a detached thread once the running call returns.
//!
//! Results are owned by the record id, which is unique within a generation,
//! so `execute` always reaches the plugin that produced the result.

use crate::config::AppPaths;
use crate::plugins::api::{Plugin, plugin_key};
use crate::plugins::host::{HostContext, ShellLauncher};
use crate::plugins::sandbox::{IsolationBoundary, TeardownOutcome};
use crate::{log_debug, log_error, log_info, log_warn};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};

/// Where a plugin came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Builtin,
    External,
}

/// One admitted plugin
pub struct PluginRecord {
    /// Manifest id for externals, plugin key for built-ins
    pub id: String,
    pub instance: Arc<dyn Plugin>,
    pub isolation: Option<Arc<IsolationBoundary>>,
    pub source: SourceKind,
    pub directory: PathBuf,
    pub loaded_at: DateTime<Utc>,
    retired: AtomicBool,
}

impl PluginRecord {
    pub fn builtin(instance: Arc<dyn Plugin>, directory: PathBuf) -> Self {
        Self {
            id: plugin_key(instance.as_ref()).to_string(),
            instance,
            isolation: None,
            source: SourceKind::Builtin,
            directory,
            loaded_at: Utc::now(),
            retired: AtomicBool::new(false),
        }
    }

    pub fn external(
        id: String,
        instance: Arc<dyn Plugin>,
        isolation: Arc<IsolationBoundary>,
        directory: PathBuf,
    ) -> Self {
        Self {
            id,
            instance,
            isolation: Some(isolation),
            source: SourceKind::External,
            directory,
            loaded_at: Utc::now(),
            retired: AtomicBool::new(false),
        }
    }

    /// Catalog id: enable-state key and owner stamped on results
    pub fn key(&self) -> &str {
        &self.id
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Dispose the instance and tear down its boundary
    ///
    /// Returns `true` only for the call that actually retired the record.
    /// Built-ins are never retired. Never blocks on a call in flight: the
    /// boundary stops admitting new calls and, when one is still running,
    /// disposal moves to a detached thread.
    pub fn retire(&self) -> bool {
        if self.source == SourceKind::Builtin {
            return false;
        }
        if self.retired.swap(true, Ordering::SeqCst) {
            return false;
        }

        let Some(boundary) = &self.isolation else {
            self.instance.dispose();
            log_debug!("Retired plugin '{}' from {:?}", self.id, self.directory);
            return true;
        };

        boundary.begin_close();
        if boundary.is_busy() {
            self.retire_in_background(Arc::clone(boundary));
        } else {
            finish_retirement(&self.id, self.instance.as_ref(), boundary);
        }
        true
    }

    fn retire_in_background(&self, boundary: Arc<IsolationBoundary>) {
        log_debug!(
            "Plugin '{}' is busy; disposing it once the running call returns",
            self.id
        );

        let spawned = {
            let id = self.id.clone();
            let instance = Arc::clone(&self.instance);
            let boundary = Arc::clone(&boundary);
            std::thread::Builder::new()
                .name(format!("retire-{}", self.id))
                .spawn(move || finish_retirement(&id, instance.as_ref(), &boundary))
        };

        if let Err(e) = spawned {
            log_error!(
                "Failed to start disposal of plugin '{}': {}; releasing its state without dispose",
                self.id,
                e
            );
            boundary.teardown();
        }
    }
}

fn finish_retirement(id: &str, instance: &dyn Plugin, boundary: &IsolationBoundary) {
    instance.dispose();
    if boundary.teardown() == TeardownOutcome::StillReferenced {
        log_debug!(
            "Plugin '{}' retired while a call is still running; its state is released afterwards",
            id
        );
    }
    log_debug!("Retired plugin '{}' from {:?}", id, boundary.root());
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.id)
            .field("name", &self.instance.name())
            .field("source", &self.source)
            .field("directory", &self.directory)
            .field("loaded_at", &self.loaded_at)
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Something that can produce the external records of a generation
pub trait PluginSource: Send + Sync {
    fn load_plugins(&self) -> Vec<PluginRecord>;
}

/// Immutable snapshot of the active plugins
#[derive(Debug)]
pub struct PluginGeneration {
    number: u64,
    records: Vec<Arc<PluginRecord>>,
    built_at: DateTime<Utc>,
}

impl PluginGeneration {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn records(&self) -> &[Arc<PluginRecord>] {
        &self.records
    }

    /// Record whose catalog id is exactly `key`
    pub fn find(&self, key: &str) -> Option<&Arc<PluginRecord>> {
        self.records.iter().find(|record| record.key() == key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn external_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.source == SourceKind::External)
            .count()
    }

    /// Retire every external record; returns how many were retired now
    fn retire_externals(&self) -> usize {
        self.records.iter().filter(|record| record.retire()).count()
    }
}

/// Single-flight cache of the current plugin generation
pub struct PluginCatalog {
    builtins: Vec<Arc<PluginRecord>>,
    source: Arc<dyn PluginSource>,
    paths: AppPaths,
    shell: Arc<dyn ShellLauncher>,
    cache: Mutex<Option<Arc<PluginGeneration>>>,
    next_generation: AtomicU64,
    builtins_initialized: Once,
}

impl PluginCatalog {
    pub fn new(
        builtins: Vec<Arc<dyn Plugin>>,
        source: Arc<dyn PluginSource>,
        paths: AppPaths,
        shell: Arc<dyn ShellLauncher>,
    ) -> Self {
        let builtins = builtins
            .into_iter()
            .map(|plugin| Arc::new(PluginRecord::builtin(plugin, paths.install_dir.clone())))
            .collect();

        Self {
            builtins,
            source,
            paths,
            shell,
            cache: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            builtins_initialized: Once::new(),
        }
    }

    /// Current generation, built on first use
    pub fn get_plugins(&self) -> Arc<PluginGeneration> {
        let mut cache = lock(&self.cache);
        if let Some(generation) = cache.as_ref() {
            return Arc::clone(generation);
        }

        let generation = Arc::new(self.build_generation());
        *cache = Some(Arc::clone(&generation));
        generation
    }

    /// Generation currently cached, without building one
    pub fn cached(&self) -> Option<Arc<PluginGeneration>> {
        lock(&self.cache).clone()
    }

    /// Drop the cached generation and retire its external plugins
    ///
    /// The next `get_plugins` runs discovery again. Returns the number of
    /// external plugins retired.
    pub fn reload(&self) -> usize {
        let previous = lock(&self.cache).take();

        let Some(previous) = previous else {
            log_debug!("Plugin catalog reload requested with nothing cached");
            return 0;
        };

        let retired = previous.retire_externals();
        log_info!(
            "Plugin catalog generation {} released, {} external plugin(s) retired",
            previous.number(),
            retired
        );
        retired
    }

    /// Retire everything; used on shutdown
    pub fn shutdown(&self) {
        self.reload();
    }

    fn build_generation(&self) -> PluginGeneration {
        self.builtins_initialized.call_once(|| self.initialize_builtins());

        let mut records: Vec<Arc<PluginRecord>> = self.builtins.clone();
        let mut taken: HashSet<String> = records
            .iter()
            .map(|record| record.id.to_ascii_lowercase())
            .collect();

        for record in self.source.load_plugins() {
            if !taken.insert(record.id.to_ascii_lowercase()) {
                log_warn!(
                    "External plugin '{}' from {:?} collides with an active plugin id; disposing it",
                    record.id,
                    record.directory
                );
                record.retire();
                continue;
            }
            records.push(Arc::new(record));
        }

        let number = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let generation = PluginGeneration {
            number,
            records,
            built_at: Utc::now(),
        };

        log_info!(
            "Plugin catalog generation {} built: {} built-in, {} external",
            number,
            self.builtins.len(),
            generation.external_count()
        );

        generation
    }

    fn initialize_builtins(&self) {
        for record in &self.builtins {
            if !record.instance.is_host_aware() {
                continue;
            }

            let host = match HostContext::create(
                &self.paths,
                record.key(),
                &record.directory,
                Arc::clone(&self.shell),
            ) {
                Ok(host) => host,
                Err(e) => {
                    log_error!("Failed to prepare host context for built-in '{}': {}", record.id, e);
                    continue;
                }
            };

            if let Err(e) = record.instance.initialize(host) {
                log_error!("Built-in plugin '{}' failed to initialize: {}", record.id, e);
            }
        }
    }
}

impl Drop for PluginCatalog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
