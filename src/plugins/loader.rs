//! Plugin discovery and loading
//!
//! This module walks the discovery roots, validates each candidate's manifest
//! and admits the plugins that pass every check:
//!
//! 1. Manifest read and validated
//! 2. Entry file resolved strictly inside the candidate directory
//! 3. No bundled copies of host-shared modules
//! 4. Fresh isolation boundary, entry executed, factory called
//! 5. Declared identity matches the manifest id
//! 6. Host-aware plugins initialized with their [`HostContext`]
//!
//! A failure at any step rejects only that candidate.

use crate::config::{AppPaths, DEV_PLUGINS_ENV, MANIFEST_FILE_NAME};
use crate::plugins::api::Plugin;
use crate::plugins::error::{LoadError, PluginError, PluginLoadError, SecurityError};
use crate::plugins::host::{HostContext, PluginLogger, ShellLauncher};
use crate::plugins::lua_plugin::LuaPlugin;
use crate::plugins::manifest::read_raw;
use crate::plugins::registry::{PluginRecord, PluginSource};
use crate::plugins::sandbox::{IsolationBoundary, bundled_shared_module};
use crate::{log_debug, log_error, log_info, log_warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One extension directory holding a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub directory: PathBuf,
    pub manifest_path: PathBuf,
}

/// Why a candidate was not admitted
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    /// Manifest id when it could be read
    pub id: Option<String>,
    pub error: PluginLoadError,
}

impl CandidateFailure {
    fn new(id: Option<&str>, error: impl Into<PluginLoadError>) -> Self {
        Self {
            id: id.map(str::to_string),
            error: error.into(),
        }
    }
}

/// Discovery roots in precedence order, de-duplicated
///
/// `dev_env` is the raw value of `FLASHLAUNCH_DEV_PLUGINS_DIR`. Malformed
/// entries are logged and skipped.
pub fn discovery_roots(paths: &AppPaths, dev_env: Option<&str>) -> Vec<PathBuf> {
    let mut roots = vec![
        paths.user_plugins_dir(),
        paths.install_plugins_dir(),
        paths.dev_plugins_dir(),
    ];

    for entry in dev_env.unwrap_or_default().split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.contains('\0') {
            log_warn!("Ignoring malformed {} entry {:?}", DEV_PLUGINS_ENV, entry);
            continue;
        }
        match std::path::absolute(entry) {
            Ok(path) => roots.push(path),
            Err(e) => log_warn!("Ignoring malformed {} entry {:?}: {}", DEV_PLUGINS_ENV, entry, e),
        }
    }

    let mut unique: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        let root: PathBuf = root.components().collect();
        if !unique.iter().any(|seen| same_root(seen, &root)) {
            unique.push(root);
        }
    }
    unique
}

fn same_root(a: &Path, b: &Path) -> bool {
    if cfg!(windows) {
        a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
    } else {
        a == b
    }
}

/// Subdirectories of `root` holding a manifest, in name order
pub fn discover_candidates(root: &Path) -> Vec<Candidate> {
    if !root.is_dir() {
        log_debug!("Plugin root {:?} does not exist, skipping", root);
        return Vec::new();
    }

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            log_warn!("Failed to read plugin root {:?}: {}", root, e);
            return Vec::new();
        }
    };

    let mut candidates: Vec<Candidate> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|directory| {
            let manifest_path = directory.join(MANIFEST_FILE_NAME);
            manifest_path.is_file().then_some(Candidate {
                directory,
                manifest_path,
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.directory.file_name().cmp(&b.directory.file_name()));
    candidates
}

/// Loads external plugins from the discovery roots
pub struct PluginLoader {
    paths: AppPaths,
    roots: Vec<PathBuf>,
    load_timeout: Duration,
    shell: Arc<dyn ShellLauncher>,
}

impl PluginLoader {
    pub fn new(
        paths: AppPaths,
        roots: Vec<PathBuf>,
        load_timeout: Duration,
        shell: Arc<dyn ShellLauncher>,
    ) -> Self {
        Self {
            paths,
            roots,
            load_timeout,
            shell,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn shell(&self) -> &Arc<dyn ShellLauncher> {
        &self.shell
    }

    /// Every candidate across all roots, roots in precedence order
    pub fn discover(&self) -> Vec<Candidate> {
        self.roots
            .iter()
            .flat_map(|root| discover_candidates(root))
            .collect()
    }

    /// Load one candidate, bounded by `cancel` and `deadline`
    pub fn load_candidate(
        &self,
        candidate: &Candidate,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<PluginRecord, CandidateFailure> {
        let raw = read_raw(&candidate.manifest_path).map_err(|e| CandidateFailure::new(None, e))?;
        let display_id = raw.display_id().map(str::to_string);
        let fail = |error: PluginLoadError| CandidateFailure {
            id: display_id.clone(),
            error,
        };

        let manifest = raw.validate().map_err(|e| fail(e.into()))?;

        let directory = candidate
            .directory
            .canonicalize()
            .map_err(|e| fail(LoadError::Boundary(e.to_string()).into()))?;

        let entry_path = directory.join(&manifest.entry_ref);
        let entry = entry_path
            .canonicalize()
            .map_err(|_| fail(LoadError::EntryNotFound(entry_path.clone()).into()))?;
        if !entry.starts_with(&directory) || entry == directory {
            return Err(fail(
                SecurityError::PathEscape {
                    entry,
                    directory,
                }
                .into(),
            ));
        }
        if !entry.is_file() {
            return Err(fail(LoadError::EntryNotFound(entry).into()));
        }

        if let Some(module) = bundled_shared_module(&directory) {
            return Err(fail(SecurityError::SharedModuleBundled(module.to_string()).into()));
        }

        let boundary = Arc::new(
            IsolationBoundary::create(&manifest.id, &directory, PluginLogger::new(&manifest.id))
                .map_err(|e| fail(e.into()))?,
        );

        let plugin = match LuaPlugin::instantiate(
            Arc::clone(&boundary),
            &entry,
            &manifest.type_ref,
            cancel,
            deadline,
            self.load_timeout,
        ) {
            Ok(plugin) => plugin,
            Err(e) => {
                boundary.teardown();
                return Err(fail(e.into()));
            }
        };

        let reject = |plugin: &LuaPlugin, error: PluginLoadError| {
            plugin.dispose();
            boundary.teardown();
            fail(error)
        };

        if let Some(declared) = plugin.id() {
            if !declared.eq_ignore_ascii_case(&manifest.id) {
                let error = SecurityError::IdentityMismatch {
                    manifest: manifest.id.clone(),
                    declared: declared.to_string(),
                };
                return Err(reject(&plugin, error.into()));
            }
        }

        if plugin.is_host_aware() {
            let host = match HostContext::create(
                &self.paths,
                &manifest.id,
                &directory,
                Arc::clone(&self.shell),
            ) {
                Ok(host) => host,
                Err(e) => return Err(reject(&plugin, LoadError::DataDirectory(e.to_string()).into())),
            };

            if let Err(e) = plugin.initialize_with(&host, cancel, deadline) {
                let error = match e {
                    PluginError::Cancelled => LoadError::Cancelled,
                    PluginError::TimedOut => LoadError::TimedOut,
                    other => LoadError::Initialization(other.to_string()),
                };
                return Err(reject(&plugin, error.into()));
            }
        }

        log_info!(
            "Loaded plugin '{}' ({}) from {:?}",
            plugin.name(),
            manifest.id,
            candidate.directory
        );

        Ok(PluginRecord::external(
            manifest.id,
            Arc::new(plugin),
            boundary,
            candidate.directory.clone(),
        ))
    }

    /// Load every candidate; the first record claiming an id wins
    pub fn load_plugins(&self) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> = Vec::new();
        let mut owners: HashMap<String, PathBuf> = HashMap::new();
        let mut skipped_count = 0;

        for candidate in self.discover() {
            let cancel = CancellationToken::new();
            let deadline = Instant::now() + self.load_timeout;

            let record = match self.load_candidate(&candidate, &cancel, deadline) {
                Ok(record) => record,
                Err(failure) => {
                    log_rejection(&candidate, &failure);
                    skipped_count += 1;
                    continue;
                }
            };

            if let Err(error) = check_duplicate(&owners, &record.id) {
                log_rejection(
                    &candidate,
                    &CandidateFailure {
                        id: Some(record.id.clone()),
                        error,
                    },
                );
                record.retire();
                skipped_count += 1;
                continue;
            }

            owners.insert(record.id.to_ascii_lowercase(), candidate.directory.clone());
            records.push(record);
        }

        log_info!(
            "Loaded {} external plugin(s), skipped {}",
            records.len(),
            skipped_count
        );

        records
    }
}

impl PluginSource for PluginLoader {
    fn load_plugins(&self) -> Vec<PluginRecord> {
        PluginLoader::load_plugins(self)
    }
}

/// Ids compare case-insensitively
fn check_duplicate(owners: &HashMap<String, PathBuf>, id: &str) -> Result<(), PluginLoadError> {
    match owners.get(&id.to_ascii_lowercase()) {
        Some(owner) => {
            log_debug!("Plugin id '{}' is owned by {:?}", id, owner);
            Err(PluginLoadError::DuplicateId(id.to_string()))
        }
        None => Ok(()),
    }
}

fn log_rejection(candidate: &Candidate, failure: &CandidateFailure) {
    let id = failure.id.as_deref().unwrap_or("<unknown>");
    match &failure.error {
        PluginLoadError::Security(e) => {
            log_warn!("Rejected plugin '{}' at {:?} (security): {}", id, candidate.directory, e)
        }
        PluginLoadError::Load(e) => {
            log_error!("Failed to load plugin '{}' from {:?}: {}", id, candidate.directory, e)
        }
        PluginLoadError::Manifest(e) => {
            log_warn!("Skipping plugin at {:?}: invalid manifest: {}", candidate.directory, e)
        }
        PluginLoadError::DuplicateId(_) => {
            log_warn!("Rejected plugin at {:?}: {}; disposing it", candidate.directory, failure.error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::SourceKind;
    use crate::plugins::test_support::{
        RecordingShell, disposals_of, hello_plugin_source, manifest_json, write_extension,
        write_hello_extension, write_spinning_extension,
    };
    use tempfile::TempDir;

    fn loader_for(temp_dir: &TempDir, roots: Vec<PathBuf>) -> PluginLoader {
        let paths = AppPaths::new(temp_dir.path().join("data"), temp_dir.path().join("install"));
        PluginLoader::new(
            paths,
            roots,
            Duration::from_secs(5),
            Arc::new(RecordingShell::default()),
        )
    }

    fn load_one(loader: &PluginLoader, directory: &Path) -> Result<PluginRecord, CandidateFailure> {
        let candidate = Candidate {
            directory: directory.to_path_buf(),
            manifest_path: directory.join(MANIFEST_FILE_NAME),
        };
        let cancel = CancellationToken::new();
        loader.load_candidate(&candidate, &cancel, Instant::now() + Duration::from_secs(5))
    }

    #[test]
    fn test_discovery_roots_order_and_dedup() {
        let paths = AppPaths::new("/data/FlashLaunch", "/opt/flashlaunch");
        let roots = discovery_roots(
            &paths,
            Some(" /work/plugins ; ;/data/FlashLaunch/plugins;/work/plugins/;relative"),
        );

        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            roots,
            vec![
                PathBuf::from("/data/FlashLaunch/plugins"),
                PathBuf::from("/opt/flashlaunch/plugins"),
                PathBuf::from("/data/FlashLaunch/plugins-dev"),
                PathBuf::from("/work/plugins"),
                cwd.join("relative"),
            ]
        );
    }

    #[test]
    fn test_discovery_roots_skip_malformed_entries() {
        let paths = AppPaths::new("/data", "/opt");
        let roots = discovery_roots(&paths, Some("bad\0path;/ok"));
        assert_eq!(roots.len(), 4);
        assert_eq!(roots[3], PathBuf::from("/ok"));

        assert_eq!(discovery_roots(&paths, None).len(), 3);
    }

    #[test]
    fn test_discover_candidates_sorted_with_manifest_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write_hello_extension(root, "zeta", "a.zeta", "Zeta");
        write_hello_extension(root, "alpha", "a.alpha", "Alpha");
        fs::create_dir_all(root.join("no_manifest")).unwrap();
        fs::write(root.join("stray.json"), "{}").unwrap();

        let candidates = discover_candidates(root);
        let names: Vec<_> = candidates
            .iter()
            .map(|c| c.directory.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        assert!(discover_candidates(&root.join("missing")).is_empty());
    }

    #[test]
    fn test_load_valid_extension() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let dir = write_hello_extension(&root, "hello", "sample.hello", "Hello World");
        let loader = loader_for(&temp_dir, vec![root]);

        let record = load_one(&loader, &dir).unwrap();
        assert_eq!(record.id, "sample.hello");
        assert_eq!(record.source, SourceKind::External);
        assert_eq!(record.instance.name(), "Hello World");
        assert!(record.isolation.is_some());

        let cancel = CancellationToken::new();
        assert_eq!(record.instance.query("hello", &cancel).unwrap().len(), 1);
        assert!(record.retire());
    }

    #[test]
    fn test_rejects_invalid_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let dir = write_extension(
            &root,
            "bad",
            r#"{ "apiVersion": 7, "id": "bad", "assembly": "main.lua", "type": "Plugin" }"#,
            &[("main.lua", "return {}")],
        );
        let loader = loader_for(&temp_dir, vec![root]);

        let failure = load_one(&loader, &dir).unwrap_err();
        assert_eq!(failure.id.as_deref(), Some("bad"));
        assert!(matches!(failure.error, PluginLoadError::Manifest(_)));
    }

    #[test]
    fn test_rejects_missing_entry() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let dir = write_extension(&root, "empty", &manifest_json("sample.empty"), &[]);
        let loader = loader_for(&temp_dir, vec![root]);

        let failure = load_one(&loader, &dir).unwrap_err();
        assert!(matches!(
            failure.error,
            PluginLoadError::Load(LoadError::EntryNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_entry_escaping_directory() {
        let temp_dir = TempDir::new().unwrap();
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("evil.lua"), hello_plugin_source("sample.evil", "Evil")).unwrap();

        let root = temp_dir.path().join("plugins");
        let dir = write_extension(&root, "evil", &manifest_json("sample.evil"), &[]);
        std::os::unix::fs::symlink(outside.join("evil.lua"), dir.join("main.lua")).unwrap();
        let loader = loader_for(&temp_dir, vec![root.clone()]);

        let failure = load_one(&loader, &dir).unwrap_err();
        assert!(failure.error.is_security());
        assert!(matches!(
            failure.error,
            PluginLoadError::Security(SecurityError::PathEscape { .. })
        ));
        assert!(loader.load_plugins().is_empty());
    }

    #[test]
    fn test_rejects_identity_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let dir = write_extension(
            &root,
            "imposter",
            &manifest_json("sample.honest"),
            &[("main.lua", &hello_plugin_source("builtin.apps", "Imposter"))],
        );
        let loader = loader_for(&temp_dir, vec![root]);

        let failure = load_one(&loader, &dir).unwrap_err();
        assert_eq!(
            failure.error,
            PluginLoadError::Security(SecurityError::IdentityMismatch {
                manifest: "sample.honest".to_string(),
                declared: "builtin.apps".to_string(),
            })
        );
    }

    #[test]
    fn test_identity_comparison_ignores_case() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let dir = write_extension(
            &root,
            "cased",
            &manifest_json("Sample.Hello"),
            &[("main.lua", &hello_plugin_source("sample.hello", "Cased"))],
        );
        let loader = loader_for(&temp_dir, vec![root]);

        let record = load_one(&loader, &dir).unwrap();
        assert_eq!(record.id, "Sample.Hello");
        record.retire();
    }

    #[test]
    fn test_rejects_bundled_host_module() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let dir = write_extension(
            &root,
            "bundler",
            &manifest_json("sample.bundler"),
            &[
                ("main.lua", &hello_plugin_source("sample.bundler", "Bundler")),
                ("flashlaunch.lua", "return {}"),
            ],
        );
        let loader = loader_for(&temp_dir, vec![root]);

        let failure = load_one(&loader, &dir).unwrap_err();
        assert_eq!(
            failure.error,
            PluginLoadError::Security(SecurityError::SharedModuleBundled("flashlaunch".to_string()))
        );
    }

    #[test]
    fn test_entry_that_never_returns_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let dir = write_extension(
            &root,
            "spin",
            &manifest_json("sample.spin"),
            &[("main.lua", "while true do end")],
        );
        let loader = loader_for(&temp_dir, vec![root]);

        let candidate = Candidate {
            directory: dir.clone(),
            manifest_path: dir.join(MANIFEST_FILE_NAME),
        };
        let cancel = CancellationToken::new();
        let failure = loader
            .load_candidate(&candidate, &cancel, Instant::now() + Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(failure.error, PluginLoadError::Load(LoadError::TimedOut));
    }

    #[test]
    fn test_host_aware_extension_gets_data_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let source = r#"
return { Plugin = function()
    local self = { id = "sample.aware", name = "Aware" }
    function self:initialize(host) self.dir = host.data_directory end
    function self:query() return { { title = self.dir, score = 1 } } end
    function self:execute() end
    return self
end }
"#;
        let dir = write_extension(&root, "aware", &manifest_json("sample.aware"), &[("main.lua", source)]);
        let loader = loader_for(&temp_dir, vec![root]);

        let record = load_one(&loader, &dir).unwrap();
        let expected = temp_dir.path().join("data").join("plugin-data").join("sample.aware");
        assert!(expected.is_dir());

        let cancel = CancellationToken::new();
        let results = record.instance.query("x", &cancel).unwrap();
        assert_eq!(results[0].title, expected.to_string_lossy());
        record.retire();
    }

    #[test]
    fn test_failed_initialization_rejects_candidate() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let source = r#"
return { Plugin = function()
    return {
        name = "Broken",
        initialize = function() error("no config") end,
        query = function() return {} end,
        execute = function() end,
    }
end }
"#;
        let dir = write_extension(&root, "broken", &manifest_json("sample.broken"), &[("main.lua", source)]);
        let loader = loader_for(&temp_dir, vec![root]);

        let failure = load_one(&loader, &dir).unwrap_err();
        assert!(matches!(
            failure.error,
            PluginLoadError::Load(LoadError::Initialization(ref m)) if m.contains("no config")
        ));
    }

    #[test]
    fn test_duplicate_ids_first_root_wins() {
        let temp_dir = TempDir::new().unwrap();
        let first = temp_dir.path().join("first");
        let second = temp_dir.path().join("second");
        write_hello_extension(&first, "hello", "sample.hello", "First");
        write_spinning_extension(&second, "hello", "SAMPLE.HELLO");
        write_hello_extension(&second, "other", "sample.other", "Other");

        let shell = Arc::new(RecordingShell::default());
        let paths = AppPaths::new(temp_dir.path().join("data"), temp_dir.path().join("install"));
        let loader = PluginLoader::new(paths, vec![first.clone(), second], Duration::from_secs(5), shell.clone());
        let records = loader.load_plugins();

        let names: Vec<&str> = records.iter().map(|r| r.instance.name()).collect();
        assert_eq!(names, vec!["First", "Other"]);
        assert_eq!(records[0].directory, first.join("hello"));

        // The losing duplicate was initialized, then disposed exactly once
        assert_eq!(disposals_of(&shell, "SAMPLE.HELLO"), 1);
        assert_eq!(shell.calls().len(), 1);

        for record in &records {
            record.retire();
        }
        assert_eq!(shell.calls().len(), 1);
    }

    #[test]
    fn test_check_duplicate_ignores_case() {
        let mut owners = HashMap::new();
        assert_eq!(check_duplicate(&owners, "sample.hello"), Ok(()));

        owners.insert("sample.hello".to_string(), PathBuf::from("/plugins/hello"));
        assert_eq!(
            check_duplicate(&owners, "Sample.Hello"),
            Err(PluginLoadError::DuplicateId("Sample.Hello".to_string()))
        );
        assert_eq!(check_duplicate(&owners, "sample.other"), Ok(()));
    }

    #[test]
    fn test_one_bad_candidate_does_not_stop_others() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        write_extension(&root, "a_broken", "{ not json", &[]);
        write_hello_extension(&root, "b_good", "sample.good", "Good");

        let loader = loader_for(&temp_dir, vec![root]);
        let records = loader.load_plugins();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "sample.good");
        records[0].retire();
    }
}
