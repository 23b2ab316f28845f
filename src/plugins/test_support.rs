//! Fakes and fixture builders shared by the test modules

use crate::plugins::api::{Plugin, PluginKind, SearchResult};
use crate::plugins::error::PluginError;
use crate::plugins::host::{HostContext, ShellLauncher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a [`StaticPlugin`] answers queries
#[derive(Debug, Clone)]
pub enum Behavior {
    Results(Vec<SearchResult>),
    Fail(String),
    Panic,
    /// Sleep, then return the results
    Slow(Duration, Vec<SearchResult>),
    /// Block until the call is cancelled
    BlockUntilCancelled,
    /// Block until cancelled on this exact text, otherwise echo it back
    BlockOnQuery(String),
}

/// In-process plugin with canned behavior and call counters
#[derive(Debug)]
pub struct StaticPlugin {
    name: String,
    id: Option<String>,
    kind: PluginKind,
    behavior: Behavior,
    host_aware: bool,
    pub queries: AtomicUsize,
    pub executions: AtomicUsize,
    pub disposals: AtomicUsize,
    pub initializations: AtomicUsize,
}

impl StaticPlugin {
    pub fn new(name: &str, results: Vec<SearchResult>) -> Self {
        Self::with_behavior(name, Behavior::Results(results))
    }

    pub fn with_behavior(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            kind: PluginKind::Other,
            behavior,
            host_aware: false,
            queries: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
            initializations: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::with_behavior(name, Behavior::Fail(message.to_string()))
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn host_aware(mut self) -> Self {
        self.host_aware = true;
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

impl Plugin for StaticPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "static test plugin"
    }

    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn query(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<SearchResult>, PluginError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Results(results) => Ok(results.clone()),
            Behavior::Fail(message) => Err(PluginError::runtime(message.clone())),
            Behavior::Panic => panic!("plugin {} panicked", self.name),
            Behavior::Slow(delay, results) => {
                std::thread::sleep(*delay);
                Ok(results.clone())
            }
            Behavior::BlockUntilCancelled => block_until_cancelled(cancel),
            Behavior::BlockOnQuery(blocking) if blocking == text => block_until_cancelled(cancel),
            Behavior::BlockOnQuery(_) => Ok(vec![SearchResult::new(text, 0.5)]),
        }
    }

    fn execute(&self, _result: &SearchResult, _cancel: &CancellationToken) -> Result<(), PluginError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Fail(message) => Err(PluginError::runtime(message.clone())),
            _ => Ok(()),
        }
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn is_host_aware(&self) -> bool {
        self.host_aware
    }

    fn initialize(&self, _host: HostContext) -> Result<(), PluginError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

fn block_until_cancelled(cancel: &CancellationToken) -> Result<Vec<SearchResult>, PluginError> {
    while !cancel.is_cancelled() {
        std::thread::sleep(Duration::from_millis(5));
    }
    Err(PluginError::Cancelled)
}

/// Shell that records requests instead of performing them
#[derive(Debug, Default)]
pub struct RecordingShell {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingShell {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> std::io::Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            Err(std::io::Error::other("shell disabled"))
        } else {
            Ok(())
        }
    }
}

impl ShellLauncher for RecordingShell {
    fn open(&self, target: &str) -> std::io::Result<()> {
        self.record(format!("open {}", target))
    }

    fn start_process(&self, program: &str, args: &[String]) -> std::io::Result<()> {
        let mut call = format!("start {}", program);
        for arg in args {
            call.push(' ');
            call.push_str(arg);
        }
        self.record(call)
    }
}

pub fn shared<T: Plugin + 'static>(plugin: T) -> (Arc<T>, Arc<dyn Plugin>) {
    let plugin = Arc::new(plugin);
    let dynamic: Arc<dyn Plugin> = plugin.clone();
    (plugin, dynamic)
}

/// Lua source of a plugin answering queries that start with "hello"
pub fn hello_plugin_source(id: &str, name: &str) -> String {
    format!(
        r#"
local fl = require("flashlaunch")
local M = {{}}

function M.Plugin()
    local self = {{ id = "{id}", name = "{name}", description = "says hello", kind = fl.kind.Utility }}

    function self:query(text)
        if not string.find(string.lower(text), "^hello") then
            return {{}}
        end
        return {{ {{ title = "Hello from {name}", subtitle = text, score = 0.9, payload = {{ url = "https://example.com/hello" }} }} }}
    end

    function self:execute(result)
        log_info("executing " .. result.title)
    end

    return self
end

return M
"#
    )
}

/// Lua source of a plugin that spins forever on the query "spin"
///
/// The spin hides inside `pcall`, and `dispose` reports itself through
/// the host shell as `open disposed:<id>`.
pub fn spinning_plugin_source(id: &str) -> String {
    format!(
        r#"
return {{ Plugin = function()
    local self = {{ id = "{id}", name = "Spinner" }}

    function self:initialize(host) self.host = host end

    function self:query(text)
        if text == "spin" then
            while true do pcall(function() while true do end end) end
        end
        return {{ {{ title = "idle", score = 0.5 }} }}
    end

    function self:execute() end

    function self:dispose() self.host.open_url("disposed:{id}") end

    return self
end }}
"#
    )
}

/// Write `<root>/<directory>/plugin.json` plus the given files
pub fn write_extension(root: &Path, directory: &str, manifest: &str, files: &[(&str, &str)]) -> PathBuf {
    let dir = root.join(directory);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("plugin.json"), manifest).unwrap();
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
    dir
}

pub fn manifest_json(id: &str) -> String {
    format!(r#"{{ "apiVersion": 1, "id": "{id}", "assembly": "main.lua", "type": "Plugin" }}"#)
}

/// A complete, valid hello extension
pub fn write_spinning_extension(root: &Path, directory: &str, id: &str) -> PathBuf {
    write_extension(
        root,
        directory,
        &manifest_json(id),
        &[("main.lua", &spinning_plugin_source(id))],
    )
}

/// Number of `open disposed:<id>` calls the shell saw
pub fn disposals_of(shell: &RecordingShell, id: &str) -> usize {
    let expected = format!("open disposed:{}", id);
    shell.calls().iter().filter(|call| **call == expected).count()
}

pub fn write_hello_extension(root: &Path, directory: &str, id: &str, name: &str) -> PathBuf {
    write_extension(
        root,
        directory,
        &manifest_json(id),
        &[("main.lua", &hello_plugin_source(id, name))],
    )
}
