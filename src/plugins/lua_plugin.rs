//! Adapter presenting a Lua extension as a [`Plugin`]
//!
//! The entry chunk returns an exports table. The manifest's `type` is a dotted
//! path into it naming either a factory function or a class table with `new`.
//! The factory returns the instance table:
//!
//! ```lua
//! local fl = require("flashlaunch")
//! local M = {}
//!
//! function M.HelloWorld()
//!     local self = { id = "sample.hello_world", name = "Hello World", kind = fl.kind.Utility }
//!     function self:query(text) return { { title = "Hello", score = 0.9 } } end
//!     function self:execute(result) end
//!     return self
//! end
//!
//! return M
//! ```
//!
//! `initialize(self, host)`, `self_test(self)` and `dispose(self)` are optional.

use crate::config::DISPOSE_TIMEOUT_MS;
use crate::log_warn;
use crate::plugins::api::{Payload, Plugin, PluginKind, SearchResult};
use crate::plugins::error::{LoadError, PluginError};
use crate::plugins::host::HostContext;
use crate::plugins::sandbox::IsolationBoundary;
use crate::plugins::sdk::create_host_table;
use mlua::{Function, Lua, LuaSerdeExt, RegistryKey, Table, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Plugin-private payload of a Lua result, kept as plain data
#[derive(Debug, Clone, PartialEq)]
pub struct LuaPayload(pub serde_json::Value);

enum Factory {
    Function(Function),
    Class { class: Table, new: Function },
}

/// A plugin instance living inside an [`IsolationBoundary`]
pub struct LuaPlugin {
    boundary: Arc<IsolationBoundary>,
    instance: RegistryKey,
    name: String,
    description: String,
    kind: PluginKind,
    id: Option<String>,
    host_aware: bool,
    self_test: bool,
    disposable: bool,
    call_budget: Duration,
}

impl LuaPlugin {
    /// Execute the entry file and construct the instance named by `type_ref`
    ///
    /// `call_budget` bounds later `initialize` calls made through the trait.
    pub fn instantiate(
        boundary: Arc<IsolationBoundary>,
        entry_path: &Path,
        type_ref: &str,
        cancel: &CancellationToken,
        deadline: Instant,
        call_budget: Duration,
    ) -> Result<Self, LoadError> {
        let code = fs::read_to_string(entry_path).map_err(|e| LoadError::Entry(e.to_string()))?;
        let chunk_name = format!(
            "@{}",
            entry_path.file_name().map_or_else(
                || entry_path.display().to_string(),
                |name| name.to_string_lossy().to_string()
            )
        );

        let factory = boundary
            .run(cancel, Some(deadline), |lua| {
                let exports: Value = lua.load(code.as_str()).set_name(chunk_name.as_str()).call(())?;
                Ok(resolve_factory(lua, exports, type_ref))
            })
            .map_err(|e| stage_error(e, LoadError::Entry))??;

        let instance = boundary
            .run(cancel, Some(deadline), |_lua| match &factory {
                Factory::Function(function) => function.call::<Value>(()),
                Factory::Class { class, new } => new.call::<Value>(class.clone()),
            })
            .map_err(|e| stage_error(e, LoadError::Instantiation))?;

        let Value::Table(instance) = instance else {
            return Err(LoadError::Instantiation(format!(
                "factory '{}' did not return a table",
                type_ref
            )));
        };

        boundary
            .run(cancel, Some(deadline), |lua| {
                Self::from_instance(Arc::clone(&boundary), lua, instance, call_budget)
            })
            .map_err(|e| stage_error(e, LoadError::Instantiation))?
    }

    fn from_instance(
        boundary: Arc<IsolationBoundary>,
        lua: &Lua,
        instance: Table,
        call_budget: Duration,
    ) -> mlua::Result<Result<Self, LoadError>> {
        for capability in ["query", "execute"] {
            if !has_function(&instance, capability)? {
                return Ok(Err(LoadError::MissingCapability(capability)));
            }
        }

        let name = optional_string(&instance, "name")?.unwrap_or_default();
        if name.trim().is_empty() {
            return Ok(Err(LoadError::MissingCapability("name")));
        }

        let kind = optional_string(&instance, "kind")?
            .and_then(|kind| kind.parse().ok())
            .unwrap_or(PluginKind::Other);

        let plugin = Self {
            description: optional_string(&instance, "description")?.unwrap_or_default(),
            id: optional_string(&instance, "id")?
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            host_aware: has_function(&instance, "initialize")?,
            self_test: has_function(&instance, "self_test")?,
            disposable: has_function(&instance, "dispose")?,
            instance: lua.create_registry_value(instance)?,
            name,
            kind,
            boundary,
            call_budget,
        };

        Ok(Ok(plugin))
    }

    pub fn boundary(&self) -> &Arc<IsolationBoundary> {
        &self.boundary
    }

    /// Run the plugin's `initialize(self, host)` under explicit limits
    pub fn initialize_with(
        &self,
        host: &HostContext,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), PluginError> {
        if !self.host_aware {
            return Ok(());
        }

        self.call_method(cancel, Some(deadline), "initialize", |lua| {
            create_host_table(lua, host).map(Value::Table)
        })
        .map(|_| ())
    }

    /// Call `instance:method(arg)` inside the boundary
    fn call_method(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        method: &str,
        arg: impl FnOnce(&Lua) -> mlua::Result<Value>,
    ) -> Result<mlua::MultiValue, PluginError> {
        self.boundary.run(cancel, deadline, |lua| {
            let instance: Table = lua.registry_value(&self.instance)?;
            let function: Function = instance.get(method)?;
            let arg = arg(lua)?;
            function.call::<mlua::MultiValue>((instance, arg))
        })
    }

    /// Convert the value returned by `query` into results
    fn collect_results(&self, lua: &Lua, value: Value) -> mlua::Result<Vec<SearchResult>> {
        let Value::Table(list) = value else {
            if !value.is_nil() {
                log_warn!(
                    "Plugin '{}' returned {} from query; expected a list",
                    self.name,
                    value.type_name()
                );
            }
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        for (index, entry) in list.sequence_values::<Value>().enumerate() {
            let Value::Table(entry) = entry? else {
                log_warn!("Plugin '{}' result #{} is not a table, skipping", self.name, index + 1);
                continue;
            };

            let Some(title) = optional_string(&entry, "title")? else {
                log_warn!("Plugin '{}' result #{} has no title, skipping", self.name, index + 1);
                continue;
            };

            let score = match entry.get::<Value>("score")? {
                Value::Integer(i) => i as f64,
                Value::Number(n) => n,
                _ => 0.0,
            };

            let mut result = SearchResult::new(title, score);
            result.subtitle = optional_string(&entry, "subtitle")?;
            result.icon = optional_string(&entry, "icon")?;

            let payload: Value = entry.get("payload")?;
            if !payload.is_nil() {
                match lua.from_value::<serde_json::Value>(payload) {
                    Ok(json) => result.payload = Some(Payload::new(LuaPayload(json))),
                    Err(e) => log_warn!(
                        "Plugin '{}' result '{}' has an unsupported payload: {}",
                        self.name,
                        result.title,
                        e
                    ),
                }
            }

            results.push(result);
        }

        Ok(results)
    }

    /// Rebuild the Lua view of a result for `execute`
    fn result_table(lua: &Lua, result: &SearchResult) -> mlua::Result<Table> {
        let table = lua.create_table()?;
        table.set("title", result.title.as_str())?;
        table.set("subtitle", result.subtitle.as_deref())?;
        table.set("score", result.score)?;
        table.set("icon", result.icon.as_deref())?;
        table.set("plugin", result.owner_plugin_id.as_str())?;

        if let Some(payload) = result.payload.as_ref().and_then(|p| p.downcast_ref::<LuaPayload>()) {
            table.set("payload", lua.to_value(&payload.0)?)?;
        }

        Ok(table)
    }
}

impl Plugin for LuaPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn query(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<SearchResult>, PluginError> {
        self.boundary.run(cancel, None, |lua| {
            let instance: Table = lua.registry_value(&self.instance)?;
            let query: Function = instance.get("query")?;
            let value: Value = query.call((instance, text))?;
            self.collect_results(lua, value)
        })
    }

    fn execute(&self, result: &SearchResult, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.call_method(cancel, None, "execute", |lua| {
            Self::result_table(lua, result).map(Value::Table)
        })
        .map(|_| ())
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn is_host_aware(&self) -> bool {
        self.host_aware
    }

    fn initialize(&self, host: HostContext) -> Result<(), PluginError> {
        let cancel = CancellationToken::new();
        self.initialize_with(&host, &cancel, Instant::now() + self.call_budget)
    }

    fn supports_self_test(&self) -> bool {
        self.self_test
    }

    /// `self_test` passes unless it raises or returns `false` (optionally with a reason)
    fn self_test(&self, cancel: &CancellationToken) -> Result<(), PluginError> {
        if !self.self_test {
            return Ok(());
        }

        let returned = self.call_method(cancel, None, "self_test", |_| Ok(Value::Nil))?;
        let mut values = returned.into_iter();
        match values.next() {
            Some(Value::Boolean(false)) => {
                let reason = match values.next() {
                    Some(Value::String(s)) => s.to_string_lossy().to_string(),
                    _ => "self test returned false".to_string(),
                };
                Err(PluginError::Runtime(reason))
            }
            _ => Ok(()),
        }
    }

    fn dispose(&self) {
        if !self.disposable || self.boundary.is_torn_down() {
            return;
        }

        let cancel = CancellationToken::new();
        let budget = Duration::from_millis(DISPOSE_TIMEOUT_MS);
        let outcome = self.boundary.run_final(&cancel, budget, |lua| {
            let instance: Table = lua.registry_value(&self.instance)?;
            let dispose: Function = instance.get("dispose")?;
            dispose.call::<()>(instance)
        });
        if let Err(e) = outcome {
            log_warn!("Plugin '{}' failed to dispose cleanly: {}", self.name, e);
        }
    }
}

/// Walk `type_ref` through the exports (or globals when nothing was exported)
fn resolve_factory(lua: &Lua, exports: Value, type_ref: &str) -> Result<Factory, LoadError> {
    let not_found = |detail: &str| LoadError::SymbolNotFound(format!("{} ({})", type_ref, detail));

    let mut current = match exports {
        Value::Table(table) => table,
        Value::Nil => lua.globals(),
        other => return Err(not_found(&format!("entry returned {}", other.type_name()))),
    };

    let segments: Vec<&str> = type_ref.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(not_found("empty path segment"));
    }

    let (last, parents) = segments.split_last().ok_or_else(|| not_found("empty path"))?;
    for segment in parents {
        current = match current.get::<Value>(*segment) {
            Ok(Value::Table(table)) => table,
            _ => return Err(not_found(&format!("'{}' is not a table", segment))),
        };
    }

    match current.get::<Value>(*last) {
        Ok(Value::Function(function)) => Ok(Factory::Function(function)),
        Ok(Value::Table(class)) => match class.get::<Value>("new") {
            Ok(Value::Function(new)) => Ok(Factory::Class { class, new }),
            _ => Err(LoadError::NotAFactory(type_ref.to_string())),
        },
        Ok(Value::Nil) => Err(not_found("not exported")),
        Ok(_) => Err(LoadError::NotAFactory(type_ref.to_string())),
        Err(e) => Err(not_found(&e.to_string())),
    }
}

/// Map a boundary failure during loading onto the loading stage it happened in
fn stage_error(error: PluginError, stage: fn(String) -> LoadError) -> LoadError {
    match error {
        PluginError::Cancelled => LoadError::Cancelled,
        PluginError::TimedOut => LoadError::TimedOut,
        PluginError::Disposed => LoadError::Boundary("isolation boundary already torn down".to_string()),
        PluginError::Runtime(message) => stage(message),
    }
}

fn has_function(table: &Table, key: &str) -> mlua::Result<bool> {
    Ok(matches!(table.get::<Value>(key)?, Value::Function(_)))
}

fn optional_string(table: &Table, key: &str) -> mlua::Result<Option<String>> {
    Ok(match table.get::<Value>(key)? {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        _ => None,
    })
}
