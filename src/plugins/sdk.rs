//! Host modules and tables exposed to Lua plugins
//!
//! - `flashlaunch`: api version, kind names and the host fuzzy scorer
//! - `flashlaunch.log`: logging scoped to the plugin
//! - The host table handed to `initialize(self, host)`

use crate::config::SUPPORTED_API_VERSION;
use crate::core::fuzzy;
use crate::plugins::api::PluginKind;
use crate::plugins::host::{HostContext, PluginLogger};
use mlua::{Lua, Table, Value, Variadic};

/// Register the host-shared modules in `loaded` and the logging globals
pub fn install_host_modules(lua: &Lua, loaded: &Table, logger: &PluginLogger) -> mlua::Result<()> {
    let log = create_log_module(lua, logger)?;

    let sdk = lua.create_table()?;
    sdk.set("api_version", SUPPORTED_API_VERSION)?;

    let kinds = lua.create_table()?;
    for kind in PluginKind::ALL {
        kinds.set(kind.as_str(), kind.as_str())?;
    }
    sdk.set("kind", kinds)?;

    sdk.set(
        "fuzzy_score",
        lua.create_function(|_, (candidate, query): (String, String)| {
            Ok(fuzzy::score(&candidate, &query))
        })?,
    )?;
    sdk.set("log", log.clone())?;

    loaded.set("flashlaunch", sdk)?;
    loaded.set("flashlaunch.log", log.clone())?;

    let globals = lua.globals();
    globals.set("log_info", log.get::<mlua::Function>("info")?)?;
    globals.set("log_warn", log.get::<mlua::Function>("warn")?)?;
    globals.set("log_error", log.get::<mlua::Function>("error")?)?;
    globals.set("log_debug", log.get::<mlua::Function>("debug")?)?;
    globals.set("print", log.get::<mlua::Function>("info")?)?;

    Ok(())
}

fn create_log_module(lua: &Lua, logger: &PluginLogger) -> mlua::Result<Table> {
    let log = lua.create_table()?;

    let l = logger.clone();
    log.set(
        "info",
        lua.create_function(move |_, args: Variadic<Value>| {
            l.info(&join_values(&args));
            Ok(())
        })?,
    )?;

    let l = logger.clone();
    log.set(
        "warn",
        lua.create_function(move |_, args: Variadic<Value>| {
            l.warn(&join_values(&args));
            Ok(())
        })?,
    )?;

    let l = logger.clone();
    log.set(
        "error",
        lua.create_function(move |_, args: Variadic<Value>| {
            l.error(&join_values(&args));
            Ok(())
        })?,
    )?;

    let l = logger.clone();
    log.set(
        "debug",
        lua.create_function(move |_, args: Variadic<Value>| {
            l.debug(&join_values(&args));
            Ok(())
        })?,
    )?;

    Ok(log)
}

/// Render log arguments the way `print` would
fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|value| match value {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.to_string_lossy().to_string(),
            other => other.type_name().to_string(),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

/// Table passed to a plugin's `initialize(self, host)`
pub fn create_host_table(lua: &Lua, host: &HostContext) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("plugin_id", host.plugin_id())?;
    table.set(
        "plugin_directory",
        host.plugin_directory().to_string_lossy().to_string(),
    )?;
    table.set(
        "data_directory",
        host.data_directory().to_string_lossy().to_string(),
    )?;

    let h = host.clone();
    table.set(
        "open_url",
        lua.create_function(move |_, url: String| Ok(h.open_url(&url)))?,
    )?;

    let h = host.clone();
    table.set(
        "open_path",
        lua.create_function(move |_, path: String| Ok(h.open_path(&path)))?,
    )?;

    let h = host.clone();
    table.set(
        "try_start_process",
        lua.create_function(move |_, (program, args): (String, Value)| {
            let args = process_arguments(args)?;
            Ok(h.try_start_process(&program, &args))
        })?,
    )?;

    let log: Table = lua
        .named_registry_value::<Table>(crate::plugins::sandbox::LOADED_MODULES_KEY)?
        .get("flashlaunch.log")?;
    table.set("log", log)?;

    Ok(table)
}

/// Accept either a list of arguments or a single whitespace-separated string
fn process_arguments(value: Value) -> mlua::Result<Vec<String>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::String(s) => Ok(s
            .to_str()?
            .split_whitespace()
            .map(str::to_string)
            .collect()),
        Value::Table(t) => t.sequence_values::<String>().collect(),
        other => Err(mlua::Error::runtime(format!(
            "process arguments must be a string or a list, got {}",
            other.type_name()
        ))),
    }
}
