//! Extension runtime for third-party launcher plugins
//!
//! Extensions are Lua packages discovered in the plugin roots. Each one is
//! validated, loaded into its own isolation boundary and wrapped so the rest
//! of the host only ever sees the [`api::Plugin`] trait.
//!
//! # Package Structure
//!
//! Each extension is a directory containing:
//! - `plugin.json` - Manifest (id, name, assembly, type, apiVersion)
//! - the entry `.lua` file named by `assembly`
//! - optionally further private modules loaded with `require`
//!
//! # Isolation
//!
//! Every extension gets:
//! - A separate Lua state with `os`, `io`, `debug` and `package` removed
//! - `require` confined to its own directory plus the host SDK modules
//! - A memory limit and an instruction hook for cancellation and deadlines
//! - A per-plugin data directory handed over through the host context

pub mod api;
pub mod error;
pub mod health;
pub mod host;
pub mod loader;
pub mod lua_plugin;
pub mod manifest;
pub mod registry;
pub mod sandbox;
pub mod sdk;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{Payload, Plugin, PluginKind, SearchResult};
pub use error::{LoadError, ManifestError, PluginError, PluginLoadError, SecurityError};
pub use loader::PluginLoader;
pub use registry::{PluginCatalog, PluginGeneration, PluginRecord};
