//! Plugin capability contract
//!
//! This module defines what every plugin, built-in or external, must provide:
//! - `query(text)` returning scored results
//! - `execute(result)` acting on one of its own results
//!
//! Optional capabilities are trait methods with inert defaults:
//! - Identity: `id()`
//! - HostAware: `is_host_aware()` + `initialize(host)`
//! - SelfTest: `supports_self_test()` + `self_test()`

use crate::plugins::error::PluginError;
use crate::plugins::host::HostContext;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Broad category a plugin belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    Application,
    Calculator,
    Web,
    System,
    Utility,
    Other,
}

impl PluginKind {
    pub const ALL: [PluginKind; 6] = [
        PluginKind::Application,
        PluginKind::Calculator,
        PluginKind::Web,
        PluginKind::System,
        PluginKind::Utility,
        PluginKind::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PluginKind::Application => "Application",
            PluginKind::Calculator => "Calculator",
            PluginKind::Web => "Web",
            PluginKind::System => "System",
            PluginKind::Utility => "Utility",
            PluginKind::Other => "Other",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginKind {
    type Err = String;

    /// Case-insensitive
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        PluginKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown plugin kind: {}", value))
    }
}

/// Plugin-private result payload
///
/// Only the producing plugin knows the concrete type; everyone else treats it
/// as opaque.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

/// One ranked entry produced by a plugin for one query
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub subtitle: Option<String>,
    /// Relevance in `[0, 1]`
    pub score: f64,
    pub icon: Option<String>,
    pub payload: Option<Payload>,
    /// Key of the plugin that produced the result, stamped by the dispatcher
    pub owner_plugin_id: String,
}

impl SearchResult {
    pub fn new(title: impl Into<String>, score: f64) -> Self {
        Self {
            title: title.into(),
            subtitle: None,
            score,
            icon: None,
            payload: None,
            owner_plugin_id: String::new(),
        }
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serializable view without the opaque payload
    pub fn view(&self) -> SearchResultView {
        SearchResultView {
            title: self.title.clone(),
            subtitle: self.subtitle.clone(),
            score: self.score,
            icon: self.icon.clone(),
            plugin: self.owner_plugin_id.clone(),
        }
    }
}

/// What the presentation layer gets to see of a result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResultView {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub plugin: String,
}

/// Plugin API trait that all plugins must implement
///
/// Calls are blocking; the dispatcher runs them on the blocking pool and
/// plugins handle their own internal synchronization.
pub trait Plugin: Send + Sync {
    /// Display name
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn kind(&self) -> PluginKind;

    /// Produce results for a query
    fn query(&self, text: &str, cancel: &CancellationToken)
    -> Result<Vec<SearchResult>, PluginError>;

    /// Act on one of this plugin's results
    fn execute(&self, result: &SearchResult, cancel: &CancellationToken)
    -> Result<(), PluginError>;

    /// Stable identity, if the plugin declares one
    fn id(&self) -> Option<&str> {
        None
    }

    /// Whether the plugin wants a [`HostContext`] before first use
    fn is_host_aware(&self) -> bool {
        false
    }

    fn initialize(&self, _host: HostContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Whether [`Plugin::self_test`] does anything
    fn supports_self_test(&self) -> bool {
        false
    }

    /// Bounded self-check run by the health check
    fn self_test(&self, _cancel: &CancellationToken) -> Result<(), PluginError> {
        Ok(())
    }

    /// Release plugin resources; called at most once by the catalog
    fn dispose(&self) {}
}

/// Key used for enable state, ownership and duplicate detection
///
/// The declared identity when it is non-blank, otherwise the display name.
pub fn plugin_key(plugin: &dyn Plugin) -> &str {
    match plugin.id() {
        Some(id) if !id.trim().is_empty() => id.trim(),
        _ => plugin.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::StaticPlugin;

    #[test]
    fn test_kind_parse_case_insensitive() {
        assert_eq!("web".parse::<PluginKind>().unwrap(), PluginKind::Web);
        assert_eq!(" CALCULATOR ".parse::<PluginKind>().unwrap(), PluginKind::Calculator);
        assert!("browser".parse::<PluginKind>().is_err());
    }

    #[test]
    fn test_plugin_key_prefers_identity() {
        let plugin = StaticPlugin::new("Hello World", vec![]).with_id("sample.hello");
        assert_eq!(plugin_key(&plugin), "sample.hello");

        let plugin = StaticPlugin::new("Hello World", vec![]).with_id("   ");
        assert_eq!(plugin_key(&plugin), "Hello World");

        let plugin = StaticPlugin::new("Hello World", vec![]);
        assert_eq!(plugin_key(&plugin), "Hello World");
    }

    #[test]
    fn test_payload_downcast() {
        let result = SearchResult::new("x", 0.5).with_payload(Payload::new(42u32));
        let payload = result.payload.as_ref().unwrap();
        assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
        assert!(payload.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_view_serializes_without_payload() {
        let mut result = SearchResult::new("Terminal", 0.9)
            .with_subtitle("Open a shell")
            .with_payload(Payload::new("secret".to_string()));
        result.owner_plugin_id = "builtin.apps".to_string();

        let json = serde_json::to_value(result.view()).unwrap();
        assert_eq!(json["title"], "Terminal");
        assert_eq!(json["plugin"], "builtin.apps");
        assert!(json.get("payload").is_none());
        assert!(json.get("icon").is_none());
    }
}
