//! Extension manifest parsing and validation
//!
//! A manifest is a `plugin.json` file next to the extension's code:
//!
//! ```json
//! { "apiVersion": 1, "id": "sample.hello_world", "assembly": "main.lua", "type": "HelloWorld" }
//! ```
//!
//! Property names are matched case-insensitively. Validation is pure: it
//! trims string fields and returns a typed error instead of failing loudly.

use crate::config::{ENTRY_EXTENSION, MAX_PLUGIN_ID_LENGTH, SUPPORTED_API_VERSION};
use crate::plugins::error::ManifestError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;

static PLUGIN_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^[A-Za-z0-9._-]{{1,{}}}$", MAX_PLUGIN_ID_LENGTH))
        .expect("plugin id pattern is valid")
});

/// Validated, immutable manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    pub api_version: i64,
    pub id: String,
    /// Bare file name of the entry module
    pub entry_ref: String,
    /// Exported factory symbol inside the entry module
    pub type_ref: String,
}

/// Manifest as written on disk, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawManifest {
    #[serde(rename = "apiversion")]
    pub api_version: Option<i64>,
    pub id: Option<String>,
    #[serde(alias = "entry")]
    pub assembly: Option<String>,
    #[serde(rename = "type")]
    pub type_ref: Option<String>,
}

impl RawManifest {
    /// Parse manifest JSON with case-insensitive property names
    pub fn parse(json: &str) -> Result<Self, ManifestError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ManifestError::Parse(e.to_string()))?;

        let serde_json::Value::Object(object) = value else {
            return Err(ManifestError::Parse("manifest must be a JSON object".to_string()));
        };

        let normalized: serde_json::Map<String, serde_json::Value> = object
            .into_iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();

        serde_json::from_value(serde_json::Value::Object(normalized))
            .map_err(|e| ManifestError::Parse(e.to_string()))
    }

    /// Best-effort id for reporting, even when validation fails
    pub fn display_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn validate(self) -> Result<PluginManifest, ManifestError> {
        let api_version = self.api_version.unwrap_or(SUPPORTED_API_VERSION);
        if api_version != SUPPORTED_API_VERSION {
            return Err(ManifestError::UnsupportedApiVersion {
                found: api_version,
                supported: SUPPORTED_API_VERSION,
            });
        }

        let id = required(self.id, "id")?;
        if !is_valid_plugin_id(&id) {
            return Err(ManifestError::InvalidId(id));
        }

        let entry_ref = required(self.assembly, "assembly")?;
        if !is_bare_file_name(&entry_ref) {
            return Err(ManifestError::EntryNotBareFileName(entry_ref));
        }
        let has_extension = Path::new(&entry_ref)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(ENTRY_EXTENSION));
        if !has_extension {
            return Err(ManifestError::EntryExtension {
                entry: entry_ref,
                expected: ENTRY_EXTENSION,
            });
        }

        let type_ref = required(self.type_ref, "type")?;
        if is_generic_symbol(&type_ref) {
            return Err(ManifestError::GenericType(type_ref));
        }

        Ok(PluginManifest {
            api_version,
            id,
            entry_ref,
            type_ref,
        })
    }
}

impl PluginManifest {
    /// Read, parse and validate a manifest file
    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        read_raw(path)?.validate()
    }
}

/// Read and parse a manifest file without validating it
pub fn read_raw(path: &Path) -> Result<RawManifest, ManifestError> {
    let content = fs::read_to_string(path).map_err(|e| ManifestError::Read(e.to_string()))?;
    RawManifest::parse(&content)
}

pub fn is_valid_plugin_id(id: &str) -> bool {
    PLUGIN_ID_PATTERN.is_match(id)
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ManifestError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ManifestError::MissingField(field))
}

/// A file name that does not encode any path component
fn is_bare_file_name(value: &str) -> bool {
    if value == "." || value == ".." {
        return false;
    }
    if value.contains(['/', '\\', ':']) {
        return false;
    }
    Path::new(value).file_name().is_some_and(|name| name == value)
}

/// Parameterized symbols such as `Plugin<T>` or CLR-style `Plugin`1`
fn is_generic_symbol(value: &str) -> bool {
    value.contains(['`', '<', '>', '[', ']'])
}
