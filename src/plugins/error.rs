//! Error taxonomy for the plugin runtime
//!
//! Nothing here ever escapes to crash the host: loader errors reject one
//! candidate, runtime errors drop one plugin's results for one query.

use std::path::PathBuf;

/// Manifest parse or validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Read(String),
    #[error("manifest JSON is invalid: {0}")]
    Parse(String),
    #[error("unsupported apiVersion={found} (host supports {supported})")]
    UnsupportedApiVersion { found: i64, supported: i64 },
    #[error("missing '{0}'")]
    MissingField(&'static str),
    #[error("invalid plugin id '{0}'. Allowed chars: [A-Za-z0-9._-], at most 100")]
    InvalidId(String),
    #[error("'assembly' must be a file name (no directories): {0}")]
    EntryNotBareFileName(String),
    #[error("'assembly' must point to a .{expected} file: {entry}")]
    EntryExtension { entry: String, expected: &'static str },
    #[error("generic types are not supported in manifest 'type': {0}")]
    GenericType(String),
}

/// Rejections that protect the host from a hostile or confused extension
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("plugin entry {entry:?} resolved outside plugin directory {directory:?}")]
    PathEscape { entry: PathBuf, directory: PathBuf },
    #[error("plugin identity mismatch: manifest declares '{manifest}', plugin reports '{declared}'")]
    IdentityMismatch { manifest: String, declared: String },
    #[error("extension bundles host-shared module '{0}'")]
    SharedModuleBundled(String),
}

/// Module resolution and instantiation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("plugin entry not found: {0:?}")]
    EntryNotFound(PathBuf),
    #[error("failed to create isolation boundary: {0}")]
    Boundary(String),
    #[error("failed to execute entry module: {0}")]
    Entry(String),
    #[error("exported symbol '{0}' not found in entry module")]
    SymbolNotFound(String),
    #[error("exported symbol '{0}' is not a factory")]
    NotAFactory(String),
    #[error("failed to create plugin instance: {0}")]
    Instantiation(String),
    #[error("plugin instance does not implement '{0}'")]
    MissingCapability(&'static str),
    #[error("plugin initialization failed: {0}")]
    Initialization(String),
    #[error("failed to create plugin data directory: {0}")]
    DataDirectory(String),
    #[error("loading exceeded its time budget")]
    TimedOut,
    #[error("loading was cancelled")]
    Cancelled,
}

/// One rejected discovery candidate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginLoadError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("plugin id '{0}' is already registered")]
    DuplicateId(String),
}

impl PluginLoadError {
    /// Security rejections are logged at warning level by the loader
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// Failure of one call into a plugin
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("{0}")]
    Runtime(String),
    #[error("call was cancelled")]
    Cancelled,
    #[error("call exceeded its deadline")]
    TimedOut,
    #[error("plugin has been disposed")]
    Disposed,
}

impl PluginError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}
