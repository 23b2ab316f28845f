//! Isolation boundary for external plugins
//!
//! Every extension runs in its own Lua state. The state:
//! - Has dangerous libraries removed (os, io, load, debug, package, ...)
//! - Resolves `require` from the extension's own directory only
//! - Always serves host-shared modules (`flashlaunch`, `flashlaunch.log`)
//!   from the host, never from extension files
//! - Refuses host runtime-only libraries
//! - Carries a memory limit and an interrupt hook that aborts Lua code once
//!   the current call is cancelled or past its deadline. The interrupt is
//!   sticky: `pcall`, `xpcall`, `coroutine.resume` and `coroutine.close`
//!   re-raise it, so plugin code cannot swallow it
//!
//! [`IsolationBoundary::teardown`] drops the host's handle to the state and
//! checks whether it was actually reclaimed.

use crate::config::{LUA_INTERRUPT_INTERVAL, LUA_MEMORY_LIMIT};
use crate::plugins::error::{LoadError, PluginError};
use crate::plugins::host::PluginLogger;
use crate::plugins::sdk::install_host_modules;
use crate::{log_debug, log_trace};
use mlua::{Function, HookTriggers, Lua, MultiValue, Table, Value, VmState};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Modules always resolved to the host's single copy
pub const HOST_SHARED_MODULES: &[&str] = &["flashlaunch", "flashlaunch.log"];

/// Host runtime-only libraries plugins may not reach
pub const DENIED_MODULES: &[&str] = &["os", "io", "debug", "package", "ffi", "jit", "lfs", "socket"];

/// Standard libraries that stay available and may also be `require`d
const STANDARD_LIBRARIES: &[&str] = &["string", "table", "math", "utf8", "coroutine"];

/// Registry slot holding the per-state module cache
pub(crate) const LOADED_MODULES_KEY: &str = "flashlaunch.loaded";

static MODULE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("module segment pattern is valid"));

static NEXT_BOUNDARY: AtomicU64 = AtomicU64::new(1);

/// Why the interrupt hook stopped Lua code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Cancelled,
    DeadlineExceeded,
}

impl InterruptReason {
    fn message(self) -> &'static str {
        match self {
            InterruptReason::Cancelled => "plugin call interrupted: cancelled",
            InterruptReason::DeadlineExceeded => "plugin call interrupted: deadline exceeded",
        }
    }
}

/// Interrupt conditions of the call currently running in a state
#[derive(Debug, Default)]
struct InterruptState {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    reason: Option<InterruptReason>,
}

impl InterruptState {
    fn check(&mut self) -> Option<InterruptReason> {
        if self.reason.is_none() {
            if self.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                self.reason = Some(InterruptReason::Cancelled);
            } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.reason = Some(InterruptReason::DeadlineExceeded);
            }
        }
        self.reason
    }
}

/// How a call is let past a closing boundary
enum Admission {
    Open(Option<Instant>),
    Final(Duration),
}

/// Result of tearing a boundary down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The Lua state was released
    Reclaimed,
    /// Something (normally an in-flight call) still holds the state
    StillReferenced,
    AlreadyTornDown,
}

/// One extension's private execution context
pub struct IsolationBoundary {
    id: u64,
    plugin_id: String,
    root: PathBuf,
    state: Mutex<Option<Arc<Lua>>>,
    /// Serializes calls into the state
    calls: Mutex<()>,
    /// Set once the owner is being retired; only the final call is admitted
    closing: AtomicBool,
    interrupt: Arc<Mutex<InterruptState>>,
}

impl IsolationBoundary {
    /// Create a fresh sandboxed state rooted at the extension directory
    ///
    /// `root` should already be canonical; private modules are confined to it.
    pub fn create(plugin_id: &str, root: &Path, logger: PluginLogger) -> Result<Self, LoadError> {
        let interrupt = Arc::new(Mutex::new(InterruptState::default()));
        let lua = create_secure_lua_state(root, &logger, Arc::clone(&interrupt))
            .map_err(|e| LoadError::Boundary(e.to_string()))?;

        let id = NEXT_BOUNDARY.fetch_add(1, Ordering::Relaxed);
        log_trace!("Created isolation boundary #{} for '{}' at {:?}", id, plugin_id, root);

        Ok(Self {
            id,
            plugin_id: plugin_id.to_string(),
            root: root.to_path_buf(),
            state: Mutex::new(Some(Arc::new(lua))),
            calls: Mutex::new(()),
            closing: AtomicBool::new(false),
            interrupt,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.state).is_none()
    }

    /// Whether [`IsolationBoundary::begin_close`] was called
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Refuse every later call except [`IsolationBoundary::run_final`]
    ///
    /// A call already running is left to finish.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Whether a call currently holds the state
    pub fn is_busy(&self) -> bool {
        matches!(self.calls.try_lock(), Err(TryLockError::WouldBlock))
    }

    /// Run `call` inside the state under the given interrupt conditions
    ///
    /// Lua errors caused by the interrupt hook are reported as
    /// [`PluginError::Cancelled`] or [`PluginError::TimedOut`]. Once the
    /// boundary is closing this returns [`PluginError::Disposed`].
    pub fn run<R>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        call: impl FnOnce(&Lua) -> mlua::Result<R>,
    ) -> Result<R, PluginError> {
        self.run_call(Admission::Open(deadline), cancel, call)
    }

    /// Like [`IsolationBoundary::run`], but still admitted while closing
    ///
    /// Used for the owner's last call (`dispose`) before teardown. `budget`
    /// starts once the call is admitted, after any running call returns.
    pub fn run_final<R>(
        &self,
        cancel: &CancellationToken,
        budget: Duration,
        call: impl FnOnce(&Lua) -> mlua::Result<R>,
    ) -> Result<R, PluginError> {
        self.run_call(Admission::Final(budget), cancel, call)
    }

    fn run_call<R>(
        &self,
        admission: Admission,
        cancel: &CancellationToken,
        call: impl FnOnce(&Lua) -> mlua::Result<R>,
    ) -> Result<R, PluginError> {
        let final_call = matches!(admission, Admission::Final(_));
        // Checked before queueing behind a running call and again once admitted
        if !final_call && self.is_closing() {
            return Err(PluginError::Disposed);
        }
        let _serial = lock(&self.calls);
        if !final_call && self.is_closing() {
            return Err(PluginError::Disposed);
        }

        let deadline = match admission {
            Admission::Open(deadline) => deadline,
            Admission::Final(budget) => Some(Instant::now() + budget),
        };

        // Holding our own handle keeps the state alive through teardown
        let lua = lock(&self.state).clone().ok_or(PluginError::Disposed)?;

        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(PluginError::TimedOut);
        }

        self.arm(cancel.clone(), deadline);
        let outcome = call(&lua);
        let reason = self.disarm();

        outcome.map_err(|e| match reason {
            Some(InterruptReason::Cancelled) => PluginError::Cancelled,
            Some(InterruptReason::DeadlineExceeded) => PluginError::TimedOut,
            None => PluginError::Runtime(e.to_string()),
        })
    }

    /// Release the state; idempotent
    ///
    /// Never blocks on in-flight calls. When one is still running the state is
    /// reclaimed as soon as it returns, which is logged but not an error.
    pub fn teardown(&self) -> TeardownOutcome {
        let Some(lua) = lock(&self.state).take() else {
            return TeardownOutcome::AlreadyTornDown;
        };

        let weak: Weak<Lua> = Arc::downgrade(&lua);
        drop(lua);

        if weak.strong_count() == 0 {
            log_debug!(
                "Isolation boundary #{} for '{}' torn down and reclaimed",
                self.id, self.plugin_id
            );
            TeardownOutcome::Reclaimed
        } else {
            log_debug!(
                "Isolation boundary #{} for '{}' torn down but still referenced by {} in-flight call(s)",
                self.id,
                self.plugin_id,
                weak.strong_count()
            );
            TeardownOutcome::StillReferenced
        }
    }

    /// Handle used to verify reclamation from the outside
    pub fn weak_state(&self) -> Option<Weak<Lua>> {
        lock(&self.state).as_ref().map(Arc::downgrade)
    }

    fn arm(&self, token: CancellationToken, deadline: Option<Instant>) {
        let mut state = lock(&self.interrupt);
        state.token = Some(token);
        state.deadline = deadline;
        state.reason = None;
    }

    fn disarm(&self) -> Option<InterruptReason> {
        let mut state = lock(&self.interrupt);
        state.token = None;
        state.deadline = None;
        state.reason.take()
    }
}

impl std::fmt::Debug for IsolationBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationBoundary")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("root", &self.root)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build the sandboxed Lua state for one extension
fn create_secure_lua_state(
    root: &Path,
    logger: &PluginLogger,
    interrupt: Arc<Mutex<InterruptState>>,
) -> mlua::Result<Lua> {
    let lua = Lua::new();

    // Remove dangerous libraries and loaders
    let globals = lua.globals();
    for name in ["os", "io", "debug", "package", "load", "loadfile", "dofile", "collectgarbage"] {
        globals.set(name, Value::Nil)?;
    }

    lua.set_memory_limit(LUA_MEMORY_LIMIT)?;

    // Global so coroutines created by plugin code inherit it
    let hook_state = Arc::clone(&interrupt);
    lua.set_global_hook(
        HookTriggers::new().every_nth_instruction(LUA_INTERRUPT_INTERVAL),
        move |_lua, _debug| {
            let mut state = lock(&hook_state);
            match state.check() {
                Some(reason) => Err(mlua::Error::runtime(reason.message())),
                None => Ok(VmState::Continue),
            }
        },
    )?;
    guard_protected_calls(&lua, interrupt)?;

    let loaded = lua.create_table()?;
    install_host_modules(&lua, &loaded, logger)?;
    lua.set_named_registry_value(LOADED_MODULES_KEY, loaded)?;

    let root = root.to_path_buf();
    let require = lua.create_function(move |lua, name: String| require_module(lua, &root, &name))?;
    globals.set("require", require)?;

    Ok(lua)
}

/// Make protected calls re-raise a pending interrupt instead of returning it
///
/// The wrappers stay in Lua so yielding across `pcall` keeps working.
fn guard_protected_calls(lua: &Lua, interrupt: Arc<Mutex<InterruptState>>) -> mlua::Result<()> {
    let check = lua.create_function(move |_, returned: MultiValue| {
        match lock(&interrupt).reason {
            Some(reason) => Err(mlua::Error::runtime(reason.message())),
            None => Ok(returned),
        }
    })?;

    let install: Function = lua
        .load(
            r#"
local check = ...
local pcall, xpcall = pcall, xpcall
local resume, close = coroutine.resume, coroutine.close
_G.pcall = function(...) return check(pcall(...)) end
_G.xpcall = function(...) return check(xpcall(...)) end
coroutine.resume = function(...) return check(resume(...)) end
coroutine.close = function(...) return check(close(...)) end
"#,
        )
        .set_name("=flashlaunch.interrupt")
        .into_function()?;
    install.call::<()>(check)
}

/// How `require` treats a module name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleClass {
    HostShared,
    Denied,
    Standard,
    Private,
}

pub fn classify_module(name: &str) -> ModuleClass {
    if name == "flashlaunch" || name.starts_with("flashlaunch.") {
        ModuleClass::HostShared
    } else if DENIED_MODULES.contains(&name) {
        ModuleClass::Denied
    } else if STANDARD_LIBRARIES.contains(&name) {
        ModuleClass::Standard
    } else {
        ModuleClass::Private
    }
}

fn require_module(lua: &Lua, root: &Path, name: &str) -> mlua::Result<Value> {
    let name = name.trim();
    let loaded: Table = lua.named_registry_value(LOADED_MODULES_KEY)?;

    match classify_module(name) {
        ModuleClass::HostShared => {
            let module: Value = loaded.get(name)?;
            if module.is_nil() {
                return Err(mlua::Error::runtime(format!("unknown host module '{}'", name)));
            }
            Ok(module)
        }
        ModuleClass::Denied => Err(mlua::Error::runtime(format!(
            "module '{}' is not available to plugins",
            name
        ))),
        ModuleClass::Standard => lua.globals().get(name),
        ModuleClass::Private => {
            let cached: Value = loaded.get(name)?;
            if !cached.is_nil() {
                return Ok(cached);
            }

            let path = resolve_private_module(root, name).map_err(mlua::Error::runtime)?;
            let code = fs::read_to_string(&path).map_err(mlua::Error::external)?;
            let chunk_name = format!(
                "@{}",
                path.strip_prefix(root).unwrap_or(&path).display()
            );

            let value: Value = lua.load(code).set_name(chunk_name).call(name)?;
            let value = if value.is_nil() { Value::Boolean(true) } else { value };
            loaded.set(name, value.clone())?;
            Ok(value)
        }
    }
}

/// Map `a.b` to `<root>/a/b.lua` or `<root>/a/b/init.lua`, confined to `root`
pub fn resolve_private_module(root: &Path, name: &str) -> Result<PathBuf, String> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.iter().any(|segment| !MODULE_SEGMENT.is_match(segment)) {
        return Err(format!("invalid module name '{}'", name));
    }

    let mut base = root.to_path_buf();
    for segment in &segments[..segments.len() - 1] {
        base.push(segment);
    }
    let last = segments[segments.len() - 1];

    let candidates = [
        base.join(format!("{}.lua", last)),
        base.join(last).join("init.lua"),
    ];

    let path = candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| format!("module '{}' not found in plugin directory", name))?;

    let canonical = path
        .canonicalize()
        .map_err(|e| format!("failed to resolve module '{}': {}", name, e))?;
    if !canonical.starts_with(root) {
        return Err(format!("module '{}' resolves outside the plugin directory", name));
    }

    Ok(canonical)
}

/// Files an extension may not ship because they would shadow host modules
pub fn bundled_shared_module(directory: &Path) -> Option<&'static str> {
    HOST_SHARED_MODULES.iter().copied().find(|module| {
        let relative: PathBuf = module.split('.').collect();
        directory.join(relative.with_extension("lua")).exists()
            || directory.join(&relative).join("init.lua").exists()
    })
}
