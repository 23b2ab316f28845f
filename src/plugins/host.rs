//! Host context handed to host-aware plugins
//!
//! Each plugin gets its own context: its id and directory, a private data
//! directory it may write to, a logger scoped to it, and a few shell actions.

use crate::config::AppPaths;
use crate::{log_debug, log_error, log_info, log_warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Logger that tags every event with the owning plugin
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: Arc<str>,
}

impl PluginLogger {
    pub fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn debug(&self, message: &str) {
        log_debug!(plugin = %self.plugin_id, "[plugin] {}", message);
    }

    pub fn info(&self, message: &str) {
        log_info!(plugin = %self.plugin_id, "[plugin] {}", message);
    }

    pub fn warn(&self, message: &str) {
        log_warn!(plugin = %self.plugin_id, "[plugin] {}", message);
    }

    pub fn error(&self, message: &str) {
        log_error!(plugin = %self.plugin_id, "[plugin] {}", message);
    }
}

/// Side effects plugins may ask the host to perform
pub trait ShellLauncher: Send + Sync {
    /// Open a URL or path with the desktop's default handler
    fn open(&self, target: &str) -> std::io::Result<()>;

    /// Start a program directly, without a shell
    fn start_process(&self, program: &str, args: &[String]) -> std::io::Result<()>;
}

/// Launcher backed by the platform's opener
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

impl ShellLauncher for SystemShell {
    fn open(&self, target: &str) -> std::io::Result<()> {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", "start", ""]).arg(target);
            c
        } else if cfg!(target_os = "macos") {
            let mut c = Command::new("open");
            c.arg(target);
            c
        } else {
            let mut c = Command::new("xdg-open");
            c.arg(target);
            c
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        spawn_detached(&mut command).map(|_| ())
    }

    fn start_process(&self, program: &str, args: &[String]) -> std::io::Result<()> {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null());
        spawn_detached(&mut command).map(|_| ())
    }
}

/// Spawn `command` and reap it on a background thread once it exits
///
/// The reaper handle is `None` when its thread could not be started; the
/// child is running either way.
fn spawn_detached(command: &mut Command) -> std::io::Result<Option<JoinHandle<Option<ExitStatus>>>> {
    let mut child = command.spawn()?;
    let pid = child.id();

    let reaper = std::thread::Builder::new()
        .name(format!("reap-{}", pid))
        .spawn(move || match child.wait() {
            Ok(status) => {
                log_debug!("Child process {} exited with {}", pid, status);
                Some(status)
            }
            Err(e) => {
                log_warn!("Failed to wait for child process {}: {}", pid, e);
                None
            }
        });

    match reaper {
        Ok(handle) => Ok(Some(handle)),
        Err(e) => {
            log_warn!("Failed to start reaper for child process {}: {}", pid, e);
            Ok(None)
        }
    }
}

/// Per-plugin view of the host
#[derive(Clone)]
pub struct HostContext {
    plugin_id: String,
    plugin_directory: PathBuf,
    data_directory: PathBuf,
    logger: PluginLogger,
    shell: Arc<dyn ShellLauncher>,
}

impl HostContext {
    /// Build a context, creating the plugin's private data directory
    pub fn create(
        paths: &AppPaths,
        plugin_id: &str,
        plugin_directory: &Path,
        shell: Arc<dyn ShellLauncher>,
    ) -> std::io::Result<Self> {
        let data_directory = paths.plugin_data_dir(&safe_directory_name(plugin_id));
        fs::create_dir_all(&data_directory)?;

        Ok(Self {
            plugin_id: plugin_id.to_string(),
            plugin_directory: plugin_directory.to_path_buf(),
            data_directory,
            logger: PluginLogger::new(plugin_id),
            shell,
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_directory(&self) -> &Path {
        &self.plugin_directory
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn open_url(&self, url: &str) -> bool {
        self.open_target(url)
    }

    pub fn open_path(&self, path: &str) -> bool {
        self.open_target(path)
    }

    /// Start a program; failures are logged and reported as `false`
    pub fn try_start_process(&self, program: &str, args: &[String]) -> bool {
        if program.trim().is_empty() {
            return false;
        }

        match self.shell.start_process(program, args) {
            Ok(()) => true,
            Err(e) => {
                self.logger.error(&format!(
                    "Failed to start process {} {:?}: {}",
                    program, args, e
                ));
                false
            }
        }
    }

    fn open_target(&self, target: &str) -> bool {
        if target.trim().is_empty() {
            return false;
        }

        match self.shell.open(target) {
            Ok(()) => true,
            Err(e) => {
                self.logger.error(&format!("Failed to open {}: {}", target, e));
                false
            }
        }
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_directory", &self.plugin_directory)
            .field("data_directory", &self.data_directory)
            .finish_non_exhaustive()
    }
}

/// Directory name derived from a plugin id
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_`; blank ids and the special
/// names `.`/`..` map to `unknown`.
pub fn safe_directory_name(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() || value == "." || value == ".." {
        return "unknown".to_string();
    }

    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::RecordingShell;
    use tempfile::TempDir;

    #[test]
    fn test_safe_directory_name() {
        assert_eq!(safe_directory_name("sample.hello_world"), "sample.hello_world");
        assert_eq!(safe_directory_name("a/b\\c:d"), "a_b_c_d");
        assert_eq!(safe_directory_name("  "), "unknown");
        assert_eq!(safe_directory_name(".."), "unknown");
        assert_eq!(safe_directory_name("App Launcher"), "App_Launcher");
    }

    #[test]
    fn test_create_makes_data_directory() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::new(temp_dir.path().join("data"), temp_dir.path().join("install"));
        let shell = Arc::new(RecordingShell::default());

        let host = HostContext::create(&paths, "sample.hello", temp_dir.path(), shell).unwrap();
        assert!(host.data_directory().is_dir());
        assert_eq!(
            host.data_directory(),
            temp_dir.path().join("data").join("plugin-data").join("sample.hello")
        );
        assert_eq!(host.plugin_id(), "sample.hello");
        assert_eq!(host.logger().plugin_id(), "sample.hello");
    }

    #[test]
    fn test_shell_actions_go_through_launcher() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::new(temp_dir.path(), temp_dir.path());
        let shell = Arc::new(RecordingShell::default());
        let host = HostContext::create(&paths, "sample", temp_dir.path(), shell.clone()).unwrap();

        assert!(host.open_url("https://example.com"));
        assert!(!host.open_url("   "));
        assert!(host.try_start_process("notepad", &["a.txt".to_string()]));
        assert!(!host.try_start_process("", &[]));

        let calls = shell.calls();
        assert_eq!(calls, vec![
            "open https://example.com".to_string(),
            "start notepad a.txt".to_string(),
        ]);
    }

    #[cfg(unix)]
    #[test]
    fn test_spawned_children_are_reaped() {
        let mut command = Command::new("true");
        let reaper = spawn_detached(&mut command).unwrap().unwrap();
        let status = reaper.join().unwrap().unwrap();
        assert!(status.success());

        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);
        let status = spawn_detached(&mut command).unwrap().unwrap().join().unwrap().unwrap();
        assert_eq!(status.code(), Some(3));

        assert!(spawn_detached(&mut Command::new("/nonexistent/flashlaunch-binary")).is_err());
    }

    #[test]
    fn test_failed_process_start_reports_false() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::new(temp_dir.path(), temp_dir.path());
        let shell = Arc::new(RecordingShell::failing());
        let host = HostContext::create(&paths, "sample", temp_dir.path(), shell).unwrap();

        assert!(!host.try_start_process("missing", &[]));
        assert!(!host.open_path("/tmp"));
    }
}
