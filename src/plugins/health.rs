//! Out-of-band plugin health check
//!
//! Every external candidate is loaded into a throwaway boundary, asked for
//! `query("")`, given its self-test if it has one, then retired. Nothing
//! loaded here ever reaches the live catalog.
//!
//! A check that outlives its timeout (or the caller's cancellation) by the
//! drain grace period is abandoned and reported as interrupted. Its blocking
//! task keeps running until the boundary's interrupt, which stays raised for
//! the rest of the call, unwinds the plugin; the task then retires its own
//! record.

use crate::config::HEALTH_CHECK_DRAIN_GRACE_MS;
use crate::plugins::api::Plugin;
use crate::plugins::error::{LoadError, PluginError, PluginLoadError};
use crate::plugins::loader::{Candidate, PluginLoader};
use crate::{log_info, log_warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome for one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub id: String,
    pub directory: PathBuf,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthCheckSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<HealthCheckResult>,
}

impl HealthCheckSummary {
    fn push(&mut self, result: HealthCheckResult) {
        self.total += 1;
        if result.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthCheckError {
    #[error("health check was cancelled")]
    Cancelled,
}

/// Why one check failed, before it is rendered into a message
enum Failure {
    Load(PluginLoadError),
    Plugin(PluginError),
    Interrupted,
}

pub struct HealthCheckRunner {
    loader: Arc<PluginLoader>,
}

impl HealthCheckRunner {
    pub fn new(loader: Arc<PluginLoader>) -> Self {
        Self { loader }
    }

    /// Check every external candidate, each bounded by `per_plugin_timeout`
    ///
    /// Cancelling `cancel` marks the running check "cancelled" and stops the
    /// run before the next candidate.
    pub async fn run(
        &self,
        per_plugin_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HealthCheckSummary, HealthCheckError> {
        let loader = Arc::clone(&self.loader);
        let candidates = tokio::task::spawn_blocking(move || loader.discover())
            .await
            .unwrap_or_default();

        log_info!(
            "Running health check on {} plugin candidate(s), timeout {} ms",
            candidates.len(),
            per_plugin_timeout.as_millis()
        );

        let mut summary = HealthCheckSummary::default();
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(HealthCheckError::Cancelled);
            }

            let result = self.check_candidate(candidate, per_plugin_timeout, cancel).await;
            if result.passed {
                log_info!("Health check passed: {} ({:?})", result.id, result.directory);
            } else {
                log_warn!(
                    "Health check failed: {} ({:?}): {}",
                    result.id,
                    result.directory,
                    result.error.as_deref().unwrap_or_default()
                );
            }
            summary.push(result);
        }

        log_info!(
            "Health check finished: {} total, {} passed, {} failed",
            summary.total,
            summary.passed,
            summary.failed
        );

        Ok(summary)
    }

    async fn check_candidate(
        &self,
        candidate: Candidate,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HealthCheckResult {
        let token = cancel.child_token();
        let deadline = Instant::now() + timeout;
        let fallback_id = directory_name(&candidate);
        let directory = candidate.directory.clone();

        let mut handle = {
            let loader = Arc::clone(&self.loader);
            let token = token.clone();
            tokio::task::spawn_blocking(move || check_blocking(&loader, &candidate, &token, deadline))
        };

        let grace = Duration::from_millis(HEALTH_CHECK_DRAIN_GRACE_MS);
        let outcome = tokio::select! {
            biased;
            joined = &mut handle => Some(joined),
            _ = cancel.cancelled() => tokio::time::timeout(grace, &mut handle).await.ok(),
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                tokio::time::timeout(grace, &mut handle).await.ok()
            }
        };
        if outcome.is_none() {
            log_warn!(
                "Health check of {:?} did not stop within {} ms of being interrupted; abandoning it",
                directory,
                grace.as_millis()
            );
        }

        let (id, result) = match outcome {
            Some(Ok((id, result))) => (id.unwrap_or(fallback_id), result),
            Some(Err(join_error)) => (fallback_id, Err(Failure::Plugin(PluginError::runtime(format!(
                "health check panicked: {}",
                join_error
            ))))),
            None => (fallback_id, Err(Failure::Plugin(PluginError::TimedOut))),
        };

        let error = result.err().map(|failure| describe(failure, cancel, timeout));
        HealthCheckResult {
            id,
            directory,
            passed: error.is_none(),
            error,
        }
    }
}

/// Load, exercise and retire one candidate on the blocking pool
fn check_blocking(
    loader: &PluginLoader,
    candidate: &Candidate,
    cancel: &CancellationToken,
    deadline: Instant,
) -> (Option<String>, Result<(), Failure>) {
    let record = match loader.load_candidate(candidate, cancel, deadline) {
        Ok(record) => record,
        Err(failure) => return (failure.id, Err(Failure::Load(failure.error))),
    };

    let outcome = exercise(record.instance.as_ref(), cancel);
    record.retire();

    let outcome = match outcome {
        Err(PluginError::Cancelled) | Err(PluginError::TimedOut) => Err(Failure::Interrupted),
        Err(e) => Err(Failure::Plugin(e)),
        Ok(()) => Ok(()),
    };
    (Some(record.id.clone()), outcome)
}

fn exercise(plugin: &dyn Plugin, cancel: &CancellationToken) -> Result<(), PluginError> {
    plugin.query("", cancel)?;
    if plugin.supports_self_test() {
        plugin.self_test(cancel)?;
    }
    Ok(())
}

fn describe(failure: Failure, cancel: &CancellationToken, timeout: Duration) -> String {
    let interrupted = || {
        if cancel.is_cancelled() {
            "cancelled".to_string()
        } else {
            format!("timed out after {} ms", timeout.as_millis())
        }
    };

    match failure {
        Failure::Interrupted
        | Failure::Plugin(PluginError::Cancelled | PluginError::TimedOut)
        | Failure::Load(PluginLoadError::Load(LoadError::Cancelled | LoadError::TimedOut)) => {
            interrupted()
        }
        Failure::Load(error) => error.to_string(),
        Failure::Plugin(error) => error.to_string(),
    }
}

fn directory_name(candidate: &Candidate) -> String {
    candidate
        .directory
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| candidate.directory.display().to_string())
}
