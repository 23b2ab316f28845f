// FlashLaunch Core - Query Processor
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Query dispatch and ranking
//!
//! One dispatch sends the query to every enabled plugin of the current
//! generation at once, each call on the blocking pool. A plugin that fails,
//! panics or gets cancelled on its own contributes nothing; only the caller's
//! cancellation ends the dispatch early. The merged list is ordered by
//! descending score with a stable sort, so equal scores keep plugin order and
//! then emission order.

use crate::config::{ConfigStore, PluginStateProvider};
use crate::core::stats::{StatsState, record_cancelled, record_dispatch};
use crate::core::telemetry::DispatchTelemetry;
use crate::plugins::api::SearchResult;
use crate::plugins::error::PluginError;
use crate::plugins::registry::{PluginCatalog, PluginGeneration, PluginRecord};
use crate::{log_debug, log_error, log_warn};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch was cancelled")]
    Cancelled,
    #[error("plugin catalog unavailable: {0}")]
    Catalog(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error("plugin '{0}' that produced this result is no longer available")]
    OwnerUnavailable(String),
    #[error("plugin '{plugin}' failed to execute the result: {error}")]
    Plugin { plugin: String, error: PluginError },
    #[error("execution was cancelled")]
    Cancelled,
}

/// Clamp into `[0, 1]`; non-finite scores become 0
pub fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub struct QueryDispatcher {
    catalog: Arc<PluginCatalog>,
    config: Arc<ConfigStore>,
    stats: StatsState,
}

impl QueryDispatcher {
    pub fn new(catalog: Arc<PluginCatalog>, config: Arc<ConfigStore>, stats: StatsState) -> Self {
        Self {
            catalog,
            config,
            stats,
        }
    }

    pub fn stats(&self) -> &StatsState {
        &self.stats
    }

    /// Current generation, fetched off the async workers since it may run discovery
    pub async fn current_generation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<PluginGeneration>, DispatchError> {
        let catalog = Arc::clone(&self.catalog);
        let building = tokio::task::spawn_blocking(move || catalog.get_plugins());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            joined = building => joined.map_err(|e| DispatchError::Catalog(e.to_string())),
        }
    }

    /// Ranked results of every enabled plugin for `query`
    pub async fn dispatch(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, DispatchError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            record_cancelled(&self.stats).await;
            return Err(DispatchError::Cancelled);
        }

        let started = Instant::now();
        let generation = match self.current_generation(cancel).await {
            Ok(generation) => generation,
            Err(DispatchError::Cancelled) => {
                record_cancelled(&self.stats).await;
                return Err(DispatchError::Cancelled);
            }
            Err(e) => return Err(e),
        };

        let state = self.config.snapshot();
        let active: Vec<&Arc<PluginRecord>> = generation
            .records()
            .iter()
            .filter(|record| state.is_enabled(record.key(), Some(record.instance.name())))
            .collect();

        let text: Arc<str> = Arc::from(query);
        let calls = active.iter().map(|record| {
            let plugin = Arc::clone(&record.instance);
            let text = Arc::clone(&text);
            let token = cancel.child_token();
            tokio::task::spawn_blocking(move || plugin.query(&text, &token))
        });
        let calls: Vec<_> = calls.collect();

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log_debug!("Dispatch for {:?} cancelled by caller", query);
                record_cancelled(&self.stats).await;
                return Err(DispatchError::Cancelled);
            }
            outcomes = futures::future::join_all(calls) => outcomes,
        };

        let mut results = Vec::new();
        let mut failed_plugins = Vec::new();
        for (record, outcome) in active.iter().zip(outcomes) {
            let key = record.key();
            match outcome {
                Ok(Ok(batch)) => {
                    results.extend(batch.into_iter().map(|mut result| {
                        result.owner_plugin_id = key.to_string();
                        result.score = clamp_score(result.score);
                        result
                    }));
                }
                Ok(Err(PluginError::Cancelled)) if cancel.is_cancelled() => {
                    record_cancelled(&self.stats).await;
                    return Err(DispatchError::Cancelled);
                }
                Ok(Err(PluginError::Disposed)) => {
                    log_debug!("Plugin '{}' was retired during dispatch, skipping", key);
                }
                Ok(Err(e)) => {
                    log_error!(plugin = key, "Plugin '{}' failed to answer query: {}", key, e);
                    failed_plugins.push(key.to_string());
                }
                Err(join_error) => {
                    log_error!(plugin = key, "Plugin '{}' crashed while answering query: {}", key, join_error);
                    failed_plugins.push(key.to_string());
                }
            }
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score));

        let telemetry = DispatchTelemetry::new(query, started.elapsed(), active.len())
            .with_results(results.len())
            .with_failures(failed_plugins);
        telemetry.emit();
        record_dispatch(&self.stats, &telemetry).await;

        Ok(results)
    }

    /// Hand a result back to the plugin that produced it
    pub async fn execute(
        &self,
        result: &SearchResult,
        cancel: &CancellationToken,
    ) -> Result<(), ExecuteError> {
        let generation = self.current_generation(cancel).await.map_err(|e| match e {
            DispatchError::Cancelled => ExecuteError::Cancelled,
            DispatchError::Catalog(_) => ExecuteError::OwnerUnavailable(result.owner_plugin_id.clone()),
        })?;

        let owner = &result.owner_plugin_id;
        let Some(record) = generation.find(owner) else {
            log_warn!("No active plugin '{}' to execute result '{}'", owner, result.title);
            return Err(ExecuteError::OwnerUnavailable(owner.clone()));
        };

        let plugin = Arc::clone(&record.instance);
        let result = result.clone();
        let token = cancel.child_token();
        let call = tokio::task::spawn_blocking(move || plugin.execute(&result, &token));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecuteError::Cancelled),
            outcome = call => outcome,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(PluginError::Cancelled)) if cancel.is_cancelled() => Err(ExecuteError::Cancelled),
            Ok(Err(PluginError::Disposed)) => Err(ExecuteError::OwnerUnavailable(owner.clone())),
            Ok(Err(error)) => Err(ExecuteError::Plugin {
                plugin: owner.clone(),
                error,
            }),
            Err(join_error) => Err(ExecuteError::Plugin {
                plugin: owner.clone(),
                error: PluginError::runtime(join_error.to_string()),
            }),
        }
    }
}
