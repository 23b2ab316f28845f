// FlashLaunch Core - Telemetry Module
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Diagnostic data emitted after every dispatch
//!
//! Purely observational: nothing here feeds back into ranking.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::log_debug;

/// Telemetry data structure for one dispatch round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTelemetry {
    /// Length of the query text in characters
    pub query_len: usize,
    pub elapsed_ms: u64,
    /// Enabled plugins the query was sent to
    pub plugin_count: usize,
    pub result_count: usize,
    /// Keys of plugins whose call failed
    pub failed_plugins: Vec<String>,
}

impl DispatchTelemetry {
    pub fn new(query: &str, elapsed: Duration, plugin_count: usize) -> Self {
        Self {
            query_len: query.chars().count(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            plugin_count,
            result_count: 0,
            failed_plugins: Vec::new(),
        }
    }

    pub fn with_results(mut self, result_count: usize) -> Self {
        self.result_count = result_count;
        self
    }

    pub fn with_failures(mut self, failed_plugins: Vec<String>) -> Self {
        self.failed_plugins = failed_plugins;
        self
    }

    /// Log the telemetry at debug level
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => log_debug!("Dispatch telemetry: {}", json),
            Err(e) => log_debug!("Failed to serialize dispatch telemetry: {}", e),
        }
    }
}
