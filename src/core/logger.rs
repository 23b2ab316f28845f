// FlashLaunch Core - Systemd-Style Logger
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Systemd-style logging on top of `tracing`
//!
//! The crate logs through the `log_*!` macros below, which forward to the
//! `tracing` facade. [`init`] installs a `tracing-subscriber` fmt backend that
//! follows systemd/journald conventions:
//! - Clean, readable output on stderr
//! - Colors only when stderr is a terminal
//! - Journald mode drops timestamps and colors (journald adds its own)
//!
//! The `[   OK   ]` / `[  FAILED ]` status helpers are used by the CLI when
//! bringing services up.

use tracing::Level;

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub min_level: Level,
    /// Whether to use colors in output
    pub use_colors: bool,
    /// Whether to include timestamps
    pub include_timestamp: bool,
    /// Whether to include target/module information
    pub include_target: bool,
    /// Whether to format for journald
    pub journald_format: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: Level::INFO,
            use_colors: atty::is(atty::Stream::Stderr),
            include_timestamp: true,
            include_target: false,
            journald_format: false,
        }
    }
}

/// Logger initialization errors
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Logger already initialized")]
    AlreadyInitialized,
}

/// Install the global subscriber
pub fn init(config: LoggerConfig) -> Result<(), LoggerError> {
    let use_colors = config.use_colors && !config.journald_format;
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.min_level)
        .with_ansi(use_colors)
        .with_target(config.include_target)
        .with_writer(std::io::stderr);

    // The timer is part of the subscriber type, so each branch installs its own
    let result = if config.include_timestamp && !config.journald_format {
        tracing::subscriber::set_global_default(builder.finish())
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())
    };

    result.map_err(|_| LoggerError::AlreadyInitialized)
}

/// Initialize logger from CLI arguments
pub fn init_from_args(debug: bool, trace: bool, journald: bool) -> Result<(), LoggerError> {
    let min_level = if trace {
        Level::TRACE
    } else if debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    init(LoggerConfig {
        min_level,
        use_colors: atty::is(atty::Stream::Stderr) && !journald,
        include_timestamp: !journald,
        include_target: trace,
        journald_format: journald,
    })
}

/// Convenience macros for logging
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        ::tracing::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        ::tracing::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        ::tracing::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        ::tracing::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        ::tracing::trace!($($arg)*)
    };
}

/// Systemd-style initialization message with loading indicator
pub fn log_init_start(service_name: &str) {
    tracing::info!("[*] Starting {}...", service_name);
}

/// Systemd-style success message with details
pub fn log_init_ok_with_details(service_name: &str, details: &str) {
    tracing::info!("[   OK   ] Starting {} ({})", service_name, details);
}

/// Systemd-style failure message with FAILED status
pub fn log_init_failed(service_name: &str, error: &str) {
    tracing::error!("[  FAILED ] Starting {} - {}", service_name, error);
}

/// Systemd-style warning message with WARN status
pub fn log_init_warn(service_name: &str, warning: &str) {
    tracing::warn!("[   WARN ] Starting {} - {}", service_name, warning);
}
