// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{
    DEFAULT_CAPABILITY_TIMEOUT, DEFAULT_HOST_COMMAND, DEFAULT_MANAGER_COMMAND,
    DEFAULT_POLL_INTERVAL, DEFAULT_PORT, DEFAULT_READY_TIMEOUT, DEFAULT_RESET_COMMAND,
    DEFAULT_STOP_GRACE,
};

/// Installs, verifies and removes each custom node of the catalog, one at a time.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host (ComfyUI) installation directory
    #[arg(long, default_value = "~/ComfyUI")]
    pub host_dir: String,

    /// Port the host listens on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Full base URL of the host; overrides --port
    #[arg(long)]
    pub base_url: Option<String>,

    /// JSON catalog file (array of {"id": "..."}) replacing the built-in one
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Test only these units, in the given order; may be repeated
    #[arg(short, long)]
    pub unit: Vec<String>,

    /// Seconds to wait for the host to report ready
    #[arg(long, default_value_t = DEFAULT_READY_TIMEOUT.as_secs())]
    pub ready_timeout_secs: u64,

    /// Milliseconds between liveness probes
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub poll_interval_ms: u64,

    /// Seconds allowed for the object_info request
    #[arg(long, default_value_t = DEFAULT_CAPABILITY_TIMEOUT.as_secs())]
    pub capability_timeout_secs: u64,

    /// Seconds to wait after SIGTERM before the host is killed
    #[arg(long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
    pub stop_grace_secs: u64,

    /// Command that resynchronizes the host's dependency environment
    #[arg(long, default_value = DEFAULT_RESET_COMMAND)]
    pub reset_command: String,

    /// Plugin manager command; `install <id>` / `uninstall <id>` are appended
    #[arg(long, default_value = DEFAULT_MANAGER_COMMAND)]
    pub manager_command: String,

    /// Command that starts the host server
    #[arg(long, default_value = DEFAULT_HOST_COMMAND)]
    pub host_command: String,

    /// Extra environment variable for every external command (KEY=VALUE); may be repeated
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Directory the JSON report is written to
    #[arg(long, default_value = ".")]
    pub report_dir: PathBuf,

    /// Directory the running log file is written to
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,

    /// End the whole batch when a unit's environment reset fails
    #[arg(long)]
    pub stop_on_reset_failure: bool,

    /// Store the full object_info response in each unit's result
    #[arg(long)]
    pub keep_raw_object_info: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(level)
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}
