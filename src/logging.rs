// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Running log: the same lines go to the console and to a timestamped file.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::args::LogLevel;

pub fn log_file_name(run_started: DateTime<Utc>) -> String {
    format!("node_harness_{}.log", run_started.format("%Y%m%d_%H%M%S"))
}

/// Installs the global subscriber and returns the log file path.
///
/// `log` records are bridged into tracing, so `log::info!` and friends end up
/// in both sinks.
pub fn init(level: LogLevel, log_dir: &Path, run_started: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let path = log_dir.join(log_file_name(run_started));
    let file = File::create(&path)
        .with_context(|| format!("Failed to create log file: {}", path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level.to_string()))
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_name() {
        let started = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 1).unwrap();
        assert_eq!(log_file_name(started), "node_harness_20251231_235901.log");
    }
}
