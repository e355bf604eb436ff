// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

mod args;
mod batch;
mod command_runner;
mod config;
mod host_api;
mod logging;
mod probe;
mod report;
mod state_machine;
mod supervisor;

/// System Configuration
mod sysconfig;

#[cfg(test)]
mod tests;

// TODO Re-enable Windows support once the host can be stopped without process groups
#[cfg(not(unix))]
compile_error!("Currently, only Unix hosts are supported.");

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;

#[allow(unused)]
use log::{debug, error, info, warn};

use args::Args;
use batch::{BatchError, BatchRunner};
use command_runner::ProcessRunner;
use config::HarnessConfig;
use host_api::ComfyApi;

/// Runs the batch: logging setup, precondition check, every unit, then the report.
///
/// # Arguments
///
/// This entry point takes no arguments beyond the implicit command-line parsing performed by `clap`.
///
/// # Returns
///
/// Returns `Ok(())` once the report is written, whatever the individual units
/// concluded. A missing host directory ends the process with exit code 1 and
/// no report.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let run_started = Utc::now();

    let log_path = logging::init(args.loglevel, &args.log_dir, run_started)?;

    // Display application information
    let app_info = sysconfig::sysconfig().app_info();
    for line in app_info.lines() {
        info!("{line}");
    }
    info!("Running log: {}", log_path.display());

    let config = HarnessConfig::from_args(&args)?;
    info!("Host directory: {}", config.host_dir.display());
    info!("Host URL: {}", config.base_url);
    info!("Units to test: {}", config.catalog.len());
    debug!("Configuration: {config:?}");

    let api = ComfyApi::new(&config)?;
    let runner = BatchRunner::new(config, Arc::new(ProcessRunner), Arc::new(api));

    let path = match runner.run_and_report(run_started).await {
        Ok(path) => path,
        Err(e @ BatchError::HostDirMissing(_)) => {
            error!("Error: {e}");
            error!("Please pass the correct location with --host-dir");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(pid) = runner.supervisor().live_host() {
        warn!("Host (pid {pid}) is still registered after the batch");
    }
    info!("Test results saved to {}", path.display());

    Ok(())
}
