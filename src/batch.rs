// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Runs the whole catalog, one unit after another.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};

use crate::command_runner::CommandRunner;
use crate::config::{HarnessConfig, ResetFailurePolicy, Unit};
use crate::host_api::HostApi;
use crate::report::{BatchReport, FinalOutcome, ReportError, StepJournal, UnitResult};
use crate::state_machine::UnitTestStateMachine;
use crate::supervisor::HostSupervisor;

/// Error types that end a run without a report.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("ComfyUI directory not found at {}", .0.display())]
    HostDirMissing(PathBuf),

    #[error("failed to create report directory {}: {source}", .path.display())]
    ReportDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Report(#[from] ReportError),
}

pub struct BatchRunner {
    config: Arc<HarnessConfig>,
    machine: Arc<UnitTestStateMachine>,
}

impl BatchRunner {
    pub fn new(
        config: HarnessConfig,
        runner: Arc<dyn CommandRunner>,
        api: Arc<dyn HostApi>,
    ) -> Self {
        let config = Arc::new(config);
        let machine = UnitTestStateMachine::new(Arc::clone(&config), runner, api);
        Self {
            config,
            machine: Arc::new(machine),
        }
    }

    pub fn supervisor(&self) -> &HostSupervisor {
        self.machine.supervisor()
    }

    /// Checks the host directory, tests the catalog and writes the report
    /// file, returning its path. A missing host directory fails before any
    /// unit runs, and no report is written.
    pub async fn run_and_report(
        &self,
        run_started: DateTime<Utc>,
    ) -> Result<PathBuf, BatchError> {
        if !self.config.host_dir.is_dir() {
            return Err(BatchError::HostDirMissing(self.config.host_dir.clone()));
        }
        let report_dir = &self.config.report_dir;
        std::fs::create_dir_all(report_dir).map_err(|source| BatchError::ReportDir {
            path: report_dir.clone(),
            source,
        })?;

        let report = self.run().await;
        Ok(report.write_to(report_dir, run_started)?)
    }

    /// Tests every unit in catalog order. A failing unit never stops the
    /// batch, except a reset failure under [`ResetFailurePolicy::StopBatch`].
    pub async fn run(&self) -> BatchReport {
        let mut report = BatchReport::default();
        let total = self.config.catalog.len();

        for (idx, unit) in self.config.catalog.iter().enumerate() {
            info!("========================================");
            info!("[{}/{}] Testing {}", idx + 1, total, unit);

            let result = self.run_isolated(unit).await;
            info!(
                "[{}/{}] {} -> {}",
                idx + 1,
                total,
                unit,
                result.final_outcome.as_str()
            );

            let stop = result.final_outcome == FinalOutcome::FailedReset
                && self.config.reset_failure_policy == ResetFailurePolicy::StopBatch;
            report.push(result);
            if stop {
                error!("Environment reset failed for {unit}, stopping the batch");
                break;
            }
        }

        info!("========================================");
        for line in report.summary().lines() {
            info!("{line}");
        }
        report
    }

    /// Runs one unit in its own task so a panic only ends that unit.
    async fn run_isolated(&self, unit: &Unit) -> UnitResult {
        let machine = Arc::clone(&self.machine);
        let task_unit = unit.clone();
        let journal = StepJournal::default();
        let task_journal = journal.clone();
        let started = Utc::now();

        match tokio::spawn(async move { machine.run(&task_unit, task_journal).await }).await {
            Ok(result) => result,
            Err(e) => {
                let message = if e.is_panic() {
                    format!("panicked: {}", panic_message(e.into_panic()))
                } else {
                    e.to_string()
                };
                error!("[{unit}] {message}");
                UnitResult::unexpected(unit, started, journal.snapshot(), message)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
