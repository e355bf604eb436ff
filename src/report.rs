// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Result types and the persisted JSON report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Unit;

/// Error types for writing the report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write report {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// The recorded result of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            payload: None,
        }
    }

    pub fn ok_with(payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::ok()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            payload: None,
        }
    }

    pub fn failed_with(message: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::failed(message)
        }
    }
}

/// One slot per step; `None` means the step never ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Steps {
    pub reset: Option<StepOutcome>,
    pub install: Option<StepOutcome>,
    pub host_start: Option<StepOutcome>,
    pub readiness_check: Option<StepOutcome>,
    pub capability_check: Option<StepOutcome>,
    pub uninstall: Option<StepOutcome>,
}

/// Names one slot of [`Steps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Reset,
    Install,
    HostStart,
    ReadinessCheck,
    CapabilityCheck,
    Uninstall,
}

impl Steps {
    fn slot(&mut self, step: Step) -> &mut Option<StepOutcome> {
        match step {
            Step::Reset => &mut self.reset,
            Step::Install => &mut self.install,
            Step::HostStart => &mut self.host_start,
            Step::ReadinessCheck => &mut self.readiness_check,
            Step::CapabilityCheck => &mut self.capability_check,
            Step::Uninstall => &mut self.uninstall,
        }
    }
}

/// Steps recorded so far for one unit. Clones share the same record, so the
/// batch can still read it after the task running the unit panicked.
#[derive(Debug, Clone, Default)]
pub struct StepJournal(Arc<Mutex<Steps>>);

impl StepJournal {
    /// Stores the outcome of a step that just executed.
    pub fn record(&self, step: Step, outcome: StepOutcome) {
        let mut steps = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *steps.slot(step) = Some(outcome);
    }

    pub fn snapshot(&self) -> Steps {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalOutcome {
    Passed,
    FailedReset,
    FailedInstallNode,
    FailedStartComfy,
    FailedObjectInfoCheck,
    FailedNodeNotFound,
    UnexpectedError,
}

impl FinalOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, FinalOutcome::Passed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinalOutcome::Passed => "PASSED",
            FinalOutcome::FailedReset => "FAILED_RESET",
            FinalOutcome::FailedInstallNode => "FAILED_INSTALL_NODE",
            FinalOutcome::FailedStartComfy => "FAILED_START_COMFY",
            FinalOutcome::FailedObjectInfoCheck => "FAILED_OBJECT_INFO_CHECK",
            FinalOutcome::FailedNodeNotFound => "FAILED_NODE_NOT_FOUND",
            FinalOutcome::UnexpectedError => "UNEXPECTED_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit: String,
    pub timestamp: String,
    pub steps: Steps,
    pub final_outcome: FinalOutcome,
    /// Error that ended the unit with `UNEXPECTED_ERROR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl UnitResult {
    /// A result for a unit whose run was cut short; `steps` holds whatever
    /// executed before that.
    pub fn unexpected(
        unit: &Unit,
        created_at: DateTime<Utc>,
        steps: Steps,
        message: impl Into<String>,
    ) -> Self {
        Self {
            unit: unit.id.clone(),
            timestamp: created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            steps,
            final_outcome: FinalOutcome::UnexpectedError,
            error_message: Some(message.into()),
        }
    }
}

/// Results in catalog order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub results: Vec<UnitResult>,
}

impl BatchReport {
    pub fn push(&mut self, result: UnitResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.final_outcome.is_pass())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.passed()
    }

    /// Multi-line human readable summary for the running log.
    pub fn summary(&self) -> String {
        let mut failures: BTreeMap<FinalOutcome, Vec<&str>> = BTreeMap::new();
        for result in self.results.iter().filter(|r| !r.final_outcome.is_pass()) {
            failures
                .entry(result.final_outcome)
                .or_default()
                .push(&result.unit);
        }

        let mut summary = format!(
            "Tested {} units: {} passed, {} failed",
            self.len(),
            self.passed(),
            self.failed()
        );
        for (outcome, units) in failures {
            summary.push_str(&format!("\n  {}: {}", outcome.as_str(), units.join(", ")));
        }
        summary
    }

    /// Report file name for a run started at `run_started`.
    pub fn file_name(run_started: DateTime<Utc>) -> String {
        format!(
            "comfyui_test_results_{}.json",
            run_started.format("%Y%m%d_%H%M%S")
        )
    }

    /// Writes the results as a pretty-printed JSON array and returns the path.
    pub fn write_to(&self, dir: &Path, run_started: DateTime<Utc>) -> Result<PathBuf, ReportError> {
        let path = dir.join(Self::file_name(run_started));
        let json = serde_json::to_string_pretty(&self.results)?;
        fs::write(&path, json).map_err(|source| ReportError::Write {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }
}
