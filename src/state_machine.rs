// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Per-unit test sequence.
//!
//! Each unit goes through
//! `Reset -> Install -> HostStart -> ReadyWait -> CapabilityCheck -> Uninstall -> Done`.
//! Step failures are recorded in the [`UnitResult`] and decide the final
//! outcome; an error escaping a step moves the unit to `Aborted` and ends it
//! with `UNEXPECTED_ERROR`. The host is stopped before the unit leaves the
//! hosted steps, whatever happened inside them.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, info, warn};
use serde_json::json;

use crate::command_runner::{CommandOutput, CommandRunner};
use crate::config::{CommandSpec, HarnessConfig, Unit};
use crate::host_api::HostApi;
use crate::probe::{self, CapabilitySnapshot};
use crate::report::{FinalOutcome, Step, StepJournal, StepOutcome, UnitResult};
use crate::supervisor::{HostHandle, HostSupervisor, Readiness, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Reset,
    Install,
    HostStart,
    ReadyWait,
    CapabilityCheck,
    Uninstall,
    Done,
    Aborted,
}

/// What the capability check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// The request or its decoding failed.
    Errored,
    NotFound,
    Found,
}

/// Mutable record of a unit while it runs; frozen into a [`UnitResult`].
struct UnitRun<'a> {
    unit: &'a Unit,
    created_at: DateTime<Utc>,
    state: UnitState,
    journal: StepJournal,
}

impl<'a> UnitRun<'a> {
    fn new(unit: &'a Unit, journal: StepJournal) -> Self {
        Self {
            unit,
            created_at: Utc::now(),
            state: UnitState::Reset,
            journal,
        }
    }

    fn record(&self, step: Step, outcome: StepOutcome) {
        self.journal.record(step, outcome);
    }

    fn enter(&mut self, state: UnitState) {
        debug!("[{}] {:?} -> {:?}", self.unit, self.state, state);
        self.state = state;
    }

    fn finish(self, final_outcome: FinalOutcome, error_message: Option<String>) -> UnitResult {
        UnitResult {
            unit: self.unit.id.clone(),
            timestamp: self
                .created_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            steps: self.journal.snapshot(),
            final_outcome,
            error_message,
        }
    }
}

pub struct UnitTestStateMachine {
    config: Arc<HarnessConfig>,
    runner: Arc<dyn CommandRunner>,
    api: Arc<dyn HostApi>,
    supervisor: HostSupervisor,
}

impl UnitTestStateMachine {
    pub fn new(
        config: Arc<HarnessConfig>,
        runner: Arc<dyn CommandRunner>,
        api: Arc<dyn HostApi>,
    ) -> Self {
        let supervisor = HostSupervisor::new(config.poll_interval, config.stop_grace);
        Self {
            config,
            runner,
            api,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &HostSupervisor {
        &self.supervisor
    }

    /// Runs every step for `unit` and returns its finished result. Each step
    /// is written to `journal` as soon as it executes.
    pub async fn run(&self, unit: &Unit, journal: StepJournal) -> UnitResult {
        let mut run = UnitRun::new(unit, journal);

        match self.drive(&mut run).await {
            Ok(outcome) => {
                run.enter(UnitState::Done);
                run.finish(outcome, None)
            }
            Err(e) => {
                error!("[{unit}] aborted during {:?}: {e:#}", run.state);
                let message = format!("aborted during {:?}: {e:#}", run.state);
                run.enter(UnitState::Aborted);
                run.finish(FinalOutcome::UnexpectedError, Some(message))
            }
        }
    }

    async fn drive(&self, run: &mut UnitRun<'_>) -> Result<FinalOutcome> {
        let unit = run.unit;

        run.enter(UnitState::Reset);
        let reset = self
            .run_command(&self.config.reset_command)
            .await
            .context("environment reset command could not be run")?;
        let lines: Vec<&str> = reset.stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        let payload = json!({"exit_code": reset.exit_code, "lines": lines});
        if !reset.success() {
            warn!("[{unit}] environment reset failed with code {}", reset.exit_code);
            run.record(Step::Reset, StepOutcome::failed_with(failure_message(&reset), payload));
            return Ok(FinalOutcome::FailedReset);
        }
        run.record(Step::Reset, StepOutcome::ok_with(payload));

        run.enter(UnitState::Install);
        let install = self
            .run_command(&self.config.install_command(unit))
            .await
            .context("install command could not be run")?;
        let installed = install.success();
        run.record(Step::Install, log_outcome(&install));
        if !installed {
            warn!("[{unit}] install failed with code {}", install.exit_code);
            return Ok(FinalOutcome::FailedInstallNode);
        }
        info!("[{unit}] installed");

        run.enter(UnitState::HostStart);
        let mut host = match self
            .supervisor
            .start(&self.config.host_command, &self.config.host_dir)
        {
            Ok(host) => host,
            Err(e @ SupervisorError::Spawn { .. }) => {
                warn!("[{unit}] {e}");
                run.record(Step::HostStart, StepOutcome::failed(e.to_string()));
                return Ok(FinalOutcome::FailedStartComfy);
            }
            Err(e) => return Err(e.into()),
        };
        run.record(Step::HostStart, StepOutcome::ok_with(json!({"pid": host.pid()})));

        let verdict = self.while_hosted(run, &mut host).await;
        self.supervisor
            .stop(&mut host)
            .await
            .context("host could not be stopped")?;

        let Some(verdict) = verdict else {
            return Ok(FinalOutcome::FailedStartComfy);
        };

        run.enter(UnitState::Uninstall);
        let uninstall = self
            .run_command(&self.config.uninstall_command(unit))
            .await
            .context("uninstall command could not be run")?;
        if uninstall.success() {
            info!("[{unit}] uninstalled");
        } else {
            warn!("[{unit}] uninstall failed with code {}", uninstall.exit_code);
        }
        run.record(Step::Uninstall, log_outcome(&uninstall));

        Ok(match verdict {
            Verdict::Errored => FinalOutcome::FailedObjectInfoCheck,
            Verdict::NotFound => FinalOutcome::FailedNodeNotFound,
            Verdict::Found => FinalOutcome::Passed,
        })
    }

    /// Steps that need the host up. `None` means it never became ready.
    async fn while_hosted(
        &self,
        run: &mut UnitRun<'_>,
        host: &mut HostHandle,
    ) -> Option<Verdict> {
        let unit = run.unit;

        run.enter(UnitState::ReadyWait);
        let timeout = self.config.ready_timeout;
        let readiness = self
            .supervisor
            .await_ready(host, self.api.as_ref(), timeout)
            .await;
        match readiness {
            Readiness::Ready(elapsed) => {
                run.record(
                    Step::ReadinessCheck,
                    StepOutcome::ok_with(json!({"elapsed_ms": elapsed.as_millis() as u64})),
                );
            }
            Readiness::TimedOut(elapsed) => {
                run.record(
                    Step::ReadinessCheck,
                    StepOutcome::failed_with(
                        format!(
                            "Server failed to start within {} seconds",
                            timeout.as_secs_f64()
                        ),
                        json!({"elapsed_ms": elapsed.as_millis() as u64}),
                    ),
                );
                return None;
            }
            Readiness::Exited(code) => {
                run.record(
                    Step::ReadinessCheck,
                    StepOutcome::failed(format!(
                        "Server exited with code {code} before becoming ready"
                    )),
                );
                return None;
            }
        }

        run.enter(UnitState::CapabilityCheck);
        let (outcome, verdict) = self.check_capabilities(unit).await;
        run.record(Step::CapabilityCheck, outcome);
        Some(verdict)
    }

    async fn check_capabilities(&self, unit: &Unit) -> (StepOutcome, Verdict) {
        let object_info = match self.api.object_info().await {
            Ok(value) => value,
            Err(e) => {
                warn!("[{unit}] object_info request failed: {e}");
                return (StepOutcome::failed(e.to_string()), Verdict::Errored);
            }
        };
        let snapshot = match CapabilitySnapshot::from_value(&object_info) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("[{unit}] {e}");
                return (StepOutcome::failed(e.to_string()), Verdict::Errored);
            }
        };

        if snapshot.is_empty() {
            warn!("[{unit}] object_info returned no nodes at all");
        }
        let probe = probe::check(&unit.id, &snapshot);
        debug!("[{unit}] {} nodes registered, {}", snapshot.len(), probe.detail);
        let mut payload = json!({
            "found": probe.found,
            "details": probe.detail,
            "matches": probe.matches,
        });
        if self.config.keep_raw_object_info {
            payload["raw_object_info"] = object_info;
        }

        let verdict = if probe.found {
            info!("[{unit}] found {} node(s) in object_info", probe.matches.len());
            Verdict::Found
        } else {
            warn!("[{unit}] no nodes found in object_info");
            Verdict::NotFound
        };
        (StepOutcome::ok_with(payload), verdict)
    }

    async fn run_command(&self, command: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.runner.run(command, Some(&self.config.host_dir)).await
    }
}

/// Install/uninstall outcome carrying the full command log.
fn log_outcome(output: &CommandOutput) -> StepOutcome {
    let payload = json!({"exit_code": output.exit_code, "log": output.combined_log()});
    if output.success() {
        StepOutcome::ok_with(payload)
    } else {
        StepOutcome::failed_with(failure_message(output), payload)
    }
}

fn failure_message(output: &CommandOutput) -> String {
    if output.stderr.trim().is_empty() {
        format!("exited with code {}", output.exit_code)
    } else {
        output.stderr.clone()
    }
}
