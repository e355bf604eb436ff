// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! External command execution.
//!
//! A non-zero exit code is a normal [`CommandOutput`], not an error. Only a
//! failure to launch or observe the process is reported as `Err`.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::config::CommandSpec;

/// Exit code and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, as stored in install/uninstall logs.
    pub fn combined_log(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion, optionally inside `cwd`.
    ///
    /// The command's environment overlay is merged on top of the caller's
    /// environment.
    async fn run(&self, command: &CommandSpec, cwd: Option<&Path>)
    -> std::io::Result<CommandOutput>;
}

/// Runs commands as child processes of the harness.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: Option<&Path>,
    ) -> std::io::Result<CommandOutput> {
        info!("Running command: {}", command.display());

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await?;
        let result = CommandOutput {
            exit_code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            "Command `{}` exited with code {}",
            command.display(),
            result.exit_code
        );
        Ok(result)
    }
}

/// Maps an exit status to a code; a signal-terminated process reports
/// `128 + signal` like a POSIX shell.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}
