// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Host process supervision.
//!
//! The host runs as a child process in its own process group so that the
//! interpreter it spawns is signalled together with it. At most one host is
//! live per [`HostSupervisor`]; the [`HostHandle`] owns it until
//! [`HostHandle::stop`] has terminated and reaped it. A handle dropped while
//! still live (for example during a panic) kills the whole group.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::command_runner::exit_code;
use crate::config::CommandSpec;
use crate::host_api::HostApi;

/// Error types for host supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch host `{command}`: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("a host process is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("failed to stop host (pid {pid}): {source}")]
    Stop { pid: u32, source: io::Error },
}

/// Outcome of waiting for the host to report ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready(Duration),
    TimedOut(Duration),
    /// The host exited before it became ready.
    Exited(i32),
}

#[cfg(test)]
impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }
}

type LiveSlot = Arc<Mutex<Option<u32>>>;

fn occupy(slot: &LiveSlot) -> std::sync::MutexGuard<'_, Option<u32>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct HostSupervisor {
    live: LiveSlot,
    poll_interval: Duration,
    stop_grace: Duration,
}

impl HostSupervisor {
    pub fn new(poll_interval: Duration, stop_grace: Duration) -> Self {
        Self {
            live: Arc::new(Mutex::new(None)),
            poll_interval,
            stop_grace,
        }
    }

    /// Pid of the host currently owned by a handle, if any.
    pub fn live_host(&self) -> Option<u32> {
        *occupy(&self.live)
    }

    /// Launches the host and returns without waiting for it to start serving.
    pub fn start(&self, command: &CommandSpec, cwd: &Path) -> Result<HostHandle, SupervisorError> {
        let mut slot = occupy(&self.live);
        if let Some(pid) = *slot {
            return Err(SupervisorError::AlreadyRunning(pid));
        }

        info!("Starting host: {}", command.display());
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                command: command.display(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        *slot = Some(pid);
        debug!("Host started with pid {pid}");

        Ok(HostHandle {
            pid,
            child: Some(child),
            slot: Arc::clone(&self.live),
            stop_grace: self.stop_grace,
        })
    }

    /// Polls the liveness endpoint until it answers `200` or `timeout` elapses.
    ///
    /// Failed probes only mean "not ready yet". Returns early when the host
    /// process has already exited.
    pub async fn await_ready(
        &self,
        handle: &mut HostHandle,
        api: &dyn HostApi,
        timeout: Duration,
    ) -> Readiness {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(code) = handle.exit_code() {
                warn!("Host exited with code {code} before becoming ready");
                return Readiness::Exited(code);
            }

            match tokio::time::timeout_at(deadline, api.queue()).await {
                Ok(Ok(())) => {
                    let elapsed = started.elapsed();
                    info!("Host ready after {:.1}s", elapsed.as_secs_f64());
                    return Readiness::Ready(elapsed);
                }
                Ok(Err(e)) => debug!("Host not ready yet: {e}"),
                Err(_) => debug!("Liveness probe cut off by the readiness deadline"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Host not ready within {}s", timeout.as_secs_f64());
                return Readiness::TimedOut(started.elapsed());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn stop(&self, handle: &mut HostHandle) -> Result<(), SupervisorError> {
        handle.stop().await
    }
}

/// Exclusive ownership of a running host process.
#[derive(Debug)]
pub struct HostHandle {
    pid: u32,
    child: Option<Child>,
    slot: LiveSlot,
    stop_grace: Duration,
}

impl HostHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(test)]
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Exit code if the process has already exited on its own.
    fn exit_code(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(exit_code(status)),
            _ => None,
        }
    }

    /// Sends SIGTERM to the host's process group and waits for the host to
    /// exit, escalating to SIGKILL after the grace period.
    ///
    /// Calling this on an already stopped handle does nothing.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let result = terminate(&mut child, self.pid, self.stop_grace).await;
        self.release();

        match result {
            Ok(code) => {
                info!("Host (pid {}) stopped with code {code}", self.pid);
                Ok(())
            }
            Err(source) => Err(SupervisorError::Stop {
                pid: self.pid,
                source,
            }),
        }
    }

    fn release(&self) {
        let mut slot = occupy(&self.slot);
        if *slot == Some(self.pid) {
            *slot = None;
        }
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("Host (pid {}) released without stop, killing it", self.pid);
            if let Err(e) = signal_group(self.pid, libc::SIGKILL) {
                warn!("Failed to kill host process group {}: {e}", self.pid);
            }
            // kill_on_drop covers the direct child; reaping finishes in the background.
            let _ = child.try_wait();
        }
        self.release();
    }
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> io::Result<i32> {
    if let Some(status) = child.try_wait()? {
        // Sweep up anything the host left behind in its group.
        signal_group(pid, libc::SIGKILL)?;
        return Ok(exit_code(status));
    }

    signal_group(pid, libc::SIGTERM)?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            signal_group(pid, libc::SIGKILL)?;
            Ok(exit_code(status?))
        }
        Err(_) => {
            warn!(
                "Host (pid {pid}) ignored SIGTERM for {}s, killing it",
                grace.as_secs_f64()
            );
            signal_group(pid, libc::SIGKILL)?;
            Ok(exit_code(child.wait().await?))
        }
    }
}

/// Signals every process in the group led by `pgid`. A group that no longer
/// exists is not an error.
fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pgid <= 0 {
        return Ok(());
    }
    // SAFETY: kill(2) takes plain integers and has no memory-safety requirements.
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HarnessConfig, Unit};
    use crate::host_api::ComfyApi;
    use crate::tests::common::{StubServer, unused_port};

    fn supervisor() -> HostSupervisor {
        HostSupervisor::new(Duration::from_millis(50), Duration::from_secs(5))
    }

    fn sleeper() -> CommandSpec {
        CommandSpec::new("sleep").with_args(["30"])
    }

    fn api_for(base_url: &str) -> ComfyApi {
        let mut config = HarnessConfig::new("/tmp", vec![Unit::new("foo")]);
        config.base_url = base_url.to_string();
        config.poll_interval = Duration::from_millis(50);
        ComfyApi::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let supervisor = supervisor();
        let mut handle = supervisor.start(&sleeper(), Path::new("/")).unwrap();
        assert!(handle.is_running());
        assert_eq!(supervisor.live_host(), Some(handle.pid()));

        supervisor.stop(&mut handle).await.unwrap();
        assert!(!handle.is_running());
        assert_eq!(supervisor.live_host(), None);

        supervisor.stop(&mut handle).await.unwrap();
        assert!(!handle.is_running());
        assert_eq!(supervisor.live_host(), None);
    }

    #[tokio::test]
    async fn test_only_one_live_host() {
        let supervisor = supervisor();
        let mut first = supervisor.start(&sleeper(), Path::new("/")).unwrap();

        let second = supervisor.start(&sleeper(), Path::new("/"));
        assert!(matches!(second, Err(SupervisorError::AlreadyRunning(pid)) if pid == first.pid()));

        first.stop().await.unwrap();
        let mut third = supervisor.start(&sleeper(), Path::new("/")).unwrap();
        third.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_live_slot() {
        let supervisor = supervisor();
        let handle = supervisor.start(&sleeper(), Path::new("/")).unwrap();
        drop(handle);

        assert_eq!(supervisor.live_host(), None);
        let mut next = supervisor.start(&sleeper(), Path::new("/")).unwrap();
        next.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_escalates_when_sigterm_is_ignored() {
        let supervisor = HostSupervisor::new(Duration::from_millis(50), Duration::from_millis(200));
        let stubborn = CommandSpec::new("sh").with_args(["-c", "trap '' TERM; sleep 30"]);
        let mut handle = supervisor.start(&stubborn, Path::new("/")).unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        handle.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = supervisor().start(&CommandSpec::new("/nonexistent/host-12345"), Path::new("/"));
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_await_ready_observes_200() {
        let server = StubServer::start(200, "{}").await;
        let supervisor = supervisor();
        let mut handle = supervisor.start(&sleeper(), Path::new("/")).unwrap();

        let readiness = supervisor
            .await_ready(&mut handle, &api_for(&server.base_url()), Duration::from_secs(5))
            .await;
        assert!(readiness.is_ready());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_await_ready_times_out_when_host_never_answers() {
        let supervisor = supervisor();
        let mut handle = supervisor.start(&sleeper(), Path::new("/")).unwrap();
        let api = api_for(&format!("http://127.0.0.1:{}", unused_port()));

        let readiness = supervisor
            .await_ready(&mut handle, &api, Duration::from_millis(300))
            .await;
        assert!(matches!(readiness, Readiness::TimedOut(elapsed) if elapsed >= Duration::from_millis(300)));

        supervisor.stop(&mut handle).await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_await_ready_treats_non_200_as_not_ready() {
        let server = StubServer::start(503, "{}").await;
        let supervisor = supervisor();
        let mut handle = supervisor.start(&sleeper(), Path::new("/")).unwrap();

        let readiness = supervisor
            .await_ready(&mut handle, &api_for(&server.base_url()), Duration::from_millis(300))
            .await;
        assert!(matches!(readiness, Readiness::TimedOut(_)));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_await_ready_returns_when_host_exits() {
        let supervisor = supervisor();
        let failing = CommandSpec::new("sh").with_args(["-c", "exit 7"]);
        let mut handle = supervisor.start(&failing, Path::new("/")).unwrap();
        let api = api_for(&format!("http://127.0.0.1:{}", unused_port()));

        let readiness = supervisor
            .await_ready(&mut handle, &api, Duration::from_secs(10))
            .await;
        assert_eq!(readiness, Readiness::Exited(7));

        handle.stop().await.unwrap();
        assert_eq!(supervisor.live_host(), None);
    }
}
