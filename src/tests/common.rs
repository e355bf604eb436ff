// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Common utilities and helpers for harness tests.

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::command_runner::{CommandOutput, CommandRunner};
use crate::config::{CommandSpec, HarnessConfig, Unit};
use crate::host_api::{ApiError, HostApi};

/// Returns the path to the test fixtures directory.
pub fn get_fixtures_dir() -> PathBuf {
    let mut d = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    d.push("src");
    d.push("tests");
    d.push("fixtures");
    d
}

/// Reads a fixture file and returns its contents as a String.
pub fn read_fixture(filename: &str) -> String {
    let path = get_fixtures_dir().join(filename);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read fixture {}: {}", filename, e))
}

/// A local port nothing listens on.
pub fn unused_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind probe port");
    listener.local_addr().expect("No local addr").port()
}

/// Configuration with short timeouts whose host is a plain `sleep`.
pub fn test_config(host_dir: &Path, units: &[&str]) -> HarnessConfig {
    let mut config = HarnessConfig::new(host_dir, units.iter().copied().map(Unit::new).collect());
    config.ready_timeout = Duration::from_secs(5);
    config.poll_interval = Duration::from_millis(20);
    config.stop_grace = Duration::from_secs(2);
    config.host_command = CommandSpec::new("sleep").with_args(["30"]);
    config.report_dir = host_dir.to_path_buf();
    config
}

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

type RunnerScript = dyn Fn(&CommandSpec) -> io::Result<CommandOutput> + Send + Sync;

/// [`CommandRunner`] answering from a closure and recording every command line.
pub struct ScriptedRunner {
    script: Box<RunnerScript>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&CommandSpec) -> io::Result<CommandOutput> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Every command succeeds.
    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| Ok(output(0, "ok", "")))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Trailing `<verb> <unit>` of each recorded manager call, e.g. `install foo`.
    pub fn manager_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split(' ').collect();
                match parts.as_slice() {
                    [.., verb @ ("install" | "uninstall"), unit] => Some(format!("{verb} {unit}")),
                    _ => None,
                }
            })
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec, _cwd: Option<&Path>) -> io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.display());
        (self.script)(command)
    }
}

type ObjectInfoScript = dyn Fn(usize) -> Result<serde_json::Value, ApiError> + Send + Sync;

/// [`HostApi`] whose readiness and object_info answers are scripted.
pub struct ScriptedApi {
    /// Number of failed liveness probes before the host answers 200;
    /// `None` never answers.
    ready_after: Option<usize>,
    object_info: Box<ObjectInfoScript>,
    queue_calls: AtomicUsize,
    object_info_calls: AtomicUsize,
}

impl ScriptedApi {
    /// `object_info` receives the zero-based index of the call.
    pub fn new<F>(ready_after: Option<usize>, object_info: F) -> Arc<Self>
    where
        F: Fn(usize) -> Result<serde_json::Value, ApiError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            ready_after,
            object_info: Box::new(object_info),
            queue_calls: AtomicUsize::new(0),
            object_info_calls: AtomicUsize::new(0),
        })
    }

    /// Ready at once, always returning `body`.
    pub fn serving(body: serde_json::Value) -> Arc<Self> {
        Self::new(Some(0), move |_| Ok(body.clone()))
    }

    pub fn queue_calls(&self) -> usize {
        self.queue_calls.load(Ordering::SeqCst)
    }

    pub fn object_info_calls(&self) -> usize {
        self.object_info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostApi for ScriptedApi {
    async fn queue(&self) -> Result<(), ApiError> {
        let attempt = self.queue_calls.fetch_add(1, Ordering::SeqCst);
        match self.ready_after {
            Some(failures) if attempt >= failures => Ok(()),
            _ => Err(ApiError::Transport("connection refused".to_string())),
        }
    }

    async fn object_info(&self) -> Result<serde_json::Value, ApiError> {
        let call = self.object_info_calls.fetch_add(1, Ordering::SeqCst);
        (self.object_info)(call)
    }
}

/// Minimal HTTP server answering every request with the same status and body.
pub struct StubServer {
    port: u16,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind stub server");
        let port = listener.local_addr().expect("No local addr").port();
        let response = format!(
            "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            if status == 200 { "OK" } else { "Stub" },
            body.len()
        );

        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let response = response.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                request.extend_from_slice(&buf[..n]);
                                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { port, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
