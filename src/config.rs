// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Harness configuration.
//!
//! Everything a batch needs (catalog, timeouts, endpoints, command templates)
//! is resolved once at startup into an immutable [`HarnessConfig`] and handed
//! to the batch runner.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::args::Args;

/// Catalog of the most used custom nodes, in test order.
const BUILTIN_CATALOG: &str = include_str!("../catalog/top_nodes.json");

pub const DEFAULT_PORT: u16 = 8188;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CAPABILITY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

pub const DEFAULT_RESET_COMMAND: &str = "uv sync";
pub const DEFAULT_MANAGER_COMMAND: &str = "uv run custom_nodes/ComfyUI-Manager/cm-cli.py";
pub const DEFAULT_HOST_COMMAND: &str = "uv run main.py";

/// Error types for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("command line is empty")]
    EmptyCommand,

    #[error("catalog entry #{0} has an empty id")]
    EmptyUnitId(usize),

    #[error("duplicate unit in catalog: {0}")]
    DuplicateUnit(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("environment override must look like KEY=VALUE, got `{0}`")]
    InvalidEnv(String),

    #[error("catalog is empty")]
    EmptyCatalog,

    #[error("invalid catalog: {0}")]
    InvalidCatalog(#[from] serde_json::Error),

    #[error("failed to read catalog {path}: {source}")]
    CatalogRead {
        path: String,
        source: std::io::Error,
    },
}

/// One installable plugin under test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Unit {
    pub id: String,
}

impl Unit {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// An external command template: program, arguments and an environment
/// overlay merged on top of the ambient environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Splits a command line on whitespace. No shell quoting is interpreted.
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let mut parts = line.split_whitespace();
        let program = parts.next().ok_or(ConfigError::EmptyCommand)?;
        Ok(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
            env: BTreeMap::new(),
        })
    }

    /// Returns a copy with `extra` appended to the argument list.
    pub fn with_args<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = self.clone();
        spec.args.extend(extra.into_iter().map(Into::into));
        spec
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Human readable command line, used for logging.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What the batch does after a unit's environment reset fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetFailurePolicy {
    /// Record `FAILED_RESET` for the unit and move on to the next one.
    #[default]
    Continue,
    /// Record `FAILED_RESET` and end the batch.
    StopBatch,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Host installation directory; every external command runs here.
    pub host_dir: PathBuf,
    pub catalog: Vec<Unit>,
    /// Base URL of the host, without a trailing slash.
    pub base_url: String,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub capability_timeout: Duration,
    pub stop_grace: Duration,
    pub reset_command: CommandSpec,
    pub manager_command: CommandSpec,
    pub host_command: CommandSpec,
    pub report_dir: PathBuf,
    pub reset_failure_policy: ResetFailurePolicy,
    pub keep_raw_object_info: bool,
}

impl HarnessConfig {
    /// Creates a configuration with default timeouts and commands.
    pub fn new(host_dir: impl Into<PathBuf>, catalog: Vec<Unit>) -> Self {
        Self {
            host_dir: host_dir.into(),
            catalog,
            base_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            capability_timeout: DEFAULT_CAPABILITY_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            reset_command: CommandSpec::new("uv").with_args(["sync"]),
            manager_command: CommandSpec::new("uv")
                .with_args(["run", "custom_nodes/ComfyUI-Manager/cm-cli.py"]),
            host_command: CommandSpec::new("uv").with_args(["run", "main.py"]),
            report_dir: PathBuf::from("."),
            reset_failure_policy: ResetFailurePolicy::Continue,
            keep_raw_object_info: false,
        }
    }

    /// Resolves the command line into a configuration.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let catalog = if !args.unit.is_empty() {
            validate_catalog(args.unit.iter().map(Unit::new).collect())?
        } else if let Some(path) = &args.catalog {
            load_catalog(path)?
        } else {
            builtin_catalog()?
        };

        let overlay = parse_env_overlay(&args.env)?;
        let command = |line: &str| -> Result<CommandSpec, ConfigError> {
            let spec = CommandSpec::parse(line)?;
            Ok(overlay
                .iter()
                .fold(spec, |spec, (key, value)| spec.with_env(key, value)))
        };

        let mut config = Self::new(expand_home(&args.host_dir), catalog);
        let base_url = args
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", args.port));
        config.base_url = base_url.trim_end_matches('/').to_string();
        config.ready_timeout = non_zero(
            "--ready-timeout-secs",
            Duration::from_secs(args.ready_timeout_secs),
        )?;
        config.poll_interval = non_zero(
            "--poll-interval-ms",
            Duration::from_millis(args.poll_interval_ms),
        )?;
        config.capability_timeout = non_zero(
            "--capability-timeout-secs",
            Duration::from_secs(args.capability_timeout_secs),
        )?;
        // Zero grace is allowed: the host is killed right away.
        config.stop_grace = Duration::from_secs(args.stop_grace_secs);
        config.reset_command = command(&args.reset_command)?;
        config.manager_command = command(&args.manager_command)?;
        config.host_command = command(&args.host_command)?;
        config.report_dir = args.report_dir.clone();
        if args.stop_on_reset_failure {
            config.reset_failure_policy = ResetFailurePolicy::StopBatch;
        }
        config.keep_raw_object_info = args.keep_raw_object_info;
        Ok(config)
    }

    pub fn liveness_url(&self) -> String {
        format!("{}/queue", self.base_url)
    }

    pub fn object_info_url(&self) -> String {
        format!("{}/object_info", self.base_url)
    }

    pub fn install_command(&self, unit: &Unit) -> CommandSpec {
        self.manager_command.with_args(["install", unit.id.as_str()])
    }

    pub fn uninstall_command(&self, unit: &Unit) -> CommandSpec {
        self.manager_command.with_args(["uninstall", unit.id.as_str()])
    }
}

pub fn builtin_catalog() -> Result<Vec<Unit>, ConfigError> {
    parse_catalog(BUILTIN_CATALOG)
}

/// Parses a JSON array of `{"id": "..."}` objects.
pub fn parse_catalog(json: &str) -> Result<Vec<Unit>, ConfigError> {
    let units: Vec<Unit> = serde_json::from_str(json)?;
    validate_catalog(units)
}

pub fn load_catalog(path: &Path) -> Result<Vec<Unit>, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogRead {
        path: path.display().to_string(),
        source,
    })?;
    parse_catalog(&json)
}

/// Rejects empty catalogs, blank ids and duplicates; keeps the given order.
pub fn validate_catalog(units: Vec<Unit>) -> Result<Vec<Unit>, ConfigError> {
    if units.is_empty() {
        return Err(ConfigError::EmptyCatalog);
    }
    {
        let mut seen = HashSet::new();
        for (idx, unit) in units.iter().enumerate() {
            if unit.id.trim().is_empty() {
                return Err(ConfigError::EmptyUnitId(idx));
            }
            if !seen.insert(unit.id.as_str()) {
                return Err(ConfigError::DuplicateUnit(unit.id.clone()));
            }
        }
    }
    Ok(units)
}

/// Parses `KEY=VALUE` pairs; the value may be empty, the key may not.
pub fn parse_env_overlay(pairs: &[String]) -> Result<Vec<(String, String)>, ConfigError> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ConfigError::InvalidEnv(pair.clone())),
        })
        .collect()
}

fn non_zero(flag: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        Err(ConfigError::ZeroDuration(flag))
    } else {
        Ok(value)
    }
}

/// Expands `~` and `~/...` using `HOME`. `~user` forms are left alone.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match std::env::var_os("HOME") {
        Some(home) => {
            let mut expanded = PathBuf::from(home);
            if !rest.is_empty() {
                expanded.push(rest);
            }
            expanded
        }
        None => PathBuf::from(path),
    }
}
