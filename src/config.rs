//! Client configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::acp::handshake::HandshakePolicy;
use crate::acp::spawner::SpawnConfig;
use crate::orchestrator::connection_manager::{ConnectionSettings, ReconnectPolicy};
use crate::orchestrator::endpoint::{EndpointPlan, TransportMode};
use crate::orchestrator::session_controller::SessionSettings;
use crate::{AppError, Result};

/// Port range and bind host for TCP mode.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EndpointConfig {
    /// First port of the sequential fallback range.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Number of sequential ports to try.
    #[serde(default = "default_port_span")]
    pub port_span: u16,
    /// Loopback host the agent binds to.
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_span: default_port_span(),
            hostname: default_hostname(),
        }
    }
}

fn default_base_port() -> u16 {
    4096
}

fn default_port_span() -> u16 {
    10
}

fn default_hostname() -> String {
    "127.0.0.1".into()
}

/// Timeout values.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Default timeout for application calls.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Timeout for `session/prompt`.
    #[serde(default = "default_prompt_seconds")]
    pub prompt_seconds: u64,
    /// Overall handshake deadline per endpoint.
    #[serde(default = "default_readiness_seconds")]
    pub readiness_seconds: u64,
    /// Timeout for a single `initialize` probe.
    #[serde(default = "default_probe_millis")]
    pub probe_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            prompt_seconds: default_prompt_seconds(),
            readiness_seconds: default_readiness_seconds(),
            probe_millis: default_probe_millis(),
        }
    }
}

fn default_request_seconds() -> u64 {
    30
}

fn default_prompt_seconds() -> u64 {
    1800
}

fn default_readiness_seconds() -> u64 {
    15
}

fn default_probe_millis() -> u64 {
    3000
}

/// Handshake probing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HandshakeConfig {
    /// Maximum number of `initialize` probes.
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,
    /// Delay after the first failed probe.
    #[serde(default = "default_initial_spacing_millis")]
    pub initial_spacing_millis: u64,
    /// Protocol version announced in `initialize`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_probes: default_max_probes(),
            initial_spacing_millis: default_initial_spacing_millis(),
            protocol_version: default_protocol_version(),
        }
    }
}

fn default_max_probes() -> u32 {
    5
}

fn default_initial_spacing_millis() -> u64 {
    100
}

fn default_protocol_version() -> u32 {
    1
}

/// Reconnection behaviour selector.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectMode {
    /// Wait for an explicit `connect()`.
    #[default]
    Manual,
    /// Retry on a bounded backoff.
    Auto,
}

/// Reconnection after an unexpected loss.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReconnectConfig {
    /// `manual` or `auto`.
    #[serde(default)]
    pub policy: ReconnectMode,
    /// Attempts before settling in `failed` (auto only).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt.
    #[serde(default = "default_initial_backoff_millis")]
    pub initial_backoff_millis: u64,
    /// Upper bound on the delay between attempts.
    #[serde(default = "default_max_backoff_millis")]
    pub max_backoff_millis: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectMode::default(),
            max_attempts: default_max_attempts(),
            initial_backoff_millis: default_initial_backoff_millis(),
            max_backoff_millis: default_max_backoff_millis(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_millis() -> u64 {
    500
}

fn default_max_backoff_millis() -> u64 {
    30_000
}

/// Client configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Agent binary (e.g., `opencode`, `gemini`).
    pub host_cli: String,
    /// Arguments passed to the agent before endpoint arguments.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Directory the agent runs in and the `cwd` of new sessions.
    pub workspace_root: PathBuf,
    /// `stdio` or `tcp`.
    #[serde(default)]
    pub transport: TransportMode,
    /// TCP endpoint range.
    #[serde(default)]
    pub endpoints: EndpointConfig,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Handshake probing.
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the workspace root, canonicalizing it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the path does not exist.
    pub fn set_workspace_root(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.workspace_root = path
            .as_ref()
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        Ok(())
    }

    /// Runtime settings for the connection manager.
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        let reconnect = match self.reconnect.policy {
            ReconnectMode::Manual => ReconnectPolicy::Manual,
            ReconnectMode::Auto => ReconnectPolicy::Auto {
                max_attempts: self.reconnect.max_attempts,
                initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_millis),
                max_backoff: Duration::from_millis(self.reconnect.max_backoff_millis),
            },
        };
        ConnectionSettings {
            endpoints: EndpointPlan {
                mode: self.transport,
                base_port: self.endpoints.base_port,
                port_span: self.endpoints.port_span,
            },
            handshake: HandshakePolicy {
                readiness_timeout: Duration::from_secs(self.timeouts.readiness_seconds),
                max_probes: self.handshake.max_probes,
                initial_spacing: Duration::from_millis(self.handshake.initial_spacing_millis),
                probe_timeout: Duration::from_millis(self.timeouts.probe_millis),
                protocol_version: self.handshake.protocol_version,
            },
            request_timeout: Duration::from_secs(self.timeouts.request_seconds),
            reconnect,
        }
    }

    /// Process launch settings.
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            host_cli: self.host_cli.clone(),
            host_cli_args: self.host_cli_args.clone(),
            workspace_root: self.workspace_root.clone(),
            hostname: self.endpoints.hostname.clone(),
            connect_timeout: Duration::from_secs(self.timeouts.readiness_seconds),
        }
    }

    /// Session creation and prompt settings.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            cwd: self.workspace_root.clone(),
            prompt_timeout: Duration::from_secs(self.timeouts.prompt_seconds),
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }
        if self.endpoints.port_span == 0 {
            return Err(AppError::Config(
                "endpoints.port_span must be greater than zero".into(),
            ));
        }
        if self.handshake.max_probes == 0 {
            return Err(AppError::Config(
                "handshake.max_probes must be greater than zero".into(),
            ));
        }

        let timeouts = [
            ("timeouts.request_seconds", self.timeouts.request_seconds),
            ("timeouts.prompt_seconds", self.timeouts.prompt_seconds),
            ("timeouts.readiness_seconds", self.timeouts.readiness_seconds),
            ("timeouts.probe_millis", self.timeouts.probe_millis),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(AppError::Config(format!("{name} must be greater than zero")));
        }

        if self.reconnect.policy == ReconnectMode::Auto && self.reconnect.max_attempts == 0 {
            return Err(AppError::Config(
                "reconnect.max_attempts must be greater than zero".into(),
            ));
        }

        let root = self.workspace_root.clone();
        self.set_workspace_root(root)
    }
}
