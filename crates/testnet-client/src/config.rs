//! Client configuration.
//!
//! Parsed from an optional TOML document. Every field has a default, so an
//! empty document yields a working configuration for the standard engine
//! container layout.
//!
//! ```toml
//! [engine]
//! addr = "172.23.0.2:7443"
//! attempt_timeout_ms = 5000
//!
//! [volume]
//! suite_execution_volume_dirpath = "/suite-execution"
//! services_relative_dirpath = "services"
//!
//! [registration_retry]
//! interval_ms = 1000
//! budget_secs = 60
//! ```

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::gateway::RetryPolicy;

pub const DEFAULT_ENGINE_PORT: u16 = 7443;
pub const DEFAULT_ENGINE_PATH: &str = "/engine/ws";
pub const DEFAULT_SUITE_EXECUTION_VOLUME_DIRPATH: &str = "/suite-execution";
pub const DEFAULT_SERVICES_RELATIVE_DIRPATH: &str = "services";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("could not read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Raw input ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfigInput {
    pub engine: EngineConfigInput,
    pub volume: VolumeConfigInput,
    pub registration_retry: RetryPolicyInput,
    pub regular_retry: RetryPolicyInput,
    pub compensating_stop_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfigInput {
    pub addr: Option<String>,
    pub path: Option<String>,
    pub attempt_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VolumeConfigInput {
    pub suite_execution_volume_dirpath: Option<String>,
    pub services_relative_dirpath: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryPolicyInput {
    pub interval_ms: Option<u64>,
    pub budget_secs: Option<u64>,
}

// ── Resolved config ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// `host:port` of the engine.
    pub addr: String,
    pub path: String,
    /// Upper bound on a single connect + request + reply exchange.
    pub attempt_timeout: Duration,
}

impl EngineConfig {
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.path)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{DEFAULT_ENGINE_PORT}"),
            path: DEFAULT_ENGINE_PATH.to_string(),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the suite execution volume lives on the runner side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub suite_execution_volume_dirpath: PathBuf,
    /// Per-service directories, relative to the volume root.
    pub services_relative_dirpath: PathBuf,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            suite_execution_volume_dirpath: PathBuf::from(DEFAULT_SUITE_EXECUTION_VOLUME_DIRPATH),
            services_relative_dirpath: PathBuf::from(DEFAULT_SERVICES_RELATIVE_DIRPATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub engine: EngineConfig,
    pub volume: VolumeConfig,
    pub registration_retry: RetryPolicy,
    pub regular_retry: RetryPolicy,
    /// Stop timeout used when removing a service whose start failed.
    pub compensating_stop_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            volume: VolumeConfig::default(),
            registration_retry: RetryPolicy::registration(),
            regular_retry: RetryPolicy::regular_operation(),
            compensating_stop_timeout_secs: 0,
        }
    }
}

impl RetryPolicyInput {
    fn resolve(&self, name: &str, defaults: RetryPolicy) -> Result<RetryPolicy, ConfigError> {
        let interval = self
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.interval);
        let budget = self
            .budget_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.budget);
        if interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "{name}.interval_ms must be greater than zero"
            )));
        }
        Ok(RetryPolicy::constant(interval, budget))
    }
}

impl ClientConfigInput {
    pub fn resolve(self) -> Result<ClientConfig, ConfigError> {
        let defaults = ClientConfig::default();

        let addr = match self.engine.addr {
            Some(addr) if addr.trim().is_empty() => {
                return Err(ConfigError::Invalid("engine.addr is empty".into()));
            }
            Some(addr) => addr.trim().to_string(),
            None => defaults.engine.addr,
        };
        let path = match self.engine.path {
            Some(path) if path.starts_with('/') => path,
            Some(path) => format!("/{path}"),
            None => defaults.engine.path,
        };
        let attempt_timeout = self
            .engine
            .attempt_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.engine.attempt_timeout);

        let suite_execution_volume_dirpath = self
            .volume
            .suite_execution_volume_dirpath
            .map(PathBuf::from)
            .unwrap_or(defaults.volume.suite_execution_volume_dirpath);
        if !suite_execution_volume_dirpath.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "volume.suite_execution_volume_dirpath must be absolute, got '{}'",
                suite_execution_volume_dirpath.display()
            )));
        }
        let services_relative_dirpath = self
            .volume
            .services_relative_dirpath
            .map(PathBuf::from)
            .unwrap_or(defaults.volume.services_relative_dirpath);
        if !is_plain_relative(&services_relative_dirpath) {
            return Err(ConfigError::Invalid(format!(
                "volume.services_relative_dirpath must be a plain relative path, got '{}'",
                services_relative_dirpath.display()
            )));
        }

        Ok(ClientConfig {
            engine: EngineConfig {
                addr,
                path,
                attempt_timeout,
            },
            volume: VolumeConfig {
                suite_execution_volume_dirpath,
                services_relative_dirpath,
            },
            registration_retry: self
                .registration_retry
                .resolve("registration_retry", defaults.registration_retry)?,
            regular_retry: self
                .regular_retry
                .resolve("regular_retry", defaults.regular_retry)?,
            compensating_stop_timeout_secs: self
                .compensating_stop_timeout_secs
                .unwrap_or(defaults.compensating_stop_timeout_secs),
        })
    }
}

impl ClientConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(ClientConfig::default());
        }
        let parsed: ClientConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }
}

/// True if the path is relative and only descends (no `..`, no root).
pub(crate) fn is_plain_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_uses_defaults() {
        let cfg = ClientConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.engine.url(), "ws://127.0.0.1:7443/engine/ws");
        assert_eq!(cfg.registration_retry.budget, Duration::from_secs(60));
        assert_eq!(cfg.regular_retry.budget, Duration::from_secs(10));
        assert_eq!(cfg.regular_retry.interval, Duration::from_secs(1));
    }

    #[test]
    fn parse_toml_config_overrides() {
        let toml = r#"
compensating_stop_timeout_secs = 3

[engine]
addr = "172.23.0.2:9000"
path = "rpc"
attempt_timeout_ms = 250

[volume]
suite_execution_volume_dirpath = "/tmp/suite"
services_relative_dirpath = "svc"

[regular_retry]
interval_ms = 100
budget_secs = 2
"#;
        let cfg = ClientConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.engine.url(), "ws://172.23.0.2:9000/rpc");
        assert_eq!(cfg.engine.attempt_timeout, Duration::from_millis(250));
        assert_eq!(cfg.volume.suite_execution_volume_dirpath, PathBuf::from("/tmp/suite"));
        assert_eq!(cfg.volume.services_relative_dirpath, PathBuf::from("svc"));
        assert_eq!(
            cfg.regular_retry,
            RetryPolicy::constant(Duration::from_millis(100), Duration::from_secs(2))
        );
        // untouched section keeps its default
        assert_eq!(cfg.registration_retry, RetryPolicy::registration());
        assert_eq!(cfg.compensating_stop_timeout_secs, 3);
    }

    #[test]
    fn rejects_relative_volume_root() {
        let err = ClientConfig::from_toml_str(
            "[volume]\nsuite_execution_volume_dirpath = \"suite\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_escaping_services_dir() {
        let err =
            ClientConfig::from_toml_str("[volume]\nservices_relative_dirpath = \"../x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_retry_interval() {
        let err = ClientConfig::from_toml_str("[regular_retry]\ninterval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("regular_retry.interval_ms"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ClientConfig::from_toml_str("[engine\naddr = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
