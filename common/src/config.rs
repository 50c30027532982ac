// Configuration management from the process environment
// Dispatcher-provided variables plus worker-specific overrides, layered with the `config` crate

use crate::errors::ConfigurationError;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_BUS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_REGISTER_SUBJECT: &str = "yggdrasil.dispatcher.register";
pub const DEFAULT_TRANSMIT_SUBJECT: &str = "yggdrasil.dispatcher.transmit";
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MAX_RETAINED_JOBS: usize = 1024;
pub const FALLBACK_WORKDIR: &str = "/run";

/// Prefix of variables shared by the dispatcher (`YGG_LOG_LEVEL`, `YGG_SOCKET_ADDR`)
const DISPATCHER_ENV_PREFIX: &str = "YGG";
/// Prefix of worker-specific variables (`FOREMAN_YGG_WORKER_WORKDIR`, ...)
const WORKER_ENV_PREFIX: &str = "FOREMAN_YGG_WORKER";
const XDG_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";

/// Resolved worker settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: String,
    pub transport: TransportSettings,
    pub workdir: PathBuf,
    pub handshake_timeout_ms: u64,
    pub max_retained_jobs: usize,
    pub metrics_port: Option<u16>,
}

/// Which binding the worker runs; exactly one per process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSettings {
    /// Dispatcher socket address was provided
    Grpc { dispatcher_addr: String },
    /// No socket address; talk to the dispatcher over the message bus
    Bus(BusConfig),
}

/// NATS bus connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    pub url: String,
    pub register_subject: String,
    pub transmit_subject: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BUS_URL.to_string(),
            register_subject: DEFAULT_REGISTER_SUBJECT.to_string(),
            transmit_subject: DEFAULT_TRANSMIT_SUBJECT.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    log_level: Option<String>,
    socket_addr: Option<String>,
    workdir: Option<String>,
    bus_url: String,
    register_subject: String,
    transmit_subject: String,
    handshake_timeout_ms: u64,
    max_retained_jobs: usize,
    metrics_port: Option<u16>,
}

impl Settings {
    /// Load settings from the process environment
    ///
    /// Recoverable problems (such as an unknown log level) are returned next
    /// to the settings so they can be logged once telemetry is up.
    pub fn load() -> Result<(Self, Vec<ConfigurationError>), ConfigurationError> {
        Self::from_env_map(None)
    }

    /// Load settings from an explicit variable map, or the process
    /// environment when `env` is `None`
    pub fn from_env_map(
        env: Option<HashMap<String, String>>,
    ) -> Result<(Self, Vec<ConfigurationError>), ConfigurationError> {
        let raw: RawSettings = Config::builder()
            .set_default("bus_url", DEFAULT_BUS_URL)?
            .set_default("register_subject", DEFAULT_REGISTER_SUBJECT)?
            .set_default("transmit_subject", DEFAULT_TRANSMIT_SUBJECT)?
            .set_default("handshake_timeout_ms", DEFAULT_HANDSHAKE_TIMEOUT_MS as i64)?
            .set_default("max_retained_jobs", DEFAULT_MAX_RETAINED_JOBS as i64)?
            .add_source(
                Environment::with_prefix(DISPATCHER_ENV_PREFIX)
                    .ignore_empty(true)
                    .source(env.clone()),
            )
            .add_source(
                Environment::with_prefix(WORKER_ENV_PREFIX)
                    .ignore_empty(true)
                    .try_parsing(true)
                    .source(env.clone()),
            )
            .build()?
            .try_deserialize()?;

        let mut warnings = Vec::new();

        // Older dispatchers do not share their log level; default to info
        let log_level = match raw.log_level.as_deref() {
            None => DEFAULT_LOG_LEVEL.to_string(),
            Some(level) => match parse_log_level(level) {
                Some(level) => level,
                None => {
                    warnings.push(ConfigurationError::InvalidLogLevel(level.to_string()));
                    DEFAULT_LOG_LEVEL.to_string()
                }
            },
        };

        let transport = match raw.socket_addr.filter(|addr| !addr.trim().is_empty()) {
            Some(dispatcher_addr) => TransportSettings::Grpc { dispatcher_addr },
            None => TransportSettings::Bus(BusConfig {
                url: raw.bus_url,
                register_subject: raw.register_subject,
                transmit_subject: raw.transmit_subject,
            }),
        };

        let xdg_runtime_dir = match &env {
            Some(map) => map.get(XDG_RUNTIME_DIR).cloned(),
            None => std::env::var(XDG_RUNTIME_DIR).ok(),
        };

        let settings = Settings {
            log_level,
            transport,
            workdir: determine_workdir(raw.workdir, xdg_runtime_dir),
            handshake_timeout_ms: raw.handshake_timeout_ms,
            max_retained_jobs: raw.max_retained_jobs,
            metrics_port: raw.metrics_port,
        };

        Ok((settings, warnings))
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.handshake_timeout_ms == 0 {
            return Err(invalid("handshake_timeout_ms", "must be greater than 0"));
        }

        if self.max_retained_jobs == 0 {
            return Err(invalid("max_retained_jobs", "must be greater than 0"));
        }

        if self.workdir.as_os_str().is_empty() {
            return Err(invalid("workdir", "cannot be empty"));
        }

        if let TransportSettings::Bus(bus) = &self.transport {
            if bus.url.is_empty() {
                return Err(invalid("bus_url", "cannot be empty"));
            }
            if bus.register_subject.is_empty() || bus.transmit_subject.is_empty() {
                return Err(invalid("bus subjects", "cannot be empty"));
            }
        }

        if self.metrics_port == Some(0) {
            return Err(invalid("metrics_port", "must be greater than 0"));
        }

        Ok(())
    }

    pub fn transport_name(&self) -> &'static str {
        match self.transport {
            TransportSettings::Grpc { .. } => "grpc",
            TransportSettings::Bus(_) => "bus",
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            transport: TransportSettings::Bus(BusConfig::default()),
            workdir: PathBuf::from(FALLBACK_WORKDIR),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_retained_jobs: DEFAULT_MAX_RETAINED_JOBS,
            metrics_port: None,
        }
    }
}

/// Working directory fallback: explicit override, then `XDG_RUNTIME_DIR`, then `/run`
pub fn determine_workdir(explicit: Option<String>, xdg_runtime_dir: Option<String>) -> PathBuf {
    explicit
        .filter(|dir| !dir.is_empty())
        .or_else(|| xdg_runtime_dir.filter(|dir| !dir.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_WORKDIR))
}

/// Normalize a log level name, returning `None` when it is not recognised
pub fn parse_log_level(level: &str) -> Option<String> {
    level
        .trim()
        .parse::<tracing::Level>()
        .ok()
        .map(|level| level.to_string().to_lowercase())
}

fn invalid(field: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
