//! Agent configuration
//!
//! [`AgentConfig`] is the runtime form handed to [`crate::Agent::new`].
//! [`ConfigFile`] is the YAML form, with kebab-case keys and millisecond
//! durations, which resolves into an `AgentConfig`.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime pool options, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Keep completed connections in the free list for reuse
    pub keep_alive: bool,
    /// How long a free connection may sit idle before it is closed
    pub idle_timeout: Duration,
    /// Per-key cap on active connections (including connects in flight)
    pub max_sockets: usize,
    /// Per-key cap on free connections
    pub max_free_sockets: usize,
    /// Exchanges one connection may serve before it is retired; 0 = unlimited
    pub max_keep_alive_requests: u64,
    /// Default per-request timeout, connect through response
    pub request_timeout: Option<Duration>,
    /// Connect timeout used by the bundled TCP transport
    pub connect_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            idle_timeout: Duration::from_millis(1000),
            max_sockets: usize::MAX,
            max_free_sockets: 256,
            max_keep_alive_requests: 0,
            request_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Rejected configuration
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max-sockets must be at least 1")]
    ZeroMaxSockets,

    #[error("keep-alive-msecs must be greater than 0 when keep-alive is on")]
    ZeroIdleTimeout,

    #[error("request-timeout-msecs must be greater than 0")]
    ZeroRequestTimeout,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sockets == 0 {
            return Err(ConfigError::ZeroMaxSockets);
        }
        if self.keep_alive && self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        Ok(())
    }
}

/// YAML configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    /// Keep-alive toggle (ON/OFF, true/false, yes/no, 1/0)
    #[serde(default = "default_keep_alive")]
    pub keep_alive: OnOff,

    /// Idle expiry for free connections in milliseconds
    #[serde(default = "default_keep_alive_msecs")]
    pub keep_alive_msecs: u64,

    /// Per-key active connection cap; absent means unlimited
    #[serde(default)]
    pub max_sockets: Option<usize>,

    /// Per-key free connection cap
    #[serde(default = "default_max_free_sockets")]
    pub max_free_sockets: usize,

    /// Requests per connection before retirement; 0 means unlimited
    #[serde(default)]
    pub max_keep_alive_requests: u64,

    /// Per-request timeout in milliseconds
    #[serde(default)]
    pub request_timeout_msecs: Option<u64>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_msecs")]
    pub connect_timeout_msecs: u64,
}

fn default_keep_alive() -> OnOff {
    OnOff::On
}

fn default_keep_alive_msecs() -> u64 {
    1000
}

fn default_max_free_sockets() -> usize {
    256
}

fn default_connect_timeout_msecs() -> u64 {
    10_000
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            keep_alive: default_keep_alive(),
            keep_alive_msecs: default_keep_alive_msecs(),
            max_sockets: None,
            max_free_sockets: default_max_free_sockets(),
            max_keep_alive_requests: 0,
            request_timeout_msecs: None,
            connect_timeout_msecs: default_connect_timeout_msecs(),
        }
    }
}

impl ConfigFile {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConfigFile = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve into runtime form
    pub fn resolve(&self) -> Result<AgentConfig, ConfigError> {
        let config = AgentConfig {
            keep_alive: self.keep_alive.is_on(),
            idle_timeout: Duration::from_millis(self.keep_alive_msecs),
            max_sockets: self.max_sockets.unwrap_or(usize::MAX),
            max_free_sockets: self.max_free_sockets,
            max_keep_alive_requests: self.max_keep_alive_requests,
            request_timeout: self.request_timeout_msecs.map(Duration::from_millis),
            connect_timeout: Duration::from_millis(self.connect_timeout_msecs),
        };
        config.validate()?;
        Ok(config)
    }
}

/// ON/OFF toggle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnOff {
    On,
    #[default]
    Off,
}

impl<'de> Deserialize<'de> for OnOff {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Int(i64),
            String(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bool(true) | Raw::Int(1) => Ok(OnOff::On),
            Raw::Bool(false) | Raw::Int(0) => Ok(OnOff::Off),
            Raw::Int(n) => Err(serde::de::Error::custom(format!("invalid on/off value: {}", n))),
            Raw::String(s) => match s.to_uppercase().as_str() {
                "ON" | "TRUE" | "YES" | "1" => Ok(OnOff::On),
                "OFF" | "FALSE" | "NO" | "0" => Ok(OnOff::Off),
                _ => Err(serde::de::Error::custom(format!("invalid on/off value: {}", s))),
            },
        }
    }
}

impl Serialize for OnOff {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            OnOff::On => serializer.serialize_str("ON"),
            OnOff::Off => serializer.serialize_str("OFF"),
        }
    }
}

impl OnOff {
    pub fn is_on(&self) -> bool {
        matches!(self, OnOff::On)
    }
}
