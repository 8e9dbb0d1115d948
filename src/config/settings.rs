//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Where to write the tool manifest at startup, if anywhere.
    #[serde(default)]
    pub tools_manifest_path: Option<PathBuf>,

    /// Network-facing settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Transport Bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Host tick scheduling settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Headless scene limits.
    #[serde(default)]
    pub scene: SceneConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::ValidationError { message });

        if self.server.max_connections == 0 {
            return fail("server.max_connections must be at least 1".into());
        }
        if self.server.max_frame_bytes < 16 {
            return fail(format!(
                "server.max_frame_bytes must be at least 16 (got {})",
                self.server.max_frame_bytes
            ));
        }
        if self.bridge.call_timeout_ms == 0 {
            return fail("bridge.call_timeout_ms must be greater than 0".into());
        }
        if self.bridge.max_pending_per_session == 0 {
            return fail("bridge.max_pending_per_session must be at least 1".into());
        }
        if self.scheduler.tick_interval_ms == 0 {
            return fail("scheduler.tick_interval_ms must be greater than 0".into());
        }
        if self.scheduler.max_calls_per_tick == 0 {
            return fail("scheduler.max_calls_per_tick must be at least 1".into());
        }
        if let Err(e) = regex::Regex::new(&self.scene.object_name_pattern) {
            return fail(format!("scene.object_name_pattern is not a valid regex: {e}"));
        }
        Ok(())
    }
}

/// Which client-facing transport the server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One envelope per WebSocket text message.
    Websocket,
    /// Length-prefixed envelopes over TCP.
    Framed,
    /// Length-prefixed envelopes over stdin/stdout.
    Stdio,
}

/// Network-facing server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Transport variant.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Bind address for socket transports.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port for socket transports.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum simultaneously connected clients.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest accepted envelope, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

const fn default_transport() -> TransportKind {
    TransportKind::Websocket
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    9876
}

const fn default_max_connections() -> usize {
    10
}

const fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

/// Transport Bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Per-call deadline, measured from submission.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Outstanding `callTool` ceiling per session.
    #[serde(default = "default_max_pending")]
    pub max_pending_per_session: usize,

    /// How long the host keeps draining queued calls on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl BridgeConfig {
    /// The per-call timeout as a [`Duration`].
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// The shutdown drain window as a [`Duration`].
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            max_pending_per_session: default_max_pending(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

const fn default_call_timeout_ms() -> u64 {
    5_000
}

const fn default_max_pending() -> usize {
    64
}

const fn default_shutdown_grace_ms() -> u64 {
    2_000
}

/// Host tick configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Interval between host ticks for the headless host loop.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Descriptors drained per tick.
    #[serde(default = "default_max_calls_per_tick")]
    pub max_calls_per_tick: usize,

    /// Maximum depth of inline nested tool calls.
    #[serde(default = "default_max_nested_depth")]
    pub max_nested_depth: usize,
}

impl SchedulerConfig {
    /// The tick interval as a [`Duration`].
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_calls_per_tick: default_max_calls_per_tick(),
            max_nested_depth: default_max_nested_depth(),
        }
    }
}

const fn default_tick_interval_ms() -> u64 {
    10
}

const fn default_max_calls_per_tick() -> usize {
    1
}

const fn default_max_nested_depth() -> usize {
    8
}

/// Limits applied by the headless scene host.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneConfig {
    /// Maximum number of objects in the scene.
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,

    /// Pattern every user-supplied object name must match.
    #[serde(default = "default_object_name_pattern")]
    pub object_name_pattern: String,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            max_objects: default_max_objects(),
            object_name_pattern: default_object_name_pattern(),
        }
    }
}

const fn default_max_objects() -> usize {
    1000
}

fn default_object_name_pattern() -> String {
    r"^[A-Za-z0-9_\-\.]+$".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.transport, TransportKind::Websocket);
        assert_eq!(config.bridge.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "tools_manifest_path": "/tmp/tools.json",
            "server": {
                "transport": "framed",
                "host": "0.0.0.0",
                "port": 7000,
                "max_connections": 4,
                "max_frame_bytes": 1024
            },
            "bridge": {
                "call_timeout_ms": 250,
                "max_pending_per_session": 8,
                "shutdown_grace_ms": 100
            },
            "scheduler": {
                "tick_interval_ms": 5,
                "max_calls_per_tick": 4,
                "max_nested_depth": 2
            },
            "scene": {
                "max_objects": 10,
                "object_name_pattern": "^[a-z]+$"
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.tools_manifest_path,
            Some(PathBuf::from("/tmp/tools.json"))
        );
        assert_eq!(config.server.transport, TransportKind::Framed);
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.bridge.call_timeout(), Duration::from_millis(250));
        assert_eq!(config.bridge.max_pending_per_session, 8);
        assert_eq!(config.scheduler.max_calls_per_tick, 4);
        assert_eq!(config.scene.max_objects, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn bridge_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.call_timeout_ms, 5_000);
        assert_eq!(config.max_pending_per_session, 64);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_calls_per_tick, 1);
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
    }

    #[test]
    fn logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "warn");
    }

    #[test]
    fn reject_zero_timeout() {
        let json = r#"{ "bridge": { "call_timeout_ms": 0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_bad_name_pattern() {
        let json = r#"{ "scene": { "object_name_pattern": "([" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_transport() {
        let json = r#"{ "server": { "transport": "carrier-pigeon" } }"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
