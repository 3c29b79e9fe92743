//! Configuration for the MeshSpy daemon.
//!
//! Values come from a JSON5 file, then environment variables, then CLI
//! flags, each layer overriding the previous one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use meshspy_bus::topic::{validate_filter, validate_topic};
use meshspy_bus::{BusConfig, BusError, DEFAULT_RAW_TOPIC, DEFAULT_TELEMETRY_TOPIC};
use meshspy_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "meshspy.json5";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] meshspy_common::Error),

    #[error("Invalid bus settings: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid value for {name}: '{value}'")]
    Env { name: &'static str, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSpyConfig {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub topics: TopicsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub device_info: DeviceInfoConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// How long the flows get to finish after shutdown starts, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Serial device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g., "/dev/ttyUSB0")
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Mirror every device line to the log
    #[serde(default)]
    pub debug: bool,

    /// Seconds between reopen attempts after the device is lost (0 = stop)
    #[serde(default = "default_reopen_interval_secs")]
    pub reopen_interval_secs: u64,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_reopen_interval_secs() -> u64 {
    5
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            debug: false,
            reopen_interval_secs: default_reopen_interval_secs(),
        }
    }
}

impl SerialConfig {
    pub fn reopen_interval(&self) -> Option<Duration> {
        match self.reopen_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Bus topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Where raw device lines are published
    #[serde(default = "default_raw_topic")]
    pub raw: String,

    /// Subscription filter for encoded node telemetry
    #[serde(default = "default_telemetry_topic")]
    pub telemetry: String,
}

fn default_raw_topic() -> String {
    DEFAULT_RAW_TOPIC.to_string()
}

fn default_telemetry_topic() -> String {
    DEFAULT_TELEMETRY_TOPIC.to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            raw: default_raw_topic(),
            telemetry: default_telemetry_topic(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file, created if missing
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("meshspy.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// External device-info helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_info_command")]
    pub command: String,

    #[serde(default = "default_info_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_info_command() -> String {
    "/usr/local/bin/meshtastic-go".to_string()
}

fn default_info_timeout_secs() -> u64 {
    10
}

impl Default for DeviceInfoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_info_command(),
            timeout_secs: default_info_timeout_secs(),
        }
    }
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

impl Default for MeshSpyConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            bus: BusConfig::default(),
            topics: TopicsConfig::default(),
            storage: StorageConfig::default(),
            device_info: DeviceInfoConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl MeshSpyConfig {
    /// Load from a JSON5 file. Does not apply overrides or validate.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(meshspy_common::load_config(path)?)
    }

    /// Find the configuration file: the explicit path if given, else
    /// `./meshspy.json5`, else `<config dir>/meshspy/meshspy.json5`.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }

        dirs::config_dir()
            .map(|dir| dir.join("meshspy").join(CONFIG_FILE_NAME))
            .filter(|path| path.is_file())
    }

    /// Apply overrides from environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SERIAL_PORT") {
            self.serial.port = port;
        }
        if let Some(value) = lookup("BAUD_RATE") {
            self.serial.baud_rate = value.trim().parse().map_err(|_| ConfigError::Env {
                name: "BAUD_RATE",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("DEBUG") {
            self.serial.debug = parse_flag(&value).ok_or(ConfigError::Env {
                name: "DEBUG",
                value: value.clone(),
            })?;
        }
        if let Some(broker) = lookup("MQTT_BROKER") {
            self.bus.broker = broker;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            self.bus.client_id = client_id;
        }
        if let Some(topic) = lookup("MQTT_TOPIC") {
            self.topics.raw = topic;
        }
        if let Some(topic) = lookup("MQTT_TELEMETRY_TOPIC") {
            self.topics.telemetry = topic;
        }
        if let Some(path) = lookup("DB_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::Validation(
                "serial.port cannot be empty".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Validation(
                "serial.baud_rate must be positive".to_string(),
            ));
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "storage.path cannot be empty".to_string(),
            ));
        }

        validate_topic(&self.topics.raw)?;
        validate_filter(&self.topics.telemetry)?;
        self.bus.validate()?;

        if self.device_info.enabled && self.device_info.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "device_info.command cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
