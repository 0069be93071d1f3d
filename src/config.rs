//! # Supervisor Configuration
//!
//! Every section and field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [interpreter]
//! max_call_depth = 16
//!
//! [motion]
//! rapid_rate = 24000.0
//! soft_limits = { min = [-500.0, -500.0, -300.0], max = [500.0, 500.0, 0.0] }
//!
//! [[tools.entries]]
//! number = 1
//! length = 42.5
//! radius = 3.0
//! kind = "end_mill"
//!
//! [[devices]]
//! id = "mill-1"
//! address = "10.0.0.21:7000"
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the supervisory host.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub coordinates: CoordinatesConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub advisory: AdvisoryConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterpreterConfig {
    /// Bound on GOSUB, M98 and G65 frames combined.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Bound on nested G65 macro calls.
    #[serde(default = "default_max_macro_depth")]
    pub max_macro_depth: usize,
    /// Runaway-loop guard.
    #[serde(default = "default_max_executed_blocks")]
    pub max_executed_blocks: u64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_call_depth: default_max_call_depth(),
            max_macro_depth: default_max_macro_depth(),
            max_executed_blocks: default_max_executed_blocks(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SoftLimits {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    /// Arc endpoint tolerance in programmed units.
    #[serde(default = "default_arc_tolerance")]
    pub arc_tolerance: f64,
    /// Rapid traverse rate in mm/min.
    #[serde(default = "default_rapid_rate")]
    pub rapid_rate: f64,
    #[serde(default = "default_override_min")]
    pub override_min: f64,
    #[serde(default = "default_override_max")]
    pub override_max: f64,
    #[serde(default)]
    pub soft_limits: Option<SoftLimits>,
    /// Upper bound on pecks a single G73/G83 hole may expand into.
    #[serde(default = "default_max_pecks_per_hole")]
    pub max_pecks_per_hole: usize,
    /// G73 chip-break retract distance in millimetres.
    #[serde(default = "default_peck_retract")]
    pub peck_retract: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            arc_tolerance: default_arc_tolerance(),
            rapid_rate: default_rapid_rate(),
            override_min: default_override_min(),
            override_max: default_override_max(),
            soft_limits: None,
            max_pecks_per_hole: default_max_pecks_per_hole(),
            peck_retract: default_peck_retract(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolEntryConfig {
    pub number: u32,
    #[serde(default)]
    pub length: f64,
    #[serde(default)]
    pub radius: f64,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default = "default_table_size")]
    pub table_size: u32,
    #[serde(default)]
    pub entries: Vec<ToolEntryConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self { table_size: default_table_size(), entries: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatesConfig {
    /// Number of extended work systems selectable with `G54.1 Pn`.
    #[serde(default = "default_extended_systems")]
    pub extended_systems: u16,
    /// Initial work offsets keyed by system name ("G54", "G59.1", "P3").
    #[serde(default)]
    pub offsets: BTreeMap<String, [f64; 3]>,
}

impl Default for CoordinatesConfig {
    fn default() -> Self {
        Self { extended_systems: default_extended_systems(), offsets: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_sensor_interval_ms")]
    pub sensor_interval_ms: u64,
    #[serde(default = "default_safety_interval_ms")]
    pub safety_interval_ms: u64,
    /// Telemetry older than this many safety intervals is stale.
    #[serde(default = "default_staleness_factor")]
    pub staleness_factor: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Consecutive failed connects after which the device is reported Degraded.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            ring_capacity: default_ring_capacity(),
            sensor_interval_ms: default_sensor_interval_ms(),
            safety_interval_ms: default_safety_interval_ms(),
            staleness_factor: default_staleness_factor(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            command_timeout_ms: default_command_timeout_ms(),
            audit_capacity: default_audit_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdvisoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `host:port` of the analytics service; none means no advisory tier.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_advisory_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: None,
            timeout_ms: default_advisory_timeout_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_port() }
    }
}

/// Statically registered device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: String,
    /// `host:port`, `loopback` or `loopback:silent`.
    pub address: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.motion;
        if !(m.arc_tolerance > 0.0) {
            return Err(ConfigError::Invalid("motion.arc_tolerance must be > 0".into()));
        }
        if !(m.rapid_rate > 0.0) {
            return Err(ConfigError::Invalid("motion.rapid_rate must be > 0".into()));
        }
        if m.override_min < 0.0 || m.override_min > m.override_max {
            let reason = "motion override range must satisfy 0 <= min <= max";
            return Err(ConfigError::Invalid(reason.into()));
        }
        if m.max_pecks_per_hole == 0 {
            return Err(ConfigError::Invalid("motion.max_pecks_per_hole must be > 0".into()));
        }
        if !m.peck_retract.is_finite() || m.peck_retract < 0.0 {
            return Err(ConfigError::Invalid("motion.peck_retract must be >= 0".into()));
        }
        if let Some(limits) = &m.soft_limits {
            if (0..3).any(|i| limits.min[i] > limits.max[i]) {
                return Err(ConfigError::Invalid("motion.soft_limits min exceeds max".into()));
            }
        }
        if self.tools.table_size == 0 {
            return Err(ConfigError::Invalid("tools.table_size must be > 0".into()));
        }
        let size = self.tools.table_size;
        if let Some(entry) = self.tools.entries.iter().find(|e| e.number == 0 || e.number > size) {
            let reason = format!("tool {} outside table 1..{}", entry.number, size);
            return Err(ConfigError::Invalid(reason));
        }
        let c = &self.coordinator;
        if c.window_secs == 0 || c.ring_capacity == 0 {
            let reason = "coordinator window and ring capacity must be > 0";
            return Err(ConfigError::Invalid(reason.into()));
        }
        if c.sensor_interval_ms == 0 || c.safety_interval_ms == 0 || c.staleness_factor == 0 {
            return Err(ConfigError::Invalid("coordinator sample intervals must be > 0".into()));
        }
        let backoff_ok = c.backoff_multiplier >= 1
            && c.backoff_initial_ms > 0
            && c.backoff_cap_ms >= c.backoff_initial_ms;
        if !backoff_ok {
            let reason = "coordinator backoff settings are inconsistent";
            return Err(ConfigError::Invalid(reason.into()));
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::Invalid(format!("device '{}' listed twice", device.id)));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_max_call_depth() -> usize { 16 }
fn default_max_macro_depth() -> usize { 8 }
fn default_max_executed_blocks() -> u64 { 100_000 }
fn default_arc_tolerance() -> f64 { 1e-4 }
fn default_rapid_rate() -> f64 { 30_000.0 }
fn default_override_min() -> f64 { 0.0 }
fn default_override_max() -> f64 { 150.0 }
fn default_max_pecks_per_hole() -> usize { 1000 }
fn default_peck_retract() -> f64 { 0.5 }
fn default_table_size() -> u32 { 24 }
fn default_extended_systems() -> u16 { 48 }
fn default_window_secs() -> u64 { 10 }
fn default_ring_capacity() -> usize { 1000 }
fn default_sensor_interval_ms() -> u64 { 100 }
fn default_safety_interval_ms() -> u64 { 50 }
fn default_staleness_factor() -> u32 { 3 }
fn default_backoff_initial_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> u32 { 2 }
fn default_backoff_cap_ms() -> u64 { 60_000 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_command_timeout_ms() -> u64 { 5000 }
fn default_audit_capacity() -> usize { 256 }
fn default_true() -> bool { true }
fn default_advisory_timeout_ms() -> u64 { 5000 }
fn default_queue_depth() -> usize { 64 }
fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }

/// Load and validate configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
