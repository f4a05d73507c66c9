//! Configuration management.
//!
//! `Settings` is deserialized from a YAML file that enumerates the named
//! receiver and publisher instances of a deployment, plus the tuning
//! parameters the correlator exposes instead of hard-coding
//! (`readout_window` / `buffer_time`, both in hardware ticks).

use crate::error::DaqError;
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;

/// Default UDP port the hardware modules send data to.
pub const DEFAULT_LISTEN_PORT: u16 = 2009;
/// Default port assembled readouts are published on.
pub const DEFAULT_READOUT_PORT: u16 = 9004;
/// Default port monitoring records are pushed to.
pub const DEFAULT_MONITOR_PORT: u16 = 9005;
/// Default local-only control port.
pub const DEFAULT_CONTROL_PORT: u16 = 9006;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub receiver: ReceiverSettings,
    /// Named publish sinks the assembled readouts fan out to.
    #[serde(default)]
    pub sinks: HashMap<String, SinkSettings>,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverSettings {
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Fold out-of-range module indices back into range instead of failing.
    #[serde(default)]
    pub relaxed_ip_range: bool,
    /// Max timestamp distance (ticks) for two packets to share a readout.
    #[serde(default = "default_readout_window")]
    pub readout_window: u64,
    /// Minimum timestamp span (ticks) the buffer settles before the oldest
    /// partial readout is flushed.
    #[serde(default = "default_buffer_time")]
    pub buffer_time: u64,
    /// Hard cap on in-flight partial readouts.
    #[serde(default = "default_buffer_length")]
    pub buffer_length: usize,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Optional per-packet debug stream file (`tack arrival_ns module` rows).
    #[serde(default)]
    pub packet_debug_stream_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkSettings {
    /// TCP pub/sub broadcaster.
    Tcp { ip: String, port: u16 },
    /// Append-only framed raw file.
    File { path: String },
    /// Discards everything; placeholder for dry runs.
    Null,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_ip")]
    pub ip: String,
    #[serde(default = "default_monitor_port")]
    pub port: u16,
    /// Reporting interval in seconds.
    #[serde(default = "default_mon_wait")]
    pub mon_wait: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            ip: default_monitor_ip(),
            port: default_monitor_port(),
            mon_wait: default_mon_wait(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_readout_window() -> u64 {
    // 0.1 ms at 1 ns per tick.
    100_000
}

fn default_buffer_time() -> u64 {
    // 10 s at 1 ns per tick.
    10_000_000_000
}

fn default_buffer_length() -> usize {
    1000
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_monitor_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_monitor_port() -> u16 {
    DEFAULT_MONITOR_PORT
}

fn default_mon_wait() -> f64 {
    1.0
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            listen_port: default_listen_port(),
            relaxed_ip_range: false,
            readout_window: default_readout_window(),
            buffer_time: default_buffer_time(),
            buffer_length: default_buffer_length(),
            control_port: default_control_port(),
            packet_debug_stream_file: None,
        }
    }
}

impl Settings {
    /// All-defaults deployment with a single readout publisher on
    /// localhost. Used when no config file is given.
    pub fn default_local() -> Self {
        let mut sinks = HashMap::new();
        sinks.insert(
            "readouts".to_string(),
            SinkSettings::Tcp {
                ip: "127.0.0.1".to_string(),
                port: DEFAULT_READOUT_PORT,
            },
        );
        Self {
            log_level: default_log_level(),
            receiver: ReceiverSettings::default(),
            sinks,
            monitor: MonitorSettings::default(),
        }
    }

    /// Loads settings from a YAML file at `path`.
    pub fn from_file(path: &str) -> Result<Self, DaqError> {
        let s = Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(DaqError::Config)?;
        let settings: Settings = s.try_deserialize().map_err(DaqError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), DaqError> {
        if self.receiver.buffer_length == 0 {
            return Err(DaqError::Configuration(
                "receiver.buffer_length must be at least 1".into(),
            ));
        }
        if self.receiver.readout_window == 0 {
            return Err(DaqError::Configuration(
                "receiver.readout_window must be non-zero".into(),
            ));
        }
        if self.monitor.mon_wait <= 0.0 {
            return Err(DaqError::Configuration(
                "monitor.mon_wait must be positive".into(),
            ));
        }
        Ok(())
    }
}
