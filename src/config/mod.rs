use serde::Deserialize;
use std::path::Path;

use crate::actor::{Mode, Transport};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4726;
pub const DEFAULT_MESSAGE: &str = "message\n";
pub const DEFAULT_RECV_BUFFER: usize = 65536;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub fleet: FleetConfig,
    pub payload: PayloadConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FleetConfig {
    pub size: usize,
    pub stagger_ms: u64,
    pub transport: Transport,
    pub mode: Mode,
    /// Run length in seconds; absent means run until Ctrl-C.
    pub duration_secs: Option<u64>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            size: 10,
            stagger_ms: 100,
            transport: Transport::Tcp,
            mode: Mode::FullDuplex,
            duration_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PayloadConfig {
    pub message: String,
    pub recv_buffer: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            message: DEFAULT_MESSAGE.to_string(),
            recv_buffer: DEFAULT_RECV_BUFFER,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReportConfig {
    pub interval_secs: u64,
    pub unit: ReportUnit,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            unit: ReportUnit::Messages,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportUnit {
    /// Rates divided by the message length.
    Messages,
    /// Raw byte rates.
    Bytes,
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads the file if it exists, otherwise falls back to compiled-in
    /// defaults.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target.host, self.target.port)
    }

    /// Bytes per reported unit for the aggregator.
    pub fn unit_size(&self) -> u64 {
        match self.report.unit {
            ReportUnit::Messages => self.payload.message.len().max(1) as u64,
            ReportUnit::Bytes => 1,
        }
    }
}
