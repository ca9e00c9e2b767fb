use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::frame::DEFAULT_MAX_FRAME_LENGTH;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutpostConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TcpConfig {
    pub enabled: bool,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Per-receive timeout; a timeout only re-arms the receive loop.
    pub recv_timeout_seconds: u64,
    pub max_frame_length: usize,
    pub welcome_message: String,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "tcp".to_string(),
            host: "0.0.0.0".to_string(),
            port: 4444,
            recv_timeout_seconds: 10,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            welcome_message: "Connected to Outpost".to_string(),
        }
    }
}

impl TcpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub payload_dir: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "http".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            payload_dir: "payloads".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_seconds: u64,
    pub idle_threshold_seconds: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            idle_threshold_seconds: 300,
        }
    }
}

impl OutpostConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }

    /// Like [`Self::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;
        s.try_deserialize()
    }
}
