use anyhow::{Context, Result};
use senxor_cmd_lib::{analysis::FrameGeometry, broker::FirmwareVersion};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of the `serve` device emulator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port of the command protocol.
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    /// Port streaming raw frames.
    #[serde(default = "default_frame_port")]
    pub frame_port: u16,
    #[serde(default)]
    pub geometry: FrameGeometry,
    /// Where split and burner settings are persisted.
    #[serde(default = "default_store_file")]
    pub store_file: PathBuf,
    /// Time between two synthetic frames.
    #[serde(default = "default_frame_interval", with = "humantime_serde")]
    pub frame_interval: Duration,
    #[serde(default)]
    pub version: FirmwareVersion,
    #[serde(default)]
    pub device_id: [u8; 6],
}

fn default_bind_address() -> String {
    String::from("0.0.0.0")
}

fn default_command_port() -> u16 {
    3334
}

fn default_frame_port() -> u16 {
    3333
}

fn default_store_file() -> PathBuf {
    PathBuf::from("senxor-analysis.yml")
}

fn default_frame_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            command_port: default_command_port(),
            frame_port: default_frame_port(),
            geometry: FrameGeometry::default(),
            store_file: default_store_file(),
            frame_interval: default_frame_interval(),
            version: FirmwareVersion::default(),
            device_id: [0; 6],
        }
    }
}

impl DeviceConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "senxor.yml";

    /// Loads the configuration, a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Config file {path:?} not found, using defaults");
            return Ok(Self::default());
        }
        log::debug!("Loading config file from {path:?}");
        let file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open config file {path:?}"))?;
        let config = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse config file {path:?}"))?;
        Ok(config)
    }
}
