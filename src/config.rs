//! Runtime configuration
//!
//! Configuration is read from YAML. Every field has a default, so an empty
//! document is a valid configuration:
//!
//! ```yaml
//! pipeline:
//!   program: gst-launch-1.0
//!   args: ["-e"]
//!   sink_port: 5000
//!   boundary: ThisRandomString
//!   shutdown_grace_ms: 2000
//! logs:
//!   pipeline_capacity: 50
//!   relay_capacity: 100
//! devices:
//!   300434063839690: 3
//!   "300434063833730": 7
//! ```
//!
//! Device identifiers may be written bare or quoted; YAML would otherwise read
//! long IMEIs as integers.

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::demux::{DEFAULT_BOUNDARY, DEFAULT_MAX_FRAME_BYTES};
use crate::launcher::PipelineCommand;
use crate::relay_log::{PIPELINE_LOG_CAPACITY, RELAY_LOG_CAPACITY};
use crate::telemetry::DeviceRegistry;
use crate::{RelayError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub pipeline: PipelineConfig,
    pub logs: LogConfig,
    /// Device identifier to logical system id
    #[serde(deserialize_with = "device_table")]
    pub devices: BTreeMap<String, u32>,
}

/// External video pipeline settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Program to launch
    pub program: String,
    /// Arguments placed before the operator's pipeline description
    pub args: Vec<String>,
    /// Encode/mux/sink elements appended after the operator's description.
    /// `{host}`, `{port}` and `{boundary}` are substituted.
    pub suffix: String,
    /// Loopback address the pipeline's TCP sink listens on
    pub sink_host: Ipv4Addr,
    pub sink_port: u16,
    /// Multipart boundary token shared by the muxer and the demuxer
    pub boundary: String,
    /// How long the feeder keeps retrying the sink before giving up
    pub connect_timeout_ms: u64,
    pub connect_retry_ms: u64,
    /// Time allowed between the termination signal and a forced kill
    pub shutdown_grace_ms: u64,
    pub read_chunk_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: "gst-launch-1.0".to_string(),
            args: vec!["-e".to_string()],
            suffix: "! videoconvert ! jpegenc ! multipartmux boundary={boundary} \
                     ! tcpserversink host={host} port={port}"
                .to_string(),
            sink_host: Ipv4Addr::LOCALHOST,
            sink_port: 5000,
            boundary: DEFAULT_BOUNDARY.to_string(),
            connect_timeout_ms: 10_000,
            connect_retry_ms: 250,
            shutdown_grace_ms: 2_000,
            read_chunk_bytes: 16 * 1024,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl PipelineConfig {
    /// Address of the pipeline's sink, always explicit IPv4
    pub fn sink_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.sink_host, self.sink_port))
    }

    /// Build the command line for an operator-supplied pipeline description
    ///
    /// The description and the rendered suffix are split on whitespace; no
    /// shell is involved.
    pub fn command_for(&self, pipeline: &str) -> PipelineCommand {
        let suffix = self
            .suffix
            .replace("{host}", &self.sink_host.to_string())
            .replace("{port}", &self.sink_port.to_string())
            .replace("{boundary}", &self.boundary);

        let args = self
            .args
            .iter()
            .cloned()
            .chain(pipeline.split_whitespace().map(str::to_string))
            .chain(suffix.split_whitespace().map(str::to_string))
            .collect();

        PipelineCommand { program: self.program.clone(), args }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(RelayError::config("pipeline.program", "must not be empty"));
        }
        if self.sink_port == 0 {
            return Err(RelayError::config("pipeline.sink_port", "must be a fixed, non-zero port"));
        }
        if self.boundary.is_empty() || self.boundary.contains(char::is_whitespace) {
            return Err(RelayError::config(
                "pipeline.boundary",
                format!("'{}' must be non-empty without whitespace", self.boundary),
            ));
        }
        if self.connect_retry_ms == 0 {
            return Err(RelayError::config("pipeline.connect_retry_ms", "must be positive"));
        }
        if self.read_chunk_bytes == 0 {
            return Err(RelayError::config("pipeline.read_chunk_bytes", "must be positive"));
        }
        if self.max_frame_bytes == 0 {
            return Err(RelayError::config("pipeline.max_frame_bytes", "must be positive"));
        }
        Ok(())
    }
}

/// Diagnostic buffer sizes
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub pipeline_capacity: usize,
    pub relay_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { pipeline_capacity: PIPELINE_LOG_CAPACITY, relay_capacity: RELAY_LOG_CAPACITY }
    }
}

impl RelayConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RelayConfig = if yaml.trim().is_empty() {
            RelayConfig::default()
        } else {
            serde_yaml_ng::from_str(yaml).map_err(|e| {
                RelayError::config("YAML deserialization", format!("parsing failed: {e}"))
            })?
        };

        config.validate()?;
        debug!(
            program = %config.pipeline.program,
            sink = %config.pipeline.sink_addr(),
            devices = config.devices.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()
    }

    /// Build the device registry from the configured table
    pub fn registry(&self) -> DeviceRegistry {
        DeviceRegistry::new(self.devices.iter().map(|(id, system_id)| (id.as_str(), *system_id)))
    }
}

#[derive(Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(untagged)]
enum DeviceKey {
    Number(u64),
    Text(String),
}

fn device_table<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<DeviceKey, u32>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, system_id)| match key {
            DeviceKey::Number(n) => (n.to_string(), system_id),
            DeviceKey::Text(s) => (s, system_id),
        })
        .collect())
}
