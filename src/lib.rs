//! Ground station relay for drone telemetry and live video.
//!
//! Skyrelay is the backend between a drone fleet and its operators:
//!
//! - **Satellite telemetry**: hex payloads relayed from a satellite modem are
//!   decoded into position/kinematics records and attributed to a vehicle
//! - **Pipeline sessions**: one external video pipeline at a time, supervised
//!   from spawn to teardown, with its MJPEG output demuxed into frames
//! - **Live view**: raw tails of the pipeline's multipart output, relayed
//!   byte for byte
//! - **Diagnostics**: bounded logs of pipeline output and relay traffic
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use skyrelay::{GroundStation, RelayConfig, UpdateRate};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let station = GroundStation::with_command_launcher(RelayConfig::load("skyrelay.yaml")?);
//!
//!     let payload = "00".repeat(39);
//!     let record = station.ingest().ingest_relay(&payload, Some("300434063839690"))?;
//!     println!("vehicle {} at {}, {}", record.system_id, record.latitude, record.longitude);
//!
//!     station.session().start("videotestsrc is-live=true").await?;
//!     let mut frames = station.session().frames(UpdateRate::Max(10));
//!     if let Some(frame) = frames.next().await {
//!         println!("frame {} ({} bytes)", frame.sequence, frame.len());
//!     }
//!     station.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod relay_log;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Telemetry path
pub mod telemetry;

// Video path
pub mod demux;
pub mod launcher;
pub mod launchers;
pub mod proxy;
pub mod session;
pub mod stream;

// Core exports
pub use config::{LogConfig, PipelineConfig, RelayConfig};
pub use error::*;
pub use relay_log::RelayLog;
pub use types::*;

// Telemetry exports
pub use telemetry::{DeviceRegistry, PositionBoard, TelemetryIngest};

// Video exports
pub use demux::FrameDemuxer;
pub use launcher::{Launcher, PipelineCommand, PipelineProcess};
pub use launchers::CommandLauncher;
pub use proxy::{StreamProxy, Tail};
pub use session::{PipelineSession, SessionState};

use std::sync::Arc;
use tracing::info;

/// Everything one ground station service needs, wired together.
///
/// Construct one per process and hand out references to request handlers.
/// All handles are cheap to clone and share state.
///
/// # Examples
///
/// ```rust
/// use skyrelay::{GroundStation, RelayConfig};
///
/// let station = GroundStation::with_command_launcher(RelayConfig::default());
/// assert!(!station.session().is_running());
/// assert!(station.ingest().board().latest().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct GroundStation {
    config: Arc<RelayConfig>,
    ingest: TelemetryIngest,
    session: PipelineSession,
    proxy: StreamProxy,
}

impl GroundStation {
    /// Wire up a station that launches pipelines through `launcher`.
    pub fn new(config: RelayConfig, launcher: Arc<dyn Launcher>) -> Self {
        let relay_log = RelayLog::new(config.logs.relay_capacity);
        let pipeline_log = RelayLog::new(config.logs.pipeline_capacity);

        let ingest = TelemetryIngest::new(config.registry(), PositionBoard::new(), relay_log);
        let session = PipelineSession::new(config.pipeline.clone(), launcher, pipeline_log);
        let proxy = StreamProxy::new(session.clone());

        info!(
            sink = %config.pipeline.sink_addr(),
            devices = config.devices.len(),
            "Ground station ready"
        );

        Self { config: Arc::new(config), ingest, session, proxy }
    }

    /// Wire up a station that spawns the configured pipeline program.
    pub fn with_command_launcher(config: RelayConfig) -> Self {
        Self::new(config, Arc::new(CommandLauncher::new()))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Satellite and direct telemetry intake
    pub fn ingest(&self) -> &TelemetryIngest {
        &self.ingest
    }

    /// The single pipeline session
    pub fn session(&self) -> &PipelineSession {
        &self.session
    }

    /// Live view tails onto the running pipeline
    pub fn proxy(&self) -> &StreamProxy {
        &self.proxy
    }

    /// Pipeline output and lifecycle lines
    pub fn pipeline_log(&self) -> &RelayLog {
        self.session.log()
    }

    /// Relay traffic summaries
    pub fn relay_log(&self) -> &RelayLog {
        self.ingest.log()
    }

    /// Stop the pipeline, if one is running.
    pub async fn shutdown(&self) {
        self.session.stop().await;
        info!("Ground station shut down");
    }
}
