// src/transport/mod.rs - Device links: how commands reach a machine and telemetry comes back
pub mod loopback;
pub mod tcp;

use async_trait::async_trait;
use modax_shared::{CommandAck, ControlCommand, SafetyFrame, SensorSample, WireError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use loopback::LoopbackLink;
pub use tcp::TcpLink;

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link closed")]
    Closed,
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Codec(#[from] WireError),
    #[error("reconnection abandoned after {0} attempts")]
    GaveUp(u32),
}

/// Telemetry as it arrives from a link, before the device worker sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Sensor(SensorSample),
    Safety(SafetyFrame),
}

impl Telemetry {
    pub fn device_id(&self) -> &str {
        match self {
            Telemetry::Sensor(s) => &s.device_id,
            Telemetry::Safety(s) => &s.device_id,
        }
    }
}

pub type TelemetrySink = mpsc::Sender<Telemetry>;

/// An open connection to one device.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Writes one command and waits for its acknowledgement.
    async fn send(
        &self,
        command: &ControlCommand,
        timeout: Duration,
    ) -> Result<CommandAck, ConnectivityError>;
}

pub struct LinkSession {
    pub link: Box<dyn DeviceLink>,
    /// Resolves (or errors) when the underlying connection is gone.
    pub closed: oneshot::Receiver<()>,
}

#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(
        &self,
        device_id: &str,
        address: &str,
        telemetry: TelemetrySink,
    ) -> Result<LinkSession, ConnectivityError>;
}

/// Connects `loopback`, `loopback:silent` and `host:port` addresses.
#[derive(Debug, Clone)]
pub struct DefaultLinkConnector {
    pub sensor_interval: Duration,
    pub safety_interval: Duration,
}

impl DefaultLinkConnector {
    pub fn from_config(config: &crate::config::CoordinatorConfig) -> Self {
        Self {
            sensor_interval: Duration::from_millis(config.sensor_interval_ms),
            safety_interval: Duration::from_millis(config.safety_interval_ms),
        }
    }
}

#[async_trait]
impl LinkConnector for DefaultLinkConnector {
    async fn connect(
        &self,
        device_id: &str,
        address: &str,
        telemetry: TelemetrySink,
    ) -> Result<LinkSession, ConnectivityError> {
        let intervals = (self.sensor_interval, self.safety_interval);
        match address {
            "loopback" => Ok(LoopbackLink::open(device_id, telemetry, Some(intervals))),
            "loopback:silent" => Ok(LoopbackLink::open(device_id, telemetry, None)),
            _ => TcpLink::connect(device_id, address, telemetry).await,
        }
    }
}
