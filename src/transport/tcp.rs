// src/transport/tcp.rs - JSON-lines device link over TCP
use super::{ConnectivityError, DeviceLink, LinkSession, Telemetry, TelemetrySink};
use async_trait::async_trait;
use modax_shared::{decode_line, encode_line, CommandAck, ControlCommand, DeviceMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

type PendingAcks = Arc<Mutex<HashMap<Uuid, oneshot::Sender<CommandAck>>>>;

/// Commands go out as `{"type":"command",...}` lines; the reader task routes telemetry to the
/// sink and matches `ack` lines to waiting senders by command id.
pub struct TcpLink {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingAcks,
    reader: JoinHandle<()>,
}

impl TcpLink {
    pub async fn connect(
        device_id: &str,
        address: &str,
        telemetry: TelemetrySink,
    ) -> Result<LinkSession, ConnectivityError> {
        tracing::info!("Connecting to device {} at {}", device_id, address);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ConnectivityError::Connect { address: address.to_string(), source })?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, closed_rx) = oneshot::channel();
        let reader_pending = Arc::clone(&pending);
        let device = device_id.to_string();

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        tracing::trace!("{} RX: {}", device, line);
                        let message = match decode_line(&line) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!("Dropping malformed line from {}: {}", device, e);
                                continue;
                            }
                        };
                        if !route(&device, message, &telemetry, &reader_pending).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Device {} closed the connection", device);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Read error on device {}: {}", device, e);
                        break;
                    }
                }
            }
            // waiting senders observe a closed channel
            reader_pending.lock().await.clear();
            let _ = closed_tx.send(());
        });

        let link = TcpLink { writer: Mutex::new(write_half), pending, reader };
        Ok(LinkSession { link: Box::new(link), closed: closed_rx })
    }
}

/// Returns false once the telemetry sink is gone.
async fn route(
    device: &str,
    message: DeviceMessage,
    telemetry: &TelemetrySink,
    pending: &PendingAcks,
) -> bool {
    let frame = match message {
        DeviceMessage::Ack(ack) => {
            match pending.lock().await.remove(&ack.command_id) {
                Some(waiter) => {
                    let _ = waiter.send(ack);
                }
                None => tracing::warn!("Unsolicited ack from {} for {}", device, ack.command_id),
            }
            return true;
        }
        DeviceMessage::Sensor(s) => Telemetry::Sensor(s),
        DeviceMessage::Safety(s) => Telemetry::Safety(s),
        DeviceMessage::Command(c) => {
            tracing::warn!("Device {} sent a command ({}), ignoring", device, c.kind.name());
            return true;
        }
    };
    if frame.device_id() != device {
        tracing::warn!(
            "Telemetry for {} arrived on the link of {}, dropped",
            frame.device_id(),
            device
        );
        return true;
    }
    telemetry.send(frame).await.is_ok()
}

#[async_trait]
impl DeviceLink for TcpLink {
    async fn send(
        &self,
        command: &ControlCommand,
        timeout: Duration,
    ) -> Result<CommandAck, ConnectivityError> {
        let line = encode_line(&DeviceMessage::Command(command.clone()))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(command.id, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&command.id);
            return Err(ConnectivityError::Io(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ConnectivityError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&command.id);
                Err(ConnectivityError::Timeout(timeout))
            }
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
