// src/coordinator/mod.rs - Device registry and the public control surface
//
// Each registered device runs its own worker task (state, safety gate, audit, windows) and,
// when it has an address, a link task (connection, backoff, FIFO dispatch). The coordinator
// only routes: it never touches a device's state directly.

pub mod advisory;
pub mod backoff;
pub mod device;
pub mod link;
pub mod ring;

use crate::config::Config;
use crate::gcode::{
    parse_program_with_library, parse_stream, MacroLibrary, ParseError, ParserConfig, Program,
};
use crate::job::ProgramHandle;
use crate::transport::{LinkConnector, Telemetry};
use advisory::AdvisoryBridge;
use device::{DeviceHandle, DeviceRequest, DeviceStatus};
use futures::future::join_all;
use modax_shared::{CommandOutcome, CommandResult, ControlCommand};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::sync::{oneshot, RwLock};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("device '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("device '{0}' is busy")]
    Busy(String),
    #[error("worker for device '{0}' is gone")]
    WorkerGone(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("program rejected with {} error(s)", .0.len())]
    Parse(Vec<ParseError>),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("device '{0}' already has an active program")]
    Busy(String),
    #[error(transparent)]
    Unavailable(#[from] CoordinatorError),
}

struct Inner {
    config: Arc<Config>,
    connector: Arc<dyn LinkConnector>,
    advisory: Option<AdvisoryBridge>,
    devices: RwLock<HashMap<String, DeviceHandle>>,
    macros: MacroLibrary,
}

/// Cloneable handle to the device registry.
#[derive(Clone)]
pub struct DeviceCoordinator {
    inner: Arc<Inner>,
}

impl DeviceCoordinator {
    pub fn new(
        config: Config,
        connector: Arc<dyn LinkConnector>,
        advisory: Option<AdvisoryBridge>,
    ) -> Self {
        let macros = MacroLibrary::new(ParserConfig::from_config(&config));
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                connector,
                advisory,
                devices: RwLock::new(HashMap::new()),
                macros,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn macros(&self) -> &MacroLibrary {
        &self.inner.macros
    }

    /// Registers a device. Without an address the device only accepts pushed telemetry.
    pub async fn register(&self, id: &str, address: Option<&str>) -> Result<(), CoordinatorError> {
        let mut devices = self.inner.devices.write().await;
        if devices.contains_key(id) {
            return Err(CoordinatorError::AlreadyRegistered(id.to_string()));
        }
        let handle = self.spawn_device(id, address);
        devices.insert(id.to_string(), handle);
        Ok(())
    }

    /// Removes a device, cancelling its worker, link and reconnection immediately.
    pub async fn deregister(&self, id: &str) -> Result<(), CoordinatorError> {
        let removed = self.inner.devices.write().await.remove(id);
        match removed {
            Some(handle) => {
                drop(handle);
                if let Some(advisory) = &self.inner.advisory {
                    advisory.forget(id).await;
                }
                tracing::info!("Device {} deregistered", id);
                Ok(())
            }
            None => Err(CoordinatorError::UnknownDevice(id.to_string())),
        }
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Routes one telemetry frame. A device seen for the first time is created without a link.
    pub async fn ingest(&self, frame: Telemetry) {
        let id = frame.device_id().to_string();
        let sender = {
            let devices = self.inner.devices.read().await;
            devices.get(&id).map(|d| d.telemetry.clone())
        };
        let sender = match sender {
            Some(sender) => sender,
            None => {
                let mut devices = self.inner.devices.write().await;
                let handle = devices.entry(id.clone()).or_insert_with(|| {
                    tracing::info!("First telemetry from unknown device {}, creating it", id);
                    self.spawn_device(&id, None)
                });
                handle.telemetry.clone()
            }
        };
        if sender.send(frame).await.is_err() {
            tracing::warn!("Worker for {} gone, telemetry dropped", id);
        }
    }

    /// Runs one command through the device's safety gate. Always yields a result.
    pub async fn execute(&self, command: ControlCommand) -> CommandResult {
        let (respond_to, rx) = oneshot::channel();
        let request = DeviceRequest::Execute { command: command.clone(), respond_to };
        match self.request(&command.device_id, request, rx).await {
            Ok(result) => result,
            Err(e) => CommandResult::new(&command, CommandOutcome::Failed(e.to_string())),
        }
    }

    pub async fn status(&self, id: &str) -> Result<DeviceStatus, CoordinatorError> {
        let (respond_to, rx) = oneshot::channel();
        let mut status = self.request(id, DeviceRequest::Status { respond_to }, rx).await?;
        if let Some(advisory) = &self.inner.advisory {
            status.recommendation = advisory.latest(id).await;
        }
        Ok(status)
    }

    pub async fn statuses(&self) -> Vec<DeviceStatus> {
        let ids = self.device_ids().await;
        let results = join_all(ids.iter().map(|id| self.status(id))).await;
        ids.iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!("Status for {} unavailable: {}", id, e);
                    None
                }
            })
            .collect()
    }

    /// Parses and starts a program. Any parse error rejects the whole program.
    pub async fn submit_program(&self, id: &str, text: &str) -> Result<ProgramHandle, SubmitError> {
        self.ensure_known(id).await?;
        let library = self.inner.macros.snapshot().await;
        let config = ParserConfig::from_config(&self.inner.config);
        let program =
            parse_program_with_library(text, &config, &library).map_err(SubmitError::Parse)?;
        self.start(id, program).await
    }

    pub async fn submit_stream<R>(&self, id: &str, reader: R) -> Result<ProgramHandle, SubmitError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.ensure_known(id).await?;
        let library = self.inner.macros.snapshot().await;
        let config = ParserConfig::from_config(&self.inner.config);
        let program = parse_stream(reader, &config, &library).await.map_err(SubmitError::Parse)?;
        self.start(id, program).await
    }

    /// Cancels the active program. Returns false when none was running.
    pub async fn cancel_program(&self, id: &str) -> Result<bool, CoordinatorError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(id, DeviceRequest::CancelProgram { respond_to }, rx).await
    }

    async fn start(&self, id: &str, program: Program) -> Result<ProgramHandle, SubmitError> {
        tracing::debug!("Program for {} parsed: {} instructions", id, program.len());
        let (respond_to, rx) = oneshot::channel();
        let request = DeviceRequest::StartProgram { program: Arc::new(program), respond_to };
        self.request(id, request, rx).await?
    }

    async fn ensure_known(&self, id: &str) -> Result<(), SubmitError> {
        if self.inner.devices.read().await.contains_key(id) {
            Ok(())
        } else {
            Err(SubmitError::UnknownDevice(id.to_string()))
        }
    }

    fn spawn_device(&self, id: &str, address: Option<&str>) -> DeviceHandle {
        device::spawn(
            id,
            address,
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.connector),
            self.inner.advisory.clone(),
        )
    }

    async fn request<T>(
        &self,
        id: &str,
        request: DeviceRequest,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, CoordinatorError> {
        let sender = {
            let devices = self.inner.devices.read().await;
            devices.get(id).map(|d| d.requests.clone())
        };
        let Some(sender) = sender else {
            return Err(CoordinatorError::UnknownDevice(id.to_string()));
        };
        sender.send(request).await.map_err(|_| CoordinatorError::WorkerGone(id.to_string()))?;
        rx.await.map_err(|_| CoordinatorError::WorkerGone(id.to_string()))
    }
}
