// src/coordinator/link.rs - Connection supervisor: reconnects with backoff, dispatches FIFO
use super::backoff::Backoff;
use super::device::{ConnectionState, DeviceRequest};
use crate::config::CoordinatorConfig;
use crate::safety::{Allow, SafetyEpoch};
use crate::transport::{ConnectivityError, DeviceLink, LinkConnector, TelemetrySink};
use modax_shared::{CommandOutcome, CommandResult, ControlCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// An authorized command waiting for the wire.
pub struct LinkJob {
    pub command: ControlCommand,
    pub allow: Allow,
    pub respond_to: oneshot::Sender<CommandResult>,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    State(ConnectionState),
    Failed(String),
}

pub struct LinkSupervisor {
    pub device_id: String,
    pub address: String,
    pub connector: Arc<dyn LinkConnector>,
    pub telemetry: TelemetrySink,
    pub worker: mpsc::Sender<DeviceRequest>,
    pub jobs: mpsc::Receiver<LinkJob>,
    pub epoch: SafetyEpoch,
    pub config: CoordinatorConfig,
}

enum Session {
    /// Connection dropped; `Some` is a job whose write failed and must be retried first.
    Lost(Option<LinkJob>),
    /// Every handle to the worker is gone.
    Stopped,
}

impl LinkSupervisor {
    pub async fn run(mut self) {
        let mut backoff = Backoff::from_config(&self.config);
        let mut retry: Option<LinkJob> = None;
        loop {
            if !self.notify(LinkEvent::State(ConnectionState::Connecting)).await {
                return;
            }
            let telemetry = self.telemetry.clone();
            match self.connector.connect(&self.device_id, &self.address, telemetry).await {
                Ok(session) => {
                    backoff.reset();
                    tracing::info!("Device {} connected", self.device_id);
                    if !self.notify(LinkEvent::State(ConnectionState::Connected)).await {
                        return;
                    }
                    match self.serve(session.link.as_ref(), session.closed, retry.take()).await {
                        Session::Lost(job) => {
                            retry = job;
                            tracing::warn!("Device {} disconnected", self.device_id);
                            if !self.notify(LinkEvent::State(ConnectionState::Disconnected)).await {
                                return;
                            }
                        }
                        Session::Stopped => return,
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    let failures = backoff.failures();
                    let degraded = failures >= self.config.max_reconnect_attempts;
                    if degraded {
                        tracing::error!(
                            "Device {} unreachable after {} attempts: {}",
                            self.device_id,
                            failures,
                            e
                        );
                        let reason = ConnectivityError::GaveUp(failures).to_string();
                        if !self.notify(LinkEvent::Failed(reason.clone())).await {
                            return;
                        }
                        if let Some(job) = retry.take() {
                            complete(&self.worker, job, CommandOutcome::Failed(reason)).await;
                        }
                    } else {
                        tracing::warn!(
                            "Connect to {} failed ({}), retrying in {:?}",
                            self.device_id,
                            e,
                            delay
                        );
                        if !self.notify(LinkEvent::State(ConnectionState::Disconnected)).await {
                            return;
                        }
                    }
                    if !self.wait(delay, degraded).await {
                        return;
                    }
                }
            }
        }
    }

    async fn notify(&self, event: LinkEvent) -> bool {
        self.worker.send(DeviceRequest::Link(event)).await.is_ok()
    }

    /// Sleeps before the next connect. Jobs stay queued, unless the device is degraded, in
    /// which case they fail immediately. Returns false when the job queue is closed.
    async fn wait(&mut self, delay: Duration, degraded: bool) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        if !degraded {
            sleep.await;
            return true;
        }
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                job = self.jobs.recv() => match job {
                    Some(job) => {
                        let reason = "device degraded: link unavailable";
                        let outcome = CommandOutcome::Failed(reason.into());
                        complete(&self.worker, job, outcome).await
                    }
                    None => return false,
                },
            }
        }
    }

    async fn serve(
        &mut self,
        link: &dyn DeviceLink,
        mut closed: oneshot::Receiver<()>,
        retry: Option<LinkJob>,
    ) -> Session {
        if let Some(job) = retry {
            if let Err(job) = self.dispatch(link, job).await {
                return Session::Lost(Some(job));
            }
        }
        loop {
            tokio::select! {
                biased;
                _ = &mut closed => return Session::Lost(None),
                job = self.jobs.recv() => {
                    let Some(job) = job else {
                        return Session::Stopped;
                    };
                    if let Err(job) = self.dispatch(link, job).await {
                        return Session::Lost(Some(job));
                    }
                }
            }
        }
    }

    /// Completes the job, or hands it back when the connection broke before the write.
    async fn dispatch(&self, link: &dyn DeviceLink, job: LinkJob) -> Result<(), LinkJob> {
        if job.allow.command_id() != job.command.id {
            let outcome = CommandOutcome::Failed("authorization does not match command".into());
            complete(&self.worker, job, outcome).await;
            return Ok(());
        }
        if !self.epoch.admits(&job.allow) {
            let reason = "safety state changed after authorization";
            let outcome = CommandOutcome::Blocked(reason.into());
            complete(&self.worker, job, outcome).await;
            return Ok(());
        }
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let outcome = match link.send(&job.command, timeout).await {
            Ok(ack) if ack.ok => CommandOutcome::Executed,
            Ok(ack) => {
                CommandOutcome::Failed(ack.reason.unwrap_or_else(|| "rejected by device".into()))
            }
            Err(ConnectivityError::Timeout(t)) => {
                CommandOutcome::Failed(format!("no acknowledgement within {:?}", t))
            }
            Err(ConnectivityError::Io(e)) => {
                tracing::warn!("Write to {} failed: {}", self.device_id, e);
                return Err(job);
            }
            Err(e) => CommandOutcome::Failed(e.to_string()),
        };
        complete(&self.worker, job, outcome).await;
        Ok(())
    }
}

async fn complete(worker: &mpsc::Sender<DeviceRequest>, job: LinkJob, outcome: CommandOutcome) {
    let result = CommandResult::new(&job.command, outcome);
    let _ = worker.send(DeviceRequest::Completed { result, respond_to: job.respond_to }).await;
}
