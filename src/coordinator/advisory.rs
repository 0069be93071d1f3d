// src/coordinator/advisory.rs - One-way bridge to the analytics tier
//
// Windows go out through a bounded queue, recommendations come back into a cache. Nothing
// here can reach a device: the bridge holds no coordinator handle.

use crate::config::AdvisoryConfig;
use async_trait::async_trait;
use modax_shared::{AggregatedWindow, Recommendation};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory call timed out after {0:?}")]
    Timeout(Duration),
    #[error("advisory tier unavailable: {0}")]
    Unavailable(String),
    #[error("malformed advisory response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait AdvisoryClient: Send + Sync {
    /// Scores one window. `None` means nothing to recommend.
    async fn analyze(
        &self,
        window: &AggregatedWindow,
    ) -> Result<Option<Recommendation>, AdvisoryError>;
}

/// Sends each window as one JSON line and reads back one line: a recommendation or `null`.
#[derive(Debug, Clone)]
pub struct TcpAdvisoryClient {
    address: String,
}

impl TcpAdvisoryClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

#[async_trait]
impl AdvisoryClient for TcpAdvisoryClient {
    async fn analyze(
        &self,
        window: &AggregatedWindow,
    ) -> Result<Option<Recommendation>, AdvisoryError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| AdvisoryError::Unavailable(e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut line =
            serde_json::to_string(window).map_err(|e| AdvisoryError::Malformed(e.to_string()))?;
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AdvisoryError::Unavailable(e.to_string()))?;

        let mut response = String::new();
        BufReader::new(read_half)
            .read_line(&mut response)
            .await
            .map_err(|e| AdvisoryError::Unavailable(e.to_string()))?;
        if response.trim().is_empty() {
            return Err(AdvisoryError::Malformed("empty response".into()));
        }
        serde_json::from_str::<Option<Recommendation>>(response.trim())
            .map_err(|e| AdvisoryError::Malformed(e.to_string()))
    }
}

pub type RecommendationCache = Arc<RwLock<HashMap<String, Recommendation>>>;

/// Cloneable handle; the worker task stops once every handle is dropped.
#[derive(Clone)]
pub struct AdvisoryBridge {
    queue: mpsc::Sender<AggregatedWindow>,
    latest: RecommendationCache,
    worker: Arc<JoinHandle<()>>,
}

impl AdvisoryBridge {
    pub fn spawn(client: Arc<dyn AdvisoryClient>, config: &AdvisoryConfig) -> Self {
        let (queue, mut rx) = mpsc::channel::<AggregatedWindow>(config.queue_depth.max(1));
        let latest: RecommendationCache = Arc::new(RwLock::new(HashMap::new()));
        let cache = Arc::clone(&latest);
        let timeout = Duration::from_millis(config.timeout_ms);

        let worker = tokio::spawn(async move {
            while let Some(window) = rx.recv().await {
                let device = window.device_id.clone();
                match tokio::time::timeout(timeout, client.analyze(&window)).await {
                    Ok(Ok(Some(recommendation))) => {
                        let recommendation = recommendation.normalized();
                        if recommendation.device_id != device {
                            tracing::warn!(
                                "Advisory answered for {} about {}, discarded",
                                device,
                                recommendation.device_id
                            );
                            continue;
                        }
                        tracing::info!(
                            "Advisory recommendation for {}: {:?} ({:.2})",
                            device,
                            recommendation.kind,
                            recommendation.confidence
                        );
                        cache.write().await.insert(device, recommendation);
                    }
                    Ok(Ok(None)) => tracing::debug!("No recommendation for {}", device),
                    Ok(Err(e)) => tracing::error!("Advisory call for {} failed: {}", device, e),
                    Err(_) => tracing::error!("{}", AdvisoryError::Timeout(timeout)),
                }
            }
        });

        Self { queue, latest, worker: Arc::new(worker) }
    }

    /// Never waits: a full queue drops the window.
    pub fn publish(&self, window: AggregatedWindow) {
        match self.queue.try_send(window) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(w)) => {
                tracing::warn!("Advisory queue full, dropping window for {}", w.device_id)
            }
            Err(mpsc::error::TrySendError::Closed(w)) => {
                tracing::debug!("Advisory bridge stopped, window for {} not sent", w.device_id)
            }
        }
    }

    pub async fn latest(&self, device_id: &str) -> Option<Recommendation> {
        self.latest.read().await.get(device_id).cloned()
    }

    pub async fn forget(&self, device_id: &str) {
        self.latest.write().await.remove(device_id);
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }
}
