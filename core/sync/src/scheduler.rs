//! Sync scheduling - on-demand and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info};

use bizsync_common::{Error, Result};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum SyncMode {
    /// Manual sync only.
    #[default]
    Manual,
    /// Sync triggered immediately on changes.
    OnDemand,
    /// Sync at regular intervals.
    Periodic { interval: Duration },
    /// Both on-demand and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    /// Drain the queue, then refresh resources whose interval elapsed.
    Full,
    /// Force-refresh specific resources.
    Resources(Vec<String>),
    /// Shutdown the scheduler.
    Shutdown,
}

/// Outcome of one scheduled sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Queued writes delivered.
    pub delivered: usize,
    /// Queued writes that failed and stay queued.
    pub retried: usize,
    /// Queued writes dropped after exhausting retries.
    pub dropped: usize,
    /// Resources refreshed from the network.
    pub refreshed: usize,
    pub refresh_failed: usize,
    pub duration: Duration,
}

type Envelope = (SyncRequest, oneshot::Sender<Result<SyncReport>>);

/// Front end for requesting syncs from a running [`SyncSchedulerHandle`].
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Envelope>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx: request_tx.clone(),
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            mode,
            request_tx,
            request_rx: Some(request_rx),
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a full sync and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Full).await
    }

    /// Request a refresh of specific resources.
    pub async fn request_resources_sync(&self, resources: Vec<String>) -> Result<SyncReport> {
        self.request(SyncRequest::Resources(resources)).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::NotConnected("Sync scheduler is not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::NotConnected("Sync scheduler dropped the request".to_string()))?
    }

    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Envelope>,
    request_rx: Option<mpsc::Receiver<Envelope>>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// Spawn this in a tokio task; `sync_fn` runs every requested or
    /// periodic sync.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncReport>> + Send,
    {
        let Some(mut request_rx) = self.request_rx.take() else {
            error!("Sync scheduler handle was already run");
            return;
        };
        let mut current_interval = self.mode.read().await.interval();
        let mut ticker = current_interval.map(interval);

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                received = request_rx.recv() => {
                    let Some((request, response_tx)) = received else { break };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let _ = response_tx.send(sync_fn(request).await);
                }

                _ = Self::wait_for_periodic(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::Full).await {
                        Ok(report) => info!(
                            "Periodic sync completed: {} delivered, {} dropped, {} refreshed",
                            report.delivered, report.dropped, report.refreshed
                        ),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }

            let expected = self.mode.read().await.interval();
            if expected != current_interval {
                current_interval = expected;
                ticker = current_interval.map(interval);
            }
        }
    }

    async fn wait_for_periodic(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Notify the scheduler of a local change (on-demand modes only).
    pub async fn notify_change(&self, resources: Vec<String>) {
        let mode = self.mode.read().await.clone();
        match mode {
            SyncMode::OnDemand | SyncMode::Hybrid { .. } => {
                let (response_tx, _) = oneshot::channel();
                let _ = self
                    .request_tx
                    .send((SyncRequest::Resources(resources), response_tx))
                    .await;
            }
            _ => debug!("Change notification ignored (mode: {:?})", mode),
        }
    }
}
