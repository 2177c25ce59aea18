//! Supervised pool of delivery workers sharing one bounded queue.

use std::{sync::Arc, time::Duration};

use hookline_core::WebhookId;
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::{DeliveryContext, DeliveryWorker, EngineStats},
};

/// Worker tasks consuming webhook ids from a shared receiver.
pub(crate) struct WorkerPool {
    worker_count: usize,
    context: Arc<DeliveryContext>,
    queue: Arc<Mutex<mpsc::Receiver<WebhookId>>>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub fn new(
        worker_count: usize,
        context: Arc<DeliveryContext>,
        queue: mpsc::Receiver<WebhookId>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_count,
            context,
            queue: Arc::new(Mutex::new(queue)),
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns all workers. Returns immediately.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.context.clone(),
                self.queue.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                info!(worker_id, "delivery worker starting");
                let result = worker.run().await;
                match &result {
                    Ok(()) => info!(worker_id, "delivery worker stopped"),
                    Err(e) => error!(worker_id, error = %e, "delivery worker terminated with error"),
                }
                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Cancels workers and waits up to `timeout` for in-flight batches.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not finish in time.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown = async move {
            let mut panics = 0usize;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => {
                        warn!(worker_id, error = %e, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        let panic =
                            DeliveryError::WorkerPanic { worker_id, error: join_error.to_string() };
                        error!(error = %panic, "worker task panicked during shutdown");
                        panics += 1;
                    },
                }
            }
            stats.write().await.active_workers = 0;
            panics
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(0) => Ok(()),
            Ok(panics) => {
                warn!(panics, "worker pool stopped with panicked workers");
                Ok(())
            },
            Err(_) => {
                error!(timeout_ms = timeout.as_millis(), "worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.worker_handles.is_empty() {
            self.cancellation_token.cancel();
        }
    }
}
