use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, ApiState};
use crate::config::{ConfigError, QueueConfig};
use crate::producer::JobProducer;
use crate::progress::ProgressTracker;
use crate::registry::HandlerRegistry;
use crate::scheduler::Sweeper;
use crate::storage::{MemoryProgressStore, MemoryQueueStore, ProgressStore, QueueStore, SqliteStorage};
use crate::worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to open job store: {0}")]
    Database(#[from] sqlx::Error),
}

/// Owns the stores, the worker pool and the sweeper.
///
/// Workers are not started until [`JobQueue::start`]; producers and the HTTP
/// router can be used before that.
///
/// # Example
/// ```ignore
/// let registry = HandlerRegistry::builder()
///     .register(FnHandler::new(["Job.SendEmail.*"], send_email))
///     .build()?;
/// let mut queue = JobQueue::in_memory(QueueConfig::default(), registry)?;
/// queue.start();
///
/// let id = queue.producer().enqueue("Job.SendEmail.Bulk", payload, Priority::High).await?;
/// ```
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    progress: ProgressTracker,
    registry: Arc<HandlerRegistry>,
    config: Arc<QueueConfig>,
    producer: JobProducer,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    sweeper_handle: Option<JoinHandle<()>>,
}

impl JobQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn QueueStore>,
        progress_store: Arc<dyn ProgressStore>,
        registry: HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(longest) = registry.longest_timeout() {
            if longest >= config.stale_claim_threshold {
                return Err(ConfigError::Validation(format!(
                    "handler timeout {longest:?} is not below stale_claim_threshold {:?}",
                    config.stale_claim_threshold
                )));
            }
        }

        let progress = ProgressTracker::new(
            progress_store,
            config.progress_retention,
            config.progress_batch_limit,
        )
        .with_store_retry(config.store_retry);
        let producer = JobProducer::new(Arc::clone(&store), progress.clone(), config.store_retry);

        Ok(Self {
            store,
            progress,
            registry: Arc::new(registry),
            config: Arc::new(config),
            producer,
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
            sweeper_handle: None,
        })
    }

    /// Queue backed by the in-process stores.
    pub fn in_memory(config: QueueConfig, registry: HandlerRegistry) -> Result<Self, ConfigError> {
        Self::new(
            config,
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryProgressStore::new()),
            registry,
        )
    }

    /// Queue backed by a SQLite database, created and migrated if needed.
    pub async fn sqlite(
        database_url: &str,
        config: QueueConfig,
        registry: HandlerRegistry,
    ) -> Result<Self, QueueError> {
        let storage = Arc::new(SqliteStorage::new(database_url).await?);
        Ok(Self::new(config, storage.clone(), storage, registry)?)
    }

    pub fn producer(&self) -> &JobProducer {
        &self.producer
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// HTTP routes for producers and operators.
    pub fn router(&self) -> axum::Router {
        api::router(ApiState {
            producer: self.producer.clone(),
            progress: self.progress.clone(),
            store: Arc::clone(&self.store),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.worker_handles.is_empty()
    }

    /// Spawn `max_concurrent_jobs` workers and the sweeper. Calling it again
    /// while running does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Job queue already started");
            return;
        }

        for id in 0..self.config.max_concurrent_jobs {
            let worker = Worker::new(
                id,
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.progress.clone(),
                Arc::clone(&self.config),
            );
            let shutdown = self.shutdown.clone();
            self.worker_handles
                .push(tokio::spawn(async move { worker.run(shutdown).await }));
        }

        let sweeper = Sweeper::new(
            Arc::clone(&self.store),
            self.progress.clone(),
            Arc::clone(&self.config),
        );
        let shutdown = self.shutdown.clone();
        self.sweeper_handle = Some(tokio::spawn(async move { sweeper.run(shutdown).await }));

        info!(
            workers = self.config.max_concurrent_jobs,
            patterns = self.registry.len(),
            "Job queue started"
        );
    }

    /// Get the shutdown token for external shutdown control
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming, let in-flight jobs resolve, then wait for every task.
    pub async fn shutdown(&mut self) {
        info!("Initiating shutdown");
        self.shutdown.cancel();

        for handle in self.worker_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        if let Some(handle) = self.sweeper_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }

        info!("Shutdown complete");
    }

    /// Wait for Ctrl+C, then shut down.
    pub async fn wait_for_shutdown(&mut self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        self.shutdown().await;
        Ok(())
    }
}
