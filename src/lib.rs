pub mod api;
pub mod config;
pub mod handler;
pub mod job;
pub mod jobqueue;
pub mod producer;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, QueueConfig, Settings};
pub use handler::{FnHandler, JobContext, JobError, JobHandler, JobResult};
pub use job::{DeadLetter, ErrorInfo, JobId, JobLocation, JobMessage, Priority, QueueStats};
pub use jobqueue::{JobQueue, QueueError};
pub use producer::{EnqueueError, JobProducer, ValidationError};
pub use progress::{JobProgress, ProgressStatus, ProgressTracker, ProgressUpdate};
pub use registry::{HandlerRegistry, RegistryError, TypePattern};
pub use retry::BackoffPolicy;
pub use storage::{
    MemoryProgressStore, MemoryQueueStore, ProgressStore, QueueStore, SqliteStorage, StorageError,
};
