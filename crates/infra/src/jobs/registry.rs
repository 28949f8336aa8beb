//! Handler registry: job type → executable handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::CacheError;
use crate::storage::StorageError;

use super::types::{JobId, JobPayload, JobType};

/// Error returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Temporary failure; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The payload can never succeed (wrong variant, missing field).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// Execution was cancelled by scheduler shutdown.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Whether the scheduler should apply backoff and run the job again.
    ///
    /// Invalid payloads fail the same way on every attempt, and a cancelled
    /// job belongs to a scheduler that is shutting down.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::InvalidPayload(_) | HandlerError::Cancelled)
    }
}

/// Per-execution context passed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    /// Cancelled on timeout and on scheduler shutdown.
    pub cancellation: CancellationToken,
}

/// Executable unit of domain logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler executes.
    fn job_type(&self) -> JobType;

    async fn run(&self, payload: &JobPayload, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Mapping from job type to handler, built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own job type.
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register<H>(&mut self, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        let job_type = handler.job_type();
        if self.handlers.insert(job_type, handler).is_some() {
            warn!(job_type = %job_type, "replacing previously registered job handler");
        }
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Registered types in a stable order.
    pub fn registered_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

/// Handler backed by an async closure; handy for tests and small jobs.
pub struct FnHandler<F> {
    job_type: JobType,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut>(job_type: JobType, f: F) -> Self
    where
        F: Fn(JobPayload, JobContext) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
    {
        Self { job_type, f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobPayload, JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn run(&self, payload: &JobPayload, ctx: &JobContext) -> Result<(), HandlerError> {
        (self.f)(payload.clone(), ctx.clone()).await
    }
}
