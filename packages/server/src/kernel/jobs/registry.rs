//! Job registry for deserializing and executing jobs.
//!
//! The registry maps job type strings (e.g., "crawl_page") to handlers that
//! reconstruct the typed payload from JSON and run the job logic. The
//! processor claims jobs from the store and dispatches through here without
//! knowing the concrete types.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

use super::job::Job;
use super::queue::PipelineCommand;
use crate::kernel::ServerDeps;

/// Type alias for the async handler function.
///
/// Handlers receive the raw payload and ServerDeps; the typed payload is
/// reconstructed inside the registered closure.
type BoxedHandler = Box<
    dyn Fn(serde_json::Value, Arc<ServerDeps>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Registration entry containing the handler.
struct JobRegistration {
    handler: BoxedHandler,
}

/// Registry that maps job type strings to handlers.
///
/// Each domain registers its job types at startup; payloads are validated
/// by deserialization into the typed struct before the handler runs, so a
/// malformed payload fails fast instead of deep inside the handler.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
///
/// registry.register::<CrawlPageJob, _, _>(
///     CrawlPageJob::JOB_TYPE,
///     |job, deps| async move {
///         pipeline_handlers::crawl_page(job, &deps).await
///     },
/// );
///
/// // Later, in the processor
/// registry.execute(&claimed, deps.clone()).await?;
/// ```
#[derive(Default)]
pub struct JobRegistry {
    registrations: HashMap<&'static str, JobRegistration>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a job type with its handler.
    ///
    /// The handler is an async function that receives the deserialized
    /// payload and ServerDeps, and returns a Result.
    pub fn register<J, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        J: PipelineCommand + DeserializeOwned + Send + Sync + 'static,
        F: Fn(J, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed_handler: BoxedHandler = Box::new(move |value, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let job: J = serde_json::from_value(value)
                    .map_err(|e| anyhow!("Failed to deserialize {}: {}", job_type, e))?;
                handler(job, deps).await
            })
        });

        self.registrations.insert(
            job_type,
            JobRegistration {
                handler: boxed_handler,
            },
        );
    }

    /// Execute a claimed job using its registered handler.
    ///
    /// Returns an error if:
    /// - The job type is not registered
    /// - The JSON payload cannot be deserialized
    /// - The handler returns an error
    pub async fn execute(&self, job: &Job, deps: Arc<ServerDeps>) -> Result<()> {
        let registration = self
            .registrations
            .get(job.job_type.as_str())
            .ok_or_else(|| anyhow!("Unknown job type: {}", job.job_type))?;

        (registration.handler)(job.payload.clone(), deps).await
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    /// Get all registered job types.
    pub fn registered_types(&self) -> Vec<&'static str> {
        self.registrations.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;
