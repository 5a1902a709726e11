//! Job infrastructure for background pipeline execution.
//!
//! This module provides the kernel-level machinery around the `jobs` table:
//! - [`PostgresJobQueue`] - Database-backed queue with atomic claiming
//! - [`ConcurrentJobProcessor`] - Bounded-concurrency batch execution
//! - [`JobRunner`] - Long-running service that polls and processes
//! - [`JobRecoveryService`] - Stalled-job release and orphaned-page repair
//! - [`SynchronizationService`] - Store-driven requeue of lost work
//! - [`Job`] - Job model with CRUD and stats queries
//!
//! # Architecture
//!
//! ```text
//! Domain code builds a PipelineCommand
//!     │
//!     └─► JobQueue::enqueue (dedupe on active job_key)
//!
//! JobRunner
//!     │
//!     ├─► Fetch ready jobs (one read per pass)
//!     ├─► Claim each job (conditional UPDATE, single winner)
//!     ├─► Execute via JobProcessor (registry dispatch)
//!     └─► Mark completed/failed (queue owns the retry math)
//! ```
//!
//! # Domain-Specific Jobs
//!
//! Job payload types and their handlers live in their domains. This module
//! only provides the infrastructure.

pub mod job;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod runner;
pub mod sync;
pub mod testing;

pub use job::{Job, JobPriority, JobStatus, JobStatusCount, ProcessingWindow};
pub use processor::{BatchOutcome, ConcurrentJobProcessor, JobProcessor, ProcessorOptions};
pub use queue::{EnqueueResult, JobOutcome, JobQueue, JobSpec, PipelineCommand, PostgresJobQueue};
pub use recovery::{
    JobRecoveryService, RecoveryReport, ORPHANED_TIMEOUT, STALLED_RECOVERY_REASON, STALLED_TIMEOUT,
};
pub use registry::{JobRegistry, SharedJobRegistry};
pub use runner::{JobRunner, JobRunnerConfig};
pub use sync::{SyncReport, SynchronizationService, MAX_PAGES_PER_SYNC};
