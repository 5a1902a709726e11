// Content Ingestion Pipeline - Core
//
// This crate ingests knowledge sources for a conversational assistant:
// sources are discovered, their pages crawled, and the crawled content
// trained into the assistant's index. Each stage runs as a background job
// with store-level claiming, so any number of workers can share one queue.
//
// Repair services (stalled-job recovery, orphaned-page synchronization,
// health monitoring) keep the pipeline moving when workers die mid-job.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
