//! Sources domain - knowledge sources, their pages, and the ingestion
//! workflow that moves both from discovery through training.

pub mod jobs;
pub mod models;
pub mod status;
pub mod workflow;

pub use models::{Page, Source, WorkflowEvent};
pub use status::WorkflowStatus;
pub use workflow::{WorkflowEngine, WorkflowError};
