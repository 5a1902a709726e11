//! Typed ID definitions for all domain entities.
//!
//! Type aliases for each entity give compile-time safety for ID usage
//! throughout the application.
//!
//! # Example
//!
//! ```rust
//! use ingest_core::common::{PageId, SourceId};
//!
//! // These are incompatible types - compiler prevents mixing them up
//! let source_id: SourceId = SourceId::new();
//! let page_id: PageId = PageId::new();
//!
//! // This would be a compile error:
//! // let wrong: PageId = source_id;
//! ```

// Re-export the core Id type and version markers
pub use super::id::{Id, V4, V7};

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for Source entities (registered knowledge sources).
pub struct Source;

/// Marker type for Page entities (pages discovered under a source).
pub struct Page;

/// Marker type for Job entities (background pipeline jobs).
pub struct Job;

/// Marker type for WorkflowEvent entities (append-only audit log rows).
pub struct WorkflowEvent;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

/// Typed ID for Source entities.
pub type SourceId = Id<Source>;

/// Typed ID for Page entities.
pub type PageId = Id<Page>;

/// Typed ID for Job entities.
pub type JobId = Id<Job>;

/// Typed ID for WorkflowEvent entities.
pub type WorkflowEventId = Id<WorkflowEvent>;
