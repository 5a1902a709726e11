pub mod page;
pub mod source;
pub mod transition;
pub mod workflow_event;

pub use page::Page;
pub use source::Source;
pub use transition::*;
pub use workflow_event::{event_types, WorkflowEvent};
