//! Workflow status machine shared by sources and pages.
//!
//! The pipeline runs `created -> crawling -> completed -> training ->
//! trained`. Removal is two-phase: any live status can enter
//! `pending_removal` (reversible, the prior status is kept for restore),
//! and only from there, `error`, or `removed` may a row be hard-deleted.
//! Illegal edges are rejected by the workflow engine, never coerced.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "workflow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Created,
    Crawling,
    Completed,
    Training,
    Trained,
    PendingRemoval,
    Removed,
    Error,
}

impl WorkflowStatus {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        if *self == next {
            return false;
        }

        match (*self, next) {
            // Forward pipeline
            (Created, Crawling) => true,
            (Crawling, Completed) => true,
            (Completed, Training) => true,
            (Training, Trained) => true,

            // Re-crawl of already-ingested content
            (Completed, Crawling) => true,
            (Trained, Crawling) => true,
            // Retry after failure
            (Error, Crawling) => true,

            // Unrecoverable failure from any live status
            (Created | Crawling | Completed | Training | Trained | PendingRemoval, Error) => true,

            // Two-phase removal
            (Created | Crawling | Completed | Training | Trained | Error, PendingRemoval) => true,
            (PendingRemoval, Removed) => true,
            // Restore puts back whatever status was captured
            (PendingRemoval, Created | Crawling | Completed | Training | Trained) => true,

            _ => false,
        }
    }

    /// Position in the ingestion pipeline, for the rule that a page may
    /// never be further along than its parent source. Removal and error
    /// statuses sit outside the pipeline.
    pub fn pipeline_stage(&self) -> Option<u8> {
        match self {
            WorkflowStatus::Created => Some(0),
            WorkflowStatus::Crawling | WorkflowStatus::Completed => Some(1),
            WorkflowStatus::Training | WorkflowStatus::Trained => Some(2),
            WorkflowStatus::PendingRemoval | WorkflowStatus::Removed | WorkflowStatus::Error => {
                None
            }
        }
    }

    /// Statuses a row may be hard-deleted from.
    pub fn allows_deletion(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::PendingRemoval | WorkflowStatus::Removed | WorkflowStatus::Error
        )
    }

    /// Live statuses, i.e. not in the removal path.
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkflowStatus::PendingRemoval | WorkflowStatus::Removed)
    }

    pub const ALL: [WorkflowStatus; 8] = [
        WorkflowStatus::Created,
        WorkflowStatus::Crawling,
        WorkflowStatus::Completed,
        WorkflowStatus::Training,
        WorkflowStatus::Trained,
        WorkflowStatus::PendingRemoval,
        WorkflowStatus::Removed,
        WorkflowStatus::Error,
    ];
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Crawling => "crawling",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Training => "training",
            WorkflowStatus::Trained => "trained",
            WorkflowStatus::PendingRemoval => "pending_removal",
            WorkflowStatus::Removed => "removed",
            WorkflowStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "created" => Ok(WorkflowStatus::Created),
            "crawling" => Ok(WorkflowStatus::Crawling),
            "completed" => Ok(WorkflowStatus::Completed),
            "training" => Ok(WorkflowStatus::Training),
            "trained" => Ok(WorkflowStatus::Trained),
            "pending_removal" => Ok(WorkflowStatus::PendingRemoval),
            "removed" => Ok(WorkflowStatus::Removed),
            "error" => Ok(WorkflowStatus::Error),
            _ => Err(anyhow::anyhow!("Invalid workflow status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowStatus::*;

    #[test]
    fn forward_pipeline_edges_are_legal() {
        assert!(Created.can_transition_to(Crawling));
        assert!(Crawling.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Training));
        assert!(Training.can_transition_to(Trained));
    }

    #[test]
    fn pipeline_cannot_skip_stages() {
        assert!(!Created.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Training));
        assert!(!Created.can_transition_to(Trained));
        assert!(!Crawling.can_transition_to(Training));
        assert!(!Crawling.can_transition_to(Trained));
        assert!(!Completed.can_transition_to(Trained));
    }

    #[test]
    fn pipeline_cannot_move_backward() {
        assert!(!Crawling.can_transition_to(Created));
        assert!(!Completed.can_transition_to(Created));
        assert!(!Training.can_transition_to(Completed));
        assert!(!Training.can_transition_to(Crawling));
        assert!(!Trained.can_transition_to(Training));
    }

    #[test]
    fn recrawl_is_legal_from_settled_statuses() {
        assert!(Completed.can_transition_to(Crawling));
        assert!(Trained.can_transition_to(Crawling));
        assert!(Error.can_transition_to(Crawling));
    }

    #[test]
    fn self_transition_is_illegal() {
        for status in WorkflowStatus::ALL {
            assert!(!status.can_transition_to(status), "{status} -> {status}");
        }
    }

    #[test]
    fn error_is_reachable_from_everywhere_but_removed() {
        assert!(Created.can_transition_to(Error));
        assert!(Crawling.can_transition_to(Error));
        assert!(Completed.can_transition_to(Error));
        assert!(Training.can_transition_to(Error));
        assert!(Trained.can_transition_to(Error));
        assert!(PendingRemoval.can_transition_to(Error));
        assert!(!Removed.can_transition_to(Error));
    }

    #[test]
    fn removal_is_two_phase() {
        assert!(Crawling.can_transition_to(PendingRemoval));
        assert!(Error.can_transition_to(PendingRemoval));
        assert!(PendingRemoval.can_transition_to(Removed));

        // No shortcut straight to removed
        for status in WorkflowStatus::ALL {
            if status != PendingRemoval {
                assert!(!status.can_transition_to(Removed), "{status} -> removed");
            }
        }
    }

    #[test]
    fn restore_targets_are_live_statuses() {
        assert!(PendingRemoval.can_transition_to(Created));
        assert!(PendingRemoval.can_transition_to(Crawling));
        assert!(PendingRemoval.can_transition_to(Trained));
        assert!(!PendingRemoval.can_transition_to(PendingRemoval));
    }

    #[test]
    fn removed_is_terminal() {
        for status in WorkflowStatus::ALL {
            assert!(!Removed.can_transition_to(status), "removed -> {status}");
        }
    }

    #[test]
    fn pipeline_stages_order_the_machine() {
        assert_eq!(Created.pipeline_stage(), Some(0));
        assert_eq!(Crawling.pipeline_stage(), Some(1));
        assert_eq!(Completed.pipeline_stage(), Some(1));
        assert_eq!(Training.pipeline_stage(), Some(2));
        assert_eq!(Trained.pipeline_stage(), Some(2));
        assert_eq!(PendingRemoval.pipeline_stage(), None);
        assert_eq!(Error.pipeline_stage(), None);
    }

    #[test]
    fn deletion_requires_removal_path_or_error() {
        assert!(PendingRemoval.allows_deletion());
        assert!(Removed.allows_deletion());
        assert!(Error.allows_deletion());
        assert!(!Created.allows_deletion());
        assert!(!Trained.allows_deletion());
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for status in WorkflowStatus::ALL {
            let parsed: WorkflowStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }
}
