//! Workflow definition: task status moves, review outcomes and stage workflows.

pub mod machine;
pub mod stages;
pub mod status;

use thiserror::Error;

pub use machine::TransitionTable;
pub use stages::{StageKind, Workflow, WorkflowStage, WorkflowTransition, APPROVAL_STAGE};
pub use status::{outcome_table, status_table, Outcome, TaskStatus};

/// Errors raised while building or querying a transition table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// No edge for `(from, label)`
    #[error("transition not permitted: {from} --{label}-->")]
    NotPermitted { from: String, label: String },

    /// Two targets declared for the same `(from, label)`
    #[error("ambiguous transition {from} --{label}--> {first} / {second}")]
    Ambiguous {
        from: String,
        label: String,
        first: String,
        second: String,
    },

    /// A terminal state was given outgoing edges
    #[error("terminal state {state} has outgoing transitions")]
    TerminalHasExits { state: String },

    /// Edge references a stage that was never declared
    #[error("unknown stage: {stage}")]
    UnknownStage { stage: String },

    /// Edge uses an outcome its source stage does not list
    #[error("stage {stage} does not produce outcome {outcome}")]
    UndeclaredOutcome { stage: String, outcome: String },

    /// Status string outside the known set
    #[error("unknown task status: {status}")]
    UnknownStatus { status: String },
}
