//! Task status board and review outcomes.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::machine::TransitionTable;
use super::WorkflowError;

/// Status of a task on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started
    Todo,
    /// An agent is working on it
    InProgress,
    /// Waiting for an agent review
    InReview,
    /// Waiting for a human decision
    InApproval,
    /// Being merged
    Merging,
    /// Finished
    Done,
    /// Failed; can be sent back to `todo`
    Failed,
    /// Cancelled by an operator (server-side only, not a board column)
    Cancelled,
}

impl TaskStatus {
    /// Board columns, in display order
    pub const BOARD: [TaskStatus; 7] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::InApproval,
        TaskStatus::Merging,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    /// Wire name (`in_progress`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::InApproval => "in_approval",
            TaskStatus::Merging => "merging",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Column label (`in progress`)
    pub fn display_name(&self) -> String {
        self.as_str().replace('_', " ")
    }

    /// Statuses reachable in one move from this one, in board order.
    pub fn next_statuses(&self) -> Vec<TaskStatus> {
        status_table()
            .labels_from(self)
            .into_iter()
            .copied()
            .collect()
    }

    /// Whether the status has no outgoing moves
    pub fn is_terminal(&self) -> bool {
        status_table().is_terminal(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "in_review" => Ok(TaskStatus::InReview),
            "in_approval" => Ok(TaskStatus::InApproval),
            "merging" => Ok(TaskStatus::Merging),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(WorkflowError::UnknownStatus {
                status: other.to_string(),
            }),
        }
    }
}

/// Outcome label attached to a workflow edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Outcome {
    /// Work is ready for review
    SubmitForReview,
    /// Reviewer or approver accepted the work
    Approved,
    /// Reviewer or approver sent the work back
    ChangesRequested,
    /// Stage completed
    Done,
    /// Server-defined label
    Other(String),
}

impl Outcome {
    /// Wire name
    pub fn as_str(&self) -> &str {
        match self {
            Outcome::SubmitForReview => "submit_for_review",
            Outcome::Approved => "approved",
            Outcome::ChangesRequested => "changes_requested",
            Outcome::Done => "done",
            Outcome::Other(label) => label,
        }
    }
}

impl From<String> for Outcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            "submit_for_review" => Outcome::SubmitForReview,
            "approved" => Outcome::Approved,
            "changes_requested" => Outcome::ChangesRequested,
            "done" => Outcome::Done,
            _ => Outcome::Other(s),
        }
    }
}

impl From<&str> for Outcome {
    fn from(s: &str) -> Self {
        Outcome::from(s.to_string())
    }
}

impl From<Outcome> for String {
    fn from(o: Outcome) -> Self {
        o.as_str().to_string()
    }
}

impl FromStr for Outcome {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Outcome::from(s))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed board moves. The label of a plain move is the requested status.
static STATUS_TABLE: Lazy<TransitionTable<TaskStatus, TaskStatus>> = Lazy::new(|| {
    use TaskStatus::*;
    let moves: &[(TaskStatus, &[TaskStatus])] = &[
        (Todo, &[InProgress]),
        (InProgress, &[InReview, Failed]),
        (InReview, &[InApproval, InProgress]),
        (InApproval, &[Merging, InProgress]),
        (Merging, &[Done, Failed]),
        (Done, &[]),
        (Failed, &[Todo]),
        (Cancelled, &[]),
    ];
    let edges = moves
        .iter()
        .flat_map(|(from, targets)| targets.iter().map(move |to| (*from, *to, *to)));
    TransitionTable::from_edges(edges)
        .and_then(|t| t.with_terminal([Done, Cancelled]))
        .unwrap_or_else(|e| panic!("built-in status table is invalid: {}", e))
});

/// Review outcomes applied directly to a task status.
static OUTCOME_TABLE: Lazy<TransitionTable<TaskStatus, Outcome>> = Lazy::new(|| {
    use TaskStatus::*;
    TransitionTable::from_edges([
        (InProgress, Outcome::SubmitForReview, InReview),
        (InReview, Outcome::Approved, InApproval),
        (InReview, Outcome::ChangesRequested, InProgress),
        (InApproval, Outcome::Approved, Merging),
        (InApproval, Outcome::ChangesRequested, InProgress),
        (Merging, Outcome::Done, Done),
    ])
    .and_then(|t| t.with_terminal([Done, Cancelled]))
    .unwrap_or_else(|e| panic!("built-in outcome table is invalid: {}", e))
});

/// The board move table
pub fn status_table() -> &'static TransitionTable<TaskStatus, TaskStatus> {
    &STATUS_TABLE
}

/// The review-outcome table over task statuses
pub fn outcome_table() -> &'static TransitionTable<TaskStatus, Outcome> {
    &OUTCOME_TABLE
}
