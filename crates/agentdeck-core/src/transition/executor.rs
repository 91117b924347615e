//! Validated task mutations.
//!
//! Every requested move is checked against the workflow tables before the
//! gateway is touched; an illegal move never produces a network call.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::approvals::ApprovalQueue;
use crate::gateway::{Gateway, GatewayError, NewTask, ReviewSubmission, Task, TaskPatch};
use crate::sync::{RefreshOutcome, SyncController};
use crate::workflow::{outcome_table, status_table, Outcome, TaskStatus, Workflow, WorkflowError};

/// Error type for transitions
#[derive(Debug, Error)]
pub enum TransitionError {
    /// Not an edge of the workflow; nothing was sent
    #[error(transparent)]
    NotPermitted(#[from] WorkflowError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The server answered `ok: false`
    #[error("server rejected the transition of task {task_id}")]
    Rejected { task_id: i64 },
}

/// What a successful mutation produced
#[derive(Debug)]
pub struct TransitionReceipt {
    pub task_id: i64,
    /// Status confirmed by the server, for status moves
    pub status: Option<TaskStatus>,
    /// Stage confirmed by the server, for stage moves
    pub current_stage: Option<String>,
    /// Result of the follow-up refresh
    pub refresh: RefreshOutcome,
    /// Background retry, when the follow-up refresh failed
    pub retry: Option<JoinHandle<RefreshOutcome>>,
}

/// Applies workflow moves through the gateway and keeps the snapshot current
#[derive(Clone)]
pub struct TransitionExecutor {
    gateway: Arc<dyn Gateway>,
    sync: SyncController,
    approvals: ApprovalQueue,
    workflow: &'static Workflow,
}

impl TransitionExecutor {
    pub fn new(sync: SyncController) -> Self {
        let gateway = sync.gateway().clone();
        let approvals = ApprovalQueue::new(gateway.clone(), sync.options().task_limit);
        Self {
            gateway,
            sync,
            approvals,
            workflow: Workflow::default_workflow(),
        }
    }

    pub fn sync(&self) -> &SyncController {
        &self.sync
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    // =========================================================
    // Status moves
    // =========================================================

    /// Move a task from `current` to `next`.
    pub async fn move_task(
        &self,
        team: &str,
        task_id: i64,
        current: TaskStatus,
        next: TaskStatus,
    ) -> Result<TransitionReceipt, TransitionError> {
        let target = status_table().next(&current, &next)?;
        let status = self.patch_status(team, task_id, target).await?;
        Ok(self.finish(team, task_id, Some(status), None).await)
    }

    /// Apply a review outcome to a task's status.
    pub async fn apply_outcome(
        &self,
        team: &str,
        task_id: i64,
        current: TaskStatus,
        outcome: &Outcome,
    ) -> Result<TransitionReceipt, TransitionError> {
        let target = outcome_table().next(&current, outcome)?;
        let status = self.patch_status(team, task_id, target).await?;
        Ok(self.finish(team, task_id, Some(status), None).await)
    }

    async fn patch_status(
        &self,
        team: &str,
        task_id: i64,
        target: TaskStatus,
    ) -> Result<TaskStatus, TransitionError> {
        let updated = self
            .gateway
            .patch_task(team, task_id, &TaskPatch::status(target))
            .await?;
        // A bare acknowledgement confirms the requested edge
        let status = match updated.status {
            Some(reported) if reported != target => {
                warn!(
                    "Task {} requested {} but server reports {}",
                    task_id, target, reported
                );
                reported
            }
            Some(reported) => reported,
            None => target,
        };
        info!("Task {} moved to {}", task_id, status);
        self.sync.apply_confirmed_status(team, task_id, status);
        Ok(status)
    }

    // =========================================================
    // Stage moves
    // =========================================================

    /// Decide a task waiting for approval.
    ///
    /// Stage-tracked tasks go through the approve endpoint; tasks without a
    /// stage fall back to the status outcome table.
    pub async fn approve(
        &self,
        team: &str,
        task: &Task,
        outcome: &Outcome,
    ) -> Result<TransitionReceipt, TransitionError> {
        let Some(stage) = task.current_stage.as_deref() else {
            let target = outcome_table().next(&task.status, outcome)?;
            let status = self.patch_status(team, task.task_id, target).await?;
            self.approvals.remove(team, task.task_id);
            return Ok(self.finish(team, task.task_id, Some(status), None).await);
        };

        let predicted = self.workflow.next_stage(stage, outcome)?;
        let response = self.gateway.approve_task(team, task.task_id, outcome).await?;
        if !response.ok {
            return Err(TransitionError::Rejected {
                task_id: task.task_id,
            });
        }
        let confirmed = self.confirm_stage(task.task_id, predicted, response.current_stage);
        self.approvals.remove(team, task.task_id);
        self.sync
            .apply_confirmed_stage(team, task.task_id, &confirmed);
        Ok(self.finish(team, task.task_id, None, Some(confirmed)).await)
    }

    /// Send a task to review.
    pub async fn request_review(
        &self,
        team: &str,
        task: &Task,
    ) -> Result<TransitionReceipt, TransitionError> {
        let outcome = Outcome::SubmitForReview;
        let Some(stage) = task.current_stage.as_deref() else {
            return self
                .apply_outcome(team, task.task_id, task.status, &outcome)
                .await;
        };

        let predicted = self.workflow.next_stage(stage, &outcome)?;
        let response = self.gateway.request_review(team, task.task_id).await?;
        if !response.ok {
            return Err(TransitionError::Rejected {
                task_id: task.task_id,
            });
        }
        let confirmed = self.confirm_stage(task.task_id, predicted, response.current_stage);
        self.sync
            .apply_confirmed_stage(team, task.task_id, &confirmed);
        Ok(self.finish(team, task.task_id, None, Some(confirmed)).await)
    }

    /// Record a review verdict on a task.
    ///
    /// Only `approved` and `changes_requested` are verdicts. Stage-tracked
    /// tasks advance along the workflow edge for the verdict; tasks without
    /// a stage only get the review recorded.
    pub async fn submit_review(
        &self,
        team: &str,
        task: &Task,
        reviewer: &str,
        outcome: &Outcome,
        comments: Option<&str>,
    ) -> Result<TransitionReceipt, TransitionError> {
        let reviewer = reviewer.trim();
        if reviewer.is_empty() {
            return Err(TransitionError::InvalidInput(
                "reviewer is empty".to_string(),
            ));
        }
        if !matches!(outcome, Outcome::Approved | Outcome::ChangesRequested) {
            return Err(TransitionError::InvalidInput(format!(
                "{} is not a review verdict",
                outcome
            )));
        }
        let predicted = match task.current_stage.as_deref() {
            Some(stage) => Some(self.workflow.next_stage(stage, outcome)?),
            None => None,
        };

        let review = ReviewSubmission {
            reviewer_agent: reviewer.to_string(),
            outcome: outcome.clone(),
            comments: comments
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        };
        let ack = self
            .gateway
            .submit_review(team, task.task_id, &review)
            .await?;
        if !ack.ok {
            return Err(TransitionError::Rejected {
                task_id: task.task_id,
            });
        }
        info!("Review {} recorded on task {} by {}", outcome, task.task_id, reviewer);
        self.approvals.remove(team, task.task_id);
        if let Some(stage) = &predicted {
            self.sync.apply_confirmed_stage(team, task.task_id, stage);
        }
        Ok(self.finish(team, task.task_id, None, predicted).await)
    }

    /// The server's stage wins over the local prediction
    fn confirm_stage(&self, task_id: i64, predicted: String, reported: Option<String>) -> String {
        match reported {
            Some(reported) if reported != predicted => {
                warn!(
                    "Task {} expected at stage {} but server reports {}",
                    task_id, predicted, reported
                );
                reported
            }
            Some(reported) => reported,
            None => predicted,
        }
    }

    // =========================================================
    // Other mutations
    // =========================================================

    /// Create a task in `todo` or `in_progress`.
    pub async fn create_task(
        &self,
        team: &str,
        title: &str,
        status: TaskStatus,
    ) -> Result<TransitionReceipt, TransitionError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(TransitionError::InvalidInput(
                "task title is empty".to_string(),
            ));
        }
        if !matches!(status, TaskStatus::Todo | TaskStatus::InProgress) {
            return Err(TransitionError::InvalidInput(format!(
                "new tasks start in todo or in_progress, not {}",
                status
            )));
        }

        let created = self
            .gateway
            .create_task(
                team,
                &NewTask {
                    title: title.to_string(),
                    status,
                },
            )
            .await?;
        info!("Created task {} in {}", created.task_id, team);
        Ok(self.finish(team, created.task_id, Some(status), None).await)
    }

    /// Set or clear (`None` or blank) the assignee of a task.
    pub async fn assign(
        &self,
        team: &str,
        task_id: i64,
        assignee: Option<&str>,
    ) -> Result<TransitionReceipt, TransitionError> {
        let assignee = assignee
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        let updated = self
            .gateway
            .patch_task(team, task_id, &TaskPatch::assignee(assignee.clone()))
            .await?;
        let assignee = updated.assignee.or(assignee);
        info!(
            "Task {} assigned to {}",
            task_id,
            assignee.as_deref().unwrap_or("nobody")
        );
        Ok(self.finish(team, task_id, None, None).await)
    }

    async fn finish(
        &self,
        team: &str,
        task_id: i64,
        status: Option<TaskStatus>,
        current_stage: Option<String>,
    ) -> TransitionReceipt {
        let (refresh, retry) = if self.sync.selected_team().as_deref() == Some(team) {
            self.sync.refresh_with_retry().await
        } else {
            (RefreshOutcome::NoTeam, None)
        };
        TransitionReceipt {
            task_id,
            status,
            current_stage,
            refresh,
            retry,
        }
    }
}
