//! Tasks waiting for a human approval decision.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::gateway::{Gateway, GatewayError, Task};
use crate::workflow::{TaskStatus, APPROVAL_STAGE};

/// Whether `task` waits for a human decision
pub fn is_pending_approval(task: &Task) -> bool {
    task.status == TaskStatus::InApproval || task.current_stage.as_deref() == Some(APPROVAL_STAGE)
}

#[derive(Debug, Default)]
struct QueueState {
    team: Option<String>,
    /// Bumped on every load; older loads may not commit
    epoch: u64,
    tasks: Vec<Task>,
}

/// Pending approval list of one team
#[derive(Clone)]
pub struct ApprovalQueue {
    gateway: Arc<dyn Gateway>,
    state: Arc<RwLock<QueueState>>,
    limit: usize,
}

impl ApprovalQueue {
    pub fn new(gateway: Arc<dyn Gateway>, limit: usize) -> Self {
        Self {
            gateway,
            state: Arc::new(RwLock::new(QueueState::default())),
            limit,
        }
    }

    /// Fetch `team`'s tasks and keep the ones pending approval.
    ///
    /// Returns false when a later load superseded this one.
    pub async fn load(&self, team: &str) -> Result<bool, GatewayError> {
        let epoch = {
            let mut state = self.state.write();
            state.epoch += 1;
            if state.team.as_deref() != Some(team) {
                state.team = Some(team.to_string());
                state.tasks.clear();
            }
            state.epoch
        };

        let tasks = self.gateway.tasks(team, self.limit).await?;
        let pending: Vec<Task> = tasks.into_iter().filter(is_pending_approval).collect();

        let mut state = self.state.write();
        if state.epoch != epoch {
            debug!("Discarding superseded approval queue load for {}", team);
            return Ok(false);
        }
        state.tasks = pending;
        Ok(true)
    }

    /// Drop `team`'s task after it was decided. Returns whether it was queued.
    pub fn remove(&self, team: &str, task_id: i64) -> bool {
        let mut state = self.state.write();
        if state.team.as_deref() != Some(team) {
            return false;
        }
        let before = state.tasks.len();
        state.tasks.retain(|t| t.task_id != task_id);
        state.tasks.len() != before
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state.read().tasks.clone()
    }

    pub fn contains(&self, task_id: i64) -> bool {
        self.state.read().tasks.iter().any(|t| t.task_id == task_id)
    }

    pub fn team(&self) -> Option<String> {
        self.state.read().team.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
