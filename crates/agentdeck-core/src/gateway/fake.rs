//! In-memory [`Gateway`] for tests.
//!
//! Records every call as a short line (`"PATCH alpha 7 status=in_approval"`),
//! answers from per-team fixtures, and can delay or fail responses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::types::*;
use super::{Gateway, GatewayError};
use crate::workflow::{Outcome, TaskStatus, Workflow};

#[derive(Default)]
struct FakeData {
    teams: Vec<TeamSummary>,
    tasks: HashMap<String, Vec<Task>>,
    agents: HashMap<String, Vec<Agent>>,
    bootstrap: Option<Bootstrap>,
    network: NetworkAllowlist,
    delays: HashMap<String, Duration>,
    /// One entry per team-list or allowlist read, applied after the data is read
    list_delays: VecDeque<Duration>,
    failing_teams: HashSet<String>,
    fail_reads: usize,
    fail_mutations: bool,
    /// PATCH answers `{"task_id", "ok"}` without the row
    ack_only_patches: bool,
    /// Stage reported by approve regardless of the workflow
    approve_stage: Option<String>,
    next_task_id: i64,
}

#[derive(Default)]
pub(crate) struct FakeGateway {
    data: Mutex<FakeData>,
    calls: Mutex<Vec<String>>,
}

/// Build a task fixture
pub(crate) fn task(task_id: i64, title: &str, status: TaskStatus) -> Task {
    Task {
        task_id,
        title: title.to_string(),
        status,
        assignee: None,
        dri: None,
        workflow_id: None,
        current_stage: None,
        created_at: None,
        updated_at: None,
    }
}

/// Build a stage-tracked task fixture
pub(crate) fn staged_task(task_id: i64, status: TaskStatus, stage: &str) -> Task {
    Task {
        workflow_id: Some("default".to_string()),
        current_stage: Some(stage.to_string()),
        ..task(task_id, &format!("task {}", task_id), status)
    }
}

pub(crate) fn team(name: &str) -> TeamSummary {
    TeamSummary {
        team_id: name.to_string(),
        name: name.to_string(),
        created_at: None,
        agent_count: 0,
        task_count: 0,
    }
}

pub(crate) fn agent(name: &str) -> Agent {
    Agent {
        name: name.to_string(),
        role: "engineer".to_string(),
        created_at: None,
    }
}

fn server_error(message: &str) -> GatewayError {
    GatewayError::Status {
        status: 500,
        message: message.to_string(),
    }
}

impl FakeGateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a team with its tasks
    pub(crate) fn with_team(self, name: &str, tasks: Vec<Task>) -> Self {
        {
            let mut data = self.data.lock();
            data.teams.push(team(name));
            data.tasks.insert(name.to_string(), tasks);
            data.agents.insert(name.to_string(), vec![agent("dev")]);
        }
        self
    }

    pub(crate) fn set_tasks(&self, team: &str, tasks: Vec<Task>) {
        self.data.lock().tasks.insert(team.to_string(), tasks);
    }

    pub(crate) fn set_teams(&self, names: &[&str]) {
        self.data.lock().teams = names.iter().map(|n| team(n)).collect();
    }

    pub(crate) fn set_bootstrap(&self, bootstrap: Bootstrap) {
        self.data.lock().bootstrap = Some(bootstrap);
    }

    pub(crate) fn set_network(&self, allowlist: &[&str]) {
        self.data.lock().network = NetworkAllowlist {
            allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
        };
    }

    /// Delay task and agent reads for `team`
    pub(crate) fn queue_list_delays(&self, delays: &[Duration]) {
        self.data.lock().list_delays.extend(delays.iter().copied());
    }

    pub(crate) fn set_delay(&self, team: &str, delay: Duration) {
        self.data.lock().delays.insert(team.to_string(), delay);
    }

    /// Make every task and agent read for `team` fail
    pub(crate) fn fail_team(&self, team: &str, failing: bool) {
        let mut data = self.data.lock();
        if failing {
            data.failing_teams.insert(team.to_string());
        } else {
            data.failing_teams.remove(team);
        }
    }

    /// Fail the next `n` task reads, whatever the team
    pub(crate) fn fail_next_reads(&self, n: usize) {
        self.data.lock().fail_reads = n;
    }

    pub(crate) fn fail_mutations(&self, failing: bool) {
        self.data.lock().fail_mutations = failing;
    }

    pub(crate) fn ack_only_patches(&self, ack_only: bool) {
        self.data.lock().ack_only_patches = ack_only;
    }

    pub(crate) fn set_approve_stage(&self, stage: &str) {
        self.data.lock().approve_stage = Some(stage.to_string());
    }

    /// All recorded calls, oldest first
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Recorded calls that change server state
    pub(crate) fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("GET "))
            .collect()
    }

    /// Number of task list fetches for `team`
    pub(crate) fn task_fetches(&self, team: &str) -> usize {
        let line = format!("GET tasks {}", team);
        self.calls.lock().iter().filter(|c| **c == line).count()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn read_failure(&self, team: &str, consume: bool) -> Option<GatewayError> {
        let mut data = self.data.lock();
        if data.failing_teams.contains(team) {
            return Some(server_error("database is locked"));
        }
        if consume && data.fail_reads > 0 {
            data.fail_reads -= 1;
            return Some(server_error("temporarily unavailable"));
        }
        None
    }

    fn mutation_failure(&self) -> Option<GatewayError> {
        if self.data.lock().fail_mutations {
            Some(server_error("mutation refused"))
        } else {
            None
        }
    }

    async fn delay_for(&self, team: &str) {
        let delay = self.data.lock().delays.get(team).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn update_task<F>(&self, team: &str, task_id: i64, f: F) -> Result<Task, GatewayError>
    where
        F: FnOnce(&mut Task),
    {
        let mut data = self.data.lock();
        let task = data
            .tasks
            .get_mut(team)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.task_id == task_id))
            .ok_or_else(|| GatewayError::Status {
                status: 404,
                message: "task not found".to_string(),
            })?;
        f(task);
        Ok(task.clone())
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn bootstrap(&self) -> Result<Bootstrap, GatewayError> {
        self.record("GET bootstrap".to_string());
        let data = self.data.lock();
        Ok(data.bootstrap.clone().unwrap_or_else(|| Bootstrap {
            teams: data.teams.clone(),
            ..Bootstrap::default()
        }))
    }

    async fn teams(&self) -> Result<Vec<TeamSummary>, GatewayError> {
        self.record("GET teams".to_string());
        let (teams, delay) = {
            let mut data = self.data.lock();
            (data.teams.clone(), data.list_delays.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(teams)
    }

    async fn tasks(&self, team: &str, _limit: usize) -> Result<Vec<Task>, GatewayError> {
        self.record(format!("GET tasks {}", team));
        let failure = self.read_failure(team, true);
        self.delay_for(team).await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(self.data.lock().tasks.get(team).cloned().unwrap_or_default())
    }

    async fn task(&self, team: &str, task_id: i64) -> Result<Task, GatewayError> {
        self.record(format!("GET task {} {}", team, task_id));
        self.update_task(team, task_id, |_| {})
    }

    async fn agents(&self, team: &str) -> Result<Vec<Agent>, GatewayError> {
        self.record(format!("GET agents {}", team));
        let failure = self.read_failure(team, false);
        self.delay_for(team).await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(self.data.lock().agents.get(team).cloned().unwrap_or_default())
    }

    async fn create_task(&self, team: &str, task: &NewTask) -> Result<CreatedTask, GatewayError> {
        self.record(format!("POST task {} {} {}", team, task.title, task.status));
        if let Some(e) = self.mutation_failure() {
            return Err(e);
        }
        let mut data = self.data.lock();
        data.next_task_id += 1;
        let task_id = 100 + data.next_task_id;
        data.tasks
            .entry(team.to_string())
            .or_default()
            .push(self::task(task_id, &task.title, task.status));
        Ok(CreatedTask { task_id })
    }

    async fn patch_task(
        &self,
        team: &str,
        task_id: i64,
        patch: &TaskPatch,
    ) -> Result<TaskUpdate, GatewayError> {
        let mut fields = Vec::new();
        if let Some(status) = patch.status {
            fields.push(format!("status={}", status));
        }
        if let Some(assignee) = &patch.assignee {
            fields.push(format!("assignee={}", assignee.as_deref().unwrap_or("-")));
        }
        self.record(format!("PATCH {} {} {}", team, task_id, fields.join(" ")));
        if let Some(e) = self.mutation_failure() {
            return Err(e);
        }
        let task = self.update_task(team, task_id, |task| {
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(assignee) = &patch.assignee {
                task.assignee = assignee.clone();
            }
        })?;
        if self.data.lock().ack_only_patches {
            return Ok(TaskUpdate {
                task_id: Some(task_id),
                ..TaskUpdate::default()
            });
        }
        Ok(task.into())
    }

    async fn approve_task(
        &self,
        team: &str,
        task_id: i64,
        outcome: &Outcome,
    ) -> Result<StageResponse, GatewayError> {
        self.record(format!("APPROVE {} {} {}", team, task_id, outcome));
        if let Some(e) = self.mutation_failure() {
            return Err(e);
        }
        let forced = self.data.lock().approve_stage.clone();
        let mut next = None;
        self.update_task(team, task_id, |task| {
            let predicted = task.current_stage.as_deref().and_then(|stage| {
                Workflow::default_workflow()
                    .next_stage(stage, outcome)
                    .ok()
            });
            next = forced.or(predicted);
            if next.is_some() {
                task.current_stage = next.clone();
            }
        })?;
        Ok(StageResponse {
            ok: next.is_some(),
            current_stage: next,
        })
    }

    async fn request_review(
        &self,
        team: &str,
        task_id: i64,
    ) -> Result<StageResponse, GatewayError> {
        self.record(format!("REQUEST_REVIEW {} {}", team, task_id));
        if let Some(e) = self.mutation_failure() {
            return Err(e);
        }
        let task = self.update_task(team, task_id, |task| {
            task.current_stage = Some("InReview".to_string());
            task.status = TaskStatus::InReview;
        })?;
        Ok(StageResponse {
            ok: true,
            current_stage: task.current_stage,
        })
    }

    async fn submit_review(
        &self,
        team: &str,
        task_id: i64,
        review: &ReviewSubmission,
    ) -> Result<Ack, GatewayError> {
        self.record(format!(
            "SUBMIT_REVIEW {} {} {} by {}",
            team, task_id, review.outcome, review.reviewer_agent
        ));
        if let Some(e) = self.mutation_failure() {
            return Err(e);
        }
        self.update_task(team, task_id, |task| {
            let next = task.current_stage.as_deref().and_then(|stage| {
                Workflow::default_workflow()
                    .next_stage(stage, &review.outcome)
                    .ok()
            });
            if next.is_some() {
                task.current_stage = next;
            }
        })?;
        Ok(Ack { ok: true })
    }

    async fn task_reviews(
        &self,
        team: &str,
        task_id: i64,
    ) -> Result<Vec<TaskReview>, GatewayError> {
        self.record(format!("GET reviews {} {}", team, task_id));
        Ok(Vec::new())
    }

    async fn task_diff(&self, team: &str, task_id: i64) -> Result<TaskDiff, GatewayError> {
        self.record(format!("GET diff {} {}", team, task_id));
        Ok(TaskDiff::default())
    }

    async fn messages(&self, team: &str, recipient: &str) -> Result<Vec<Message>, GatewayError> {
        self.record(format!("GET messages {} {}", team, recipient));
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        team: &str,
        recipient: &str,
        content: &str,
    ) -> Result<(), GatewayError> {
        self.record(format!("POST message {} {} {}", team, recipient, content));
        Ok(())
    }

    async fn charter(&self, team: &str) -> Result<TextDocument, GatewayError> {
        self.record(format!("GET charter {}", team));
        Ok(TextDocument::default())
    }

    async fn journal(
        &self,
        team: &str,
        agent: &str,
        _limit_bytes: Option<u64>,
    ) -> Result<TextDocument, GatewayError> {
        self.record(format!("GET journal {} {}", team, agent));
        Ok(TextDocument::default())
    }

    async fn agent_config(&self, team: &str, agent: &str) -> Result<AgentConfig, GatewayError> {
        self.record(format!("GET agent_config {} {}", team, agent));
        Ok(AgentConfig::default())
    }

    async fn network(&self) -> Result<NetworkAllowlist, GatewayError> {
        self.record("GET network".to_string());
        let (network, delay) = {
            let mut data = self.data.lock();
            (data.network.clone(), data.list_delays.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(network)
    }

    async fn network_allow(&self, domain: &str) -> Result<Ack, GatewayError> {
        self.record(format!("POST network allow {}", domain));
        self.data.lock().network.allowlist.push(domain.to_string());
        Ok(Ack { ok: true })
    }

    async fn network_disallow(&self, domain: &str) -> Result<Ack, GatewayError> {
        self.record(format!("POST network disallow {}", domain));
        self.data.lock().network.allowlist.retain(|d| d != domain);
        Ok(Ack { ok: true })
    }

    async fn network_reset(&self) -> Result<Ack, GatewayError> {
        self.record("POST network reset".to_string());
        self.data.lock().network = NetworkAllowlist::default();
        Ok(Ack { ok: true })
    }

    fn stream_url(&self) -> String {
        "http://fake.invalid/stream".to_string()
    }
}
