//! Wire types exchanged with the orchestration server.
//!
//! The server is not consistent about field casing: some endpoints emit Go
//! struct names (`TaskID`, `Title`), others snake_case (`task_id`). Every
//! type here accepts both and serializes one canonical snake_case shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::workflow::{Outcome, TaskStatus};

/// Treat an explicit JSON `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Summary row for a team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamSummary {
    #[serde(default, alias = "TeamID", deserialize_with = "null_as_default")]
    pub team_id: String,
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "CreatedAt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "AgentCount")]
    pub agent_count: u32,
    #[serde(default, alias = "TaskCount")]
    pub task_count: u32,
}

/// A team member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Role", deserialize_with = "null_as_default")]
    pub role: String,
    #[serde(default, alias = "CreatedAt")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A task in canonical form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTask")]
pub struct Task {
    pub task_id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub dri: Option<String>,
    pub workflow_id: Option<String>,
    pub current_stage: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Task as it arrives on the wire, with both casings captured separately.
///
/// PascalCase wins when both spellings are present.
#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(rename = "TaskID")]
    task_id_pascal: Option<i64>,
    task_id: Option<i64>,
    #[serde(rename = "Title")]
    title_pascal: Option<String>,
    title: Option<String>,
    #[serde(rename = "Status")]
    status_pascal: Option<TaskStatus>,
    status: Option<TaskStatus>,
    #[serde(rename = "Assignee")]
    assignee_pascal: Option<String>,
    assignee: Option<String>,
    #[serde(rename = "DRI")]
    dri_pascal: Option<String>,
    dri: Option<String>,
    #[serde(rename = "WorkflowID")]
    workflow_id_pascal: Option<String>,
    workflow_id: Option<String>,
    #[serde(rename = "CurrentStage")]
    current_stage_pascal: Option<String>,
    current_stage: Option<String>,
    #[serde(rename = "CreatedAt")]
    created_at_pascal: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    #[serde(rename = "UpdatedAt")]
    updated_at_pascal: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<RawTask> for Task {
    type Error = String;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        let task_id = raw
            .task_id_pascal
            .or(raw.task_id)
            .ok_or_else(|| "task is missing task_id".to_string())?;

        Ok(Task {
            task_id,
            title: raw.title_pascal.or(raw.title).unwrap_or_default(),
            status: raw.status_pascal.or(raw.status).unwrap_or(TaskStatus::Todo),
            assignee: raw.assignee_pascal.or(raw.assignee),
            dri: raw.dri_pascal.or(raw.dri),
            workflow_id: raw.workflow_id_pascal.or(raw.workflow_id),
            current_stage: raw.current_stage_pascal.or(raw.current_stage),
            created_at: raw.created_at_pascal.or(raw.created_at),
            updated_at: raw.updated_at_pascal.or(raw.updated_at),
        })
    }
}

/// Reply to a task PATCH.
///
/// The server answers with the updated row, or with a bare
/// `{"task_id": .., "ok": true}` acknowledgement when it has no row to
/// echo. Fields it did not send stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawTask")]
pub struct TaskUpdate {
    pub task_id: Option<i64>,
    pub status: Option<TaskStatus>,
    pub assignee: Option<String>,
    pub current_stage: Option<String>,
}

impl From<RawTask> for TaskUpdate {
    fn from(raw: RawTask) -> Self {
        TaskUpdate {
            task_id: raw.task_id_pascal.or(raw.task_id),
            status: raw.status_pascal.or(raw.status),
            assignee: raw.assignee_pascal.or(raw.assignee),
            current_stage: raw.current_stage_pascal.or(raw.current_stage),
        }
    }
}

impl From<Task> for TaskUpdate {
    fn from(task: Task) -> Self {
        TaskUpdate {
            task_id: Some(task.task_id),
            status: Some(task.status),
            assignee: task.assignee,
            current_stage: task.current_stage,
        }
    }
}

impl Task {
    /// Normalize a list of raw task objects.
    ///
    /// Entries that cannot be normalized are skipped with a warning so that
    /// one bad row does not hide the rest of the board.
    pub fn normalize_all(values: Vec<Value>) -> Vec<Task> {
        values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<Task>(value) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("Skipping malformed task: {}", e);
                    None
                }
            })
            .collect()
    }
}

fn lenient_tasks<'de, D>(deserializer: D) -> Result<Option<Vec<Task>>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(values.map(Task::normalize_all))
}

/// Server identity block from `/config` and `/bootstrap`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub human_name: String,
    #[serde(default)]
    pub hc_home: String,
    #[serde(default)]
    pub bootstrap_id: String,
}

/// Network allowlist
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkAllowlist {
    #[serde(default, deserialize_with = "null_as_default")]
    pub allowlist: Vec<String>,
}

/// Payload of `GET /bootstrap`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub config: Option<ServerConfig>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub teams: Vec<TeamSummary>,
    #[serde(default)]
    pub initial_team: Option<String>,
    /// Tasks of the initial team, when the server pre-loads them
    #[serde(default, deserialize_with = "lenient_tasks")]
    pub tasks: Option<Vec<Task>>,
    #[serde(default)]
    pub agents: Option<Vec<Agent>>,
    #[serde(default)]
    pub network: Option<NetworkAllowlist>,
}

impl Bootstrap {
    /// Team to select first: the server's choice, else the first team.
    pub fn initial_team_name(&self) -> Option<String> {
        self.initial_team
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| self.teams.first().map(|t| t.name.clone()))
    }
}

/// Body of `POST /teams/{team}/tasks`
#[derive(Debug, Clone, Serialize)]
pub struct NewTask {
    pub title: String,
    pub status: TaskStatus,
}

/// Response of task creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CreatedTask {
    pub task_id: i64,
}

/// Body of `PATCH /teams/{team}/tasks/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the assignee
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Option<String>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            assignee: None,
        }
    }

    pub fn assignee(assignee: Option<String>) -> Self {
        Self {
            status: None,
            assignee: Some(assignee),
        }
    }
}

/// Response of approve / request-review
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StageResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub current_stage: Option<String>,
}

/// Generic `{ok}` response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub ok: bool,
}

/// A chat message between the operator and an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: Option<i64>,
    pub sender: String,
    #[serde(default)]
    pub recipient: Option<String>,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A review recorded against a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReview {
    pub review_id: i64,
    pub task_id: i64,
    #[serde(default)]
    pub reviewer_agent: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Body of `POST /teams/{team}/tasks/{id}/submit-review`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewSubmission {
    pub reviewer_agent: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// Unified diff of a task branch
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskDiff {
    #[serde(default)]
    pub diff: String,
}

/// Plain text document (charter, journal)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextDocument {
    #[serde(default)]
    pub content: String,
}

/// Per-agent model settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub max_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_snake_case() {
        let json = r#"{
            "task_id": 7,
            "title": "Fix login",
            "status": "in_review",
            "assignee": "alice",
            "workflow_id": "wf-1",
            "current_stage": "InReview",
            "created_at": "2025-03-01T10:00:00Z",
            "updated_at": "2025-03-01T11:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_id, 7);
        assert_eq!(task.status, TaskStatus::InReview);
        assert_eq!(task.assignee.as_deref(), Some("alice"));
        assert_eq!(task.current_stage.as_deref(), Some("InReview"));
        assert!(task.created_at.is_some());
    }

    #[test]
    fn test_task_pascal_case_matches_snake_case() {
        let pascal = r#"{
            "TaskID": 7,
            "Title": "Fix login",
            "Status": "in_review",
            "Assignee": "alice",
            "DRI": null,
            "WorkflowID": "wf-1",
            "CurrentStage": "InReview",
            "CreatedAt": "2025-03-01T10:00:00Z",
            "UpdatedAt": "2025-03-01T11:00:00Z"
        }"#;
        let snake = r#"{
            "task_id": 7,
            "title": "Fix login",
            "status": "in_review",
            "assignee": "alice",
            "workflow_id": "wf-1",
            "current_stage": "InReview",
            "created_at": "2025-03-01T10:00:00Z",
            "updated_at": "2025-03-01T11:00:00Z"
        }"#;
        let a: Task = serde_json::from_str(pascal).unwrap();
        let b: Task = serde_json::from_str(snake).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_task_pascal_wins_when_both_present() {
        let json = r#"{"TaskID": 3, "task_id": 4, "Title": "A", "title": "B"}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_id, 3);
        assert_eq!(task.title, "A");
        assert_eq!(task.status, TaskStatus::Todo);
    }

    #[test]
    fn test_task_serializes_canonical_shape() {
        let task: Task = serde_json::from_str(r#"{"TaskID": 1, "Title": "x", "Status": "done"}"#).unwrap();
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["task_id"], 1);
        assert_eq!(value["status"], "done");
        assert!(value.get("TaskID").is_none());
    }

    #[test]
    fn test_task_update_from_ack() {
        let ack: TaskUpdate = serde_json::from_str(r#"{"task_id":7,"ok":true}"#).unwrap();
        assert_eq!(
            ack,
            TaskUpdate {
                task_id: Some(7),
                ..TaskUpdate::default()
            }
        );

        let row: TaskUpdate =
            serde_json::from_str(r#"{"TaskID":7,"Status":"in_approval","Assignee":"bob"}"#)
                .unwrap();
        assert_eq!(row.status, Some(TaskStatus::InApproval));
        assert_eq!(row.assignee.as_deref(), Some("bob"));
    }

    #[test]
    fn test_task_without_id_fails() {
        assert!(serde_json::from_str::<Task>(r#"{"title": "orphan"}"#).is_err());
    }

    #[test]
    fn test_normalize_all_skips_bad_rows() {
        let values = vec![
            serde_json::json!({"task_id": 1, "title": "ok", "status": "todo"}),
            serde_json::json!({"task_id": 2, "status": "exploded"}),
            serde_json::json!({"TaskID": 3, "Title": "also ok"}),
        ];
        let tasks = Task::normalize_all(values);
        let ids: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_team_summary_both_casings() {
        let pascal: TeamSummary = serde_json::from_str(
            r#"{"TeamID": "t1", "Name": "alpha", "AgentCount": 2, "TaskCount": 5}"#,
        )
        .unwrap();
        let snake: TeamSummary = serde_json::from_str(
            r#"{"team_id": "t1", "name": "alpha", "agent_count": 2, "task_count": 5}"#,
        )
        .unwrap();
        assert_eq!(pascal, snake);
    }

    #[test]
    fn test_bootstrap_with_nulls() {
        let json = r#"{
            "config": {"human_name": "ops", "hc_home": "/srv", "bootstrap_id": "abc"},
            "teams": null,
            "initial_team": null,
            "network": {"allowlist": null}
        }"#;
        let b: Bootstrap = serde_json::from_str(json).unwrap();
        assert!(b.teams.is_empty());
        assert!(b.tasks.is_none());
        assert_eq!(b.initial_team_name(), None);
        assert!(b.network.unwrap().allowlist.is_empty());
    }

    #[test]
    fn test_bootstrap_initial_team_falls_back_to_first() {
        let json = r#"{
            "teams": [{"Name": "alpha"}, {"Name": "beta"}],
            "initial_team": "",
            "tasks": [{"TaskID": 1, "Title": "a", "Status": "todo"}, {"bogus": true}],
            "agents": [{"Name": "dev", "Role": "engineer"}]
        }"#;
        let b: Bootstrap = serde_json::from_str(json).unwrap();
        assert_eq!(b.initial_team_name().as_deref(), Some("alpha"));
        assert_eq!(b.tasks.as_ref().map(|t| t.len()), Some(1));
        assert_eq!(b.agents.unwrap()[0].role, "engineer");
    }

    #[test]
    fn test_task_patch_serialization() {
        let patch = TaskPatch::status(TaskStatus::InApproval);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!({"status": "in_approval"})
        );
        let clear = TaskPatch::assignee(None);
        assert_eq!(
            serde_json::to_value(&clear).unwrap(),
            serde_json::json!({"assignee": null})
        );
    }
}
