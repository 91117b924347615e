//! Data access gateway: typed request/response calls against the server.
//!
//! The synchronization controller and transition executor only see the
//! [`Gateway`] trait. [`HttpGateway`] is the production implementation.

mod http;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use thiserror::Error;

use crate::workflow::Outcome;

pub use http::HttpGateway;
pub use types::{
    Ack, Agent, AgentConfig, Bootstrap, CreatedTask, Message, NetworkAllowlist, NewTask,
    ReviewSubmission, ServerConfig, StageResponse, Task, TaskDiff, TaskPatch, TaskReview,
    TaskUpdate, TeamSummary, TextDocument,
};

/// Error type for gateway calls
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request never produced a response (connection refused, reset, ...)
    #[error("request failed: {0}")]
    Transport(String),

    /// The server answered with a non-success status
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body did not match the expected shape
    #[error("invalid response body: {0}")]
    Decode(String),

    /// The configured base URL cannot be used
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

impl GatewayError {
    /// Short message suitable for a status line
    pub fn short_message(&self) -> String {
        match self {
            GatewayError::Status { status, message } if message.is_empty() => {
                format!("server returned {}", status)
            }
            GatewayError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            GatewayError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Calls the dashboard makes against the orchestration server.
///
/// Implementations normalize task payloads before returning them; callers
/// always see the canonical [`Task`] shape.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// `GET /bootstrap`
    async fn bootstrap(&self) -> Result<Bootstrap, GatewayError>;

    /// `GET /teams`
    async fn teams(&self) -> Result<Vec<TeamSummary>, GatewayError>;

    /// `GET /teams/{team}/tasks?limit=N`
    async fn tasks(&self, team: &str, limit: usize) -> Result<Vec<Task>, GatewayError>;

    /// `GET /teams/{team}/tasks/{id}`
    async fn task(&self, team: &str, task_id: i64) -> Result<Task, GatewayError>;

    /// `GET /teams/{team}/agents`
    async fn agents(&self, team: &str) -> Result<Vec<Agent>, GatewayError>;

    /// `POST /teams/{team}/tasks`
    async fn create_task(&self, team: &str, task: &NewTask) -> Result<CreatedTask, GatewayError>;

    /// `PATCH /teams/{team}/tasks/{id}`
    async fn patch_task(
        &self,
        team: &str,
        task_id: i64,
        patch: &TaskPatch,
    ) -> Result<TaskUpdate, GatewayError>;

    /// `POST /teams/{team}/tasks/{id}/approve`
    async fn approve_task(
        &self,
        team: &str,
        task_id: i64,
        outcome: &Outcome,
    ) -> Result<StageResponse, GatewayError>;

    /// `POST /teams/{team}/tasks/{id}/request-review`
    async fn request_review(&self, team: &str, task_id: i64)
        -> Result<StageResponse, GatewayError>;

    /// `POST /teams/{team}/tasks/{id}/submit-review`
    async fn submit_review(
        &self,
        team: &str,
        task_id: i64,
        review: &ReviewSubmission,
    ) -> Result<Ack, GatewayError>;

    /// `GET /teams/{team}/tasks/{id}/reviews`
    async fn task_reviews(&self, team: &str, task_id: i64)
        -> Result<Vec<TaskReview>, GatewayError>;

    /// `GET /teams/{team}/tasks/{id}/diff`
    async fn task_diff(&self, team: &str, task_id: i64) -> Result<TaskDiff, GatewayError>;

    /// `GET /teams/{team}/messages?recipient=...`
    async fn messages(&self, team: &str, recipient: &str) -> Result<Vec<Message>, GatewayError>;

    /// `POST /teams/{team}/messages`
    async fn send_message(
        &self,
        team: &str,
        recipient: &str,
        content: &str,
    ) -> Result<(), GatewayError>;

    /// `GET /teams/{team}/charter`
    async fn charter(&self, team: &str) -> Result<TextDocument, GatewayError>;

    /// `GET /teams/{team}/agents/{agent}/journal[?limit=bytes]`
    async fn journal(
        &self,
        team: &str,
        agent: &str,
        limit_bytes: Option<u64>,
    ) -> Result<TextDocument, GatewayError>;

    /// `GET /teams/{team}/agents/{agent}/config`
    async fn agent_config(&self, team: &str, agent: &str) -> Result<AgentConfig, GatewayError>;

    /// `GET /network`
    async fn network(&self) -> Result<NetworkAllowlist, GatewayError>;

    /// `POST /network/allow`
    async fn network_allow(&self, domain: &str) -> Result<Ack, GatewayError>;

    /// `POST /network/disallow`
    async fn network_disallow(&self, domain: &str) -> Result<Ack, GatewayError>;

    /// `POST /network/reset`
    async fn network_reset(&self) -> Result<Ack, GatewayError>;

    /// URL of the server-push channel (`/stream`)
    fn stream_url(&self) -> String;
}
