//! reqwest-backed [`Gateway`] implementation.

use async_trait::async_trait;
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::types::*;
use super::{Gateway, GatewayError};
use crate::workflow::Outcome;

/// Error body written by the server (`{"error": "..."}`)
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// `/messages` answers either a bare list or `{"messages": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum MessageList {
    Bare(Vec<Message>),
    Wrapped {
        #[serde(default)]
        messages: Vec<Message>,
    },
}

#[derive(Deserialize)]
struct ReviewList {
    #[serde(default)]
    reviews: Option<Vec<TaskReview>>,
}

/// HTTP client for the orchestration server
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base: Url,
}

impl HttpGateway {
    /// Create a gateway for `base_url` (e.g. `http://localhost:3548`).
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        let base = Url::parse(base_url)
            .map_err(|e| GatewayError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { client, base })
    }

    /// Base URL requests are resolved against
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Build a URL from path segments; each segment is percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    fn team_url(&self, team: &str, rest: &[&str]) -> Url {
        let mut segments = vec!["teams", team];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Response, GatewayError> {
        debug!("{} {}", method, url);
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, GatewayError> {
        let response = self.send(Method::GET, url, None).await?;
        decode(response).await
    }

    async fn send_json<B, T>(&self, method: Method, url: Url, body: &B) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let response = self.send(method, url, Some(body)).await?;
        decode(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());
    Err(GatewayError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn bootstrap(&self) -> Result<Bootstrap, GatewayError> {
        self.get_json(self.url(&["bootstrap"])).await
    }

    async fn teams(&self) -> Result<Vec<TeamSummary>, GatewayError> {
        let teams: Option<Vec<TeamSummary>> = self.get_json(self.url(&["teams"])).await?;
        Ok(teams.unwrap_or_default())
    }

    async fn tasks(&self, team: &str, limit: usize) -> Result<Vec<Task>, GatewayError> {
        let mut url = self.team_url(team, &["tasks"]);
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        let list: Value = self.get_json(url).await?;
        match list {
            Value::Array(values) => Ok(Task::normalize_all(values)),
            _ => Ok(Vec::new()),
        }
    }

    async fn task(&self, team: &str, task_id: i64) -> Result<Task, GatewayError> {
        let id = task_id.to_string();
        self.get_json(self.team_url(team, &["tasks", &id])).await
    }

    async fn agents(&self, team: &str) -> Result<Vec<Agent>, GatewayError> {
        let agents: Option<Vec<Agent>> = self.get_json(self.team_url(team, &["agents"])).await?;
        Ok(agents.unwrap_or_default())
    }

    async fn create_task(&self, team: &str, task: &NewTask) -> Result<CreatedTask, GatewayError> {
        self.send_json(Method::POST, self.team_url(team, &["tasks"]), task)
            .await
    }

    async fn patch_task(
        &self,
        team: &str,
        task_id: i64,
        patch: &TaskPatch,
    ) -> Result<TaskUpdate, GatewayError> {
        let id = task_id.to_string();
        self.send_json(Method::PATCH, self.team_url(team, &["tasks", &id]), patch)
            .await
    }

    async fn approve_task(
        &self,
        team: &str,
        task_id: i64,
        outcome: &Outcome,
    ) -> Result<StageResponse, GatewayError> {
        #[derive(Serialize)]
        struct Body<'a> {
            outcome: &'a Outcome,
        }
        let id = task_id.to_string();
        self.send_json(
            Method::POST,
            self.team_url(team, &["tasks", &id, "approve"]),
            &Body { outcome },
        )
        .await
    }

    async fn request_review(
        &self,
        team: &str,
        task_id: i64,
    ) -> Result<StageResponse, GatewayError> {
        let id = task_id.to_string();
        self.send_json(
            Method::POST,
            self.team_url(team, &["tasks", &id, "request-review"]),
            &serde_json::json!({}),
        )
        .await
    }

    async fn submit_review(
        &self,
        team: &str,
        task_id: i64,
        review: &ReviewSubmission,
    ) -> Result<Ack, GatewayError> {
        let id = task_id.to_string();
        self.send_json(
            Method::POST,
            self.team_url(team, &["tasks", &id, "submit-review"]),
            review,
        )
        .await
    }

    async fn task_reviews(
        &self,
        team: &str,
        task_id: i64,
    ) -> Result<Vec<TaskReview>, GatewayError> {
        let id = task_id.to_string();
        let list: ReviewList = self
            .get_json(self.team_url(team, &["tasks", &id, "reviews"]))
            .await?;
        Ok(list.reviews.unwrap_or_default())
    }

    async fn task_diff(&self, team: &str, task_id: i64) -> Result<TaskDiff, GatewayError> {
        let id = task_id.to_string();
        self.get_json(self.team_url(team, &["tasks", &id, "diff"]))
            .await
    }

    async fn messages(&self, team: &str, recipient: &str) -> Result<Vec<Message>, GatewayError> {
        let mut url = self.team_url(team, &["messages"]);
        url.query_pairs_mut().append_pair("recipient", recipient);
        // An unreadable inbox renders as empty rather than as an error.
        let response = match self.send(Method::GET, url, None).await {
            Ok(response) => response,
            Err(GatewayError::Status { status, message }) => {
                debug!("messages unavailable ({}): {}", status, message);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let list: Option<MessageList> = decode(response).await?;
        Ok(match list {
            Some(MessageList::Bare(messages)) | Some(MessageList::Wrapped { messages }) => messages,
            None => Vec::new(),
        })
    }

    async fn send_message(
        &self,
        team: &str,
        recipient: &str,
        content: &str,
    ) -> Result<(), GatewayError> {
        let body = serde_json::json!({ "recipient": recipient, "content": content });
        self.send(Method::POST, self.team_url(team, &["messages"]), Some(body))
            .await?;
        Ok(())
    }

    async fn charter(&self, team: &str) -> Result<TextDocument, GatewayError> {
        self.get_json(self.team_url(team, &["charter"])).await
    }

    async fn journal(
        &self,
        team: &str,
        agent: &str,
        limit_bytes: Option<u64>,
    ) -> Result<TextDocument, GatewayError> {
        let mut url = self.team_url(team, &["agents", agent, "journal"]);
        if let Some(limit) = limit_bytes.filter(|l| *l > 0) {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        self.get_json(url).await
    }

    async fn agent_config(&self, team: &str, agent: &str) -> Result<AgentConfig, GatewayError> {
        self.get_json(self.team_url(team, &["agents", agent, "config"]))
            .await
    }

    async fn network(&self) -> Result<NetworkAllowlist, GatewayError> {
        self.get_json(self.url(&["network"])).await
    }

    async fn network_allow(&self, domain: &str) -> Result<Ack, GatewayError> {
        let body = serde_json::json!({ "domain": domain });
        self.send_json(Method::POST, self.url(&["network", "allow"]), &body)
            .await
    }

    async fn network_disallow(&self, domain: &str) -> Result<Ack, GatewayError> {
        let body = serde_json::json!({ "domain": domain });
        self.send_json(Method::POST, self.url(&["network", "disallow"]), &body)
            .await
    }

    async fn network_reset(&self) -> Result<Ack, GatewayError> {
        let response = self
            .send(Method::POST, self.url(&["network", "reset"]), None)
            .await?;
        decode(response).await
    }

    fn stream_url(&self) -> String {
        self.url(&["stream"]).to_string()
    }
}
