//! Push notifications received over `/stream`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

/// Type tag of a push notification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    TaskUpdate,
    TeamUpdate,
    AgentUpdate,
    NetworkUpdate,
    Message,
    /// Any type this client does not act on (`repo_update`, ...)
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::TaskUpdate => "task_update",
            NotificationKind::TeamUpdate => "team_update",
            NotificationKind::AgentUpdate => "agent_update",
            NotificationKind::NetworkUpdate => "network_update",
            NotificationKind::Message => "message",
            NotificationKind::Other(s) => s,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "task_update" => NotificationKind::TaskUpdate,
            "team_update" => NotificationKind::TeamUpdate,
            "agent_update" => NotificationKind::AgentUpdate,
            "network_update" => NotificationKind::NetworkUpdate,
            "message" => NotificationKind::Message,
            _ => NotificationKind::Other(s),
        }
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded push notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamNotification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, deserialize_with = "lenient_string")]
    pub team: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub task_id: Option<i64>,
    /// Raw status string; unknown values must not drop the notification
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub current_stage: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub assignee: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub agent: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub message_id: Option<i64>,
}

// Payload fields never drop a notification: an unexpected shape reads as absent.

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

impl StreamNotification {
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            team: None,
            task_id: None,
            status: None,
            current_stage: None,
            assignee: None,
            agent: None,
            message_id: None,
        }
    }

    pub fn for_team(kind: NotificationKind, team: &str) -> Self {
        Self {
            team: Some(team.to_string()),
            ..Self::new(kind)
        }
    }

    /// Whether this notification concerns `team`
    pub fn is_for_team(&self, team: &str) -> bool {
        self.team.as_deref() == Some(team)
    }
}

/// What a single stream frame carried
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Server handshake (`{"type": "connected"}`)
    Connected,
    Notification(StreamNotification),
}

/// Decode one frame's data.
///
/// Returns `None` for anything that is not a JSON object with a string
/// `type` field; such frames are dropped.
pub fn decode(data: &str) -> Option<Inbound> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!("Dropping non-JSON stream frame: {}", e);
            return None;
        }
    };

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => {
            debug!("Dropping stream frame without type: {}", data);
            return None;
        }
    };
    if kind == "connected" {
        return Some(Inbound::Connected);
    }

    match serde_json::from_value::<StreamNotification>(value) {
        Ok(n) => Some(Inbound::Notification(n)),
        Err(e) => {
            debug!("Dropping malformed {} notification: {}", kind, e);
            None
        }
    }
}
