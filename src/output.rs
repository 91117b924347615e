//! Plain-text rendering of board data for the terminal.

use std::fmt::Write as _;

use agentdeck_core::gateway::{Message, Task, TaskReview, TeamSummary};
use agentdeck_core::sync::{LoadPhase, Snapshot};
use agentdeck_core::workflow::TaskStatus;
use chrono::{DateTime, Utc};

/// One line per task: `#7 [in_review] Fix login (@alice, stage InReview)`
pub fn task_line(task: &Task) -> String {
    let mut line = format!("#{} [{}] {}", task.task_id, task.status, task.title);
    let mut extras = Vec::new();
    if let Some(assignee) = &task.assignee {
        extras.push(format!("@{}", assignee));
    }
    if let Some(stage) = &task.current_stage {
        extras.push(format!("stage {}", stage));
    }
    if !extras.is_empty() {
        let _ = write!(line, " ({})", extras.join(", "));
    }
    line
}

/// Tasks grouped by board column; empty columns are skipped.
pub fn board(snapshot: &Snapshot, phase: LoadPhase) -> String {
    let mut out = String::new();
    let team = snapshot.selected_team.as_deref().unwrap_or("(no team)");
    let _ = writeln!(out, "== {} [{}] ==", team, phase);

    let columns = TaskStatus::BOARD
        .iter()
        .copied()
        .chain([TaskStatus::Cancelled]);
    for status in columns {
        let tasks: Vec<&Task> = snapshot.tasks.iter().filter(|t| t.status == status).collect();
        if tasks.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{} ({})", status.display_name(), tasks.len());
        for task in tasks {
            let _ = writeln!(out, "  {}", task_line(task));
        }
    }
    if snapshot.tasks.is_empty() {
        out.push_str("  no tasks\n");
    }
    out
}

pub fn team_line(team: &TeamSummary) -> String {
    format!(
        "{} ({} agents, {} tasks)",
        team.name, team.agent_count, team.task_count
    )
}

pub fn review_line(review: &TaskReview) -> String {
    let mut line = format!(
        "{} {} by {}",
        timestamp(review.created_at),
        review.outcome,
        review.reviewer_agent
    );
    if !review.comments.is_empty() {
        let _ = write!(line, ": {}", review.comments);
    }
    line
}

pub fn message_line(message: &Message) -> String {
    format!(
        "{} <{}> {}",
        timestamp(message.created_at),
        message.sender,
        message.content
    )
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}
