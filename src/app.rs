//! Command runner: wires the core services and executes one subcommand.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use agentdeck_core::config::{Command, NetworkAction, Settings};
use agentdeck_core::gateway::{Gateway, HttpGateway, ServerConfig, Task};
use agentdeck_core::stream::{ConnectionState, EventStreamClient};
use agentdeck_core::sync::{RefreshOutcome, SyncController, SyncEvent, SyncOptions};
use agentdeck_core::transition::{TransitionExecutor, TransitionReceipt};
use agentdeck_core::workflow::TaskStatus;

use crate::output;

/// Chat sender name when neither settings nor server provide one
const DEFAULT_HUMAN_NAME: &str = "human";

/// Sender name used for the operator's chat inbox
pub fn human_name(settings: &Settings, server: Option<&ServerConfig>) -> String {
    settings
        .human_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| {
            server
                .map(|c| c.human_name.clone())
                .filter(|n| !n.trim().is_empty())
        })
        .unwrap_or_else(|| DEFAULT_HUMAN_NAME.to_string())
}

/// Main application
pub struct App {
    settings: Settings,
    /// Team requested on the command line
    team: Option<String>,
}

impl App {
    pub fn new(settings: Settings, team: Option<String>) -> Self {
        Self { settings, team }
    }

    /// Run one command against the configured server
    pub async fn run(&mut self, command: Command) -> Result<()> {
        let gateway = HttpGateway::new(&self.settings.api_base)
            .with_context(|| format!("Invalid api_base: {}", self.settings.api_base))?;
        debug!("Using server {}", gateway.base_url());
        let gateway: Arc<dyn Gateway> = Arc::new(gateway);

        if let Command::Network { action } = &command {
            return network(gateway.as_ref(), action.clone()).await;
        }

        let sync = SyncController::new(gateway.clone(), SyncOptions::from_settings(&self.settings));
        sync.bootstrap()
            .await
            .context("Failed to load bootstrap data")?;
        if let Some(team) = &self.team {
            if let RefreshOutcome::Failed(message) = sync.select_team(team).await {
                bail!("Failed to load team {}: {}", team, message);
            }
        }

        let executor = TransitionExecutor::new(sync.clone());
        self.dispatch(command, &sync, &executor).await
    }

    async fn dispatch(
        &self,
        command: Command,
        sync: &SyncController,
        executor: &TransitionExecutor,
    ) -> Result<()> {
        let gateway = sync.gateway().clone();

        if let Command::Teams = command {
            for team in sync.snapshot().teams {
                println!("{}", output::team_line(&team));
            }
            return Ok(());
        }
        if let Command::Watch = command {
            return self.watch(sync).await;
        }

        let team = sync
            .selected_team()
            .context("No team available; pass --team")?;

        match command {
            Command::Tasks { json } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sync.tasks())?);
                } else {
                    print!("{}", output::board(&sync.snapshot(), sync.phase()));
                }
            }
            Command::Move { task_id, to } => {
                let task = find_task(sync, &team, task_id).await?;
                let receipt = executor.move_task(&team, task_id, task.status, to).await?;
                report(receipt).await;
            }
            Command::Outcome { task_id, outcome } => {
                let task = find_task(sync, &team, task_id).await?;
                let receipt = executor
                    .apply_outcome(&team, task_id, task.status, &outcome)
                    .await?;
                report(receipt).await;
            }
            Command::Approve { task_id, outcome } => {
                let task = find_task(sync, &team, task_id).await?;
                let receipt = executor.approve(&team, &task, &outcome).await?;
                report(receipt).await;
            }
            Command::RequestReview { task_id } => {
                let task = find_task(sync, &team, task_id).await?;
                let receipt = executor.request_review(&team, &task).await?;
                report(receipt).await;
            }
            Command::Create { title, in_progress } => {
                let status = if in_progress {
                    TaskStatus::InProgress
                } else {
                    TaskStatus::Todo
                };
                let receipt = executor.create_task(&team, &title, status).await?;
                report(receipt).await;
            }
            Command::Assign { task_id, assignee } => {
                let receipt = executor
                    .assign(&team, task_id, assignee.as_deref())
                    .await?;
                report(receipt).await;
            }
            Command::Approvals => {
                executor
                    .approvals()
                    .load(&team)
                    .await
                    .context("Failed to load approval queue")?;
                let pending = executor.approvals().tasks();
                if pending.is_empty() {
                    println!("Nothing waiting for approval in {}", team);
                }
                for task in pending {
                    println!("{}", output::task_line(&task));
                }
            }
            Command::Review {
                task_id,
                outcome,
                reviewer,
                comments,
            } => {
                let task = find_task(sync, &team, task_id).await?;
                let reviewer = reviewer
                    .unwrap_or_else(|| human_name(&self.settings, sync.config().as_ref()));
                let receipt = executor
                    .submit_review(&team, &task, &reviewer, &outcome, comments.as_deref())
                    .await?;
                report(receipt).await;
            }
            Command::Reviews { task_id } => {
                for review in gateway.task_reviews(&team, task_id).await? {
                    println!("{}", output::review_line(&review));
                }
            }
            Command::Diff { task_id } => {
                print!("{}", gateway.task_diff(&team, task_id).await?.diff);
            }
            Command::Chat { agent, message } => match message {
                Some(content) => {
                    gateway.send_message(&team, &agent, &content).await?;
                    info!("Message sent to {}", agent);
                }
                None => {
                    let me = human_name(&self.settings, sync.config().as_ref());
                    let inbox = gateway.messages(&team, &me).await?;
                    for message in inbox.iter().filter(|m| m.sender == agent) {
                        println!("{}", output::message_line(message));
                    }
                }
            },
            Command::Charter => {
                println!("{}", gateway.charter(&team).await?.content);
            }
            Command::Journal { agent, limit_bytes } => {
                print!("{}", gateway.journal(&team, &agent, limit_bytes).await?.content);
            }
            Command::AgentConfig { agent } => {
                let config = gateway.agent_config(&team, &agent).await?;
                println!("model: {}\nmax_tokens: {}", config.model, config.max_tokens);
            }
            Command::Watch | Command::Teams | Command::Network { .. } => {}
        }
        Ok(())
    }

    /// Follow the event stream until Ctrl-C, printing the board on every change
    async fn watch(&self, sync: &SyncController) -> Result<()> {
        let mut client = EventStreamClient::new(&self.settings.stream)?;
        sync.attach(&client.slot());
        let mut events = sync.subscribe();

        client
            .connect(&sync.gateway().stream_url())
            .await
            .context("Failed to open event stream")?;
        let mut state = client
            .watch_state()
            .context("Event stream did not start")?;

        print!("{}", output::board(&sync.snapshot(), sync.phase()));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow();
                    match current {
                        ConnectionState::Connected => info!("Live updates connected"),
                        ConnectionState::Disconnected => warn!("Live updates lost, reconnecting"),
                        ConnectionState::Closed => break,
                        ConnectionState::Connecting => {}
                    }
                }
                event = events.recv() => match event {
                    Ok(SyncEvent::SnapshotUpdated { .. }) => {
                        print!("{}", output::board(&sync.snapshot(), sync.phase()));
                    }
                    Ok(SyncEvent::TeamsUpdated) => {
                        info!("Teams updated ({} teams)", sync.snapshot().teams.len());
                    }
                    Ok(SyncEvent::RefreshFailed { message, .. }) => {
                        warn!("Refresh failed: {}", message);
                    }
                    Ok(SyncEvent::NetworkUpdated) => {
                        info!("Network allowlist: {}", sync.network().allowlist.join(", "));
                    }
                    Ok(SyncEvent::PhaseChanged { phase }) => debug!("Phase {}", phase),
                    Err(RecvError::Lagged(n)) => debug!("Skipped {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }

        client.close().await;
        Ok(())
    }
}

/// Task from the snapshot, or fetched when it is beyond the list limit
async fn find_task(sync: &SyncController, team: &str, task_id: i64) -> Result<Task> {
    if let Some(task) = sync.task(task_id) {
        return Ok(task);
    }
    sync.gateway()
        .task(team, task_id)
        .await
        .with_context(|| format!("Task #{} not found in {}", task_id, team))
}

async fn report(receipt: TransitionReceipt) {
    match (&receipt.status, &receipt.current_stage) {
        (Some(status), _) => println!("#{} is now {}", receipt.task_id, status),
        (None, Some(stage)) => println!("#{} is now at stage {}", receipt.task_id, stage),
        (None, None) => println!("#{} updated", receipt.task_id),
    }

    if let RefreshOutcome::Failed(message) = &receipt.refresh {
        warn!("Board refresh failed: {}", message);
        if let Some(retry) = receipt.retry {
            match retry.await {
                Ok(RefreshOutcome::Committed) => info!("Board refreshed after retry"),
                Ok(other) => warn!("Board not refreshed: {:?}", other),
                Err(e) => warn!("Refresh retry aborted: {}", e),
            }
        }
    }
}

async fn network(gateway: &dyn Gateway, action: Option<NetworkAction>) -> Result<()> {
    match action.unwrap_or(NetworkAction::List) {
        NetworkAction::List => {}
        NetworkAction::Allow { domain } => {
            gateway.network_allow(&domain).await?;
        }
        NetworkAction::Disallow { domain } => {
            gateway.network_disallow(&domain).await?;
        }
        NetworkAction::Reset => {
            gateway.network_reset().await?;
        }
    }
    let network = gateway.network().await?;
    if network.allowlist.is_empty() {
        println!("(allowlist empty)");
    }
    for domain in network.allowlist {
        println!("{}", domain);
    }
    Ok(())
}
