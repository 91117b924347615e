//! Synchronization controller: owns the snapshot and decides what to refetch.
//!
//! Every refresh is tagged with a [`RefreshTicket`] carrying the team, the
//! team epoch and a sequence number at the time it was issued. A result
//! commits only if its ticket is still current, so a slow response for a
//! previously selected team can never overwrite the current team's data.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::{LoadPhase, Snapshot, SyncState};
use crate::config::Settings;
use crate::gateway::{Agent, Gateway, GatewayError, NetworkAllowlist, ServerConfig, Task};
use crate::stream::{HandlerSlot, NotificationKind, StreamNotification};
use crate::workflow::TaskStatus;

/// Default broadcast channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound for the background refresh retry delay
const MAX_RETRY_DELAY_MS: u64 = 2000;

/// Identity of one refresh request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTicket {
    pub team: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Result of a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No team selected, nothing fetched
    NoTeam,
    Committed,
    /// Superseded while in flight; result discarded
    Stale,
    /// Fetch failed; the message is what the status line shows
    Failed(String),
}

impl RefreshOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, RefreshOutcome::Failed(_))
    }
}

/// What a push notification asks the controller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Refetch tasks and agents of the selected team
    RefreshSelected,
    /// Refetch the team list only
    RefreshTeams,
    RefreshNetwork,
    Ignore,
}

/// Decide how to react to `notification` while `selected` is the current team.
pub fn plan_for(selected: Option<&str>, notification: &StreamNotification) -> SyncAction {
    let for_selected = selected.is_some_and(|team| notification.is_for_team(team));
    match notification.kind {
        NotificationKind::TaskUpdate | NotificationKind::AgentUpdate if for_selected => {
            SyncAction::RefreshSelected
        }
        NotificationKind::TeamUpdate => SyncAction::RefreshTeams,
        NotificationKind::NetworkUpdate => SyncAction::RefreshNetwork,
        _ => SyncAction::Ignore,
    }
}

/// Events emitted when controller state changes
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Tasks and agents of `team` were replaced or patched
    SnapshotUpdated { team: Option<String> },
    TeamsUpdated,
    PhaseChanged { phase: LoadPhase },
    RefreshFailed {
        team: Option<String>,
        message: String,
    },
    NetworkUpdated,
}

/// Error type for controller operations
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Tunables for refreshes
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// `limit` passed to the task list endpoint
    pub task_limit: usize,
    /// Background retries after a failed post-mutation refresh
    pub retry_attempts: u32,
    pub retry_initial: Duration,
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            task_limit: settings.task_limit,
            retry_attempts: settings.sync.refresh_retry_attempts,
            retry_initial: Duration::from_millis(settings.sync.refresh_retry_initial_ms),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Delay before retry number `attempt` (0-based)
fn retry_delay(initial: Duration, attempt: u32) -> Duration {
    let initial_ms = initial.as_millis() as u64;
    let ms = initial_ms.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(MAX_RETRY_DELAY_MS))
}

/// Shared handle to the synchronized state.
///
/// Cloning is cheap; all clones see and write the same state.
#[derive(Clone)]
pub struct SyncController {
    state: Arc<RwLock<SyncState>>,
    gateway: Arc<dyn Gateway>,
    event_tx: broadcast::Sender<SyncEvent>,
    options: SyncOptions,
}

impl SyncController {
    pub fn new(gateway: Arc<dyn Gateway>, options: SyncOptions) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(SyncState::new())),
            gateway,
            event_tx,
            options,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Subscribe to controller events.
    ///
    /// If the receiver falls behind, older events are dropped (lagged).
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    // =========================================================
    // Queries
    // =========================================================

    pub fn snapshot(&self) -> Snapshot {
        self.state.read().snapshot.clone()
    }

    pub fn phase(&self) -> LoadPhase {
        self.state.read().phase
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn selected_team(&self) -> Option<String> {
        self.state.read().snapshot.selected_team.clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state.read().snapshot.tasks.clone()
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.state.read().snapshot.agents.clone()
    }

    pub fn task(&self, task_id: i64) -> Option<Task> {
        self.state.read().snapshot.task(task_id).cloned()
    }

    pub fn config(&self) -> Option<ServerConfig> {
        self.state.read().config.clone()
    }

    pub fn network(&self) -> NetworkAllowlist {
        self.state.read().network.clone()
    }

    /// Whether the task's status was set locally and not yet confirmed by a refresh
    pub fn is_optimistic(&self, task_id: i64) -> bool {
        self.state.read().optimistic.contains(&task_id)
    }

    /// Current team epoch
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    // =========================================================
    // Loading
    // =========================================================

    /// Load the bootstrap payload and select the initial team.
    ///
    /// When the payload already carries the initial team's tasks they are
    /// used as-is; otherwise the team is refreshed.
    pub async fn bootstrap(&self) -> Result<RefreshOutcome, SyncError> {
        let (teams_seq, network_seq) = {
            let mut state = self.state.write();
            (state.teams_seq.issue(), state.network_seq.issue())
        };

        let payload = match self.gateway.bootstrap().await {
            Ok(payload) => payload,
            Err(e) => {
                let message = e.short_message();
                warn!("Bootstrap failed: {}", e);
                self.state.write().last_error = Some(message.clone());
                self.set_phase(LoadPhase::Error);
                self.emit(SyncEvent::RefreshFailed {
                    team: None,
                    message,
                });
                return Err(e.into());
            }
        };

        let team = payload.initial_team_name();
        let preseed = team.is_some() && payload.tasks.is_some();
        let (previous, phase) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let previous = state.phase;
            if state.teams_seq.try_commit(teams_seq) {
                state.snapshot.teams = payload.teams;
            }
            if payload.config.is_some() {
                state.config = payload.config;
            }
            if let Some(network) = payload.network {
                if state.network_seq.try_commit(network_seq) {
                    state.network = network;
                }
            }
            state.switch_team(team.clone());
            if preseed {
                state.snapshot.tasks = payload.tasks.unwrap_or_default();
                state.snapshot.agents = payload.agents.unwrap_or_default();
                state.phase = LoadPhase::Ready;
            }
            (previous, state.phase)
        };

        info!(
            "Bootstrapped: initial team {}",
            team.as_deref().unwrap_or("(none)")
        );
        self.emit(SyncEvent::TeamsUpdated);
        if phase != previous {
            self.emit(SyncEvent::PhaseChanged { phase });
        }
        self.emit(SyncEvent::SnapshotUpdated { team: team.clone() });

        match team {
            None => Ok(RefreshOutcome::NoTeam),
            Some(_) if preseed => Ok(RefreshOutcome::Committed),
            Some(_) => Ok(self.refresh().await),
        }
    }

    /// Make `team` the selected team and refresh it.
    ///
    /// An empty name clears the selection. Results of refreshes issued for
    /// the previous team are discarded from here on.
    pub async fn select_team(&self, team: &str) -> RefreshOutcome {
        let team = team.trim();
        let next = (!team.is_empty()).then(|| team.to_string());

        let switched = {
            let mut state = self.state.write();
            if state.snapshot.selected_team == next {
                false
            } else {
                state.switch_team(next.clone());
                true
            }
        };

        if switched {
            debug!("Selected team {:?}", next);
            self.emit(SyncEvent::SnapshotUpdated { team: next.clone() });
            self.emit(SyncEvent::PhaseChanged {
                phase: self.phase(),
            });
        }
        self.refresh().await
    }

    /// Refetch tasks and agents of the selected team.
    pub async fn refresh(&self) -> RefreshOutcome {
        match self.issue_ticket() {
            Some(ticket) => self.run_ticket(ticket).await,
            None => RefreshOutcome::NoTeam,
        }
    }

    /// Refresh, and if that fails keep retrying in the background.
    ///
    /// The retry stops early once another refresh commits or the team
    /// changes.
    pub async fn refresh_with_retry(&self) -> (RefreshOutcome, Option<JoinHandle<RefreshOutcome>>) {
        let outcome = self.refresh().await;
        if outcome.is_failed() && self.options.retry_attempts > 0 {
            let retry = self.spawn_refresh_retry();
            (outcome, Some(retry))
        } else {
            (outcome, None)
        }
    }

    fn spawn_refresh_retry(&self) -> JoinHandle<RefreshOutcome> {
        let controller = self.clone();
        let (epoch, floor) = {
            let state = self.state.read();
            (state.epoch, state.floor_seq)
        };
        let attempts = self.options.retry_attempts;
        let initial = self.options.retry_initial;

        tokio::spawn(async move {
            let mut outcome = RefreshOutcome::Failed("refresh retries exhausted".to_string());
            for attempt in 0..attempts {
                tokio::time::sleep(retry_delay(initial, attempt)).await;
                if controller.superseded(epoch, floor) {
                    debug!("Refresh retry superseded");
                    return RefreshOutcome::Stale;
                }
                outcome = controller.refresh().await;
                match &outcome {
                    RefreshOutcome::Failed(message) => {
                        debug!("Refresh retry {} failed: {}", attempt + 1, message);
                    }
                    _ => return outcome,
                }
            }
            warn!("Giving up refresh after {} retries", attempts);
            outcome
        })
    }

    fn superseded(&self, epoch: u64, floor: u64) -> bool {
        let state = self.state.read();
        state.epoch != epoch || state.floor_seq != floor
    }

    fn issue_ticket(&self) -> Option<RefreshTicket> {
        let (ticket, phase_changed) = {
            let mut state = self.state.write();
            let team = state.snapshot.selected_team.clone()?;
            state.seq += 1;
            let phase_changed = state.phase != LoadPhase::Loading;
            if phase_changed {
                state.phase = LoadPhase::Loading;
            }
            let ticket = RefreshTicket {
                team,
                epoch: state.epoch,
                seq: state.seq,
            };
            (ticket, phase_changed)
        };
        if phase_changed {
            self.emit(SyncEvent::PhaseChanged {
                phase: LoadPhase::Loading,
            });
        }
        Some(ticket)
    }

    async fn run_ticket(&self, ticket: RefreshTicket) -> RefreshOutcome {
        debug!(
            "Refreshing team {} (epoch {}, seq {})",
            ticket.team, ticket.epoch, ticket.seq
        );
        let (tasks, agents) = tokio::join!(
            self.gateway.tasks(&ticket.team, self.options.task_limit),
            self.gateway.agents(&ticket.team),
        );
        match tasks.and_then(|tasks| agents.map(|agents| (tasks, agents))) {
            Ok((tasks, agents)) => self.commit(&ticket, tasks, agents),
            Err(e) => self.fail(&ticket, e),
        }
    }

    fn commit(&self, ticket: &RefreshTicket, tasks: Vec<Task>, agents: Vec<Agent>) -> RefreshOutcome {
        let phase_changed = {
            let mut state = self.state.write();
            if !is_current(&state, ticket) {
                debug!(
                    "Discarding stale refresh for team {} (epoch {}, seq {})",
                    ticket.team, ticket.epoch, ticket.seq
                );
                return RefreshOutcome::Stale;
            }
            state.snapshot.tasks = tasks;
            state.snapshot.agents = agents;
            state.floor_seq = ticket.seq;
            state.optimistic.clear();
            state.last_error = None;
            let changed = state.phase != LoadPhase::Ready;
            state.phase = LoadPhase::Ready;
            changed
        };

        self.emit(SyncEvent::SnapshotUpdated {
            team: Some(ticket.team.clone()),
        });
        if phase_changed {
            self.emit(SyncEvent::PhaseChanged {
                phase: LoadPhase::Ready,
            });
        }
        RefreshOutcome::Committed
    }

    fn fail(&self, ticket: &RefreshTicket, error: GatewayError) -> RefreshOutcome {
        let message = error.short_message();
        let phase_changed = {
            let mut state = self.state.write();
            if !is_current(&state, ticket) {
                debug!(
                    "Ignoring failure of stale refresh for team {}: {}",
                    ticket.team, message
                );
                return RefreshOutcome::Stale;
            }
            state.last_error = Some(message.clone());
            let changed = state.phase != LoadPhase::Error;
            state.phase = LoadPhase::Error;
            changed
        };

        warn!("Refresh of team {} failed: {}", ticket.team, error);
        self.emit(SyncEvent::RefreshFailed {
            team: Some(ticket.team.clone()),
            message: message.clone(),
        });
        if phase_changed {
            self.emit(SyncEvent::PhaseChanged {
                phase: LoadPhase::Error,
            });
        }
        RefreshOutcome::Failed(message)
    }

    fn set_phase(&self, phase: LoadPhase) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.phase != phase;
            state.phase = phase;
            changed
        };
        if changed {
            self.emit(SyncEvent::PhaseChanged { phase });
        }
    }

    /// Refetch the team list only.
    ///
    /// Returns false when a later fetch already landed and this result was
    /// discarded.
    pub async fn refresh_teams(&self) -> Result<bool, SyncError> {
        let seq = self.state.write().teams_seq.issue();
        let teams = self.gateway.teams().await?;
        {
            let mut state = self.state.write();
            if !state.teams_seq.try_commit(seq) {
                debug!("Discarding stale team list (seq {})", seq);
                return Ok(false);
            }
            state.snapshot.teams = teams;
        }
        self.emit(SyncEvent::TeamsUpdated);
        Ok(true)
    }

    /// Refetch the network allowlist. Same ordering rule as [`Self::refresh_teams`].
    pub async fn refresh_network(&self) -> Result<bool, SyncError> {
        let seq = self.state.write().network_seq.issue();
        let network = self.gateway.network().await?;
        {
            let mut state = self.state.write();
            if !state.network_seq.try_commit(seq) {
                debug!("Discarding stale network allowlist (seq {})", seq);
                return Ok(false);
            }
            state.network = network;
        }
        self.emit(SyncEvent::NetworkUpdated);
        Ok(true)
    }

    // =========================================================
    // Push notifications
    // =========================================================

    /// The action `notification` calls for given the current selection
    pub fn plan(&self, notification: &StreamNotification) -> SyncAction {
        let state = self.state.read();
        plan_for(state.snapshot.selected_team.as_deref(), notification)
    }

    /// React to one push notification.
    pub async fn on_notification(&self, notification: StreamNotification) -> SyncAction {
        let action = self.plan(&notification);
        match action {
            SyncAction::RefreshSelected => {
                self.refresh().await;
            }
            SyncAction::RefreshTeams => {
                if let Err(e) = self.refresh_teams().await {
                    warn!("Failed to refresh teams: {}", e);
                }
            }
            SyncAction::RefreshNetwork => {
                if let Err(e) = self.refresh_network().await {
                    warn!("Failed to refresh network allowlist: {}", e);
                }
            }
            SyncAction::Ignore => {
                debug!(
                    "Ignoring {} notification for team {:?}",
                    notification.kind, notification.team
                );
            }
        }
        action
    }

    /// Route notifications delivered through `slot` to this controller.
    ///
    /// Each notification is handled on its own task so a slow refresh never
    /// blocks the stream.
    pub fn attach(&self, slot: &HandlerSlot) {
        let controller = self.clone();
        slot.set_handler(move |notification| {
            let controller = controller.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        controller.on_notification(notification).await;
                    });
                }
                Err(_) => warn!("Notification delivered outside a runtime, dropped"),
            }
        });
    }

    // =========================================================
    // Confirmed mutations
    // =========================================================

    /// Show `status` for a task whose mutation the server confirmed.
    ///
    /// Refreshes issued before this call can no longer commit. Returns false
    /// when `team` is not selected or the task is not held.
    pub fn apply_confirmed_status(&self, team: &str, task_id: i64, status: TaskStatus) -> bool {
        self.overlay(team, task_id, |task| task.status = status)
    }

    /// Same as [`Self::apply_confirmed_status`] for the workflow stage
    pub fn apply_confirmed_stage(&self, team: &str, task_id: i64, stage: &str) -> bool {
        self.overlay(team, task_id, |task| task.current_stage = Some(stage.to_string()))
    }

    fn overlay<F>(&self, team: &str, task_id: i64, update: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let applied = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            if state.snapshot.selected_team.as_deref() != Some(team) {
                return false;
            }
            state.floor_seq = state.seq;
            match state.snapshot.tasks.iter_mut().find(|t| t.task_id == task_id) {
                Some(task) => {
                    update(task);
                    state.optimistic.insert(task_id);
                    true
                }
                None => false,
            }
        };
        if applied {
            self.emit(SyncEvent::SnapshotUpdated {
                team: Some(team.to_string()),
            });
        }
        applied
    }
}

fn is_current(state: &SyncState, ticket: &RefreshTicket) -> bool {
    state.epoch == ticket.epoch
        && state.snapshot.selected_team.as_deref() == Some(ticket.team.as_str())
        && ticket.seq > state.floor_seq
}
