use std::collections::HashSet;
use std::fmt;

use crate::gateway::{Agent, NetworkAllowlist, ServerConfig, Task, TeamSummary};

/// Load phase of the selected team's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// No team selected
    Idle,
    Loading,
    Ready,
    /// Last refresh failed; the previous lists are still shown
    Error,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadPhase::Idle => "idle",
            LoadPhase::Loading => "loading",
            LoadPhase::Ready => "ready",
            LoadPhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// The cached view of the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub selected_team: Option<String>,
    pub teams: Vec<TeamSummary>,
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
}

impl Snapshot {
    pub fn task(&self, task_id: i64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Sequence numbers for a list refreshed on its own (teams, allowlist)
#[derive(Debug, Default)]
pub(crate) struct ListSeq {
    issued: u64,
    committed: u64,
}

impl ListSeq {
    pub fn issue(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    /// Record `seq` as committed unless a newer fetch already was
    pub fn try_commit(&mut self, seq: u64) -> bool {
        if seq <= self.committed {
            return false;
        }
        self.committed = seq;
        true
    }
}

/// State owned by the sync controller
#[derive(Debug)]
pub(crate) struct SyncState {
    pub snapshot: Snapshot,
    pub phase: LoadPhase,
    pub last_error: Option<String>,
    pub config: Option<ServerConfig>,
    pub network: NetworkAllowlist,
    /// Bumped on every team change
    pub epoch: u64,
    /// Last refresh sequence number handed out
    pub seq: u64,
    /// Refreshes at or below this sequence may not commit
    pub floor_seq: u64,
    /// Tasks whose status was set locally after a confirmed mutation
    pub optimistic: HashSet<i64>,
    /// Ordering for team list fetches
    pub teams_seq: ListSeq,
    /// Ordering for allowlist fetches
    pub network_seq: ListSeq,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::default(),
            phase: LoadPhase::Idle,
            last_error: None,
            config: None,
            network: NetworkAllowlist::default(),
            epoch: 0,
            seq: 0,
            floor_seq: 0,
            optimistic: HashSet::new(),
            teams_seq: ListSeq::default(),
            network_seq: ListSeq::default(),
        }
    }

    /// Select `team` (or nothing), discarding the previous team's lists.
    pub fn switch_team(&mut self, team: Option<String>) {
        self.epoch += 1;
        self.floor_seq = self.seq;
        self.snapshot.selected_team = team;
        self.snapshot.tasks.clear();
        self.snapshot.agents.clear();
        self.optimistic.clear();
        self.last_error = None;
        self.phase = if self.snapshot.selected_team.is_some() {
            LoadPhase::Loading
        } else {
            LoadPhase::Idle
        };
    }
}
