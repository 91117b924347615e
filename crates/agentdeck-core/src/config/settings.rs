use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::workflow::{Outcome, TaskStatus};

/// Environment variable that overrides `api_base`
pub const API_BASE_ENV: &str = "AGENTDECK_API_BASE";

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Operator console for agent orchestration teams")]
pub struct Config {
    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Orchestration server base URL
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Team to operate on (defaults to the server's initial team)
    #[arg(short, long, global = true)]
    pub team: Option<String>,

    /// Maximum number of tasks fetched per refresh
    #[arg(long, global = true)]
    pub task_limit: Option<usize>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Follow the live event stream and print board changes
    Watch,
    /// List teams
    Teams,
    /// Print the task board of the team
    Tasks {
        /// Print the tasks as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a task to another status
    Move {
        task_id: i64,
        /// Target status (todo, in_progress, in_review, ...)
        to: TaskStatus,
    },
    /// Apply a review outcome to a task's status
    Outcome {
        task_id: i64,
        /// Outcome label (approved, changes_requested, ...)
        outcome: Outcome,
    },
    /// Approve a task waiting for a human decision
    Approve {
        task_id: i64,
        /// Outcome label sent with the approval
        #[arg(default_value = "approved")]
        outcome: Outcome,
    },
    /// Ask for a review of a task
    RequestReview { task_id: i64 },
    /// Create a task
    Create {
        title: String,
        /// Start the task immediately
        #[arg(long)]
        in_progress: bool,
    },
    /// Assign a task (omit the assignee to clear it)
    Assign {
        task_id: i64,
        assignee: Option<String>,
    },
    /// List tasks waiting for approval
    Approvals,
    /// Show reviews recorded for a task
    Reviews { task_id: i64 },
    /// Record a review verdict (approved or changes_requested)
    Review {
        task_id: i64,
        outcome: Outcome,
        /// Reviewer name; defaults to the operator's chat name
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        comments: Option<String>,
    },
    /// Show the diff of a task branch
    Diff { task_id: i64 },
    /// Read or send chat messages with an agent
    Chat {
        agent: String,
        /// Message to send; without it the inbox is printed
        message: Option<String>,
    },
    /// Inspect or change the network allowlist
    Network {
        #[command(subcommand)]
        action: Option<NetworkAction>,
    },
    /// Print the team charter
    Charter,
    /// Print an agent's journal
    Journal {
        agent: String,
        /// Only the last N bytes
        #[arg(long)]
        limit_bytes: Option<u64>,
    },
    /// Print an agent's model settings
    AgentConfig { agent: String },
}

/// `network` subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum NetworkAction {
    /// Print the allowlist
    List,
    /// Allow a domain
    Allow { domain: String },
    /// Remove a domain
    Disallow { domain: String },
    /// Restore the server defaults
    Reset,
}

impl Config {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Application settings (from config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Orchestration server base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Maximum number of tasks fetched per refresh
    #[serde(default = "default_task_limit")]
    pub task_limit: usize,

    /// Name used as sender in chat (server config wins when unset)
    #[serde(default)]
    pub human_name: Option<String>,

    /// Event stream settings
    #[serde(default)]
    pub stream: StreamSettings,

    /// Synchronization settings
    #[serde(default)]
    pub sync: SyncSettings,
}

fn default_api_base() -> String {
    "http://localhost:3548".to_string()
}

fn default_task_limit() -> usize {
    200
}

/// Event stream reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// First reconnect delay in milliseconds
    #[serde(default = "default_stream_retry_initial")]
    pub retry_initial_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds
    #[serde(default = "default_stream_retry_max")]
    pub retry_max_ms: u64,
}

fn default_stream_retry_initial() -> u64 {
    500
}

fn default_stream_retry_max() -> u64 {
    10_000
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retry_initial_ms: default_stream_retry_initial(),
            retry_max_ms: default_stream_retry_max(),
        }
    }
}

/// Background refresh retry after a successful mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Number of retries before giving up
    #[serde(default = "default_refresh_retry_attempts")]
    pub refresh_retry_attempts: u32,

    /// First retry delay in milliseconds (doubles, capped at 2s)
    #[serde(default = "default_refresh_retry_initial")]
    pub refresh_retry_initial_ms: u64,
}

fn default_refresh_retry_attempts() -> u32 {
    3
}

fn default_refresh_retry_initial() -> u64 {
    200
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            refresh_retry_attempts: default_refresh_retry_attempts(),
            refresh_retry_initial_ms: default_refresh_retry_initial(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            task_limit: default_task_limit(),
            human_name: None,
            stream: StreamSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from config file or use defaults
    ///
    /// `AGENTDECK_API_BASE` overrides the file's `api_base`.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let mut settings = Self::load_file(path)?;
        settings.apply_env();
        Ok(settings)
    }

    fn load_file(path: Option<&PathBuf>) -> Result<Self> {
        // Try custom path first
        if let Some(p) = path {
            if p.exists() {
                return Self::read(p);
            }
        }

        // Try default config locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("agentdeck/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/agentdeck/config.toml")),
            dirs::home_dir().map(|p| p.join(".agentdeck.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::read(path);
            }
        }

        // Return defaults if no config file found
        Ok(Self::default())
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    fn apply_env(&mut self) {
        if let Ok(base) = std::env::var(API_BASE_ENV) {
            if !base.trim().is_empty() {
                self.api_base = base.trim().to_string();
            }
        }
    }

    /// Merge CLI config into settings (CLI takes precedence)
    pub fn merge_cli(&mut self, cli: &Config) {
        if let Some(api_base) = &cli.api_base {
            self.api_base = api_base.clone();
        }
        if let Some(limit) = cli.task_limit {
            self.task_limit = limit;
        }
    }

    /// Validate and normalize settings values
    ///
    /// The server refuses task limits above 1000.
    pub fn validate(&mut self) {
        const MAX_TASK_LIMIT: usize = 1000;

        self.task_limit = self.task_limit.clamp(1, MAX_TASK_LIMIT);
        self.api_base = self.api_base.trim_end_matches('/').to_string();
        if self.stream.retry_initial_ms == 0 {
            self.stream.retry_initial_ms = 1;
        }
        if self.stream.retry_max_ms < self.stream.retry_initial_ms {
            self.stream.retry_max_ms = self.stream.retry_initial_ms;
        }
        if self.sync.refresh_retry_initial_ms == 0 {
            self.sync.refresh_retry_initial_ms = 1;
        }
    }
}
