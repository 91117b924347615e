//! Stage workflows: named stages connected by outcome-labelled edges.

use std::collections::HashSet;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::machine::TransitionTable;
use super::status::Outcome;
use super::WorkflowError;

/// Who acts on a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// An agent runs the stage
    Agent,
    /// A human operator decides the outcome
    Human,
    /// The server advances the stage on its own
    Auto,
    /// Merge worker
    Merge,
    /// End of the workflow
    Terminal,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Agent => "agent",
            StageKind::Human => "human",
            StageKind::Auto => "auto",
            StageKind::Merge => "merge",
            StageKind::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// A stage definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStage {
    pub name: String,
    pub kind: StageKind,
    /// Outcome labels this stage may produce
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
}

impl WorkflowStage {
    pub fn new(name: &str, kind: StageKind, outcomes: &[Outcome]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            outcomes: outcomes.to_vec(),
        }
    }
}

/// A `(from, outcome, to)` edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub from: String,
    pub outcome: Outcome,
    pub to: String,
}

impl WorkflowTransition {
    pub fn new(from: &str, outcome: Outcome, to: &str) -> Self {
        Self {
            from: from.to_string(),
            outcome,
            to: to.to_string(),
        }
    }
}

/// A validated stage workflow
#[derive(Debug, Clone)]
pub struct Workflow {
    stages: Vec<WorkflowStage>,
    table: TransitionTable<String, Outcome>,
}

impl Workflow {
    /// Validate stages and transitions into a workflow.
    ///
    /// Every edge must connect declared stages, use an outcome listed on
    /// its source stage, and never leave a terminal stage.
    pub fn new(
        stages: Vec<WorkflowStage>,
        transitions: Vec<WorkflowTransition>,
    ) -> Result<Self, WorkflowError> {
        let names: HashSet<&str> = stages.iter().map(|s| s.name.as_str()).collect();

        for t in &transitions {
            for stage in [&t.from, &t.to] {
                if !names.contains(stage.as_str()) {
                    return Err(WorkflowError::UnknownStage {
                        stage: stage.clone(),
                    });
                }
            }
            let source = stages.iter().find(|s| s.name == t.from);
            if let Some(source) = source {
                if !source.outcomes.contains(&t.outcome) {
                    return Err(WorkflowError::UndeclaredOutcome {
                        stage: t.from.clone(),
                        outcome: t.outcome.to_string(),
                    });
                }
            }
        }

        let terminal: Vec<String> = stages
            .iter()
            .filter(|s| s.kind == StageKind::Terminal)
            .map(|s| s.name.clone())
            .collect();

        let table = TransitionTable::from_edges(
            transitions
                .into_iter()
                .map(|t| (t.from, t.outcome, t.to)),
        )?
        .with_terminal(terminal)?;

        Ok(Self { stages, table })
    }

    /// The default review workflow seeded by the server
    pub fn default_workflow() -> &'static Workflow {
        &DEFAULT_WORKFLOW
    }

    /// Resolve the stage reached from `from` with `outcome`.
    pub fn next_stage(&self, from: &str, outcome: &Outcome) -> Result<String, WorkflowError> {
        if self.stage(from).is_none() {
            return Err(WorkflowError::UnknownStage {
                stage: from.to_string(),
            });
        }
        self.table.next(from, outcome)
    }

    /// Outcomes that can be applied at `stage`
    pub fn outcomes_from(&self, stage: &str) -> Vec<&Outcome> {
        self.table.labels_from(stage)
    }

    pub fn stage(&self, name: &str) -> Option<&WorkflowStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stages(&self) -> &[WorkflowStage] {
        &self.stages
    }

    /// First declared stage
    pub fn initial_stage(&self) -> Option<&WorkflowStage> {
        self.stages.first()
    }

    pub fn is_terminal(&self, stage: &str) -> bool {
        self.table.is_terminal(stage)
    }

    /// All transitions in declaration order
    pub fn transitions(&self) -> Vec<WorkflowTransition> {
        self.table
            .edges()
            .map(|(from, outcome, to)| WorkflowTransition {
                from: from.clone(),
                outcome: outcome.clone(),
                to: to.clone(),
            })
            .collect()
    }
}

static DEFAULT_WORKFLOW: Lazy<Workflow> = Lazy::new(|| {
    use Outcome::*;
    let stages = vec![
        WorkflowStage::new("Coding", StageKind::Agent, &[SubmitForReview, Done]),
        WorkflowStage::new("InReview", StageKind::Agent, &[Approved, ChangesRequested]),
        WorkflowStage::new("InApproval", StageKind::Human, &[Approved, ChangesRequested]),
        WorkflowStage::new("Merging", StageKind::Merge, &[Done]),
        WorkflowStage::new("Done", StageKind::Terminal, &[]),
    ];
    let transitions = vec![
        WorkflowTransition::new("Coding", SubmitForReview, "InReview"),
        WorkflowTransition::new("Coding", Done, "Done"),
        WorkflowTransition::new("InReview", Approved, "InApproval"),
        WorkflowTransition::new("InReview", ChangesRequested, "Coding"),
        WorkflowTransition::new("InApproval", Approved, "Merging"),
        WorkflowTransition::new("InApproval", ChangesRequested, "Coding"),
        WorkflowTransition::new("Merging", Done, "Done"),
    ];
    Workflow::new(stages, transitions)
        .unwrap_or_else(|e| panic!("built-in workflow is invalid: {}", e))
});

/// Name of the stage where a human approves work
pub const APPROVAL_STAGE: &str = "InApproval";
