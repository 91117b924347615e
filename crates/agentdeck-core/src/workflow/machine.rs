//! Validated finite-state transition relation.
//!
//! A [`TransitionTable`] maps `(state, label)` to exactly one target state.
//! The task status board, the review-outcome table and the stage workflow
//! all go through [`TransitionTable::next`], so there is one definition of
//! "legal move" in the crate.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;

use super::WorkflowError;

/// Partial function `(state, label) -> state`, checked once at construction.
#[derive(Debug, Clone)]
pub struct TransitionTable<S, L> {
    /// Lookup index: state -> label -> target
    index: HashMap<S, HashMap<L, S>>,
    /// Edges in declaration order (for listing legal moves)
    edges: Vec<(S, L, S)>,
    /// States declared terminal (no outgoing edges allowed)
    terminal: HashSet<S>,
}

impl<S, L> TransitionTable<S, L>
where
    S: Clone + Eq + Hash + Display,
    L: Clone + Eq + Hash + Display,
{
    /// Build a table from `(from, label, to)` triples.
    ///
    /// Fails with [`WorkflowError::Ambiguous`] if the same `(from, label)`
    /// pair is declared with two different targets. Repeating an identical
    /// edge is accepted.
    pub fn from_edges<I>(edges: I) -> Result<Self, WorkflowError>
    where
        I: IntoIterator<Item = (S, L, S)>,
    {
        let mut table = Self {
            index: HashMap::new(),
            edges: Vec::new(),
            terminal: HashSet::new(),
        };

        for (from, label, to) in edges {
            let targets = table.index.entry(from.clone()).or_default();
            match targets.get(&label) {
                Some(existing) if *existing == to => continue,
                Some(existing) => {
                    return Err(WorkflowError::Ambiguous {
                        from: from.to_string(),
                        label: label.to_string(),
                        first: existing.to_string(),
                        second: to.to_string(),
                    })
                }
                None => {
                    targets.insert(label.clone(), to.clone());
                    table.edges.push((from, label, to));
                }
            }
        }

        Ok(table)
    }

    /// Declare terminal states.
    ///
    /// A terminal state must not have outgoing edges.
    pub fn with_terminal<I>(mut self, states: I) -> Result<Self, WorkflowError>
    where
        I: IntoIterator<Item = S>,
    {
        for state in states {
            if self.index.get(&state).is_some_and(|t| !t.is_empty()) {
                return Err(WorkflowError::TerminalHasExits {
                    state: state.to_string(),
                });
            }
            self.terminal.insert(state);
        }
        Ok(self)
    }

    /// Resolve the target of `(from, label)`.
    pub fn next<Q, M>(&self, from: &Q, label: &M) -> Result<S, WorkflowError>
    where
        S: Borrow<Q>,
        L: Borrow<M>,
        Q: Hash + Eq + Display + ?Sized,
        M: Hash + Eq + Display + ?Sized,
    {
        self.index
            .get(from)
            .and_then(|targets| targets.get(label))
            .cloned()
            .ok_or_else(|| WorkflowError::NotPermitted {
                from: from.to_string(),
                label: label.to_string(),
            })
    }

    /// Whether `(from, label)` is a key of the table.
    pub fn permits<Q, M>(&self, from: &Q, label: &M) -> bool
    where
        S: Borrow<Q>,
        L: Borrow<M>,
        Q: Hash + Eq + ?Sized,
        M: Hash + Eq + ?Sized,
    {
        self.index
            .get(from)
            .is_some_and(|targets| targets.contains_key(label))
    }

    /// Labels accepted from `from`, in declaration order.
    pub fn labels_from<Q>(&self, from: &Q) -> Vec<&L>
    where
        S: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.edges
            .iter()
            .filter(|(f, _, _)| <S as Borrow<Q>>::borrow(f) == from)
            .map(|(_, label, _)| label)
            .collect()
    }

    /// Whether `state` was declared terminal.
    pub fn is_terminal<Q>(&self, state: &Q) -> bool
    where
        S: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.terminal.contains(state)
    }

    /// All edges in declaration order.
    pub fn edges(&self) -> impl Iterator<Item = (&S, &L, &S)> {
        self.edges.iter().map(|(f, l, t)| (f, l, t))
    }

    /// Number of edges
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the table has no edges
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
