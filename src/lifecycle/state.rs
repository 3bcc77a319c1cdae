//! Per-component lifecycle state machine.
//!
//! ```text
//! Declared ──► Initializing ──► Live ──► ShuttingDown ──► Shutdown
//!    │              │             │
//!    └──────────────┴─────────────┴──► Failed
//! ```
//!
//! `Declared → Failed` is taken by composites whose child failed: they never
//! start construction. `Live → Failed` is a runtime fault reported by a consumer.

use crate::error::{ModelError, ModelResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Lifecycle state of one component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Declared,
    Initializing,
    Live,
    Failed,
    ShuttingDown,
    Shutdown,
}

impl ComponentState {
    /// `Live` or `Failed`: what a composite waits for on each child.
    pub fn is_settled(self) -> bool {
        matches!(self, ComponentState::Live | ComponentState::Failed)
    }

    /// No further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ComponentState::Failed | ComponentState::Shutdown)
    }

    /// True if `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, next),
            (Declared, Initializing)
                | (Declared, Failed)
                | (Initializing, Live)
                | (Initializing, Failed)
                | (Live, ShuttingDown)
                | (Live, Failed)
                | (ShuttingDown, Shutdown)
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentState::Declared => "Declared",
            ComponentState::Initializing => "Initializing",
            ComponentState::Live => "Live",
            ComponentState::Failed => "Failed",
            ComponentState::ShuttingDown => "ShuttingDown",
            ComponentState::Shutdown => "Shutdown",
        };
        f.write_str(s)
    }
}

/// One recorded state change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Transition {
    pub component: String,
    pub from: ComponentState,
    pub to: ComponentState,
    /// Global sequence number; strictly increasing across all components.
    pub seq: u64,
    pub at: DateTime<Utc>,
}

/// Current state and transition history of every component.
///
/// Written by the orchestrator and its workers, readable at any time.
#[derive(Debug, Default)]
pub struct StateTable {
    states: RwLock<HashMap<String, ComponentState>>,
    history: RwLock<Vec<Transition>>,
    seq: AtomicU64,
}

impl StateTable {
    /// Table with every name in `Declared`.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let table = Self::default();
        table.reset(names);
        table
    }

    /// Put every name back into `Declared` and clear the history.
    pub fn reset<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        states.clear();
        states.extend(
            names
                .into_iter()
                .map(|name| (name.to_string(), ComponentState::Declared)),
        );
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Current state of a component.
    pub fn get(&self, name: &str) -> Option<ComponentState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Apply a transition, rejecting illegal ones. Returns the sequence number.
    pub fn transition(&self, name: &str, to: ComponentState) -> ModelResult<u64> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let from = *states
            .get(name)
            .ok_or_else(|| ModelError::NotFound(name.to_string()))?;
        if !from.can_transition_to(to) {
            return Err(ModelError::InvalidTransition {
                component: name.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        states.insert(name.to_string(), to);

        // sequence is taken under the states lock so history order matches
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Transition {
                component: name.to_string(),
                from,
                to,
                seq,
                at: Utc::now(),
            });
        Ok(seq)
    }

    /// Names currently in `state`, sorted.
    pub fn in_state(&self, state: ComponentState) -> Vec<String> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every transition so far, in sequence order.
    pub fn history(&self) -> Vec<Transition> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sequence number of the first transition of `name` into `to`.
    pub fn seq_of(&self, name: &str, to: ComponentState) -> Option<u64> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.component == name && t.to == to)
            .map(|t| t.seq)
    }
}
