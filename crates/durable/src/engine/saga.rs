//! Saga compensation stack
//!
//! Workflows push a compensation after each step that should be undone if
//! the run later fails. The stack lives in replay state, so it is rebuilt
//! from history on every advance and never persisted on its own.

use serde::{Deserialize, Serialize};

use crate::workflow::ActivityOptions;

/// A compensating activity captured by workflow code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationEntry {
    /// Activity type that undoes the step
    pub activity_type: String,

    /// Input captured when the step succeeded
    pub input: serde_json::Value,

    /// Execution options for the compensation
    pub options: ActivityOptions,
}

/// LIFO stack of compensations
#[derive(Debug, Clone, Default)]
pub struct CompensationStack {
    entries: Vec<CompensationEntry>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compensation
    pub fn push(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    /// Take the most recent compensation with its insertion index
    pub fn pop(&mut self) -> Option<(usize, CompensationEntry)> {
        let entry = self.entries.pop()?;
        Some((self.entries.len(), entry))
    }

    /// Remaining entries, newest first
    pub fn entries(&self) -> Vec<CompensationEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Activity id used for the compensation at `index`
pub fn compensation_activity_id(index: usize, activity_type: &str) -> String {
    format!("compensate-{index}-{activity_type}")
}
