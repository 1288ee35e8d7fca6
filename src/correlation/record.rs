//! Correlation record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fan-out completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelationState {
    /// Awaiting completions.
    Open,
    /// All expected sub-tasks resolved. Terminal.
    Complete,
    /// A sub-task failed under fail-fast. Terminal.
    Failed,
}

impl CorrelationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CorrelationState::Complete | CorrelationState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CorrelationState::Open => "OPEN",
            CorrelationState::Complete => "COMPLETE",
            CorrelationState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(CorrelationState::Open),
            "COMPLETE" => Some(CorrelationState::Complete),
            "FAILED" => Some(CorrelationState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CorrelationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to "has this unit of work finished?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelationStatus {
    Open,
    Complete,
    Failed,
    /// No record exists for the id.
    Unknown,
}

impl From<CorrelationState> for CorrelationStatus {
    fn from(state: CorrelationState) -> Self {
        match state {
            CorrelationState::Open => CorrelationStatus::Open,
            CorrelationState::Complete => CorrelationStatus::Complete,
            CorrelationState::Failed => CorrelationStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub correlation_id: String,
    pub expected_count: Option<u32>,
    pub completed_count: u32,
    pub failed_count: u32,
    pub state: CorrelationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of applying one mutation to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Counted, state unchanged.
    Counted,
    /// Counted and the state moved.
    Changed {
        from: CorrelationState,
        to: CorrelationState,
    },
    /// Record is terminal or already saw `expected_count` outcomes; nothing changed.
    Ignored,
    /// The outcome of this message was already counted; nothing changed.
    Duplicate,
}

impl Transition {
    /// True when the record was written.
    pub fn is_counted(self) -> bool {
        matches!(self, Transition::Counted | Transition::Changed { .. })
    }
}

impl CorrelationRecord {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            expected_count: None,
            completed_count: 0,
            failed_count: 0,
            state: CorrelationState::Open,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn resolved_count(&self) -> u32 {
        self.completed_count + self.failed_count
    }

    /// Record the terminal outcome of one message.
    pub fn apply_outcome(&mut self, succeeded: bool, fail_fast: bool) -> Transition {
        if self.state.is_terminal() {
            return Transition::Ignored;
        }
        if self
            .expected_count
            .is_some_and(|expected| self.resolved_count() >= expected)
        {
            return Transition::Ignored;
        }

        if succeeded {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.updated_at = Utc::now();

        let from = self.state;
        if !succeeded && fail_fast {
            self.state = CorrelationState::Failed;
        } else if self.expected_count == Some(self.resolved_count()) {
            self.state = CorrelationState::Complete;
        }
        self.transition_from(from)
    }

    /// Set or replace the fan-out size while the record is open.
    pub fn apply_expected(&mut self, expected_count: u32) -> Transition {
        if self.state.is_terminal() {
            return Transition::Ignored;
        }
        self.expected_count = Some(expected_count);
        self.updated_at = Utc::now();

        let from = self.state;
        if self.resolved_count() >= expected_count {
            self.state = CorrelationState::Complete;
        }
        self.transition_from(from)
    }

    fn transition_from(&self, from: CorrelationState) -> Transition {
        if from == self.state {
            Transition::Counted
        } else {
            Transition::Changed {
                from,
                to: self.state,
            }
        }
    }
}
