//! Per-request resolution state machine.

use crate::error::{ErrorKind, PretrainedError, Result};
use crate::types::ArtifactRecord;
use std::fmt;
use tracing::{debug, warn};

/// State of one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionState {
    Pending,
    Resolving,
    Downloading,
    Verifying,
    Committed,
    Failed(ErrorKind),
}

impl ResolutionState {
    /// Whether no further transition can follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResolutionState::Committed | ResolutionState::Failed(_))
    }

    /// Whether `next` may directly follow this state.
    pub fn can_transition_to(&self, next: ResolutionState) -> bool {
        use ResolutionState::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Resolving, Downloading)
                | (Resolving, Committed)
                | (Resolving, Failed(_))
                | (Downloading, Verifying)
                | (Downloading, Failed(_))
                | (Verifying, Committed)
                | (Verifying, Failed(_))
        )
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionState::Pending => write!(f, "PENDING"),
            ResolutionState::Resolving => write!(f, "RESOLVING"),
            ResolutionState::Downloading => write!(f, "DOWNLOADING"),
            ResolutionState::Verifying => write!(f, "VERIFYING"),
            ResolutionState::Committed => write!(f, "COMMITTED"),
            ResolutionState::Failed(kind) => write!(f, "FAILED({})", kind),
        }
    }
}

/// Terminal outcome of a resolution together with the states it went through.
#[derive(Debug, Clone)]
pub struct ResolutionReport {
    pub transitions: Vec<ResolutionState>,
    pub result: Result<ArtifactRecord>,
}

impl ResolutionReport {
    /// The last recorded state.
    pub fn final_state(&self) -> Option<ResolutionState> {
        self.transitions.last().copied()
    }

    pub fn is_committed(&self) -> bool {
        self.final_state() == Some(ResolutionState::Committed)
    }

    pub fn into_result(self) -> Result<ArtifactRecord> {
        self.result
    }
}

/// Records transitions for one resolution, rejecting out-of-order ones.
#[derive(Debug)]
pub(crate) struct StateMachine {
    label: String,
    transitions: Vec<ResolutionState>,
}

impl StateMachine {
    /// Start in `Pending`.
    pub(crate) fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        debug!("{}: {}", label, ResolutionState::Pending);
        Self {
            label,
            transitions: vec![ResolutionState::Pending],
        }
    }

    /// A machine continuing from an already-recorded state.
    pub(crate) fn resume_from(label: impl Into<String>, state: ResolutionState) -> Self {
        Self {
            label: label.into(),
            transitions: vec![state],
        }
    }

    pub(crate) fn current(&self) -> ResolutionState {
        // Never empty: constructors seed the first state.
        self.transitions
            .last()
            .copied()
            .unwrap_or(ResolutionState::Pending)
    }

    /// Move to `next`. Invalid transitions are logged and ignored.
    pub(crate) fn advance(&mut self, next: ResolutionState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!("{}: ignoring invalid transition {} -> {}", self.label, current, next);
            return;
        }
        debug!("{}: {} -> {}", self.label, current, next);
        self.transitions.push(next);
    }

    /// Close the machine with `result`, failing it first if still open.
    pub(crate) fn finish(mut self, result: Result<ArtifactRecord>) -> ResolutionReport {
        if let Err(e) = &result {
            if !self.current().is_terminal() {
                self.advance(ResolutionState::Failed(e.kind()));
            }
        }
        ResolutionReport {
            transitions: self.transitions,
            result,
        }
    }

    /// Close the machine with an error.
    pub(crate) fn fail(self, error: PretrainedError) -> ResolutionReport {
        self.finish(Err(error))
    }
}
