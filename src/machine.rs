use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::tree::TypeHint;

/// Where a resumable execution currently stands. Transitions go through the
/// methods below only; the state tag doubles as the single-writer guard
/// against double resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    BeforeFirstAwait,
    Suspended,
    Resumed,
    Completed,
    Faulted,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid machine transition: {from:?} -> {event}")]
pub struct StateError {
    pub from: MachineState,
    pub event: &'static str,
}

impl MachineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MachineState::Completed | MachineState::Faulted)
    }

    pub fn suspend(self) -> Result<Self, StateError> {
        match self {
            MachineState::BeforeFirstAwait | MachineState::Resumed => Ok(MachineState::Suspended),
            from => Err(StateError { from, event: "suspend" }),
        }
    }

    pub fn resume(self) -> Result<Self, StateError> {
        match self {
            MachineState::Suspended => Ok(MachineState::Resumed),
            from => Err(StateError { from, event: "resume" }),
        }
    }

    pub fn complete(self) -> Result<Self, StateError> {
        match self {
            MachineState::BeforeFirstAwait | MachineState::Resumed => Ok(MachineState::Completed),
            from => Err(StateError { from, event: "complete" }),
        }
    }

    /// Faulting is allowed from any non-terminal state.
    pub fn fault(self) -> Result<Self, StateError> {
        if self.is_terminal() {
            Err(StateError { from: self, event: "fault" })
        } else {
            Ok(MachineState::Faulted)
        }
    }
}

/// A durable slot on the state-machine record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpillField {
    pub name: String,
    pub ty: TypeHint,
    /// Reference-like fields are defaulted after their last read so the
    /// record does not pin memory once the operation completes.
    pub clear_after_use: bool,
}

/// Storage the enclosing async frame must grow to host this operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineLayout {
    pub fields: Vec<SpillField>,
    /// Number of suspension points in the lowered operation.
    pub states: u32,
}
