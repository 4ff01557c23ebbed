// Story status state machine with validation

use super::StoryStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Invalid status transition from {from:?} to {to:?}")]
    InvalidTransition { from: StoryStatus, to: StoryStatus },

    #[error("Story already in terminal status: {0:?}")]
    AlreadyTerminal(StoryStatus),
}

/// Validates if a story can transition from one status to another
pub fn can_transition(from: StoryStatus, to: StoryStatus) -> bool {
    use StoryStatus::*;

    match (from, to) {
        // Intake states are interchangeable and both feed assignment
        (Pending | Backlog, InProgress) => true,
        (Pending, Backlog) | (Backlog, Pending) => true,

        // From InProgress: coder finishes, errors, or is reverted when
        // its agent unregisters. Pools without testers report done directly
        (InProgress, Testing) => true,
        (InProgress, Done) => true,
        (InProgress, Failed) => true,
        (InProgress, Backlog | Pending) => true,

        // From Testing: tester passes, fails, or is reverted
        (Testing, Done) => true,
        (Testing, Failed) => true,
        (Testing, Backlog | Pending) => true,

        // From Failed: reassigned for a retry, or manually requeued
        (Failed, InProgress) => true,
        (Failed, Backlog | Pending) => true,

        // Done is absorbing

        // Same status is always allowed (no-op)
        (a, b) if a == b => true,

        _ => false,
    }
}

/// Validates and performs a status transition
pub fn transition_state(
    current: StoryStatus,
    target: StoryStatus,
) -> Result<StoryStatus, StateTransitionError> {
    if current == StoryStatus::Done && target != StoryStatus::Done {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }

    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Terminal statuses release all of the story's file locks
pub fn is_terminal_status(status: StoryStatus) -> bool {
    matches!(status, StoryStatus::Done | StoryStatus::Failed)
}

/// Statuses from which a coder or tester is actively working the story
pub fn is_active_status(status: StoryStatus) -> bool {
    matches!(status, StoryStatus::InProgress | StoryStatus::Testing)
}

/// Statuses eligible for coder intake before any assignment
pub fn is_intake_status(status: StoryStatus) -> bool {
    matches!(status, StoryStatus::Pending | StoryStatus::Backlog)
}
