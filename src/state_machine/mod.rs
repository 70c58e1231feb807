// Task status state machine
//
// Tasks move queued -> processing -> {complete | queued (retry) | failed}.
// Terminal states accept no events. The stores apply these transitions under
// their own guards; `transition` is the single source of truth for which
// moves are legal.

pub mod errors;
pub mod events;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::{EntityStatus, TaskStatus};

/// Resolve the status a task moves to when `event` is applied in `current`
pub fn transition(current: TaskStatus, event: TaskEvent) -> StateMachineResult<TaskStatus> {
    use TaskEvent as E;
    use TaskStatus as S;

    match (current, event) {
        (S::Queued, E::Claim) => Ok(S::Processing),
        (S::Processing, E::Reclaim) => Ok(S::Processing),
        (S::Processing, E::Complete) => Ok(S::Complete),
        (S::Processing, E::Retry) => Ok(S::Queued),
        (S::Processing, E::Fail) => Ok(S::Failed),
        (from, event) => Err(StateMachineError::InvalidTransition {
            from: from.to_string(),
            event: event.event_type().to_string(),
        }),
    }
}

/// Guard for the attempt counter, which only ever grows
pub fn check_attempts(current: i32, requested: i32) -> StateMachineResult<()> {
    if requested < current {
        return Err(StateMachineError::AttemptsRegression { current, requested });
    }
    Ok(())
}
