use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Attempts cannot decrease: {current} -> {requested}")]
    AttemptsRegression { current: i32, requested: i32 },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
