//! Engine adapter error types

use std::time::Duration;

use thiserror::Error;

use crate::protocol::EngineState;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn engine: {0}")]
    Spawn(String),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine did not answer {waiting_for:?} within {after:?}")]
    Timeout {
        waiting_for: String,
        after: Duration,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Engine played an illegal move: {0}")]
    IllegalMove(String),

    #[error("Engine process exited")]
    Exited,

    #[error("Engine operation cancelled")]
    Cancelled,

    #[error("{operation} is not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
}
