//! Bot error types

use std::time::Duration;

use chess_core::BoardError;
use engine_protocol::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status} from {endpoint}: {body}")]
    Http {
        status: u16,
        endpoint: String,
        body: String,
    },

    #[error("Endpoint {endpoint} is rate limited for another {remaining:?}")]
    RateLimited { endpoint: String, remaining: Duration },

    #[error("Event stream closed")]
    StreamClosed,

    #[error("Board desync: {0}")]
    Desync(#[from] BoardError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    /// Errors worth retrying or reconnecting after.
    pub fn is_transient(&self) -> bool {
        match self {
            BotError::Network(_) | BotError::RateLimited { .. } | BotError::StreamClosed => true,
            BotError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Errors that end the game session that raised them.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, BotError::Desync(_) | BotError::Engine(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BotError::Http { status, .. } => Some(*status),
            BotError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
