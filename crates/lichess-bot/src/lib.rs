//! Bridge between the lichess bot API and a chess engine: accepts and issues
//! challenges, plays each game in its own session and keeps the PGN record.

pub mod blocklist;
pub mod challenge;
pub mod clients;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod engines;
pub mod error;
pub mod matchmaking;
pub mod model;
pub mod pgn_record;
pub mod policy;
pub mod registry;
pub mod session;
pub mod sources;
pub mod timer;
pub mod timing;

pub use config::Config;
pub use controller::Controller;
pub use error::{BotError, Result};
pub use session::{run_session, SessionContext, SessionOutcome, SessionReport};
