//! Platform client contract and its lichess implementation.

pub mod lichess;
#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::Result;
use crate::model::{Event, GameEvent, GameSummary, UserProfile};

pub use lichess::{Endpoint, LichessClient};

/// Items of an ndjson stream. `None` is a keep-alive tick.
pub type EventStream = BoxStream<'static, Result<Option<Event>>>;
pub type GameStream = BoxStream<'static, Result<Option<GameEvent>>>;

/// Parameters of an outgoing challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParams {
    pub rated: bool,
    /// Seconds.
    pub clock_limit: Option<u32>,
    pub clock_increment: Option<u32>,
    pub days: Option<u32>,
    pub color: String,
    pub variant: String,
}

impl ChallengeParams {
    pub fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("rated", self.rated.to_string()),
            ("color", self.color.clone()),
            ("variant", self.variant.clone()),
        ];
        match self.days {
            Some(days) => form.push(("days", days.to_string())),
            None => {
                form.push(("clock.limit", self.clock_limit.unwrap_or(0).to_string()));
                form.push(("clock.increment", self.clock_increment.unwrap_or(0).to_string()));
            }
        }
        form
    }
}

/// Result of a conditional text download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    NotModified,
    Body { text: String, etag: Option<String> },
}

/// Everything the bot needs from the game server.
#[async_trait]
pub trait Platform: Send + Sync {
    /// The account's event stream: challenges, game starts and finishes.
    async fn stream_events(&self) -> Result<EventStream>;

    /// One game's state stream, starting with `gameFull`.
    async fn stream_game(&self, game_id: &str) -> Result<GameStream>;

    async fn make_move(&self, game_id: &str, uci: &str, offering_draw: bool) -> Result<()>;

    async fn accept_challenge(&self, challenge_id: &str) -> Result<()>;

    async fn decline_challenge(&self, challenge_id: &str, reason: &str) -> Result<()>;

    /// Returns the new challenge's id, if the server gave one.
    async fn create_challenge(&self, username: &str, params: &ChallengeParams) -> Result<Option<String>>;

    async fn cancel_challenge(&self, challenge_id: &str) -> Result<()>;

    async fn resign(&self, game_id: &str) -> Result<()>;

    async fn offer_draw(&self, game_id: &str) -> Result<()>;

    async fn abort(&self, game_id: &str) -> Result<()>;

    async fn answer_takeback(&self, game_id: &str, accept: bool) -> Result<()>;

    async fn chat(&self, game_id: &str, room: &str, text: &str) -> Result<()>;

    async fn profile(&self) -> Result<UserProfile>;

    async fn ongoing_games(&self) -> Result<Vec<GameSummary>>;

    async fn online_bots(&self) -> Result<Vec<UserProfile>>;

    async fn public_data(&self, username: &str) -> Result<UserProfile>;

    async fn is_online(&self, username: &str) -> Result<bool>;

    async fn game_pgn(&self, game_id: &str) -> Result<String>;

    async fn upgrade_to_bot(&self) -> Result<()>;

    /// Scopes granted to the configured token.
    async fn token_scopes(&self) -> Result<Vec<String>>;

    /// GET a JSON document from an opening, cloud or tablebase service.
    async fn online_json(&self, url: &str, params: &[(&str, String)], timeout: Duration) -> Result<Value>;

    /// GET a text document, honouring a previously seen ETag.
    async fn fetch_text(&self, url: &str, etag: Option<&str>) -> Result<Fetched>;
}
