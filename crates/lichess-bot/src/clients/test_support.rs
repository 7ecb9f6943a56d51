//! In-memory platform for unit tests. Records every call as a short string.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use super::{ChallengeParams, EventStream, Fetched, GameStream, Platform};
use crate::error::{BotError, Result};
use crate::model::{Event, GameEvent, GameSummary, UserProfile};

#[derive(Default)]
pub(crate) struct FakePlatform {
    calls: Mutex<Vec<String>>,
    json: Mutex<VecDeque<Value>>,
    online: Mutex<Vec<String>>,
    texts: Mutex<VecDeque<Fetched>>,
    events: Mutex<Vec<Event>>,
    games: Mutex<HashMap<String, VecDeque<Vec<GameEvent>>>>,
    bots: Mutex<Vec<UserProfile>>,
    users: Mutex<HashMap<String, UserProfile>>,
    ongoing: Mutex<Vec<GameSummary>>,
    pgn: Mutex<String>,
}

impl FakePlatform {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    pub fn push_json(&self, value: Value) {
        self.json.lock().unwrap().push_back(value);
    }

    pub fn online_requests(&self) -> Vec<String> {
        self.online.lock().unwrap().clone()
    }

    pub fn push_text(&self, fetched: Fetched) {
        self.texts.lock().unwrap().push_back(fetched);
    }

    pub fn set_events(&self, events: Vec<Event>) {
        *self.events.lock().unwrap() = events;
    }

    /// Queues the events of one `stream_game` connection. The stream stays
    /// open after the last event.
    pub fn push_game_stream(&self, game_id: &str, events: Vec<GameEvent>) {
        self.games
            .lock()
            .unwrap()
            .entry(game_id.to_string())
            .or_default()
            .push_back(events);
    }

    pub fn set_bots(&self, bots: Vec<UserProfile>) {
        for bot in &bots {
            self.users.lock().unwrap().insert(bot.username.to_lowercase(), bot.clone());
        }
        *self.bots.lock().unwrap() = bots;
    }

    pub fn set_ongoing(&self, games: Vec<GameSummary>) {
        *self.ongoing.lock().unwrap() = games;
    }

    pub fn set_pgn(&self, pgn: &str) {
        *self.pgn.lock().unwrap() = pgn.to_string();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn stream_events(&self) -> Result<EventStream> {
        self.record("stream_events".into());
        let events: Vec<_> = self.events.lock().unwrap().drain(..).map(|e| Ok(Some(e))).collect();
        Ok(stream::iter(events).chain(stream::pending()).boxed())
    }

    async fn stream_game(&self, game_id: &str) -> Result<GameStream> {
        self.record(format!("stream_game {game_id}"));
        let script = self
            .games
            .lock()
            .unwrap()
            .get_mut(game_id)
            .and_then(VecDeque::pop_front)
            .ok_or(BotError::StreamClosed)?;
        let items: Vec<_> = script.into_iter().map(|e| Ok(Some(e))).collect();
        Ok(stream::iter(items).chain(stream::pending()).boxed())
    }

    async fn make_move(&self, game_id: &str, uci: &str, offering_draw: bool) -> Result<()> {
        let draw = if offering_draw { " draw" } else { "" };
        self.record(format!("move {game_id} {uci}{draw}"));
        Ok(())
    }

    async fn accept_challenge(&self, challenge_id: &str) -> Result<()> {
        self.record(format!("accept {challenge_id}"));
        Ok(())
    }

    async fn decline_challenge(&self, challenge_id: &str, reason: &str) -> Result<()> {
        self.record(format!("decline {challenge_id} {reason}"));
        Ok(())
    }

    async fn create_challenge(&self, username: &str, params: &ChallengeParams) -> Result<Option<String>> {
        self.record(format!("challenge {username} {}", params.variant));
        Ok(Some(format!("out-{username}")))
    }

    async fn cancel_challenge(&self, challenge_id: &str) -> Result<()> {
        self.record(format!("cancel {challenge_id}"));
        Ok(())
    }

    async fn resign(&self, game_id: &str) -> Result<()> {
        self.record(format!("resign {game_id}"));
        Ok(())
    }

    async fn offer_draw(&self, game_id: &str) -> Result<()> {
        self.record(format!("draw {game_id}"));
        Ok(())
    }

    async fn abort(&self, game_id: &str) -> Result<()> {
        self.record(format!("abort {game_id}"));
        Ok(())
    }

    async fn answer_takeback(&self, game_id: &str, accept: bool) -> Result<()> {
        self.record(format!("takeback {game_id} {accept}"));
        Ok(())
    }

    async fn chat(&self, game_id: &str, room: &str, text: &str) -> Result<()> {
        self.record(format!("chat {game_id} {room} {text}"));
        Ok(())
    }

    async fn profile(&self) -> Result<UserProfile> {
        Ok(UserProfile {
            id: "bot".into(),
            username: "Bot".into(),
            title: Some("BOT".into()),
            ..UserProfile::default()
        })
    }

    async fn ongoing_games(&self) -> Result<Vec<GameSummary>> {
        Ok(self.ongoing.lock().unwrap().clone())
    }

    async fn online_bots(&self) -> Result<Vec<UserProfile>> {
        Ok(self.bots.lock().unwrap().clone())
    }

    async fn public_data(&self, username: &str) -> Result<UserProfile> {
        self.users
            .lock()
            .unwrap()
            .get(&username.to_lowercase())
            .cloned()
            .ok_or_else(|| BotError::Http {
                status: 404,
                endpoint: "public_data".into(),
                body: String::new(),
            })
    }

    async fn is_online(&self, _username: &str) -> Result<bool> {
        Ok(true)
    }

    async fn game_pgn(&self, game_id: &str) -> Result<String> {
        self.record(format!("pgn {game_id}"));
        Ok(self.pgn.lock().unwrap().clone())
    }

    async fn upgrade_to_bot(&self) -> Result<()> {
        self.record("upgrade".into());
        Ok(())
    }

    async fn token_scopes(&self) -> Result<Vec<String>> {
        Ok(vec!["bot:play".into()])
    }

    async fn online_json(&self, url: &str, _params: &[(&str, String)], _timeout: Duration) -> Result<Value> {
        self.online.lock().unwrap().push(url.to_string());
        self.json.lock().unwrap().pop_front().ok_or(BotError::StreamClosed)
    }

    async fn fetch_text(&self, url: &str, _etag: Option<&str>) -> Result<Fetched> {
        self.record(format!("fetch {url}"));
        self.texts.lock().unwrap().pop_front().ok_or(BotError::StreamClosed)
    }
}
