//! Shared fakes and builders for the scenario tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use lichess_bot::clients::{ChallengeParams, EventStream, Fetched, GameStream, Platform};
use lichess_bot::config::EngineProtocol;
use lichess_bot::conversation::ChallengeQueueView;
use lichess_bot::engines::{ConfiguredEngines, EngineFactory};
use lichess_bot::model::{Event, GameEvent, GameSummary, UserProfile};
use lichess_bot::registry::SessionRegistry;
use lichess_bot::session::TakebackCounts;
use lichess_bot::sources::{Books, Tablebases};
use lichess_bot::{BotError, Config, Result, SessionContext};

/// One connection of the account event stream.
struct Connection {
    events: Vec<Event>,
    /// Whether the server drops the stream after the events.
    closes: bool,
}

/// A platform that replays scripted streams and records every call.
#[derive(Default)]
pub struct FakePlatform {
    calls: Mutex<Vec<String>>,
    connections: Mutex<VecDeque<Connection>>,
    games: Mutex<HashMap<String, VecDeque<Vec<GameEvent>>>>,
    ongoing: Mutex<Vec<GameSummary>>,
}

impl FakePlatform {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    pub fn push_connection(&self, events: Vec<Event>, closes: bool) {
        self.connections.lock().unwrap().push_back(Connection { events, closes });
    }

    pub fn push_game_stream(&self, game_id: &str, events: Vec<GameEvent>) {
        self.games
            .lock()
            .unwrap()
            .entry(game_id.to_string())
            .or_default()
            .push_back(events);
    }

    pub fn set_ongoing(&self, games: Vec<GameSummary>) {
        *self.ongoing.lock().unwrap() = games;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn stream_events(&self) -> Result<EventStream> {
        self.record("stream_events".into());
        let Some(connection) = self.connections.lock().unwrap().pop_front() else {
            return Ok(stream::pending().boxed());
        };
        let events = stream::iter(connection.events.into_iter().map(|e| Ok(Some(e))));
        if connection.closes {
            Ok(events.boxed())
        } else {
            Ok(events.chain(stream::pending()).boxed())
        }
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
        Ok(None)
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
        Ok(Vec::new())
    }

    async fn public_data(&self, _username: &str) -> Result<UserProfile> {
        Err(BotError::StreamClosed)
    }

    async fn is_online(&self, _username: &str) -> Result<bool> {
        Ok(true)
    }

    async fn game_pgn(&self, game_id: &str) -> Result<String> {
        self.record(format!("pgn {game_id}"));
        Ok(String::new())
    }

    async fn upgrade_to_bot(&self) -> Result<()> {
        self.record("upgrade".into());
        Ok(())
    }

    async fn token_scopes(&self) -> Result<Vec<String>> {
        Ok(vec!["bot:play".into()])
    }

    async fn online_json(&self, _url: &str, _params: &[(&str, String)], _timeout: Duration) -> Result<Value> {
        Err(BotError::StreamClosed)
    }

    async fn fetch_text(&self, url: &str, _etag: Option<&str>) -> Result<Fetched> {
        self.record(format!("fetch {url}"));
        Err(BotError::StreamClosed)
    }
}

/// A homemade engine so no engine binary is needed.
pub fn config() -> Config {
    let mut config = Config::default();
    config.engine.protocol = EngineProtocol::Homemade;
    config.engine.name = "FirstMove".into();
    config
}

pub fn context(platform: Arc<FakePlatform>, config: Config) -> SessionContext {
    let engines = Arc::new(ConfiguredEngines::new(config.engine.clone(), false));
    context_with_engines(platform, config, engines)
}

pub fn context_with_engines(
    platform: Arc<FakePlatform>,
    config: Config,
    engines: Arc<dyn EngineFactory>,
) -> SessionContext {
    SessionContext {
        platform,
        engines,
        books: Books::default(),
        tablebases: Tablebases::default(),
        username: "Bot".into(),
        challenge_queue: ChallengeQueueView::default(),
        takebacks: TakebackCounts::default(),
        registry: SessionRegistry::new(config.max_games()),
        config: Arc::new(config),
    }
}

pub fn event(json: &str) -> Event {
    serde_json::from_str(json).unwrap()
}

pub fn game_start(id: &str) -> Event {
    event(&format!(
        r#"{{"type":"gameStart","game":{{"gameId":"{id}","speed":"blitz","opponent":{{"username":"Alice"}}}}}}"#
    ))
}

pub fn challenge(id: &str, user: &str) -> Event {
    event(&format!(
        r#"{{"type":"challenge","challenge":{{"id":"{id}","rated":true,
        "variant":{{"key":"standard"}},"speed":"blitz",
        "timeControl":{{"type":"clock","limit":180,"increment":2}},
        "challenger":{{"id":"{user}","name":"{user}","rating":1700}},
        "destUser":{{"id":"bot","name":"Bot","title":"BOT"}}}}}}"#
    ))
}

/// `gameFull` of a fresh 3+0 game against Alice.
pub fn full(id: &str, moves: &str, we_are_white: bool) -> GameEvent {
    let (white, black) = if we_are_white { ("Bot", "Alice") } else { ("Alice", "Bot") };
    let json = format!(
        r#"{{"type":"gameFull","id":"{id}","rated":true,"variant":{{"key":"standard"}},"speed":"blitz",
        "perf":{{"name":"Blitz"}},"createdAt":1700000000000,"clock":{{"initial":180000,"increment":0}},
        "white":{{"id":"{w}","name":"{white}","rating":1900}},
        "black":{{"id":"{b}","name":"{black}","rating":1800}},
        "state":{{"type":"gameState","moves":"{moves}","wtime":180000,"btime":180000,
        "winc":0,"binc":0,"status":"started"}}}}"#,
        w = white.to_lowercase(),
        b = black.to_lowercase(),
    );
    serde_json::from_str(&json).unwrap()
}

pub fn state(moves: &str, status: &str, winner: Option<&str>) -> GameEvent {
    let winner = winner.map_or("null".to_string(), |w| format!("\"{w}\""));
    let json = format!(
        r#"{{"type":"gameState","moves":"{moves}","wtime":170000,"btime":170000,
        "winc":0,"binc":0,"status":"{status}","winner":{winner}}}"#
    );
    serde_json::from_str(&json).unwrap()
}
