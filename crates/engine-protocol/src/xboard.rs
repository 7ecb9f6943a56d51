//! XBoard (CECP v2) engine adapter

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chess_core::{GameBoard, GameVariant};
use shakmaty::{Color, Move};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::options::{parse_xboard_option, OptionKind, OptionSchema, OptionValue};
use crate::process::{EngineCommand, EngineIo, EngineProcess};
use crate::protocol::{Engine, EngineState, OpponentInfo, PlayResult, Score, SearchInfo, SearchLimits};

/// Upper bound for a handshake extended with `done=0`.
const EXTENDED_HANDSHAKE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct XBoardSettings {
    pub options: BTreeMap<String, OptionValue>,
    pub ponder: bool,
    pub handshake_timeout: Duration,
    pub response_grace: Duration,
    pub max_search_time: Duration,
    pub variant: GameVariant,
}

impl Default for XBoardSettings {
    fn default() -> Self {
        Self {
            options: BTreeMap::new(),
            ponder: false,
            handshake_timeout: Duration::from_secs(30),
            response_grace: Duration::from_secs(10),
            max_search_time: Duration::from_secs(300),
            variant: GameVariant::Standard,
        }
    }
}

pub struct XBoardEngine {
    io: EngineIo,
    process: Option<EngineProcess>,
    settings: XBoardSettings,
    state: EngineState,
    name: String,
    features: HashMap<String, String>,
    schema: Vec<OptionSchema>,
    position: Option<GameBoard>,
    /// Our position plus the reply the engine is pondering on.
    ponder_position: Option<GameBoard>,
    /// Moves the engine has on its own board, in our notation.
    engine_moves: Vec<Move>,
    game_started: bool,
    level_sent: bool,
    ping: u32,
}

impl XBoardEngine {
    pub fn spawn(
        command: &EngineCommand,
        settings: XBoardSettings,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let (process, io) = EngineProcess::spawn(command, cancel)?;
        let mut engine = Self::with_io(io, settings);
        engine.process = Some(process);
        Ok(engine)
    }

    pub fn with_io(io: EngineIo, settings: XBoardSettings) -> Self {
        Self {
            io,
            process: None,
            settings,
            state: EngineState::Uninitialized,
            name: "engine".to_string(),
            features: HashMap::new(),
            schema: Vec::new(),
            position: None,
            ponder_position: None,
            engine_moves: Vec::new(),
            game_started: false,
            level_sent: false,
            ping: 0,
        }
    }

    pub fn feature(&self, key: &str) -> Option<&str> {
        self.features.get(key).map(String::as_str)
    }

    fn feature_enabled(&self, key: &str) -> bool {
        self.feature(key) == Some("1")
    }

    fn expect(&self, operation: &'static str, allowed: &[EngineState]) -> Result<(), EngineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    async fn apply_option(&mut self, name: &str, value: &OptionValue) -> Result<(), EngineError> {
        let unsupported = |what: &str| EngineError::Config(format!("engine does not support {what}"));
        if name == "memory" {
            if !self.feature_enabled("memory") {
                return Err(unsupported("memory"));
            }
            return self.io.send(&format!("memory {value}")).await;
        }
        if name == "cores" {
            if !self.feature_enabled("smp") {
                return Err(unsupported("cores"));
            }
            return self.io.send(&format!("cores {value}")).await;
        }
        if let Some(kind) = name.strip_prefix("egtpath") {
            let kind = kind.trim();
            let declared = self
                .feature("egt")
                .is_some_and(|egt| egt.split(',').any(|k| k.trim() == kind));
            if kind.is_empty() || !declared {
                return Err(unsupported(&format!("egtpath {kind}")));
            }
            return self.io.send(&format!("egtpath {kind} {value}")).await;
        }

        let option = self
            .schema
            .iter()
            .find(|o| o.name == name)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown engine option: {name}")))?;
        let validated = option.validate(value)?;
        let cmd = match (&validated.kind, validated.value) {
            (OptionKind::Button, _) | (_, None) => format!("option {}", validated.name),
            (OptionKind::Check { .. }, Some(v)) => {
                format!("option {}={}", validated.name, if v == "true" { 1 } else { 0 })
            }
            (_, Some(v)) => format!("option {}={v}", validated.name),
        };
        self.io.send(&cmd).await
    }

    async fn sync_ping(&mut self) -> Result<(), EngineError> {
        if !self.feature_enabled("ping") {
            return Ok(());
        }
        self.ping += 1;
        let expected = format!("pong {}", self.ping);
        self.io.send(&format!("ping {}", self.ping)).await?;
        let deadline = Instant::now() + self.settings.response_grace;
        self.io.wait_for(deadline, "pong", |l| l == expected).await?;
        Ok(())
    }

    async fn send_move(&mut self, board_before: &GameBoard, m: Move) -> Result<(), EngineError> {
        let text = board_before.to_uci(m);
        if self.feature_enabled("usermove") {
            self.io.send(&format!("usermove {text}")).await
        } else {
            self.io.send(&text).await
        }
    }

    async fn start_game(&mut self, board: &GameBoard) -> Result<(), EngineError> {
        self.io.send("new").await?;
        if let Some(variant) = self.settings.variant.xboard_variant() {
            self.io.send(&format!("variant {variant}")).await?;
        }
        self.io.send("force").await?;
        if !board.is_standard_start() {
            self.io.send(&format!("setboard {}", board.initial_fen())).await?;
        }
        self.engine_moves.clear();
        self.level_sent = false;
        self.game_started = true;
        Ok(())
    }

    /// Clock and search limits, sent before the engine starts thinking.
    async fn send_limits(&mut self, white: bool, limits: &SearchLimits) -> Result<(), EngineError> {
        if let Some(clock) = &limits.clock {
            let (ours, theirs, inc) = if white {
                (clock.wtime, clock.btime, clock.winc)
            } else {
                (clock.btime, clock.wtime, clock.binc)
            };
            if !self.level_sent {
                let secs = ours.as_secs();
                let level = format!("level 0 {}:{:02} {}", secs / 60, secs % 60, format_seconds(inc));
                self.io.send(&level).await?;
                self.level_sent = true;
            }
            self.io.send(&format!("time {}", ours.as_millis() / 10)).await?;
            self.io.send(&format!("otim {}", theirs.as_millis() / 10)).await?;
        }
        if let Some(movetime) = limits.movetime {
            let secs = movetime.as_secs_f64().ceil().max(1.0) as u64;
            self.io.send(&format!("st {secs}")).await?;
        }
        if let Some(depth) = limits.depth {
            self.io.send(&format!("sd {depth}")).await?;
        }
        Ok(())
    }

    async fn read_move(&mut self, board: &GameBoard, deadline: Instant) -> Result<PlayResult, EngineError> {
        let mut result = PlayResult::default();
        loop {
            let line = self.io.read_line(deadline, "move").await?;
            if let Some(text) = line.strip_prefix("move ") {
                self.state = EngineState::Idle;
                let best = board
                    .parse_move(text)
                    .map_err(|_| EngineError::IllegalMove(text.trim().to_string()))?;
                self.engine_moves.push(best);
                result.best = Some(best);
                return Ok(result);
            }
            if line == "resign" || (is_result_line(&line) && line.contains("resign")) {
                self.state = EngineState::Idle;
                result.resigned = true;
                return Ok(result);
            }
            if line == "offer draw" {
                result.draw_offered = true;
                continue;
            }
            if line.starts_with("Illegal move") || line.starts_with("Error") {
                self.state = EngineState::Idle;
                return Err(EngineError::Protocol(line));
            }
            if let Some(info) = parse_thinking(&line) {
                result.info.update(info);
            }
        }
    }
}

#[async_trait]
impl Engine for XBoardEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EngineState {
        self.state
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        self.expect("initialize", &[EngineState::Uninitialized])?;
        self.state = EngineState::Initializing;

        self.io.send("xboard").await?;
        self.io.send("protover 2").await?;

        let mut deadline = Instant::now() + self.settings.handshake_timeout;
        let mut seen_feature = false;
        'handshake: loop {
            let line = match self.io.read_line(deadline, "feature done=1").await {
                Ok(line) => line,
                // protover 1 engines never finish the feature list
                Err(EngineError::Timeout { .. }) if seen_feature => break,
                Err(e) => return Err(e),
            };
            let Some(rest) = line.strip_prefix("feature ") else {
                continue;
            };
            seen_feature = true;
            for (key, value) in parse_features(rest) {
                self.io.send(&format!("accepted {key}")).await?;
                match key.as_str() {
                    "done" if value == "0" => {
                        let extended = EXTENDED_HANDSHAKE.min(self.settings.handshake_timeout * 120);
                        deadline = Instant::now() + extended;
                    }
                    "done" => break 'handshake,
                    "option" => match parse_xboard_option(&value) {
                        Some(option) => self.schema.push(option),
                        None => debug!(option = %value, "ignoring unparseable option"),
                    },
                    "myname" => self.name = value.clone(),
                    _ => {}
                }
                if key != "option" {
                    self.features.insert(key, value);
                }
            }
        }

        let options = self.settings.options.clone();
        for (name, value) in &options {
            self.apply_option(name, value).await?;
        }
        self.io.send("post").await?;
        self.io.send(if self.settings.ponder { "hard" } else { "easy" }).await?;
        self.sync_ping().await?;

        self.state = EngineState::Idle;
        debug!(engine = %self.name, options = self.schema.len(), "engine ready");
        Ok(())
    }

    async fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), EngineError> {
        self.expect("set_option", &[EngineState::Idle])?;
        self.apply_option(name, value).await
    }

    async fn set_position(&mut self, board: &GameBoard) -> Result<(), EngineError> {
        self.expect("set_position", &[EngineState::Idle])?;
        let known = self.engine_moves.len();
        let continues = self.game_started
            && known <= board.ply()
            && board.moves()[..known] == self.engine_moves[..];

        if continues {
            self.io.send("force").await?;
        } else {
            self.start_game(board).await?;
        }

        let start = self.engine_moves.len();
        let mut replay = board.clone();
        while replay.ply() > start {
            replay.pop();
        }
        for m in &board.moves()[start..] {
            self.send_move(&replay, *m).await?;
            replay.push(*m).map_err(|e| EngineError::Protocol(e.to_string()))?;
            self.engine_moves.push(*m);
        }
        self.sync_ping().await?;
        self.position = Some(board.clone());
        Ok(())
    }

    async fn go(&mut self, limits: &SearchLimits) -> Result<PlayResult, EngineError> {
        self.expect("go", &[EngineState::Idle])?;
        let board = self.position.clone().ok_or(EngineError::InvalidState {
            operation: "go without a position",
            state: self.state,
        })?;
        let white = board.turn() == Color::White;

        self.send_limits(white, limits).await?;
        if limits.nodes.is_some() {
            warn!(engine = %self.name, "node limits are not supported by XBoard engines, ignoring");
        }
        if !limits.root_moves.is_empty() {
            debug!("XBoard has no root move restriction, searching all moves");
        }

        self.io.send("go").await?;
        self.state = EngineState::Searching;
        let budget = limits.deadline(white, self.settings.response_grace, self.settings.max_search_time);
        self.read_move(&board, Instant::now() + budget).await
    }

    async fn play(
        &mut self,
        board: &GameBoard,
        limits: &SearchLimits,
        draw_offered: bool,
    ) -> Result<PlayResult, EngineError> {
        if self.state == EngineState::Pondering {
            let hit = self
                .ponder_position
                .as_ref()
                .is_some_and(|p| p.moves() == board.moves());
            if hit && !draw_offered {
                return self.ponderhit(limits).await;
            }
            self.stop().await?;
        }
        self.set_position(board).await?;
        if draw_offered && self.feature("draw") != Some("0") {
            self.io.send("draw").await?;
        }
        self.go(limits).await
    }

    /// Under `hard` the engine ponders on its own once it has moved, so
    /// this only records the reply it is expected to be thinking about.
    async fn ponder(&mut self, board: &GameBoard, ponder_move: Move, limits: &SearchLimits) -> Result<(), EngineError> {
        if !self.settings.ponder || !limits.ponder {
            return Ok(());
        }
        self.expect("ponder", &[EngineState::Idle])?;
        let mut predicted = board.clone();
        if predicted.push(ponder_move).is_err() || predicted.is_game_over() {
            return Ok(());
        }
        self.state = EngineState::Pondering;
        self.ponder_position = Some(predicted);
        Ok(())
    }

    /// Sends the reply without `force`, so the engine keeps its ponder search.
    async fn ponderhit(&mut self, limits: &SearchLimits) -> Result<PlayResult, EngineError> {
        self.expect("ponderhit", &[EngineState::Pondering])?;
        let board = self.ponder_position.take().ok_or(EngineError::InvalidState {
            operation: "ponderhit without a ponder position",
            state: self.state,
        })?;
        let mut before = board.clone();
        let reply = before.pop().ok_or(EngineError::InvalidState {
            operation: "ponderhit without a reply",
            state: self.state,
        })?;
        let white = board.turn() == Color::White;
        self.send_limits(white, limits).await?;
        self.send_move(&before, reply).await?;
        self.engine_moves.push(reply);
        self.position = Some(board.clone());
        self.state = EngineState::Searching;

        let budget = limits.deadline(white, self.settings.response_grace, self.settings.max_search_time);
        self.read_move(&board, Instant::now() + budget).await
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Idle => Ok(()),
            EngineState::Pondering => {
                // Back to force mode; a pondering engine prints nothing.
                self.io.send("force").await?;
                self.ponder_position = None;
                self.state = EngineState::Idle;
                Ok(())
            }
            EngineState::Searching => {
                self.io.send("?").await?;
                let board = self.position.clone().ok_or(EngineError::InvalidState {
                    operation: "stop without a position",
                    state: self.state,
                })?;
                let deadline = Instant::now() + self.settings.response_grace;
                self.read_move(&board, deadline).await?;
                // The engine has played its move; make it forget it on the next setup.
                self.game_started = false;
                Ok(())
            }
            state => Err(EngineError::InvalidState {
                operation: "stop",
                state,
            }),
        }
    }

    async fn send_opponent(&mut self, opponent: &OpponentInfo, our_rating: Option<u32>) -> Result<(), EngineError> {
        if self.feature("name") != Some("0") {
            self.io.send(&format!("name {}", opponent.name)).await?;
        }
        if let (Some(ours), Some(theirs)) = (our_rating, opponent.rating) {
            self.io.send(&format!("rating {ours} {theirs}")).await?;
        }
        if opponent.is_bot {
            self.io.send("computer").await?;
        }
        Ok(())
    }

    async fn send_result(&mut self, result: &str, reason: &str) -> Result<(), EngineError> {
        self.io.send(&format!("result {result} {{{reason}}}")).await
    }

    async fn quit(&mut self) {
        if matches!(self.state, EngineState::Terminating | EngineState::Terminated) {
            return;
        }
        self.state = EngineState::Terminating;
        if let Err(e) = self.io.send("quit").await {
            debug!(error = %e, "failed to send quit");
        }
        if let Some(process) = self.process.as_mut() {
            process.shutdown(self.settings.response_grace).await;
        }
        self.process = None;
        self.state = EngineState::Terminated;
    }
}

fn is_result_line(line: &str) -> bool {
    line.starts_with("1-0") || line.starts_with("0-1") || line.starts_with("1/2-1/2")
}

fn format_seconds(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.1}", d.as_secs_f64())
    }
}

/// Tokenize the body of a `feature` line into key/value pairs. Values may be quoted.
pub fn parse_features(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = text.trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 1..];
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(char::is_whitespace) {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        out.push((key, value.to_string()));
        rest = remaining.trim_start();
    }
    out
}

/// Parse a thinking line: `ply score time nodes pv...`, time in centiseconds.
pub fn parse_thinking(line: &str) -> Option<SearchInfo> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let depth = tokens
        .first()?
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    let score: i32 = tokens.get(1)?.parse().ok()?;
    let centis: u64 = tokens.get(2)?.parse().ok()?;
    let nodes: u64 = tokens.get(3)?.parse().ok()?;
    Some(SearchInfo {
        depth: Some(depth),
        score: Some(Score::Cp(score)),
        time: Some(Duration::from_millis(centis * 10)),
        nodes: Some(nodes),
        pv: tokens[4..].iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    })
}
