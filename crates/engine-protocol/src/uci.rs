//! UCI engine adapter (async I/O)

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chess_core::{GameBoard, GameVariant};
use shakmaty::{Color, Move};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::options::{validate_options, OptionSchema, OptionValue, ValidatedOption};
use crate::process::{EngineCommand, EngineIo, EngineProcess};
use crate::protocol::{Engine, EngineState, OpponentInfo, PlayResult, Score, SearchInfo, SearchLimits};

/// Options the adapter sets itself; user values for these are dropped.
const MANAGED_OPTIONS: [&str; 4] = ["UCI_Chess960", "UCI_Variant", "MultiPV", "Ponder"];

#[derive(Debug, Clone)]
pub struct UciSettings {
    pub options: BTreeMap<String, OptionValue>,
    pub ponder: bool,
    pub handshake_timeout: Duration,
    pub response_grace: Duration,
    pub max_search_time: Duration,
    pub variant: GameVariant,
}

impl Default for UciSettings {
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

pub struct UciEngine {
    io: EngineIo,
    process: Option<EngineProcess>,
    settings: UciSettings,
    state: EngineState,
    name: String,
    schema: Vec<OptionSchema>,
    position: Option<GameBoard>,
    ponder_position: Option<GameBoard>,
    new_game_sent: bool,
}

impl UciEngine {
    /// Spawn the engine process. The handshake happens in `initialize`.
    pub fn spawn(
        command: &EngineCommand,
        settings: UciSettings,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let (process, io) = EngineProcess::spawn(command, cancel)?;
        let mut engine = Self::with_io(io, settings);
        engine.process = Some(process);
        Ok(engine)
    }

    /// Adapter over an existing transport, without an owned process.
    pub fn with_io(io: EngineIo, settings: UciSettings) -> Self {
        Self {
            io,
            process: None,
            settings,
            state: EngineState::Uninitialized,
            name: "engine".to_string(),
            schema: Vec::new(),
            position: None,
            ponder_position: None,
            new_game_sent: false,
        }
    }

    pub fn schema(&self) -> &[OptionSchema] {
        &self.schema
    }

    fn find_option(&self, name: &str) -> Option<&OptionSchema> {
        self.schema.iter().find(|o| o.name.eq_ignore_ascii_case(name))
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

    fn grace_deadline(&self) -> Instant {
        Instant::now() + self.settings.response_grace
    }

    async fn send_setoption(&mut self, option: &ValidatedOption) -> Result<(), EngineError> {
        let cmd = match &option.value {
            Some(value) => format!("setoption name {} value {value}", option.name),
            None => format!("setoption name {}", option.name),
        };
        self.io.send(&cmd).await
    }

    async fn set_managed(&mut self, name: &str, value: OptionValue) -> Result<bool, EngineError> {
        let Some(option) = self.find_option(name).cloned() else {
            return Ok(false);
        };
        let validated = option.validate(&value)?;
        self.send_setoption(&validated).await?;
        Ok(true)
    }

    async fn sync_ready(&mut self, deadline: Instant) -> Result<(), EngineError> {
        self.io.send("isready").await?;
        self.io.wait_for(deadline, "readyok", |l| l == "readyok").await?;
        Ok(())
    }

    async fn read_bestmove(
        &mut self,
        board: &GameBoard,
        deadline: Instant,
    ) -> Result<PlayResult, EngineError> {
        let mut info = SearchInfo::default();
        loop {
            let line = self.io.read_line(deadline, "bestmove").await?;
            if line.starts_with("info") {
                info.update(parse_info(&line));
                continue;
            }
            let Some((best, ponder)) = parse_bestmove(&line) else {
                continue;
            };
            self.state = EngineState::Idle;

            let best = board
                .parse_uci(&best)
                .map_err(|_| EngineError::IllegalMove(best.clone()))?;
            let ponder = ponder.and_then(|p| {
                let mut after = board.clone();
                after.push(best).ok()?;
                after.parse_uci(&p).ok()
            });
            return Ok(PlayResult {
                best: Some(best),
                ponder,
                info,
                resigned: false,
                draw_offered: false,
            });
        }
    }

    async fn start_search(&mut self, board: &GameBoard, limits: &SearchLimits, ponder: bool) -> Result<(), EngineError> {
        self.io.send(&position_command(board)).await?;
        self.io.send(&go_command(board, limits, ponder)).await
    }
}

#[async_trait]
impl Engine for UciEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EngineState {
        self.state
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        self.expect("initialize", &[EngineState::Uninitialized])?;
        self.state = EngineState::Initializing;

        let deadline = Instant::now() + self.settings.handshake_timeout;
        self.io.send("uci").await?;
        loop {
            let line = self.io.read_line(deadline, "uciok").await?;
            if line == "uciok" {
                break;
            }
            if let Some(name) = line.strip_prefix("id name ") {
                self.name = name.trim().to_string();
            } else if line.starts_with("option ") {
                match crate::options::parse_uci_option(&line) {
                    Some(option) => self.schema.push(option),
                    None => debug!(line, "ignoring unparseable option"),
                }
            }
        }

        let mut requested = self.settings.options.clone();
        requested.retain(|name, _| {
            let managed = MANAGED_OPTIONS.iter().any(|m| m.eq_ignore_ascii_case(name));
            if managed {
                debug!(option = %name, "option is managed by the bot, ignoring configured value");
            }
            !managed
        });
        for option in validate_options(&self.schema, &requested, true)? {
            self.send_setoption(&option).await?;
        }

        let variant = self.settings.variant;
        if variant.is_chess960() && !self.set_managed("UCI_Chess960", true.into()).await? {
            warn!(engine = %self.name, "engine does not declare UCI_Chess960");
        }
        if let Some(uci_variant) = variant.uci_variant() {
            if !self.set_managed("UCI_Variant", uci_variant.into()).await? {
                return Err(EngineError::Config(format!(
                    "{} does not support variant {variant}",
                    self.name
                )));
            }
        }
        if self.settings.ponder {
            self.set_managed("Ponder", true.into()).await?;
        }

        self.sync_ready(deadline).await?;
        self.state = EngineState::Idle;
        debug!(engine = %self.name, options = self.schema.len(), "engine ready");
        Ok(())
    }

    async fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), EngineError> {
        self.expect("set_option", &[EngineState::Idle])?;
        let option = self
            .find_option(name)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown engine option: {name}")))?;
        let validated = option.validate(value)?;
        self.send_setoption(&validated).await
    }

    async fn set_position(&mut self, board: &GameBoard) -> Result<(), EngineError> {
        self.expect("set_position", &[EngineState::Idle])?;
        if !self.new_game_sent {
            self.io.send("ucinewgame").await?;
            let deadline = self.grace_deadline();
            self.sync_ready(deadline).await?;
            self.new_game_sent = true;
        }
        self.io.send(&position_command(board)).await?;
        self.position = Some(board.clone());
        Ok(())
    }

    async fn go(&mut self, limits: &SearchLimits) -> Result<PlayResult, EngineError> {
        self.expect("go", &[EngineState::Idle])?;
        let board = self.position.clone().ok_or(EngineError::InvalidState {
            operation: "go without a position",
            state: self.state,
        })?;
        self.io.send(&go_command(&board, limits, false)).await?;
        self.state = EngineState::Searching;

        let budget = limits.deadline(
            board.turn() == Color::White,
            self.settings.response_grace,
            self.settings.max_search_time,
        );
        self.read_bestmove(&board, Instant::now() + budget).await
    }

    async fn play(
        &mut self,
        board: &GameBoard,
        limits: &SearchLimits,
        _draw_offered: bool,
    ) -> Result<PlayResult, EngineError> {
        if self.state == EngineState::Pondering {
            let hit = self
                .ponder_position
                .as_ref()
                .is_some_and(|p| p.moves() == board.moves());
            if hit {
                return self.ponderhit(limits).await;
            }
            self.stop().await?;
        }
        self.set_position(board).await?;
        self.go(limits).await
    }

    async fn ponder(
        &mut self,
        board: &GameBoard,
        ponder_move: Move,
        limits: &SearchLimits,
    ) -> Result<(), EngineError> {
        if !self.settings.ponder || !limits.ponder {
            return Ok(());
        }
        self.expect("ponder", &[EngineState::Idle])?;
        let mut predicted = board.clone();
        if predicted.push(ponder_move).is_err() || predicted.is_game_over() {
            return Ok(());
        }
        self.start_search(&predicted, limits, true).await?;
        self.state = EngineState::Pondering;
        self.ponder_position = Some(predicted);
        Ok(())
    }

    async fn ponderhit(&mut self, limits: &SearchLimits) -> Result<PlayResult, EngineError> {
        self.expect("ponderhit", &[EngineState::Pondering])?;
        let board = self.ponder_position.take().ok_or(EngineError::InvalidState {
            operation: "ponderhit without a ponder position",
            state: self.state,
        })?;
        self.io.send("ponderhit").await?;
        self.state = EngineState::Searching;
        self.position = Some(board.clone());

        let budget = limits.deadline(
            board.turn() == Color::White,
            self.settings.response_grace,
            self.settings.max_search_time,
        );
        self.read_bestmove(&board, Instant::now() + budget).await
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Idle => return Ok(()),
            EngineState::Searching | EngineState::Pondering => {}
            state => {
                return Err(EngineError::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        }
        self.io.send("stop").await?;
        let deadline = self.grace_deadline();
        self.io
            .wait_for(deadline, "bestmove", |l| l.starts_with("bestmove"))
            .await?;
        self.state = EngineState::Idle;
        self.ponder_position = None;
        Ok(())
    }

    async fn send_opponent(&mut self, opponent: &OpponentInfo, _our_rating: Option<u32>) -> Result<(), EngineError> {
        if self.find_option("UCI_Opponent").is_none() {
            return Ok(());
        }
        let title = opponent.title.as_deref().unwrap_or("none");
        let rating = opponent
            .rating
            .map_or_else(|| "none".to_string(), |r| r.to_string());
        let kind = if opponent.is_bot { "computer" } else { "human" };
        let value = format!("{title} {rating} {kind} {}", opponent.name);
        self.io
            .send(&format!("setoption name UCI_Opponent value {value}"))
            .await
    }

    async fn send_result(&mut self, _result: &str, _reason: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn quit(&mut self) {
        if matches!(self.state, EngineState::Terminating | EngineState::Terminated) {
            return;
        }
        if matches!(self.state, EngineState::Searching | EngineState::Pondering) {
            let _ = self.io.send("stop").await;
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

fn position_command(board: &GameBoard) -> String {
    let mut cmd = if board.is_standard_start() {
        "position startpos".to_string()
    } else {
        format!("position fen {}", board.initial_fen())
    };
    if !board.moves().is_empty() {
        cmd.push_str(" moves");
        for m in board.moves() {
            cmd.push(' ');
            cmd.push_str(&board.to_uci(*m));
        }
    }
    cmd
}

fn go_command(board: &GameBoard, limits: &SearchLimits, ponder: bool) -> String {
    let mut cmd = String::from("go");
    if ponder {
        cmd.push_str(" ponder");
    }
    if let Some(clock) = &limits.clock {
        let _ = write!(
            cmd,
            " wtime {} btime {} winc {} binc {}",
            clock.wtime.as_millis(),
            clock.btime.as_millis(),
            clock.winc.as_millis(),
            clock.binc.as_millis()
        );
    }
    if let Some(movetime) = limits.movetime {
        let _ = write!(cmd, " movetime {}", movetime.as_millis());
    }
    if let Some(depth) = limits.depth {
        let _ = write!(cmd, " depth {depth}");
    }
    if let Some(nodes) = limits.nodes {
        let _ = write!(cmd, " nodes {nodes}");
    }
    if !limits.root_moves.is_empty() {
        cmd.push_str(" searchmoves");
        for m in &limits.root_moves {
            cmd.push(' ');
            cmd.push_str(&board.to_uci(*m));
        }
    }
    cmd
}

/// Parse `bestmove <move> [ponder <move>]`.
pub fn parse_bestmove(line: &str) -> Option<(String, Option<String>)> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "bestmove" {
        return None;
    }
    let best = parts.next().unwrap_or("(none)").to_string();
    let ponder = match (parts.next(), parts.next()) {
        (Some("ponder"), Some(p)) => Some(p.to_string()),
        _ => None,
    };
    Some((best, ponder))
}

/// Parse an `info` line. Unknown tokens are skipped.
pub fn parse_info(line: &str) -> SearchInfo {
    let mut info = SearchInfo::default();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut i = 1;
    let num = |idx: usize| tokens.get(idx).and_then(|v| v.parse::<u64>().ok());

    while i < tokens.len() {
        match tokens[i] {
            "depth" => info.depth = num(i + 1).map(|v| v as u32),
            "seldepth" => info.seldepth = num(i + 1).map(|v| v as u32),
            "multipv" => info.multipv = num(i + 1).map(|v| v as u32),
            "nodes" => info.nodes = num(i + 1),
            "nps" => info.nps = num(i + 1),
            "time" => info.time = num(i + 1).map(Duration::from_millis),
            "score" => {
                info.score = match (tokens.get(i + 1), tokens.get(i + 2)) {
                    (Some(&"cp"), Some(v)) => v.parse().ok().map(Score::Cp),
                    (Some(&"mate"), Some(v)) => v.parse().ok().map(Score::Mate),
                    _ => None,
                };
                i += 3;
                if matches!(tokens.get(i), Some(&"lowerbound") | Some(&"upperbound")) {
                    i += 1;
                }
                continue;
            }
            "wdl" => {
                if let (Some(w), Some(d), Some(l)) = (num(i + 1), num(i + 2), num(i + 3)) {
                    info.wdl = Some((w as u32, d as u32, l as u32));
                }
                i += 4;
                continue;
            }
            "pv" => {
                info.pv = tokens[i + 1..].iter().map(|s| s.to_string()).collect();
                break;
            }
            "string" => {
                info.string = Some(tokens[i + 1..].join(" "));
                break;
            }
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    info
}
