//! Platform data model: players, challenges, games and the ndjson events that
//! carry them.

use std::collections::HashMap;
use std::time::Duration;

use chess_core::GameVariant;
use chrono::{DateTime, TimeZone, Utc};
use engine_protocol::ClockLimits;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rating: Option<u32>,
    #[serde(default)]
    pub provisional: bool,
    #[serde(default)]
    pub ai_level: Option<u32>,
}

impl Player {
    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT") || self.ai_level.is_some()
    }

    pub fn display_name(&self) -> String {
        match self.ai_level {
            Some(level) => format!("AI level {level}"),
            None => self.name.clone(),
        }
    }

    /// `Title Name (rating)`, as used in log lines.
    pub fn label(&self) -> String {
        let mut out = String::new();
        if let Some(title) = &self.title {
            out.push_str(title);
            out.push(' ');
        }
        out.push_str(&self.display_name());
        if let Some(rating) = self.rating {
            out.push_str(&format!(" ({rating}{})", if self.provisional { "?" } else { "" }));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VariantInfo {
    pub key: GameVariant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PerfInfo {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimeControl {
    Clock {
        limit: u32,
        increment: u32,
    },
    #[serde(rename_all = "camelCase")]
    Correspondence {
        days_per_turn: u32,
    },
    Unlimited,
}

/// Challenge payload as sent by the platform.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeData {
    pub id: String,
    #[serde(default)]
    pub rated: bool,
    pub variant: VariantInfo,
    #[serde(default)]
    pub perf: PerfInfo,
    #[serde(default)]
    pub speed: String,
    pub time_control: TimeControl,
    pub challenger: Option<Player>,
    pub dest_user: Option<Player>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub initial_fen: Option<String>,
    #[serde(default)]
    pub decline_reason_key: Option<String>,
}

/// Immutable snapshot of an incoming or outgoing challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub id: String,
    pub rated: bool,
    pub variant: GameVariant,
    pub perf_name: String,
    pub speed: String,
    pub base: Option<u32>,
    pub increment: Option<u32>,
    pub days: Option<u32>,
    pub challenger: Player,
    pub dest_user: Option<Player>,
    pub color: Option<String>,
    pub initial_fen: Option<String>,
    pub from_self: bool,
    pub decline_reason: Option<String>,
}

impl Challenge {
    pub fn new(data: ChallengeData, me: &str) -> Self {
        let (base, increment, days) = match data.time_control {
            TimeControl::Clock { limit, increment } => (Some(limit), Some(increment), None),
            TimeControl::Correspondence { days_per_turn } => (None, None, Some(days_per_turn)),
            TimeControl::Unlimited => (None, None, None),
        };
        let challenger = data.challenger.unwrap_or_default();
        let from_self = challenger.name.eq_ignore_ascii_case(me);
        Self {
            id: data.id,
            rated: data.rated,
            variant: data.variant.key,
            perf_name: data.perf.name,
            speed: data.speed,
            base,
            increment,
            days,
            challenger,
            dest_user: data.dest_user,
            color: data.color,
            initial_fen: data.initial_fen,
            from_self,
            decline_reason: data.decline_reason_key,
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.rated {
            "rated"
        } else {
            "casual"
        }
    }

    /// Ordering key for the challenge queue.
    pub fn score(&self) -> i64 {
        let rated_bonus = if self.rated { 200 } else { 0 };
        let titled_bonus = if self.challenger.title.is_some() && !self.challenger.is_bot() {
            200
        } else {
            0
        };
        i64::from(self.challenger.rating.unwrap_or(0)) + rated_bonus + titled_bonus
    }

    pub fn is_unlimited(&self) -> bool {
        self.base.is_none() && self.days.is_none()
    }
}

/// Clock and move list of a game in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GameState {
    pub moves: String,
    /// Milliseconds.
    pub wtime: u64,
    pub btime: u64,
    pub winc: u64,
    pub binc: u64,
    pub wdraw: bool,
    pub bdraw: bool,
    pub wtakeback: bool,
    pub btakeback: bool,
    pub status: String,
    pub winner: Option<String>,
}

impl GameState {
    pub fn ply(&self) -> usize {
        self.moves.split_whitespace().count()
    }

    pub fn clock(&self) -> ClockLimits {
        ClockLimits {
            wtime: Duration::from_millis(self.wtime),
            btime: Duration::from_millis(self.btime),
            winc: Duration::from_millis(self.winc),
            binc: Duration::from_millis(self.binc),
        }
    }

    pub fn is_over(&self) -> bool {
        !matches!(self.status.as_str(), "" | "created" | "started")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ClockInfo {
    /// Milliseconds.
    pub initial: u64,
    pub increment: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFull {
    pub id: String,
    pub variant: VariantInfo,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub perf: PerfInfo,
    #[serde(default)]
    pub rated: bool,
    #[serde(default)]
    pub created_at: i64,
    pub white: Player,
    pub black: Player,
    #[serde(default)]
    pub initial_fen: Option<String>,
    #[serde(default)]
    pub clock: Option<ClockInfo>,
    #[serde(default)]
    pub days_per_turn: Option<u32>,
    pub state: GameState,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatLine {
    pub room: String,
    pub username: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Mate,
    OutOfTime,
    Resign,
    Aborted,
    Draw,
    Other(String),
}

impl Termination {
    fn from_status(status: &str) -> Self {
        match status {
            "mate" => Termination::Mate,
            "outoftime" | "timeout" => Termination::OutOfTime,
            "resign" => Termination::Resign,
            "aborted" | "noStart" => Termination::Aborted,
            "draw" | "stalemate" => Termination::Draw,
            other => Termination::Other(other.to_string()),
        }
    }
}

/// One game from our side of the board, built from `gameFull`.
#[derive(Debug, Clone)]
pub struct Game {
    pub id: String,
    pub variant: GameVariant,
    pub speed: String,
    pub perf_name: String,
    pub rated: bool,
    pub white: Player,
    pub black: Player,
    pub is_white: bool,
    pub initial_fen: Option<String>,
    /// Seconds.
    pub base: u32,
    pub increment: u32,
    pub days: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub state: GameState,
    base_url: String,
}

impl Game {
    pub fn new(full: GameFull, username: &str, base_url: &str) -> Self {
        let is_white = full.white.name.eq_ignore_ascii_case(username);
        let (base, increment) = full
            .clock
            .map(|c| ((c.initial / 1000) as u32, (c.increment / 1000) as u32))
            .unwrap_or((0, 0));
        let created_at = Utc
            .timestamp_millis_opt(full.created_at)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            id: full.id,
            variant: full.variant.key,
            speed: full.speed,
            perf_name: full.perf.name,
            rated: full.rated,
            white: full.white,
            black: full.black,
            is_white,
            initial_fen: full.initial_fen.filter(|f| f != "startpos"),
            base,
            increment,
            days: full.days_per_turn,
            created_at,
            state: full.state,
            base_url: base_url.to_string(),
        }
    }

    pub fn me(&self) -> &Player {
        if self.is_white {
            &self.white
        } else {
            &self.black
        }
    }

    pub fn opponent(&self) -> &Player {
        if self.is_white {
            &self.black
        } else {
            &self.white
        }
    }

    pub fn color(&self) -> &'static str {
        if self.is_white {
            "white"
        } else {
            "black"
        }
    }

    pub fn url(&self) -> String {
        format!("{}{}/{}", self.base_url, self.id, self.color())
    }

    pub fn short_url(&self) -> String {
        format!("{}{}", self.base_url, self.id)
    }

    pub fn mode(&self) -> &'static str {
        if self.rated {
            "Rated"
        } else {
            "Casual"
        }
    }

    pub fn pgn_event(&self) -> String {
        if matches!(self.variant, GameVariant::Standard | GameVariant::FromPosition) {
            format!("{} {} game", self.mode(), self.perf_name.to_lowercase())
        } else {
            format!("{} {} game", self.mode(), self.variant.name())
        }
    }

    pub fn time_control(&self) -> String {
        format!("{}+{}", self.base, self.increment)
    }

    pub fn is_correspondence(&self) -> bool {
        self.speed == "correspondence"
    }

    /// Lichess lets either side abort until both have moved.
    pub fn is_abortable(&self) -> bool {
        !self.state.moves.trim().contains(' ')
    }

    pub fn my_remaining_time(&self) -> Duration {
        let ms = if self.is_white {
            self.state.wtime
        } else {
            self.state.btime
        };
        Duration::from_millis(ms)
    }

    pub fn is_my_turn(&self) -> bool {
        (self.state.ply() % 2 == 0) == self.is_white
    }

    pub fn termination(&self) -> Termination {
        Termination::from_status(&self.state.status)
    }

    pub fn result(&self) -> &'static str {
        match (self.state.winner.as_deref(), self.termination()) {
            (Some("white"), _) => "1-0",
            (Some("black"), _) => "0-1",
            (_, Termination::Aborted) => "*",
            _ if self.state.is_over() => "1/2-1/2",
            _ => "*",
        }
    }

    /// Wording used in the engine's final `result` line.
    pub fn result_reason(&self) -> String {
        let winner = match self.state.winner.as_deref() {
            Some("white") => "White",
            Some("black") => "Black",
            _ => "",
        };
        let loser = if winner == "White" { "Black" } else { "White" };
        match self.termination() {
            Termination::Mate => format!("{winner} mates"),
            Termination::OutOfTime if winner.is_empty() => "Time forfeit".to_string(),
            Termination::OutOfTime => format!("{loser} forfeits on time"),
            Termination::Resign => format!("{loser} resigns"),
            Termination::Aborted => "Game aborted".to_string(),
            Termination::Draw => "Draw".to_string(),
            Termination::Other(status) => status,
        }
    }
}

/// Game summary as found in `gameStart`, `gameFinish` and the ongoing-games list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub game_id: String,
    #[serde(default)]
    pub is_my_turn: bool,
    #[serde(default)]
    pub seconds_left: Option<u64>,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub opponent: Option<SummaryOpponent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryOpponent {
    #[serde(default)]
    pub username: String,
}

impl GameSummary {
    pub fn is_correspondence(&self) -> bool {
        self.speed == "correspondence"
    }
}

/// Top-level account event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Challenge { challenge: ChallengeData },
    ChallengeDeclined { challenge: ChallengeData },
    ChallengeCanceled { challenge: ChallengeData },
    GameStart { game: GameSummary },
    GameFinish { game: GameSummary },
    #[serde(other)]
    Unknown,
}

/// Per-game event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    GameFull(Box<GameFull>),
    GameState(GameState),
    ChatLine(ChatLine),
    #[serde(rename_all = "camelCase")]
    OpponentGone {
        gone: bool,
        #[serde(default)]
        claim_win_in_seconds: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PerfStats {
    #[serde(default)]
    pub games: u32,
    #[serde(default)]
    pub rating: u32,
    #[serde(default)]
    pub prov: bool,
}

/// Account or public user data.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub title: Option<String>,
    pub perfs: HashMap<String, PerfStats>,
    pub tos_violation: bool,
    pub disabled: bool,
    /// Whether this user blocks the authenticated account.
    pub blocking: bool,
}

impl UserProfile {
    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT")
    }

    pub fn perf(&self, category: &str) -> PerfStats {
        self.perfs.get(category).copied().unwrap_or_default()
    }
}
