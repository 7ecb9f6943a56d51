//! Protocol-independent engine model: lifecycle states, scores, search limits and
//! the `Engine` trait implemented by the UCI and XBoard adapters.

use std::time::Duration;

use async_trait::async_trait;
use chess_core::GameBoard;
use shakmaty::Move;

use crate::error::EngineError;

/// Lifecycle of one engine adapter. Adapters are single use: once `Terminated`
/// a new process and adapter are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Idle,
    Searching,
    Pondering,
    Terminating,
    Terminated,
}

/// Evaluation from the side to move's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Cp(i32),
    Mate(i32),
}

impl Score {
    pub const MATE_SCORE: i32 = 40000;

    /// Centipawn equivalent; mates map near `±MATE_SCORE`, shorter mates further out.
    pub fn to_cp(self) -> i32 {
        match self {
            Score::Cp(cp) => cp,
            Score::Mate(n) if n > 0 => Self::MATE_SCORE - n,
            Score::Mate(n) if n < 0 => -Self::MATE_SCORE - n,
            Score::Mate(_) => -Self::MATE_SCORE,
        }
    }

    pub fn is_mate(self) -> bool {
        matches!(self, Score::Mate(_))
    }
}

/// Statistics reported while searching. Only the main line (multipv 1) is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchInfo {
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    pub multipv: Option<u32>,
    pub score: Option<Score>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    pub time: Option<Duration>,
    /// Win/draw/loss in permille.
    pub wdl: Option<(u32, u32, u32)>,
    pub pv: Vec<String>,
    pub string: Option<String>,
}

impl SearchInfo {
    /// Merges a newer report into this one, keeping fields the newer one lacks.
    pub fn update(&mut self, newer: SearchInfo) {
        if newer.multipv.is_some_and(|n| n != 1) {
            return;
        }
        self.depth = newer.depth.or(self.depth);
        self.seldepth = newer.seldepth.or(self.seldepth);
        self.score = newer.score.or(self.score);
        self.nodes = newer.nodes.or(self.nodes);
        self.nps = newer.nps.or(self.nps);
        self.time = newer.time.or(self.time);
        self.wdl = newer.wdl.or(self.wdl);
        if !newer.pv.is_empty() {
            self.pv = newer.pv;
        }
        if newer.string.is_some() {
            self.string = newer.string;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockLimits {
    pub wtime: Duration,
    pub btime: Duration,
    pub winc: Duration,
    pub binc: Duration,
}

/// Search budget for one `go`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchLimits {
    pub clock: Option<ClockLimits>,
    pub movetime: Option<Duration>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    /// Restrict the search to these moves (UCI `searchmoves`).
    pub root_moves: Vec<Move>,
    /// Allow the engine to ponder after answering.
    pub ponder: bool,
}

impl SearchLimits {
    /// How long to wait for the engine's answer before declaring it unresponsive.
    pub fn deadline(&self, we_are_white: bool, grace: Duration, max_search: Duration) -> Duration {
        if let Some(movetime) = self.movetime {
            return movetime + grace;
        }
        if let Some(clock) = &self.clock {
            let ours = if we_are_white { clock.wtime } else { clock.btime };
            return ours + grace;
        }
        max_search + grace
    }
}

/// Outcome of a search. `best` is `None` when the engine resigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayResult {
    pub best: Option<Move>,
    pub ponder: Option<Move>,
    pub info: SearchInfo,
    pub resigned: bool,
    pub draw_offered: bool,
}

impl PlayResult {
    pub fn from_move(m: Move) -> Self {
        Self {
            best: Some(m),
            ..Self::default()
        }
    }
}

/// Opponent details forwarded to engines that want them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpponentInfo {
    pub name: String,
    pub title: Option<String>,
    pub rating: Option<u32>,
    pub is_bot: bool,
}

#[async_trait]
pub trait Engine: Send {
    fn name(&self) -> &str;

    fn state(&self) -> EngineState;

    /// Spawned process to `Idle`: handshake and option setup.
    async fn initialize(&mut self) -> Result<(), EngineError>;

    async fn set_option(&mut self, name: &str, value: &crate::OptionValue) -> Result<(), EngineError>;

    async fn set_position(&mut self, board: &GameBoard) -> Result<(), EngineError>;

    /// Searches the position last given to `set_position`. The returned move has
    /// been checked for legality.
    async fn go(&mut self, limits: &SearchLimits) -> Result<PlayResult, EngineError>;

    /// Resolves any ponder search against `board`, then searches it.
    async fn play(
        &mut self,
        board: &GameBoard,
        limits: &SearchLimits,
        draw_offered: bool,
    ) -> Result<PlayResult, EngineError>;

    /// Starts pondering on the predicted reply, if the engine supports it.
    async fn ponder(
        &mut self,
        board: &GameBoard,
        ponder_move: Move,
        limits: &SearchLimits,
    ) -> Result<(), EngineError>;

    /// The predicted reply was played. Finishes the ponder search under
    /// `limits`, which carry the current clock.
    async fn ponderhit(&mut self, limits: &SearchLimits) -> Result<PlayResult, EngineError>;

    /// Ends a running search or ponder and discards its result.
    async fn stop(&mut self) -> Result<(), EngineError>;

    async fn send_opponent(&mut self, opponent: &OpponentInfo, our_rating: Option<u32>) -> Result<(), EngineError>;

    async fn send_result(&mut self, result: &str, reason: &str) -> Result<(), EngineError>;

    /// Graceful quit with a bounded wait, then force kill. Always ends `Terminated`.
    async fn quit(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_to_cp() {
        assert_eq!(Score::Cp(-35).to_cp(), -35);
        assert_eq!(Score::Mate(3).to_cp(), 39997);
        assert_eq!(Score::Mate(-2).to_cp(), -39998);
    }

    #[test]
    fn test_info_update_ignores_secondary_lines() {
        let mut info = SearchInfo {
            depth: Some(10),
            score: Some(Score::Cp(20)),
            ..Default::default()
        };
        info.update(SearchInfo {
            multipv: Some(2),
            depth: Some(11),
            ..Default::default()
        });
        assert_eq!(info.depth, Some(10));
        info.update(SearchInfo {
            depth: Some(12),
            nodes: Some(1000),
            ..Default::default()
        });
        assert_eq!(info.depth, Some(12));
        assert_eq!(info.score, Some(Score::Cp(20)));
    }

    #[test]
    fn test_deadline() {
        let grace = Duration::from_secs(10);
        let limits = SearchLimits {
            movetime: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        assert_eq!(limits.deadline(true, grace, Duration::from_secs(300)), Duration::from_secs(12));
        let limits = SearchLimits {
            clock: Some(ClockLimits {
                wtime: Duration::from_secs(60),
                btime: Duration::from_secs(30),
                winc: Duration::ZERO,
                binc: Duration::ZERO,
            }),
            ..Default::default()
        };
        assert_eq!(limits.deadline(false, grace, Duration::from_secs(300)), Duration::from_secs(40));
        assert_eq!(SearchLimits::default().deadline(true, grace, Duration::from_secs(300)), Duration::from_secs(310));
    }
}
