//! Local replica of a game's position, kept in lockstep with the server's move list.

use shakmaty::fen::Fen;
use shakmaty::san::{San, SanPlus};
use shakmaty::uci::UciMove;
use shakmaty::variant::VariantPosition;
use shakmaty::zobrist::Zobrist64;
use shakmaty::{CastlingMode, Color, EnPassantMode, Move, Position};
use thiserror::Error;

use crate::variant::GameVariant;

pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BoardError {
    #[error("invalid FEN {fen:?}: {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("illegal or malformed move {uci:?} at ply {ply}")]
    InvalidMove { uci: String, ply: usize },

    #[error("move list diverged at ply {ply}: local {local:?}, server {server:?}")]
    Diverged {
        ply: usize,
        local: String,
        server: String,
    },
}

/// Result of reconciling the local move list with the server's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    /// Number of moves appended.
    Advanced(usize),
    /// Number of moves popped after a takeback.
    TakenBack(usize),
}

#[derive(Debug, Clone)]
pub struct GameBoard {
    variant: GameVariant,
    castling_mode: CastlingMode,
    root_fen: Option<String>,
    positions: Vec<VariantPosition>,
    moves: Vec<Move>,
    history: Vec<String>,
}

impl GameBoard {
    /// Builds the root position. `initial_fen` of `None` or `"startpos"` means the
    /// variant's regular starting position.
    pub fn new(variant: GameVariant, initial_fen: Option<&str>) -> Result<Self, BoardError> {
        let initial_fen = initial_fen
            .map(str::trim)
            .filter(|f| !f.is_empty() && *f != "startpos");

        let (root, castling_mode, root_fen) = match initial_fen {
            None => {
                let mode = if variant.is_chess960() {
                    CastlingMode::Chess960
                } else {
                    CastlingMode::Standard
                };
                (VariantPosition::new(variant.rules()), mode, None)
            }
            Some(fen) => {
                let invalid = |reason: String| BoardError::InvalidFen {
                    fen: fen.to_string(),
                    reason,
                };
                let setup = Fen::from_ascii(fen.as_bytes())
                    .map_err(|e| invalid(e.to_string()))?
                    .into_setup();
                let mode = if variant.is_chess960() {
                    CastlingMode::Chess960
                } else {
                    CastlingMode::detect(&setup)
                };
                let pos = VariantPosition::from_setup(variant.rules(), setup, mode)
                    .or_else(|e| e.ignore_invalid_castling_rights())
                    .or_else(|e| e.ignore_invalid_ep_square())
                    .map_err(|e| invalid(e.to_string()))?;
                let root_fen = (fen != STARTING_FEN).then(|| fen.to_string());
                (pos, mode, root_fen)
            }
        };

        Ok(Self {
            variant,
            castling_mode,
            root_fen,
            positions: vec![root],
            moves: Vec::new(),
            history: Vec::new(),
        })
    }

    pub fn variant(&self) -> GameVariant {
        self.variant
    }

    pub fn castling_mode(&self) -> CastlingMode {
        self.castling_mode
    }

    /// Custom starting FEN, `None` when the game started from the regular position.
    pub fn root_fen(&self) -> Option<&str> {
        self.root_fen.as_deref()
    }

    pub fn is_standard_start(&self) -> bool {
        self.root_fen.is_none() && !self.variant.is_chess960()
    }

    pub fn position(&self) -> &VariantPosition {
        self.positions.last().unwrap_or(&self.positions[0])
    }

    pub fn root_position(&self) -> &VariantPosition {
        &self.positions[0]
    }

    /// Position before the move at `ply` was played.
    pub fn position_at(&self, ply: usize) -> Option<&VariantPosition> {
        self.positions.get(ply)
    }

    pub fn ply(&self) -> usize {
        self.moves.len()
    }

    pub fn turn(&self) -> Color {
        self.position().turn()
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// UCI strings of the moves played so far, exactly as they were applied.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn last_move(&self) -> Option<Move> {
        self.moves.last().copied()
    }

    pub fn fen(&self) -> String {
        Fen::from_position(self.position(), EnPassantMode::Legal).to_string()
    }

    pub fn initial_fen(&self) -> String {
        Fen::from_position(self.root_position(), EnPassantMode::Legal).to_string()
    }

    pub fn piece_count(&self) -> usize {
        self.position().board().occupied().count()
    }

    pub fn has_castling_rights(&self) -> bool {
        !self.position().castles().is_empty()
    }

    pub fn is_game_over(&self) -> bool {
        self.position().is_game_over()
    }

    pub fn legal_moves(&self) -> Vec<Move> {
        self.position().legal_moves().into_iter().collect()
    }

    pub fn zobrist(&self) -> u64 {
        let hash: Zobrist64 = self.position().zobrist_hash(EnPassantMode::Legal);
        hash.0
    }

    /// Parses a UCI string and checks it is legal in the current position.
    pub fn parse_uci(&self, uci: &str) -> Result<Move, BoardError> {
        let invalid = || BoardError::InvalidMove {
            uci: uci.to_string(),
            ply: self.ply(),
        };
        let parsed = UciMove::from_ascii(uci.trim().as_bytes()).map_err(|_| invalid())?;
        parsed.to_move(self.position()).map_err(|_| invalid())
    }

    /// Accepts either UCI or SAN, as XBoard engines may answer with both.
    pub fn parse_move(&self, text: &str) -> Result<Move, BoardError> {
        if let Ok(m) = self.parse_uci(text) {
            return Ok(m);
        }
        San::from_ascii(text.trim().trim_end_matches(['+', '#']).as_bytes())
            .ok()
            .and_then(|san| san.to_move(self.position()).ok())
            .ok_or_else(|| BoardError::InvalidMove {
                uci: text.to_string(),
                ply: self.ply(),
            })
    }

    /// Renders a move in the notation the platform expects for this game.
    pub fn to_uci(&self, m: Move) -> String {
        m.to_uci(self.castling_mode).to_string()
    }

    pub fn san(&self, m: Move) -> String {
        San::from_move(self.position(), m).to_string()
    }

    /// SAN with check/mate suffixes for a sequence of moves from the current position.
    /// Stops at the first move that is not legal.
    pub fn san_line(&self, line: &[Move]) -> Vec<String> {
        let mut pos = self.position().clone();
        let mut out = Vec::with_capacity(line.len());
        for m in line {
            if !pos.is_legal(*m) {
                break;
            }
            out.push(SanPlus::from_move_and_play_unchecked(&mut pos, *m).to_string());
        }
        out
    }

    /// SAN of every move played so far, paired with its ply index.
    pub fn san_history(&self) -> Vec<String> {
        self.moves
            .iter()
            .zip(&self.positions)
            .map(|(m, pos)| SanPlus::from_move(pos.clone(), *m).to_string())
            .collect()
    }

    pub fn push_uci(&mut self, uci: &str) -> Result<Move, BoardError> {
        let m = self.parse_uci(uci)?;
        self.push_with_text(m, uci.trim().to_string());
        Ok(m)
    }

    /// Plays a move already known to be legal.
    pub fn push(&mut self, m: Move) -> Result<(), BoardError> {
        if !self.position().is_legal(m) {
            return Err(BoardError::InvalidMove {
                uci: self.to_uci(m),
                ply: self.ply(),
            });
        }
        let text = self.to_uci(m);
        self.push_with_text(m, text);
        Ok(())
    }

    fn push_with_text(&mut self, m: Move, text: String) {
        let mut next = self.position().clone();
        next.play_unchecked(m);
        self.positions.push(next);
        self.moves.push(m);
        self.history.push(text);
    }

    /// Whether two UCI strings name the same move at `ply`. The server may
    /// send castling as king-to-target or king-takes-rook.
    fn same_move_at(&self, ply: usize, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let Some(pos) = self.positions.get(ply) else {
            return false;
        };
        let parse = |uci: &str| {
            UciMove::from_ascii(uci.as_bytes())
                .ok()
                .and_then(|parsed| parsed.to_move(pos).ok())
        };
        matches!((parse(a), parse(b)), (Some(x), Some(y)) if x == y)
    }

    pub fn pop(&mut self) -> Option<Move> {
        let m = self.moves.pop()?;
        self.positions.pop();
        self.history.pop();
        Some(m)
    }

    /// Reconciles the board with the server's space separated move list.
    ///
    /// A server list that is a strict prefix of ours is a takeback. Any other
    /// divergence leaves the board untouched and returns `Diverged`.
    pub fn sync(&mut self, server_moves: &str) -> Result<SyncOutcome, BoardError> {
        let server: Vec<&str> = server_moves.split_whitespace().collect();

        if let Some(ply) = server
            .iter()
            .zip(&self.history)
            .enumerate()
            .position(|(ply, (s, local))| !self.same_move_at(ply, s, local))
        {
            return Err(BoardError::Diverged {
                ply,
                local: self.history[ply].clone(),
                server: server[ply].to_string(),
            });
        }

        if server.len() < self.history.len() {
            let popped = self.history.len() - server.len();
            for _ in 0..popped {
                self.pop();
            }
            return Ok(SyncOutcome::TakenBack(popped));
        }

        if server.len() == self.history.len() {
            return Ok(SyncOutcome::Unchanged);
        }

        // Apply on a scratch copy so a bad tail leaves us unchanged.
        let mut scratch = self.clone();
        for uci in &server[self.history.len()..] {
            scratch.push_uci(uci)?;
        }
        let added = server.len() - self.history.len();
        *self = scratch;
        Ok(SyncOutcome::Advanced(added))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startpos_sync_advances() {
        let mut board = GameBoard::new(GameVariant::Standard, None).unwrap();
        assert_eq!(board.sync("").unwrap(), SyncOutcome::Unchanged);
        assert_eq!(board.sync("e2e4 e7e5").unwrap(), SyncOutcome::Advanced(2));
        assert_eq!(board.ply(), 2);
        assert_eq!(board.turn(), Color::White);
        assert_eq!(board.sync("e2e4 e7e5").unwrap(), SyncOutcome::Unchanged);
    }

    #[test]
    fn test_takeback_pops_moves() {
        let mut board = GameBoard::new(GameVariant::Standard, None).unwrap();
        board.sync("e2e4 e7e5 g1f3").unwrap();
        assert_eq!(board.sync("e2e4").unwrap(), SyncOutcome::TakenBack(2));
        assert_eq!(board.history(), &["e2e4".to_string()]);
    }

    #[test]
    fn test_divergence_leaves_board_untouched() {
        let mut board = GameBoard::new(GameVariant::Standard, None).unwrap();
        board.sync("e2e4 e7e5").unwrap();
        let err = board.sync("d2d4 e7e5 g1f3").unwrap_err();
        assert!(matches!(err, BoardError::Diverged { ply: 0, .. }));
        assert_eq!(board.ply(), 2);
    }

    #[test]
    fn test_illegal_tail_is_transactional() {
        let mut board = GameBoard::new(GameVariant::Standard, None).unwrap();
        board.sync("e2e4").unwrap();
        let err = board.sync("e2e4 e7e5 e1e3").unwrap_err();
        assert!(matches!(err, BoardError::InvalidMove { .. }));
        assert_eq!(board.ply(), 1);
    }

    #[test]
    fn test_custom_fen() {
        let fen = "8/8/8/4k3/8/8/4P3/4K3 w - - 0 1";
        let board = GameBoard::new(GameVariant::FromPosition, Some(fen)).unwrap();
        assert_eq!(board.root_fen(), Some(fen));
        assert_eq!(board.piece_count(), 3);
        assert!(!board.has_castling_rights());
        assert!(!board.is_standard_start());
    }

    #[test]
    fn test_invalid_fen() {
        let err = GameBoard::new(GameVariant::FromPosition, Some("not a fen")).unwrap_err();
        assert!(matches!(err, BoardError::InvalidFen { .. }));
    }

    #[test]
    fn test_castling_notation_accepted_both_ways() {
        let mut board = GameBoard::new(GameVariant::Standard, None).unwrap();
        board.sync("e2e4 e7e5 g1f3 b8c6 f1c4 g8f6 e1g1").unwrap();
        assert_eq!(board.sync("e2e4 e7e5 g1f3 b8c6 f1c4 g8f6 e1h1").unwrap(), SyncOutcome::Unchanged);
    }

    #[test]
    fn test_chess960_castling_not_confused_with_e_file() {
        let fen = "4k3/8/8/8/8/8/8/4K1R1 w G - 0 1";
        let mut board = GameBoard::new(GameVariant::Chess960, Some(fen)).unwrap();
        board.sync("e1g1").unwrap();
        assert!(matches!(board.last_move(), Some(Move::Castle { .. })));
        let err = board.sync("e1h1").unwrap_err();
        assert!(matches!(err, BoardError::Diverged { ply: 0, .. }));
        assert_eq!(board.ply(), 1);
    }

    #[test]
    fn test_start_position_zobrist_is_polyglot() {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        assert_eq!(board.zobrist(), 0x463b96181691fc9c);
    }

    #[test]
    fn test_parse_move_accepts_san() {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let m = board.parse_move("Nf3").unwrap();
        assert_eq!(board.to_uci(m), "g1f3");
        assert!(board.parse_move("Nf6").is_err());
    }

    #[test]
    fn test_san_line() {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let e4 = board.parse_uci("e2e4").unwrap();
        assert_eq!(board.san(e4), "e4");
        let mut after = board.clone();
        after.push(e4).unwrap();
        let e5 = after.parse_uci("e7e5").unwrap();
        assert_eq!(board.san_line(&[e4, e5]), vec!["e4", "e5"]);
    }
}
