//! In-process move generators used instead of an engine subprocess.

use chess_core::GameBoard;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shakmaty::Move;

use crate::protocol::{PlayResult, SearchLimits};

/// A move source that runs inside the bot process.
pub trait Homemade: Send {
    fn name(&self) -> &str;

    /// Picks a move for the side to move. `root_moves`, when non-empty, restricts
    /// the choice.
    fn search(
        &mut self,
        board: &GameBoard,
        limits: &SearchLimits,
        draw_offered: bool,
        root_moves: &[Move],
    ) -> PlayResult;
}

pub const HOMEMADE_ENGINES: [&str; 3] = ["RandomMove", "Alphabetical", "FirstMove"];

/// Builds a homemade engine by its configured name.
pub fn homemade_by_name(name: &str) -> Option<Box<dyn Homemade>> {
    match name {
        "RandomMove" => Some(Box::new(RandomMove::new())),
        "Alphabetical" => Some(Box::new(Alphabetical)),
        "FirstMove" => Some(Box::new(FirstMove)),
        _ => None,
    }
}

fn candidates(board: &GameBoard, root_moves: &[Move]) -> Vec<Move> {
    if root_moves.is_empty() {
        board.legal_moves()
    } else {
        root_moves.to_vec()
    }
}

/// Plays a uniformly random legal move.
pub struct RandomMove {
    rng: StdRng,
}

impl RandomMove {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomMove {
    fn default() -> Self {
        Self::new()
    }
}

impl Homemade for RandomMove {
    fn name(&self) -> &str {
        "RandomMove"
    }

    fn search(&mut self, board: &GameBoard, _: &SearchLimits, _: bool, root_moves: &[Move]) -> PlayResult {
        PlayResult {
            best: candidates(board, root_moves).choose(&mut self.rng).copied(),
            ..Default::default()
        }
    }
}

/// Plays the move whose SAN sorts first.
pub struct Alphabetical;

impl Homemade for Alphabetical {
    fn name(&self) -> &str {
        "Alphabetical"
    }

    fn search(&mut self, board: &GameBoard, _: &SearchLimits, _: bool, root_moves: &[Move]) -> PlayResult {
        let best = candidates(board, root_moves)
            .into_iter()
            .min_by_key(|m| board.san(*m));
        PlayResult {
            best,
            ..Default::default()
        }
    }
}

/// Plays the move whose UCI string sorts first.
pub struct FirstMove;

impl Homemade for FirstMove {
    fn name(&self) -> &str {
        "FirstMove"
    }

    fn search(&mut self, board: &GameBoard, _: &SearchLimits, _: bool, root_moves: &[Move]) -> PlayResult {
        let best = candidates(board, root_moves)
            .into_iter()
            .min_by_key(|m| board.to_uci(*m));
        PlayResult {
            best,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_core::GameVariant;

    #[test]
    fn test_by_name() {
        for name in HOMEMADE_ENGINES {
            assert_eq!(homemade_by_name(name).unwrap().name(), name);
        }
        assert!(homemade_by_name("Stockfish").is_none());
    }

    #[test]
    fn test_first_move_and_alphabetical() {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let limits = SearchLimits::default();

        let m = FirstMove.search(&board, &limits, false, &[]).best.unwrap();
        assert_eq!(board.to_uci(m), "a2a3");

        let m = Alphabetical.search(&board, &limits, false, &[]).best.unwrap();
        assert_eq!(board.san(m), "Na3");
    }

    #[test]
    fn test_random_move_is_legal_and_respects_root_moves() {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let mut engine = RandomMove::with_seed(7);
        let limits = SearchLimits::default();
        for _ in 0..20 {
            let m = engine.search(&board, &limits, false, &[]).best.unwrap();
            assert!(board.legal_moves().contains(&m));
        }
        let only = board.parse_uci("g1f3").unwrap();
        assert_eq!(engine.search(&board, &limits, false, &[only]).best, Some(only));
    }

    #[test]
    fn test_no_moves_when_mated() {
        let board = GameBoard::new(
            GameVariant::FromPosition,
            Some("rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3"),
        )
        .unwrap();
        assert!(FirstMove.search(&board, &SearchLimits::default(), false, &[]).best.is_none());
    }
}
