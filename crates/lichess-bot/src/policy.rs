//! Resign and draw decisions from the scores of our recent moves.

use engine_protocol::Score;

use crate::config::DrawOrResignConfig;

/// Scores of our moves from our side, oldest first. `None` is a move played
/// without an evaluation, which never counts toward either threshold.
#[derive(Debug, Clone)]
pub struct DrawResignPolicy {
    config: DrawOrResignConfig,
    scores: Vec<Option<Score>>,
}

impl DrawResignPolicy {
    pub fn new(config: DrawOrResignConfig) -> Self {
        Self {
            config,
            scores: Vec::new(),
        }
    }

    pub fn record(&mut self, score: Option<Score>) {
        self.scores.push(score);
    }

    /// Forgets the latest score, when one of our moves is taken back.
    pub fn undo(&mut self) {
        self.scores.pop();
    }

    pub fn scores(&self) -> &[Option<Score>] {
        &self.scores
    }

    fn last_all(&self, count: u32, pred: impl Fn(i32) -> bool) -> bool {
        let count = count as usize;
        if count == 0 || self.scores.len() < count {
            return false;
        }
        self.scores[self.scores.len() - count..]
            .iter()
            .all(|s| s.is_some_and(|s| pred(s.to_cp())))
    }

    pub fn should_resign(&self) -> bool {
        let threshold = self.config.resign_score;
        self.config.resign_enabled && self.last_all(self.config.resign_moves, |cp| cp <= threshold)
    }

    /// Whether to offer, or accept, a draw with `pieces` left on the board.
    pub fn should_offer_draw(&self, pieces: usize) -> bool {
        let range = self.config.offer_draw_score;
        self.config.offer_draw_enabled
            && pieces <= self.config.offer_draw_pieces
            && self.last_all(self.config.offer_draw_moves, |cp| cp.abs() <= range)
    }
}
