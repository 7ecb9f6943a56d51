//! Move selection from a local Polyglot book.

use chess_core::polyglot::PolyglotBook;
use chess_core::shakmaty::Move;
use chess_core::GameBoard;
use rand::distributions::WeightedIndex;
use rand::prelude::*;

use crate::config::{BookSelection, PolyglotConfig};

pub fn choose<R: Rng + ?Sized>(
    book: &PolyglotBook,
    board: &GameBoard,
    config: &PolyglotConfig,
    rng: &mut R,
) -> Option<Move> {
    let entries = book.moves(board);
    match config.selection {
        BookSelection::WeightedRandom => {
            let dist = WeightedIndex::new(entries.iter().map(|(_, w)| u32::from(*w))).ok()?;
            Some(entries[dist.sample(rng)].0)
        }
        BookSelection::UniformRandom => entries
            .iter()
            .filter(|(_, w)| *w >= config.min_weight)
            .collect::<Vec<_>>()
            .choose(rng)
            .map(|(m, _)| *m),
        BookSelection::BestMove => entries
            .iter()
            .filter(|(_, w)| *w >= config.min_weight)
            .max_by_key(|(_, w)| *w)
            .map(|(m, _)| *m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_core::GameVariant;
    use rand::rngs::StdRng;

    fn entry(key: u64, from: u16, to: u16, weight: u16) -> Vec<u8> {
        let mut out = key.to_be_bytes().to_vec();
        out.extend_from_slice(&((from << 6) | to).to_be_bytes());
        out.extend_from_slice(&weight.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out
    }

    fn start_book() -> (GameBoard, PolyglotBook) {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let key = board.zobrist();
        // e2e4 (12 -> 28) weight 10, d2d4 (11 -> 27) weight 1
        let mut data = entry(key, 12, 28, 10);
        data.extend(entry(key, 11, 27, 1));
        (board, PolyglotBook::from_bytes(data))
    }

    #[test]
    fn test_best_move_takes_highest_weight() {
        let (board, book) = start_book();
        let config = PolyglotConfig {
            selection: BookSelection::BestMove,
            ..PolyglotConfig::default()
        };
        let m = choose(&book, &board, &config, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(board.to_uci(m), "e2e4");
    }

    #[test]
    fn test_min_weight_filters_uniform_choice() {
        let (board, book) = start_book();
        let config = PolyglotConfig {
            selection: BookSelection::UniformRandom,
            min_weight: 5,
            ..PolyglotConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            let m = choose(&book, &board, &config, &mut rng).unwrap();
            assert_eq!(board.to_uci(m), "e2e4");
        }
    }

    #[test]
    fn test_no_entries_for_position() {
        let (mut board, book) = start_book();
        board.push_uci("g1f3").unwrap();
        let config = PolyglotConfig::default();
        assert!(choose(&book, &board, &config, &mut StdRng::seed_from_u64(1)).is_none());
    }
}
