//! Lichess opening explorer.

use std::cmp::Ordering;

use chess_core::shakmaty::Color;
use chess_core::GameBoard;
use engine_protocol::PlayResult;
use serde_json::Value;
use tracing::debug;

use super::{is_orthodox, legal_move, Fetcher};
use crate::config::{ExplorerSort, ExplorerSource, OpeningExplorerConfig};

pub const EXPLORER_URL: &str = "https://explorer.lichess.ovh";

pub(crate) async fn explorer_move(
    fetch: &Fetcher<'_>,
    board: &GameBoard,
    config: &OpeningExplorerConfig,
    username: &str,
) -> Option<PlayResult> {
    let fen = board.fen();
    let variant = board.variant().api_variant().to_string();
    let (path, params) = match config.source {
        ExplorerSource::Masters => {
            if !is_orthodox(board) {
                return None;
            }
            ("masters", vec![("fen", fen), ("moves", "100".to_string())])
        }
        ExplorerSource::Player => {
            let player = config.player_name.as_deref().unwrap_or(username);
            let color = if board.turn() == Color::White { "white" } else { "black" };
            (
                "player",
                vec![
                    ("player", player.to_string()),
                    ("fen", fen),
                    ("moves", "100".to_string()),
                    ("variant", variant),
                    ("recentGames", "0".to_string()),
                    ("color", color.to_string()),
                ],
            )
        }
        ExplorerSource::Lichess => (
            "lichess",
            vec![
                ("fen", fen),
                ("moves", "100".to_string()),
                ("variant", variant),
                ("topGames", "0".to_string()),
                ("recentGames", "0".to_string()),
            ],
        ),
    };
    let data = fetch.get(&format!("{EXPLORER_URL}/{path}"), &params).await?;
    let m = best_move(&data, board, config)?;
    legal_move(board, &m).map(PlayResult::from_move)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplorerMove {
    pub uci: String,
    pub games: u64,
    /// Score rate for the side to move, draws counting half.
    pub winrate: f64,
}

pub fn candidates(data: &Value, board: &GameBoard) -> Vec<ExplorerMove> {
    let white = board.turn() == Color::White;
    data["moves"]
        .as_array()
        .map(|moves| {
            moves
                .iter()
                .filter_map(|m| {
                    let w = m["white"].as_u64()?;
                    let d = m["draws"].as_u64()?;
                    let b = m["black"].as_u64()?;
                    let games = w + d + b;
                    if games == 0 {
                        return None;
                    }
                    let ours = if white { w } else { b };
                    Some(ExplorerMove {
                        uci: m["uci"].as_str()?.to_string(),
                        games,
                        winrate: (ours as f64 + d as f64 / 2.0) / games as f64,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The top move after the `min_games` filter and the configured sort.
pub fn best_move(data: &Value, board: &GameBoard, config: &OpeningExplorerConfig) -> Option<String> {
    let mut moves: Vec<ExplorerMove> = candidates(data, board)
        .into_iter()
        .filter(|m| m.games >= config.min_games)
        .collect();
    let by_rate = |a: &ExplorerMove, b: &ExplorerMove| {
        b.winrate.partial_cmp(&a.winrate).unwrap_or(Ordering::Equal)
    };
    match config.sort {
        ExplorerSort::Winrate => moves.sort_by(|a, b| by_rate(a, b).then(b.games.cmp(&a.games))),
        ExplorerSort::GamesPlayed => moves.sort_by(|a, b| b.games.cmp(&a.games).then(by_rate(a, b))),
    }
    let best = moves.into_iter().next()?;
    debug!(uci = %best.uci, games = best.games, winrate = best.winrate, "Explorer move");
    Some(best.uci)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_core::GameVariant;
    use serde_json::json;

    fn data() -> Value {
        json!({
            "white": 100, "draws": 50, "black": 80,
            "moves": [
                {"uci": "e2e4", "white": 50, "draws": 20, "black": 30},
                {"uci": "d2d4", "white": 30, "draws": 20, "black": 10},
                {"uci": "b2b4", "white": 5, "draws": 0, "black": 0}
            ]
        })
    }

    #[test]
    fn test_winrate_sort_respects_min_games() {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let config = OpeningExplorerConfig::default();
        // b2b4 wins every game but is below min_games
        assert_eq!(best_move(&data(), &board, &config).as_deref(), Some("d2d4"));
    }

    #[test]
    fn test_games_played_sort() {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let config = OpeningExplorerConfig {
            sort: ExplorerSort::GamesPlayed,
            ..OpeningExplorerConfig::default()
        };
        assert_eq!(best_move(&data(), &board, &config).as_deref(), Some("e2e4"));
    }

    #[test]
    fn test_winrate_from_black_side() {
        let mut board = GameBoard::new(GameVariant::Standard, None).unwrap();
        board.push_uci("e2e4").unwrap();
        let moves = candidates(&json!({"moves": [{"uci": "c7c5", "white": 2, "draws": 2, "black": 6}]}), &board);
        assert_eq!(moves[0].winrate, 0.7);
    }
}
