//! Online endgame tablebase lookups: the lichess tablebase API and chessdb.

use chess_core::GameBoard;
use serde_json::Value;
use tracing::debug;

use super::chessdb::CHESSDB_URL;
use super::{is_orthodox, legal_move, Fetcher, TablebaseVerdict, Wdl};
use crate::config::{EgtbSource, MoveQuality, OnlineEgtbConfig};

pub const LICHESS_TABLEBASE_URL: &str = "https://tablebase.lichess.ovh";

/// Most pieces the lichess tables cover for this variant.
pub fn lichess_piece_limit(board: &GameBoard) -> usize {
    if board.variant().is_standard_rules() {
        7
    } else {
        6
    }
}

/// WDL of a lichess category, from the point of view of the side it describes.
pub fn category_wdl(category: &str) -> Option<Wdl> {
    match category {
        "loss" | "syzygy-loss" => Some(-2),
        "maybe-loss" | "blessed-loss" => Some(-1),
        "draw" => Some(0),
        "cursed-win" | "maybe-win" => Some(1),
        "win" | "syzygy-win" => Some(2),
        _ => None,
    }
}

/// Piecewise WDL of a chessdb score.
pub fn chessdb_score_wdl(score: i64) -> Wdl {
    if score < -20000 {
        -2
    } else if score < 0 {
        -1
    } else if score == 0 {
        0
    } else if score <= 20000 {
        1
    } else {
        2
    }
}

pub(crate) async fn lookup(fetch: &Fetcher<'_>, board: &GameBoard, config: &OnlineEgtbConfig) -> Option<TablebaseVerdict> {
    match config.source {
        EgtbSource::Lichess => {
            if board.piece_count() > config.max_pieces.min(lichess_piece_limit(board)) {
                return None;
            }
            lichess_lookup(fetch, board).await
        }
        EgtbSource::Chessdb => {
            if !is_orthodox(board) || board.piece_count() > config.max_pieces.min(7) {
                return None;
            }
            chessdb_lookup(fetch, board, config.move_quality).await
        }
    }
}

async fn lichess_lookup(fetch: &Fetcher<'_>, board: &GameBoard) -> Option<TablebaseVerdict> {
    let path = board.variant().tablebase_path()?;
    let data = fetch.get(&format!("{LICHESS_TABLEBASE_URL}/{path}"), &[("fen", board.fen())]).await?;
    parse_lichess(&data, board)
}

/// Moves are listed best first; each category describes the position after
/// the move, so it is negated for the mover.
pub fn parse_lichess(data: &Value, board: &GameBoard) -> Option<TablebaseVerdict> {
    let moves = data["moves"].as_array()?;
    let scored: Vec<(&str, Wdl)> = moves
        .iter()
        .filter_map(|m| Some((m["uci"].as_str()?, -category_wdl(m["category"].as_str()?)?)))
        .collect();
    collect_best(board, scored)
}

async fn chessdb_lookup(fetch: &Fetcher<'_>, board: &GameBoard, quality: MoveQuality) -> Option<TablebaseVerdict> {
    let action = if quality == MoveQuality::Suggest { "queryall" } else { "querypv" };
    let params = [
        ("action", action.to_string()),
        ("board", board.fen()),
        ("json", "1".to_string()),
    ];
    let data = fetch.get(CHESSDB_URL, &params).await?;
    parse_chessdb(&data, board, quality)
}

pub fn parse_chessdb(data: &Value, board: &GameBoard, quality: MoveQuality) -> Option<TablebaseVerdict> {
    if data["status"].as_str() != Some("ok") {
        debug!(status = ?data["status"], "chessdb tablebase has no answer");
        return None;
    }
    if quality == MoveQuality::Suggest {
        let scored: Vec<(&str, Wdl)> = data["moves"]
            .as_array()?
            .iter()
            .filter_map(|m| Some((m["uci"].as_str()?, chessdb_score_wdl(m["score"].as_i64()?))))
            .collect();
        return collect_best(board, scored);
    }
    let uci = data["pv"].as_array()?.first()?.as_str()?;
    let wdl = chessdb_score_wdl(data["score"].as_i64()?);
    collect_best(board, vec![(uci, wdl)])
}

/// Keeps the legal moves that share the first move's WDL.
fn collect_best(board: &GameBoard, scored: Vec<(&str, Wdl)>) -> Option<TablebaseVerdict> {
    let &(_, wdl) = scored.first()?;
    let moves: Vec<_> = scored
        .into_iter()
        .filter(|(_, w)| *w == wdl)
        .filter_map(|(uci, _)| legal_move(board, uci))
        .collect();
    if moves.is_empty() {
        return None;
    }
    Some(TablebaseVerdict { wdl, moves })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_core::GameVariant;
    use serde_json::json;

    fn rook_ending() -> GameBoard {
        GameBoard::new(GameVariant::Standard, Some("6k1/8/6K1/8/8/8/8/R7 w - - 0 1")).unwrap()
    }

    #[test]
    fn test_chessdb_score_wdl() {
        assert_eq!(chessdb_score_wdl(-25000), -2);
        assert_eq!(chessdb_score_wdl(-3), -1);
        assert_eq!(chessdb_score_wdl(0), 0);
        assert_eq!(chessdb_score_wdl(20000), 1);
        assert_eq!(chessdb_score_wdl(20001), 2);
    }

    #[test]
    fn test_lichess_categories_negated_for_mover() {
        let data = json!({
            "category": "win",
            "moves": [
                {"uci": "a1a8", "category": "loss"},
                {"uci": "a1a7", "category": "loss"},
                {"uci": "a1a2", "category": "blessed-loss"},
                {"uci": "g6f6", "category": "draw"}
            ]
        });
        let verdict = parse_lichess(&data, &rook_ending()).unwrap();
        assert_eq!(verdict.wdl, 2);
        assert_eq!(verdict.moves.len(), 2);
    }

    #[test]
    fn test_unknown_category_is_skipped() {
        let data = json!({"moves": [{"uci": "a1a8", "category": "unknown"}]});
        assert!(parse_lichess(&data, &rook_ending()).is_none());
    }

    #[test]
    fn test_chessdb_best_and_suggest() {
        let board = rook_ending();
        let best = json!({"status": "ok", "score": 29990, "pv": ["a1a8"]});
        assert_eq!(parse_chessdb(&best, &board, MoveQuality::Best).unwrap().wdl, 2);

        let all = json!({"status": "ok", "moves": [
            {"uci": "a1a8", "score": 30000},
            {"uci": "a1a7", "score": 29990},
            {"uci": "g6f6", "score": 0}
        ]});
        let verdict = parse_chessdb(&all, &board, MoveQuality::Suggest).unwrap();
        assert_eq!(verdict.moves.len(), 2);
        assert!(parse_chessdb(&json!({"status": "unknown"}), &board, MoveQuality::Best).is_none());
    }

    #[test]
    fn test_piece_limit_by_variant() {
        assert_eq!(lichess_piece_limit(&rook_ending()), 7);
        let atomic = GameBoard::new(GameVariant::Atomic, None).unwrap();
        assert_eq!(lichess_piece_limit(&atomic), 6);
    }
}
