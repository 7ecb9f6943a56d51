//! chessdb.cn opening book queries.

use chess_core::GameBoard;
use engine_protocol::{PlayResult, Score, SearchInfo};
use serde_json::Value;
use tracing::debug;

use super::{is_orthodox, legal_move, parse_pv, Fetcher};
use crate::config::{ChessDbBookConfig, MoveQuality};

pub const CHESSDB_URL: &str = "https://www.chessdb.cn/cdb.php";

pub(crate) fn action(quality: MoveQuality) -> &'static str {
    match quality {
        MoveQuality::Best => "querypv",
        MoveQuality::Good => "querybest",
        MoveQuality::All | MoveQuality::Suggest => "query",
    }
}

pub(crate) async fn book_move(
    fetch: &Fetcher<'_>,
    board: &GameBoard,
    config: &ChessDbBookConfig,
) -> Option<PlayResult> {
    if !is_orthodox(board) {
        return None;
    }
    let params = [
        ("action", action(config.move_quality).to_string()),
        ("board", board.fen()),
        ("json", "1".to_string()),
    ];
    let data = fetch.get(CHESSDB_URL, &params).await?;
    parse_book(&data, board, config)
}

/// Interprets a chessdb answer. Only `querypv` answers carry depth and score.
pub fn parse_book(data: &Value, board: &GameBoard, config: &ChessDbBookConfig) -> Option<PlayResult> {
    if data["status"].as_str() != Some("ok") {
        debug!(status = ?data["status"], "chessdb has no move");
        return None;
    }
    if config.move_quality != MoveQuality::Best {
        let m = legal_move(board, data["move"].as_str()?)?;
        return Some(PlayResult::from_move(m));
    }

    let depth = data["depth"].as_u64()? as u32;
    if depth < config.min_depth {
        debug!(depth, min_depth = config.min_depth, "chessdb line too shallow");
        return None;
    }
    let line: Vec<&str> = data["pv"].as_array()?.iter().filter_map(Value::as_str).collect();
    let m = legal_move(board, line.first()?)?;
    let score = data["score"].as_i64().map(|cp| Score::Cp(cp as i32));
    Some(PlayResult {
        best: Some(m),
        info: SearchInfo {
            depth: Some(depth),
            score,
            pv: parse_pv(board, &line),
            ..SearchInfo::default()
        },
        ..PlayResult::default()
    })
}
