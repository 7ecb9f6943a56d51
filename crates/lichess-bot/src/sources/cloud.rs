//! Lichess cloud evaluations.

use chess_core::shakmaty::Color;
use chess_core::GameBoard;
use engine_protocol::{PlayResult, Score, SearchInfo};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use super::{legal_move, parse_pv, Fetcher};
use crate::config::{CloudAnalysisConfig, MoveQuality};

pub const CLOUD_EVAL_URL: &str = "https://lichess.org/api/cloud-eval";

pub(crate) async fn cloud_move<R: Rng + ?Sized>(
    fetch: &Fetcher<'_>,
    board: &GameBoard,
    config: &CloudAnalysisConfig,
    rng: &mut R,
) -> Option<PlayResult> {
    let multi_pv = if config.move_quality == MoveQuality::Best { 1 } else { 5 };
    let params = [
        ("fen", board.fen()),
        ("multiPv", multi_pv.to_string()),
        ("variant", board.variant().api_variant().to_string()),
    ];
    let data = fetch.get(CLOUD_EVAL_URL, &params).await?;
    choose(&data, board, config, rng)
}

/// A principal variation with its score from White's point of view.
struct Line<'a> {
    score: Score,
    moves: Vec<&'a str>,
}

fn white_score(pv: &Value) -> Option<Score> {
    if let Some(cp) = pv["cp"].as_i64() {
        Some(Score::Cp(cp as i32))
    } else {
        pv["mate"].as_i64().map(|n| Score::Mate(n as i32))
    }
}

fn negate(score: Score) -> Score {
    match score {
        Score::Cp(cp) => Score::Cp(-cp),
        Score::Mate(n) => Score::Mate(-n),
    }
}

/// Picks a line from a cloud evaluation. `best` takes the first line, `good`
/// picks randomly among lines within `max_score_difference` of it.
pub fn choose<R: Rng + ?Sized>(
    data: &Value,
    board: &GameBoard,
    config: &CloudAnalysisConfig,
    rng: &mut R,
) -> Option<PlayResult> {
    if data.get("error").is_some() {
        debug!(error = ?data["error"], "No cloud evaluation");
        return None;
    }
    let depth = data["depth"].as_u64()? as u32;
    let knodes = data["knodes"].as_u64()?;
    if depth < config.min_depth || knodes < config.min_knodes {
        debug!(depth, knodes, "Cloud evaluation too shallow");
        return None;
    }

    let lines: Vec<Line<'_>> = data["pvs"]
        .as_array()?
        .iter()
        .filter_map(|pv| {
            Some(Line {
                score: white_score(pv)?,
                moves: pv["moves"].as_str()?.split_whitespace().collect(),
            })
        })
        .filter(|line| !line.moves.is_empty())
        .collect();
    let best = lines.first()?;

    let white = board.turn() == Color::White;
    let chosen = if config.move_quality == MoveQuality::Best {
        best
    } else {
        let best_cp = best.score.to_cp();
        let diff = config.max_score_difference;
        let good: Vec<&Line<'_>> = lines
            .iter()
            .filter(|line| {
                let cp = line.score.to_cp();
                if white {
                    cp >= best_cp - diff
                } else {
                    cp <= best_cp + diff
                }
            })
            .collect();
        good.choose(rng).copied().unwrap_or(best)
    };

    let m = legal_move(board, chosen.moves[0])?;
    let score = if white { chosen.score } else { negate(chosen.score) };
    Some(PlayResult {
        best: Some(m),
        info: SearchInfo {
            depth: Some(depth),
            nodes: Some(knodes * 1000),
            score: Some(score),
            pv: parse_pv(board, &chosen.moves),
            ..SearchInfo::default()
        },
        ..PlayResult::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_core::GameVariant;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn eval() -> Value {
        json!({
            "fen": "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1",
            "knodes": 50000,
            "depth": 40,
            "pvs": [
                {"moves": "c7c5 g1f3", "cp": 25},
                {"moves": "e7e5 g1f3", "cp": 30},
                {"moves": "a7a6 d2d4", "cp": 120}
            ]
        })
    }

    fn after_e4() -> GameBoard {
        let mut board = GameBoard::new(GameVariant::Standard, None).unwrap();
        board.push_uci("e2e4").unwrap();
        board
    }

    #[test]
    fn test_best_line_scored_for_mover() {
        let config = CloudAnalysisConfig::default();
        let result = choose(&eval(), &after_e4(), &config, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(result.info.score, Some(Score::Cp(-25)));
        assert_eq!(result.info.nodes, Some(50_000_000));
        assert_eq!(result.info.pv, ["c7c5", "g1f3"]);
    }

    #[test]
    fn test_good_never_picks_lines_outside_margin() {
        let config = CloudAnalysisConfig {
            move_quality: MoveQuality::Good,
            max_score_difference: 10,
            ..CloudAnalysisConfig::default()
        };
        let board = after_e4();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let result = choose(&eval(), &board, &config, &mut rng).unwrap();
            let uci = board.to_uci(result.best.unwrap());
            assert!(uci == "c7c5" || uci == "e7e5", "picked {uci}");
        }
    }

    #[test]
    fn test_depth_gate_and_error() {
        let config = CloudAnalysisConfig {
            min_depth: 50,
            ..CloudAnalysisConfig::default()
        };
        let board = after_e4();
        assert!(choose(&eval(), &board, &config, &mut StdRng::seed_from_u64(1)).is_none());
        let missing = json!({"error": "Not found"});
        assert!(choose(&missing, &board, &CloudAnalysisConfig::default(), &mut StdRng::seed_from_u64(1)).is_none());
    }
}
