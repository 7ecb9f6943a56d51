//! Move sources consulted before the engine: opening books, online databases
//! and tablebases. Sources are tried in a fixed order and the first accepted
//! move wins. Every failure degrades to the next source.

pub mod book;
pub mod chessdb;
pub mod cloud;
pub mod egtb;
pub mod explorer;
pub mod syzygy;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chess_core::polyglot::PolyglotBook;
use chess_core::shakmaty::Move;
use chess_core::GameBoard;
use engine_protocol::{PlayResult, Score, SearchInfo};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clients::Platform;
use crate::config::{DrawOrResignConfig, EngineConfig, MoveQuality, OnlineMovesConfig, PolyglotConfig};
use crate::error::{BotError, Result};

pub use syzygy::{load_tablebases, SyzygyTables, Tablebases};

/// Timeout of a single request to an online source.
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opening books keyed by variant, loaded once and shared by every session.
pub type Books = Arc<BTreeMap<String, Vec<PolyglotBook>>>;

pub fn load_books(config: &PolyglotConfig) -> Result<Books> {
    let mut books = BTreeMap::new();
    if config.enabled {
        for (variant, paths) in &config.book {
            let mut loaded = Vec::with_capacity(paths.len());
            for path in paths {
                let book = PolyglotBook::open(path).map_err(|e| {
                    BotError::Config(format!("cannot read book {}: {e}", path.display()))
                })?;
                info!(path = %path.display(), entries = book.len(), "Loaded opening book");
                loaded.push(book);
            }
            books.insert(variant.to_lowercase(), loaded);
        }
    }
    Ok(Arc::new(books))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveSource {
    Book,
    ChessDb,
    CloudAnalysis,
    OpeningExplorer,
    LocalTablebase,
    OnlineTablebase,
    Engine,
}

impl fmt::Display for MoveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MoveSource::Book => "Opening book",
            MoveSource::ChessDb => "ChessDB",
            MoveSource::CloudAnalysis => "Lichess cloud analysis",
            MoveSource::OpeningExplorer => "Lichess opening explorer",
            MoveSource::LocalTablebase => "Local tablebase",
            MoveSource::OnlineTablebase => "Online tablebase",
            MoveSource::Engine => "Engine",
        })
    }
}

/// A move chosen without the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMove {
    pub source: MoveSource,
    pub result: PlayResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Play(SourceMove),
    /// Equally good tablebase moves; the engine picks among them.
    Suggest { source: MoveSource, moves: Vec<Move> },
    /// Nothing found, ask the engine.
    Engine,
}

/// Win/draw/loss from the mover's point of view, -2..=2.
pub type Wdl = i8;

/// Synthetic centipawn score of a tablebase result.
pub fn wdl_to_cp(wdl: Wdl) -> i32 {
    match wdl {
        2 => 9900,
        1 => 500,
        0 => 0,
        -1 => -500,
        _ => -9900,
    }
}

/// Outcome of a tablebase lookup: the best WDL and every move achieving it, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct TablebaseVerdict {
    pub wdl: Wdl,
    pub moves: Vec<Move>,
}

/// Orthodox chess from the standard setup rules, which is all some databases know.
pub(crate) fn is_orthodox(board: &GameBoard) -> bool {
    board.variant().is_standard_rules() && !board.variant().is_chess960()
}

/// Resolves a UCI string from an online source, rejecting illegal suggestions.
pub(crate) fn legal_move(board: &GameBoard, uci: &str) -> Option<Move> {
    match board.parse_uci(uci) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(uci, fen = %board.fen(), error = %e, "Ignoring illegal move from online source");
            None
        }
    }
}

/// Parses a space-separated UCI line, stopping at the first illegal move.
pub(crate) fn parse_pv(board: &GameBoard, line: &[&str]) -> Vec<String> {
    let mut scratch = board.clone();
    let mut pv = Vec::new();
    for uci in line {
        if scratch.push_uci(uci).is_err() {
            break;
        }
        pv.push((*uci).to_string());
    }
    pv
}

/// GETs JSON with bounded retries. Every error is logged and swallowed.
pub(crate) struct Fetcher<'a> {
    platform: &'a dyn Platform,
    attempts: u32,
}

impl<'a> Fetcher<'a> {
    pub fn new(platform: &'a dyn Platform, max_retries: u32) -> Self {
        Self {
            platform,
            attempts: max_retries.max(1),
        }
    }

    pub async fn get(&self, url: &str, params: &[(&str, String)]) -> Option<Value> {
        for attempt in 1..=self.attempts {
            match self.platform.online_json(url, params, ONLINE_TIMEOUT).await {
                Ok(value) => return Some(value),
                Err(e) => debug!(url, attempt, error = %e, "Online source request failed"),
            }
        }
        warn!(url, attempts = self.attempts, "Giving up on online source");
        None
    }
}

/// Per-game resolver. Holds the count of consecutive positions in which no
/// online opening source had a move.
pub struct MoveResolver {
    platform: Arc<dyn Platform>,
    books: Books,
    tablebases: Tablebases,
    polyglot: PolyglotConfig,
    online: OnlineMovesConfig,
    draw_or_resign: DrawOrResignConfig,
    username: String,
    rng: StdRng,
    out_of_book: u32,
}

impl MoveResolver {
    pub fn new(
        platform: Arc<dyn Platform>,
        books: Books,
        tablebases: Tablebases,
        config: &EngineConfig,
        username: &str,
    ) -> Self {
        Self {
            platform,
            books,
            tablebases,
            polyglot: config.polyglot.clone(),
            online: config.online_moves.clone(),
            draw_or_resign: config.draw_or_resign.clone(),
            username: username.to_string(),
            rng: StdRng::from_entropy(),
            out_of_book: 0,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn out_of_book_moves(&self) -> u32 {
        self.out_of_book
    }

    /// Tries every enabled source in priority order.
    pub async fn resolve(&mut self, board: &GameBoard, time_left: Duration) -> Resolution {
        if let Some(m) = self.book_move(board) {
            return Resolution::Play(SourceMove {
                source: MoveSource::Book,
                result: PlayResult::from_move(m),
            });
        }
        if let Some(found) = self.opening_move(board, time_left).await {
            return Resolution::Play(found);
        }
        if let Some(resolution) = self.local_tablebase_move(board).await {
            return resolution;
        }
        if let Some(resolution) = self.online_tablebase_move(board, time_left).await {
            return resolution;
        }
        Resolution::Engine
    }

    fn book_move(&mut self, board: &GameBoard) -> Option<Move> {
        if !self.polyglot.enabled || !within_depth(board.ply(), self.polyglot.max_depth) {
            return None;
        }
        let books = self.books.get(board.variant().book_key())?;
        for book in books {
            if let Some(m) = book::choose(book, board, &self.polyglot, &mut self.rng) {
                info!(uci = %board.to_uci(m), "Got move from opening book");
                return Some(m);
            }
        }
        None
    }

    async fn opening_move(&mut self, board: &GameBoard, time_left: Duration) -> Option<SourceMove> {
        if !within_depth(board.ply(), self.online.max_depth)
            || self.out_of_book >= self.online.max_out_of_book_moves
        {
            return None;
        }
        let fetch = Fetcher::new(self.platform.as_ref(), self.online.max_retries);

        let chessdb = &self.online.chessdb_book;
        let mut found = None;
        if chessdb.enabled && time_left >= Duration::from_secs(chessdb.min_time) {
            found = chessdb::book_move(&fetch, board, chessdb)
                .await
                .map(|result| (MoveSource::ChessDb, result));
        }
        let cloud = &self.online.lichess_cloud_analysis;
        if found.is_none() && cloud.enabled && time_left >= Duration::from_secs(cloud.min_time) {
            found = cloud::cloud_move(&fetch, board, cloud, &mut self.rng)
                .await
                .map(|result| (MoveSource::CloudAnalysis, result));
        }
        let explorer = &self.online.lichess_opening_explorer;
        if found.is_none() && explorer.enabled && time_left >= Duration::from_secs(explorer.min_time) {
            found = explorer::explorer_move(&fetch, board, explorer, &self.username)
                .await
                .map(|result| (MoveSource::OpeningExplorer, result));
        }

        match found {
            Some((source, result)) => {
                self.out_of_book = 0;
                info!(%source, uci = ?result.best.map(|m| board.to_uci(m)), "Got move from online source");
                Some(SourceMove { source, result })
            }
            None => {
                self.out_of_book += 1;
                let used = chessdb.enabled || cloud.enabled || explorer.enabled;
                if used && self.out_of_book == self.online.max_out_of_book_moves {
                    info!("Will stop using online opening books for this game");
                }
                None
            }
        }
    }

    async fn local_tablebase_move(&self, board: &GameBoard) -> Option<Resolution> {
        if !self.tablebases.covers(board) {
            return None;
        }
        let tables = self.tablebases.clone();
        let position = board.clone();
        let verdict = match tokio::task::spawn_blocking(move || tables.lookup(&position)).await {
            Ok(verdict) => verdict?,
            Err(e) => {
                warn!(error = %e, "Tablebase lookup did not finish");
                return None;
            }
        };
        let quality = self.tablebases.move_quality();
        self.tablebase_resolution(board, verdict, quality, MoveSource::LocalTablebase)
    }

    async fn online_tablebase_move(&mut self, board: &GameBoard, time_left: Duration) -> Option<Resolution> {
        let config = &self.online.online_egtb;
        if !config.enabled
            || time_left < Duration::from_secs(config.min_time)
            || board.has_castling_rights()
        {
            return None;
        }
        let fetch = Fetcher::new(self.platform.as_ref(), self.online.max_retries);
        let verdict = egtb::lookup(&fetch, board, config).await?;
        self.tablebase_resolution(board, verdict, config.move_quality, MoveSource::OnlineTablebase)
    }

    fn tablebase_resolution(
        &self,
        board: &GameBoard,
        verdict: TablebaseVerdict,
        quality: MoveQuality,
        source: MoveSource,
    ) -> Option<Resolution> {
        let TablebaseVerdict { wdl, mut moves } = verdict;
        if moves.is_empty() {
            return None;
        }
        if quality == MoveQuality::Suggest && moves.len() > 1 {
            info!(%source, wdl, count = moves.len(), "Suggesting tablebase moves to the engine");
            return Some(Resolution::Suggest { source, moves });
        }
        let best = moves.swap_remove(0);
        info!(%source, wdl, uci = %board.to_uci(best), "Got move from tablebase");
        let policy = &self.draw_or_resign;
        Some(Resolution::Play(SourceMove {
            source,
            result: PlayResult {
                best: Some(best),
                ponder: None,
                info: SearchInfo {
                    score: Some(Score::Cp(wdl_to_cp(wdl))),
                    ..SearchInfo::default()
                },
                resigned: policy.resign_enabled && policy.resign_for_egtb_minus_two && wdl == -2,
                draw_offered: policy.offer_draw_enabled && policy.offer_draw_for_egtb_zero && wdl == 0,
            },
        }))
    }
}

/// Whether `ply` is within the first `max_depth` moves of each side.
fn within_depth(ply: usize, max_depth: u32) -> bool {
    (ply as u64) < u64::from(max_depth) * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::test_support::FakePlatform;
    use chess_core::GameVariant;
    use serde_json::json;

    fn engine_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.online_moves.max_out_of_book_moves = 2;
        config.online_moves.chessdb_book.enabled = true;
        config.online_moves.chessdb_book.min_time = 0;
        config
    }

    fn resolver(platform: Arc<FakePlatform>, config: &EngineConfig) -> MoveResolver {
        MoveResolver::new(platform, Arc::new(BTreeMap::new()), Tablebases::default(), config, "bot")
            .with_rng(StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_within_depth() {
        assert!(within_depth(0, 1));
        assert!(within_depth(1, 1));
        assert!(!within_depth(2, 1));
        assert!(within_depth(usize::MAX / 4, u32::MAX));
    }

    #[test]
    fn test_wdl_to_cp() {
        assert_eq!(wdl_to_cp(2), 9900);
        assert_eq!(wdl_to_cp(-1), -500);
        assert_eq!(wdl_to_cp(-2), -9900);
    }

    #[tokio::test]
    async fn test_chessdb_move_is_played() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_json(json!({"status": "ok", "move": "e2e4"}));
        let mut resolver = resolver(platform, &engine_config());
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();

        match resolver.resolve(&board, Duration::from_secs(60)).await {
            Resolution::Play(found) => {
                assert_eq!(found.source, MoveSource::ChessDb);
                assert_eq!(board.to_uci(found.result.best.unwrap()), "e2e4");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(resolver.out_of_book_moves(), 0);
    }

    #[tokio::test]
    async fn test_out_of_book_counter_stops_online_lookups() {
        let platform = Arc::new(FakePlatform::default());
        let mut resolver = resolver(platform.clone(), &engine_config());
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();

        for _ in 0..3 {
            assert_eq!(resolver.resolve(&board, Duration::from_secs(60)).await, Resolution::Engine);
        }
        assert_eq!(resolver.out_of_book_moves(), 2);
        // max(1, max_retries) attempts per miss, none after the cap
        assert_eq!(platform.online_requests().len(), 4);
    }

    #[tokio::test]
    async fn test_min_time_skips_source() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_json(json!({"status": "ok", "move": "e2e4"}));
        let mut config = engine_config();
        config.online_moves.chessdb_book.min_time = 30;
        let mut resolver = resolver(platform.clone(), &config);
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();

        assert_eq!(resolver.resolve(&board, Duration::from_secs(10)).await, Resolution::Engine);
        assert!(platform.online_requests().is_empty());
    }

    #[tokio::test]
    async fn test_tablebase_loss_resigns_when_configured() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_json(json!({
            "category": "loss",
            "moves": [{"uci": "a1b1", "category": "win"}]
        }));
        let mut config = EngineConfig::default();
        config.online_moves.online_egtb.enabled = true;
        config.online_moves.online_egtb.min_time = 0;
        config.draw_or_resign.resign_enabled = true;
        let mut resolver = resolver(platform, &config);
        let board = GameBoard::new(GameVariant::Standard, Some("4k3/8/8/8/8/8/7q/K7 w - - 0 1")).unwrap();

        match resolver.resolve(&board, Duration::from_secs(60)).await {
            Resolution::Play(found) => {
                assert_eq!(found.source, MoveSource::OnlineTablebase);
                assert!(found.result.resigned);
                assert!(!found.result.draw_offered);
                assert_eq!(found.result.info.score, Some(Score::Cp(-9900)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tablebase_suggest_returns_equal_moves() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_json(json!({
            "category": "win",
            "moves": [
                {"uci": "a1a7", "category": "loss"},
                {"uci": "a1a8", "category": "loss"},
                {"uci": "a1b1", "category": "draw"}
            ]
        }));
        let mut config = EngineConfig::default();
        config.online_moves.online_egtb.enabled = true;
        config.online_moves.online_egtb.min_time = 0;
        config.online_moves.online_egtb.move_quality = MoveQuality::Suggest;
        let mut resolver = resolver(platform, &config);
        let board = GameBoard::new(GameVariant::Standard, Some("6k1/8/6K1/8/8/8/8/R7 w - - 0 1")).unwrap();

        match resolver.resolve(&board, Duration::from_secs(60)).await {
            Resolution::Suggest { source, moves } => {
                assert_eq!(source, MoveSource::OnlineTablebase);
                let ucis: Vec<_> = moves.iter().map(|m| board.to_uci(*m)).collect();
                assert_eq!(ucis, ["a1a7", "a1a8"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
