//! A whole game through the public session entry point.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chess_core::shakmaty::{Move, Role, Square};
use chess_core::GameBoard;
use engine_protocol::{EngineError, Homemade, PlayResult, SearchLimits};
use lichess_bot::engines::{EngineFactory, Player};
use lichess_bot::model::Game;
use lichess_bot::{run_session, BotError, SessionOutcome};
use tokio_util::sync::CancellationToken;

use common::{config, context, context_with_engines, full, state, FakePlatform};

#[tokio::test]
async fn test_full_game_greets_and_saves_pgn() {
    let dir = std::env::temp_dir().join(format!("session-test-{}", std::process::id()));
    let platform = Arc::new(FakePlatform::default());
    platform.push_game_stream(
        "g1",
        vec![
            full("g1", "", true),
            state("a2a3", "started", None),
            state("a2a3 e7e5", "started", None),
            state("a2a3 e7e5 a1a2", "resign", Some("white")),
        ],
    );
    let mut config = config();
    config.greeting.hello = "Good luck {opponent}".into();
    config.greeting.goodbye = "Thanks for the game".into();
    config.pgn_directory = Some(dir.clone());
    let ctx = context(platform.clone(), config);
    assert!(ctx.registry.try_admit("g1"));

    let report = run_session(ctx.clone(), "g1".into(), CancellationToken::new()).await;

    assert!(matches!(report.outcome, SessionOutcome::GameOver));
    assert!(!report.unfinished_correspondence());
    assert_eq!(platform.calls_starting("move"), ["move g1 a2a3", "move g1 a1a2"]);
    assert_eq!(
        platform.calls_starting("chat"),
        ["chat g1 player Good luck Alice", "chat g1 player Thanks for the game"]
    );
    assert!(ctx.registry.is_empty());

    let pgn = std::fs::read_to_string(dir.join("Bot vs Alice - g1.pgn")).unwrap();
    assert!(pgn.contains("[Result \"1-0\"]"));
    assert!(pgn.contains("1. a3 e5 2. Ra2"));
    std::fs::remove_dir_all(&dir).unwrap();
}

/// Always answers 1. e2-e5, which is never legal.
struct Cheater;

impl Homemade for Cheater {
    fn name(&self) -> &str {
        "Cheater"
    }

    fn search(&mut self, _board: &GameBoard, _limits: &SearchLimits, _draw: bool, _root: &[Move]) -> PlayResult {
        PlayResult::from_move(Move::Normal {
            role: Role::Pawn,
            from: Square::E2,
            capture: None,
            to: Square::E5,
            promotion: None,
        })
    }
}

struct CheaterFactory;

#[async_trait]
impl EngineFactory for CheaterFactory {
    async fn create(&self, _game: &Game, _cancel: CancellationToken) -> Result<Player, EngineError> {
        Ok(Player::homemade(Box::new(Cheater)))
    }
}

#[tokio::test]
async fn test_illegal_engine_move_ends_only_that_game() {
    let platform = Arc::new(FakePlatform::default());
    platform.push_game_stream("g1", vec![full("g1", "", true)]);
    let mut config = config();
    config.challenge.concurrency = 2;
    let ctx = context_with_engines(platform.clone(), config, Arc::new(CheaterFactory));
    assert!(ctx.registry.try_admit("g1"));
    assert!(ctx.registry.try_admit("other"));

    let report = run_session(ctx.clone(), "g1".into(), CancellationToken::new()).await;

    assert!(matches!(
        report.outcome,
        SessionOutcome::Failed(BotError::Engine(EngineError::IllegalMove(ref uci))) if uci == "e2e5"
    ));
    assert!(platform.calls_starting("move").is_empty());
    assert_eq!(platform.calls_starting("abort"), ["abort g1"]);
    assert_eq!(ctx.registry.game_ids(), ["other"]);
}

#[tokio::test]
async fn test_cancelled_before_game_full() {
    let platform = Arc::new(FakePlatform::default());
    platform.push_game_stream("g1", Vec::new());
    let ctx = context(platform.clone(), config());
    assert!(ctx.registry.try_admit("g1"));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = run_session(ctx.clone(), "g1".into(), cancel).await;

    assert!(matches!(report.outcome, SessionOutcome::Cancelled));
    assert!(ctx.registry.is_empty());
}
