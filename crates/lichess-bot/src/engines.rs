//! Creating the move maker of a game: an engine subprocess or a homemade
//! in-process routine.

use async_trait::async_trait;
use chess_core::shakmaty::Move;
use chess_core::GameBoard;
use engine_protocol::{
    homemade_by_name, Engine, EngineError, EngineState, Homemade, OpponentInfo, PlayResult,
    SearchLimits, UciEngine, UciSettings, XBoardEngine, XBoardSettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{EngineConfig, EngineProtocol};
use crate::model::Game;

/// Whatever produces our moves when no other source has one.
pub enum Player {
    Engine(Box<dyn Engine>),
    Homemade(HomemadePlayer),
}

/// An in-process engine. It is handed to a blocking thread for each search.
pub struct HomemadePlayer {
    name: String,
    engine: Option<Box<dyn Homemade>>,
}

impl HomemadePlayer {
    async fn search(
        &mut self,
        board: &GameBoard,
        limits: &SearchLimits,
        draw_offered: bool,
    ) -> Result<PlayResult, EngineError> {
        let mut engine = self.engine.take().ok_or(EngineError::Exited)?;
        let board = board.clone();
        let limits = limits.clone();
        let (engine, result) = tokio::task::spawn_blocking(move || {
            let result = engine.search(&board, &limits, draw_offered, &limits.root_moves);
            (engine, result)
        })
        .await
        .map_err(|e| EngineError::Protocol(format!("{} search failed: {e}", self.name)))?;
        self.engine = Some(engine);
        Ok(result)
    }
}

impl Player {
    pub fn homemade(engine: Box<dyn Homemade>) -> Self {
        Player::Homemade(HomemadePlayer {
            name: engine.name().to_string(),
            engine: Some(engine),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Player::Engine(engine) => engine.name(),
            Player::Homemade(homemade) => &homemade.name,
        }
    }

    pub async fn play(
        &mut self,
        board: &GameBoard,
        limits: &SearchLimits,
        draw_offered: bool,
    ) -> Result<PlayResult, EngineError> {
        match self {
            Player::Engine(engine) => engine.play(board, limits, draw_offered).await,
            Player::Homemade(homemade) => homemade.search(board, limits, draw_offered).await,
        }
    }

    /// Keeps the engine searching on the expected reply. `board` includes our move.
    pub async fn ponder(&mut self, board: &GameBoard, expected: Move, limits: &SearchLimits) -> Result<(), EngineError> {
        match self {
            Player::Engine(engine) => engine.ponder(board, expected, limits).await,
            Player::Homemade(_) => Ok(()),
        }
    }

    /// Ends a ponder search before a move is taken from another source.
    pub async fn stop_pondering(&mut self) -> Result<(), EngineError> {
        match self {
            Player::Engine(engine) if engine.state() == EngineState::Pondering => engine.stop().await,
            _ => Ok(()),
        }
    }

    pub async fn send_result(&mut self, result: &str, reason: &str) -> Result<(), EngineError> {
        match self {
            Player::Engine(engine) => engine.send_result(result, reason).await,
            Player::Homemade(_) => Ok(()),
        }
    }

    pub async fn quit(&mut self) {
        if let Player::Engine(engine) = self {
            engine.quit().await;
        }
    }
}

/// Builds a fresh, initialized move maker for every game.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, game: &Game, cancel: CancellationToken) -> Result<Player, EngineError>;
}

/// The factory described by the `[engine]` section.
pub struct ConfiguredEngines {
    config: EngineConfig,
    correspondence_ponder: bool,
}

impl ConfiguredEngines {
    pub fn new(config: EngineConfig, correspondence_ponder: bool) -> Self {
        Self {
            config,
            correspondence_ponder,
        }
    }

    fn can_ponder(&self, game: &Game) -> bool {
        if game.is_correspondence() {
            self.correspondence_ponder
        } else {
            self.config.ponder
        }
    }
}

fn opponent_info(game: &Game) -> OpponentInfo {
    let opponent = game.opponent();
    OpponentInfo {
        name: opponent.display_name(),
        title: opponent.title.clone(),
        rating: opponent.rating,
        is_bot: opponent.is_bot(),
    }
}

#[async_trait]
impl EngineFactory for ConfiguredEngines {
    async fn create(&self, game: &Game, cancel: CancellationToken) -> Result<Player, EngineError> {
        let config = &self.config;
        let engine: Box<dyn Engine> = match config.protocol {
            EngineProtocol::Homemade => {
                let homemade = homemade_by_name(&config.name)
                    .ok_or_else(|| EngineError::Config(format!("unknown homemade engine {}", config.name)))?;
                info!(game_id = %game.id, engine = homemade.name(), "Using homemade engine");
                return Ok(Player::homemade(homemade));
            }
            EngineProtocol::Uci => {
                let settings = UciSettings {
                    options: config.uci_options.clone(),
                    ponder: self.can_ponder(game),
                    handshake_timeout: config.handshake_timeout(),
                    response_grace: config.response_grace(),
                    max_search_time: config.max_search_time(),
                    variant: game.variant,
                };
                Box::new(UciEngine::spawn(&config.command(), settings, cancel)?)
            }
            EngineProtocol::Xboard => {
                let settings = XBoardSettings {
                    options: config.xboard_options.clone(),
                    ponder: self.can_ponder(game),
                    handshake_timeout: config.handshake_timeout(),
                    response_grace: config.response_grace(),
                    max_search_time: config.max_search_time(),
                    variant: game.variant,
                };
                Box::new(XBoardEngine::spawn(&config.command(), settings, cancel)?)
            }
        };
        prepare(engine, game).await
    }
}

/// Handshake and opponent details. An engine that fails either is shut down
/// before the error is returned.
async fn prepare(mut engine: Box<dyn Engine>, game: &Game) -> Result<Player, EngineError> {
    let ready = match engine.initialize().await {
        Ok(()) => engine.send_opponent(&opponent_info(game), game.me().rating).await,
        Err(e) => Err(e),
    };
    if let Err(e) = ready {
        engine.quit().await;
        return Err(e);
    }
    debug!(game_id = %game.id, engine = engine.name(), "Engine ready");
    Ok(Player::Engine(engine))
}
