//! One game from `gameFull` to game over: keeps the board in step with the
//! server, moves on our turns and answers chat, draw and takeback requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chess_core::pgn::MoveComment;
use chess_core::shakmaty::{Color, Move, Position};
use chess_core::{BoardError, GameBoard, SyncOutcome};
use engine_protocol::{EngineError, PlayResult, Score, SearchLimits};
use futures::StreamExt;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::{GameStream, Platform};
use crate::config::Config;
use crate::conversation::{greeting, pv_moves, ChallengeQueueView, ChatContext, Conversation, MoveStats};
use crate::engines::{EngineFactory, Player};
use crate::error::{BotError, Result};
use crate::model::{ChatLine, Game, GameEvent, GameState, Termination};
use crate::pgn_record::{build_pgn, PgnRecorder};
use crate::policy::DrawResignPolicy;
use crate::registry::{SessionRegistry, SessionStatus};
use crate::sources::{Books, MoveResolver, MoveSource, Resolution, Tablebases};
use crate::timing::TimeManager;

/// Abort window: no abort attempts once both sides made three moves.
const ABORT_PLIES: usize = 6;
/// Abort time granted by the `!wait` chat command.
const WAIT_COMMAND_TIME: Duration = Duration::from_secs(60);
/// Slack beyond the mover's clock before a realtime game counts as dead.
const TERMINATE_GRACE: Duration = Duration::from_secs(60);
const MAX_RECONNECTS: u32 = 10;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Accepted takebacks per game id, kept for the lifetime of the process.
pub type TakebackCounts = Arc<Mutex<HashMap<String, u32>>>;

/// Everything a session borrows from the controller.
#[derive(Clone)]
pub struct SessionContext {
    pub platform: Arc<dyn Platform>,
    pub config: Arc<Config>,
    pub engines: Arc<dyn EngineFactory>,
    pub books: Books,
    pub tablebases: Tablebases,
    pub username: String,
    pub challenge_queue: ChallengeQueueView,
    pub takebacks: TakebackCounts,
    pub registry: SessionRegistry,
}

#[derive(Debug)]
pub enum SessionOutcome {
    GameOver,
    Aborted,
    /// Left a correspondence game while waiting for the opponent.
    Disconnected,
    /// Left a realtime game in which nobody moved for too long.
    Inactive,
    Cancelled,
    Failed(BotError),
}

#[derive(Debug)]
pub struct SessionReport {
    pub game_id: String,
    pub outcome: SessionOutcome,
    pub correspondence: bool,
}

impl SessionReport {
    /// A correspondence game that should go back to the check-in queue.
    pub fn unfinished_correspondence(&self) -> bool {
        self.correspondence && matches!(self.outcome, SessionOutcome::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    AwaitingOurMove,
    AwaitingOpponentMove,
    GameOver,
}

enum Flow {
    Continue,
    End(SessionOutcome),
}

enum Wake {
    Event(Option<GameEvent>),
    Lost(Option<BotError>),
    Deadline,
    Cancelled,
}

/// A move sent to the server and not yet echoed back in a state update.
struct PendingMove {
    ply: usize,
    mv: Move,
    comment: Option<MoveComment>,
}

/// Frees the registry slot on every exit path of the session task.
struct Slot {
    registry: SessionRegistry,
    game_id: String,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.registry.remove(&self.game_id);
    }
}

/// Plays one game to its end. Never returns an error: failures end only this
/// game and are reported in the outcome.
pub async fn run_session(ctx: SessionContext, game_id: String, cancel: CancellationToken) -> SessionReport {
    let _slot = Slot {
        registry: ctx.registry.clone(),
        game_id: game_id.clone(),
    };
    let mut correspondence = false;
    let outcome = match GameSession::setup(&ctx, &game_id, &cancel).await {
        Ok((mut session, stream)) => {
            correspondence = session.game.is_correspondence();
            let outcome = session.run(stream).await;
            session.finish(&outcome).await;
            outcome
        }
        Err(_) if cancel.is_cancelled() => SessionOutcome::Cancelled,
        Err(e) => {
            error!(game_id = %game_id, error = %e, "Could not start game session");
            SessionOutcome::Failed(e)
        }
    };
    info!(game_id = %game_id, ?outcome, "Game session ended");
    SessionReport {
        game_id,
        outcome,
        correspondence,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct GameSession<'a> {
    ctx: &'a SessionContext,
    cancel: CancellationToken,
    game: Game,
    board: GameBoard,
    player: Player,
    resolver: MoveResolver,
    policy: DrawResignPolicy,
    timing: TimeManager,
    conversation: Conversation,
    phase: Phase,
    /// Annotations by ply, parallel to the board's move list.
    comments: Vec<Option<MoveComment>>,
    stats: Option<MoveStats>,
    pending: Option<PendingMove>,
    state_received: Instant,
    abort_time: Duration,
    abort_at: Option<Instant>,
    terminate_at: Option<Instant>,
    corr_disconnect: Duration,
    disconnect_at: Option<Instant>,
    resigned: bool,
    takeback_answered: Option<usize>,
}

impl<'a> GameSession<'a> {
    async fn setup(
        ctx: &'a SessionContext,
        game_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(GameSession<'a>, GameStream)> {
        let mut stream = ctx.platform.stream_game(game_id).await?;
        let full = loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(BotError::StreamClosed),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(Some(GameEvent::GameFull(full)))) => break full,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => return Err(BotError::StreamClosed),
            }
        };

        let game = Game::new(*full, &ctx.username, &ctx.config.url);
        let mut board = GameBoard::new(game.variant, game.initial_fen.as_deref())?;
        board.sync(&game.state.moves)?;

        let player = match ctx.engines.create(&game, cancel.child_token()).await {
            Ok(player) => player,
            Err(e) => {
                if game.is_abortable() {
                    if let Err(err) = ctx.platform.abort(&game.id).await {
                        warn!(game_id, error = %err, "Could not abort game after engine failure");
                    }
                }
                return Err(e.into());
            }
        };

        let config = &ctx.config;
        let corr_disconnect = if game.is_correspondence() && board.ply() > 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(config.correspondence.disconnect_time)
        };
        info!(
            game_id,
            url = %game.url(),
            opponent = %game.opponent().label(),
            variant = game.variant.name(),
            time_control = %game.time_control(),
            engine = player.name(),
            "Game started"
        );

        let mut session = GameSession {
            ctx,
            cancel: cancel.clone(),
            resolver: MoveResolver::new(
                ctx.platform.clone(),
                ctx.books.clone(),
                ctx.tablebases.clone(),
                &config.engine,
                &ctx.username,
            ),
            policy: DrawResignPolicy::new(config.engine.draw_or_resign.clone()),
            timing: TimeManager::from_config(config),
            conversation: Conversation::new(game_id, &ctx.username, player.name(), ctx.challenge_queue.clone()),
            phase: Phase::Setup,
            comments: vec![None; board.ply()],
            stats: None,
            pending: None,
            state_received: Instant::now(),
            abort_time: config.abort_time(),
            abort_at: None,
            terminate_at: None,
            corr_disconnect,
            disconnect_at: None,
            resigned: false,
            takeback_answered: None,
            game,
            board,
            player,
        };
        ctx.registry.set_status(game_id, SessionStatus::Active);
        if session.board.ply() < 2 {
            let greetings = &config.greeting;
            session.greet(&greetings.hello, &greetings.hello_spectators).await;
        }
        Ok((session, stream))
    }

    async fn run(&mut self, mut stream: GameStream) -> SessionOutcome {
        let initial = self.game.state.clone();
        let mut next = self.handle_state(initial).await;
        loop {
            match next {
                Ok(Flow::Continue) => {}
                Ok(Flow::End(outcome)) => return outcome,
                Err(e) => return self.fail(e).await,
            }

            let deadline = self.next_deadline();
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                item = stream.next() => match item {
                    Some(Ok(event)) => Wake::Event(event),
                    Some(Err(e)) => Wake::Lost(Some(e)),
                    None => Wake::Lost(None),
                },
                _ = sleep_until_deadline(deadline) => Wake::Deadline,
            };

            next = match wake {
                Wake::Cancelled => return SessionOutcome::Cancelled,
                Wake::Event(event) => self.dispatch(event).await,
                Wake::Deadline => self.on_deadline().await,
                Wake::Lost(error) => {
                    match error {
                        Some(e) => warn!(game_id = %self.game.id, error = %e, "Game stream failed"),
                        None => debug!(game_id = %self.game.id, "Game stream ended"),
                    }
                    self.reconnect(&mut stream).await
                }
            };
        }
    }

    async fn dispatch(&mut self, event: Option<GameEvent>) -> Result<Flow> {
        match event {
            None => self.on_tick().await,
            Some(GameEvent::GameFull(full)) => {
                self.game = Game::new(*full, &self.ctx.username, &self.ctx.config.url);
                let state = self.game.state.clone();
                self.handle_state(state).await
            }
            Some(GameEvent::GameState(state)) => self.handle_state(state).await,
            Some(GameEvent::ChatLine(line)) => {
                self.handle_chat(&line).await;
                Ok(Flow::Continue)
            }
            Some(GameEvent::OpponentGone {
                gone,
                claim_win_in_seconds,
            }) => {
                info!(game_id = %self.game.id, gone, ?claim_win_in_seconds, "Opponent presence changed");
                Ok(Flow::Continue)
            }
            Some(GameEvent::Unknown) => Ok(Flow::Continue),
        }
    }

    fn is_my_turn(&self) -> bool {
        (self.board.turn() == Color::White) == self.game.is_white
    }

    fn is_our_ply(&self, ply: usize) -> bool {
        let root_white = self.board.root_position().turn() == Color::White;
        ((ply % 2 == 0) == root_white) == self.game.is_white
    }

    async fn handle_state(&mut self, state: GameState) -> Result<Flow> {
        self.state_received = Instant::now();
        self.game.state = state;

        let before = self.board.ply();
        match self.board.sync(&self.game.state.moves)? {
            SyncOutcome::Advanced(added) => self.confirm_moves(before, added)?,
            SyncOutcome::TakenBack(popped) => self.undo_moves(popped),
            SyncOutcome::Unchanged => {}
        }

        if self.game.state.is_over() {
            self.phase = Phase::GameOver;
            let outcome = if self.game.termination() == Termination::Aborted {
                SessionOutcome::Aborted
            } else {
                SessionOutcome::GameOver
            };
            return Ok(Flow::End(outcome));
        }

        self.arm_timers();
        if self.answer_takeback().await {
            return Ok(Flow::Continue);
        }

        if self.is_my_turn() {
            self.phase = Phase::AwaitingOurMove;
            if self.pending.as_ref().is_some_and(|p| p.ply == self.board.ply()) {
                debug!(game_id = %self.game.id, ply = self.board.ply(), "Move already sent for this position");
                return Ok(Flow::Continue);
            }
            self.take_turn().await
        } else {
            self.phase = Phase::AwaitingOpponentMove;
            Ok(Flow::Continue)
        }
    }

    /// Checks the server's echo of our pending move and records annotations
    /// for the new plies.
    fn confirm_moves(&mut self, before: usize, added: usize) -> Result<()> {
        let mut ours = None;
        if let Some(pending) = self.pending.take() {
            if pending.ply >= before + added {
                self.pending = Some(pending);
            } else if pending.ply >= before {
                let played = self.board.moves()[pending.ply];
                if played != pending.mv {
                    return Err(BotError::Desync(BoardError::Diverged {
                        ply: pending.ply,
                        local: self.board.to_uci(pending.mv),
                        server: self.board.to_uci(played),
                    }));
                }
                ours = Some((pending.ply, pending.comment));
            }
        }
        for ply in before..before + added {
            let comment = match &mut ours {
                Some((at, comment)) if *at == ply => comment.take(),
                _ => None,
            };
            self.comments.push(comment);
        }
        debug!(game_id = %self.game.id, ply = self.board.ply(), phase = ?self.phase, "Board advanced");
        Ok(())
    }

    fn undo_moves(&mut self, popped: usize) {
        let ply = self.board.ply();
        for undone in ply..ply + popped {
            if self.is_our_ply(undone) {
                self.policy.undo();
            }
        }
        self.comments.truncate(ply);
        if self.pending.as_ref().is_some_and(|p| p.ply >= ply) {
            self.pending = None;
        }
        info!(game_id = %self.game.id, popped, ply, "Moves taken back");
    }

    fn arm_timers(&mut self) {
        let now = self.state_received;
        let waiting = !self.is_my_turn();

        self.abort_at = (waiting && self.board.ply() < ABORT_PLIES).then(|| now + self.abort_time);

        self.terminate_at = (!self.game.is_correspondence()).then(|| {
            let clock = self.game.state.clock();
            let (time, increment) = if self.board.turn() == Color::White {
                (clock.wtime, clock.winc)
            } else {
                (clock.btime, clock.binc)
            };
            now + time + increment + TERMINATE_GRACE
        });

        self.disconnect_at = (self.game.is_correspondence() && waiting).then(|| now + self.corr_disconnect);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.abort_at, self.terminate_at, self.disconnect_at]
            .into_iter()
            .flatten()
            .min()
    }

    async fn on_deadline(&mut self) -> Result<Flow> {
        let now = Instant::now();
        let game_id = self.game.id.clone();

        if self.abort_at.is_some_and(|t| t <= now) {
            self.abort_at = None;
            info!(game_id = %game_id, ply = self.board.ply(), "Opponent did not move, aborting");
            match self.ctx.platform.abort(&game_id).await {
                Ok(()) => return Ok(Flow::End(SessionOutcome::Aborted)),
                Err(e) => warn!(game_id = %game_id, error = %e, "Abort rejected, staying in the game"),
            }
        }

        if self.terminate_at.is_some_and(|t| t <= now) {
            self.terminate_at = None;
            warn!(game_id = %game_id, "No activity for longer than the clock allows, leaving the game");
            if self.game.is_abortable() {
                if let Err(e) = self.ctx.platform.abort(&game_id).await {
                    warn!(game_id = %game_id, error = %e, "Could not abort inactive game");
                }
            }
            return Ok(Flow::End(SessionOutcome::Inactive));
        }

        if self.disconnect_at.is_some_and(|t| t <= now) {
            info!(game_id = %game_id, "Waiting for the opponent, disconnecting from correspondence game");
            return Ok(Flow::End(SessionOutcome::Disconnected));
        }
        Ok(Flow::Continue)
    }

    /// Keep-alive: retries our move if the last submission failed.
    async fn on_tick(&mut self) -> Result<Flow> {
        if self.phase == Phase::AwaitingOurMove && self.pending.is_none() && !self.resigned {
            return self.take_turn().await;
        }
        Ok(Flow::Continue)
    }

    async fn reconnect(&mut self, stream: &mut GameStream) -> Result<Flow> {
        let game_id = self.game.id.clone();
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=MAX_RECONNECTS {
            match self.ctx.platform.ongoing_games().await {
                Ok(games) if !games.iter().any(|g| g.game_id == game_id) => {
                    info!(game_id = %game_id, "Game is no longer ongoing");
                    return Ok(Flow::End(SessionOutcome::GameOver));
                }
                Ok(_) => match self.ctx.platform.stream_game(&game_id).await {
                    Ok(fresh) => {
                        info!(game_id = %game_id, attempt, "Reconnected to game stream");
                        *stream = fresh;
                        return Ok(Flow::Continue);
                    }
                    Err(e) => warn!(game_id = %game_id, attempt, error = %e, "Could not reopen game stream"),
                },
                Err(e) => warn!(game_id = %game_id, attempt, error = %e, "Could not list ongoing games"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Flow::End(SessionOutcome::Cancelled)),
                _ = sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
        Err(BotError::StreamClosed)
    }

    async fn pause(&mut self, until: Instant) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep_until(until) => {}
        }
    }

    fn search_limits(&self) -> SearchLimits {
        let config = &self.ctx.config;
        let correspondence = self.game.is_correspondence();
        let can_ponder = if correspondence {
            config.correspondence.ponder
        } else {
            config.engine.ponder
        };
        self.timing.limits(
            self.board.ply(),
            self.board.turn() == Color::White,
            &self.game.state.clock(),
            correspondence,
            self.state_received.elapsed(),
            can_ponder,
        )
    }

    async fn search(&mut self, limits: &SearchLimits) -> Result<PlayResult> {
        let opponent_offers_draw = if self.game.is_white {
            self.game.state.bdraw
        } else {
            self.game.state.wdraw
        };
        Ok(self.player.play(&self.board, limits, opponent_offers_draw).await?)
    }

    async fn take_turn(&mut self) -> Result<Flow> {
        if self.board.is_game_over() {
            return Ok(Flow::Continue);
        }
        if self.policy.should_resign() {
            return self.resign().await;
        }

        let game_id = self.game.id.clone();
        let ply = self.board.ply();
        let time_left = self.game.my_remaining_time();
        let (source, result, limits) = match self.resolver.resolve(&self.board, time_left).await {
            Resolution::Play(found) => {
                self.player.stop_pondering().await?;
                (found.source, found.result, None)
            }
            Resolution::Suggest { source, moves } => {
                debug!(game_id = %game_id, %source, count = moves.len(), "Engine chooses among tablebase moves");
                let mut limits = self.search_limits();
                limits.root_moves = moves;
                let result = self.search(&limits).await?;
                (MoveSource::Engine, result, Some(limits))
            }
            Resolution::Engine => {
                let limits = self.search_limits();
                let result = self.search(&limits).await?;
                (MoveSource::Engine, result, Some(limits))
            }
        };

        if result.resigned {
            return self.resign().await;
        }
        let Some(best) = result.best else {
            warn!(game_id = %game_id, ply, "No move to play");
            return Ok(Flow::Continue);
        };
        if !self.board.legal_moves().contains(&best) {
            return Err(EngineError::IllegalMove(self.board.to_uci(best)).into());
        }

        self.policy.record(result.info.score);
        let offer_draw = result.draw_offered || self.policy.should_offer_draw(self.board.piece_count());
        let comment = self.comment(best, &result);
        self.stats = Some(MoveStats::new(source, result.info.clone(), &self.board));

        let fake = self.timing.fake_think_time(ply, self.game.my_remaining_time());
        if !fake.is_zero() {
            self.pause(self.state_received + fake).await;
        }

        let uci = self.board.to_uci(best);
        info!(game_id = %game_id, ply, uci = %uci, %source, score = ?result.info.score, offer_draw, "Playing move");
        if let Err(e) = self.ctx.platform.make_move(&game_id, &uci, offer_draw).await {
            warn!(game_id = %game_id, uci = %uci, error = %e, "Move not accepted, will retry");
            self.policy.undo();
            return Ok(Flow::Continue);
        }
        self.pending = Some(PendingMove { ply, mv: best, comment });
        if self.game.is_correspondence() {
            self.corr_disconnect = Duration::from_secs(self.ctx.config.correspondence.disconnect_time);
            self.disconnect_at = Some(Instant::now() + self.corr_disconnect);
        }

        let delay = self.timing.rate_limiting_delay();
        if !delay.is_zero() {
            self.pause(Instant::now() + delay).await;
        }

        if let (Some(limits), Some(expected)) = (limits, result.ponder) {
            let mut after = self.board.clone();
            after.push(best)?;
            self.player.ponder(&after, expected, &limits).await?;
        }
        Ok(Flow::Continue)
    }

    fn comment(&self, best: Move, result: &PlayResult) -> Option<MoveComment> {
        let (cp, mate) = match result.info.score {
            Some(Score::Cp(cp)) => (Some(cp), None),
            Some(Score::Mate(n)) => (None, Some(n)),
            None => (None, None),
        };
        let eval = MoveComment::format_eval(cp, mate, self.board.turn());
        let mut pv = pv_moves(&self.board, &result.info.pv);
        if pv.first() != Some(&best) {
            pv = vec![best];
        }
        if eval.is_none() && pv.len() < 2 {
            return None;
        }
        Some(MoveComment {
            eval,
            depth: result.info.depth,
            pv,
        })
    }

    async fn resign(&mut self) -> Result<Flow> {
        let game_id = self.game.id.clone();
        info!(game_id = %game_id, scores = ?self.policy.scores(), "Resigning");
        self.player.stop_pondering().await?;
        match self.ctx.platform.resign(&game_id).await {
            Ok(()) => self.resigned = true,
            Err(e) => warn!(game_id = %game_id, error = %e, "Resignation not accepted"),
        }
        Ok(Flow::Continue)
    }

    /// Answers an opponent's takeback request once. Returns whether it was accepted.
    async fn answer_takeback(&mut self) -> bool {
        let requested = if self.game.is_white {
            self.game.state.btakeback
        } else {
            self.game.state.wtakeback
        };
        if !requested {
            self.takeback_answered = None;
            return false;
        }
        if self.takeback_answered == Some(self.board.ply()) {
            return false;
        }
        self.takeback_answered = Some(self.board.ply());

        let max = self.ctx.config.max_takebacks_accepted;
        let accept = {
            let mut counts = self.ctx.takebacks.lock().unwrap_or_else(PoisonError::into_inner);
            let count = counts.entry(self.game.id.clone()).or_insert(0);
            if *count < max {
                *count += 1;
                true
            } else {
                false
            }
        };
        info!(game_id = %self.game.id, accept, "Answering takeback request");
        if let Err(e) = self.ctx.platform.answer_takeback(&self.game.id, accept).await {
            warn!(game_id = %self.game.id, error = %e, "Could not answer takeback");
        }
        accept
    }

    async fn handle_chat(&mut self, line: &ChatLine) {
        let context = ChatContext {
            abortable: self.game.is_abortable(),
            stats: self.stats.as_ref(),
        };
        let Some(response) = self.conversation.react(line, &context) else {
            return;
        };
        if response.wait {
            self.abort_time = self.abort_time.max(WAIT_COMMAND_TIME);
            if self.abort_at.is_some() {
                self.abort_at = Some(Instant::now() + self.abort_time);
            }
        }
        self.send_chat(&response.room, &response.text).await;
    }

    async fn send_chat(&mut self, room: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.platform.chat(&self.game.id, room, text).await {
            warn!(game_id = %self.game.id, room, error = %e, "Could not send chat message");
        }
    }

    async fn greet(&mut self, to_player: &str, to_spectators: &str) {
        let opponent = self.game.opponent().display_name();
        let me = self.ctx.username.clone();
        for (room, template) in [("player", to_player), ("spectator", to_spectators)] {
            if !template.is_empty() {
                self.send_chat(room, &greeting(template, &me, &opponent)).await;
            }
        }
    }

    async fn fail(&mut self, e: BotError) -> SessionOutcome {
        if self.cancel.is_cancelled() && matches!(e, BotError::Engine(EngineError::Cancelled)) {
            return SessionOutcome::Cancelled;
        }
        error!(game_id = %self.game.id, error = %e, "Game session failed");
        if e.is_fatal_for_session() && self.game.is_abortable() {
            if let Err(err) = self.ctx.platform.abort(&self.game.id).await {
                warn!(game_id = %self.game.id, error = %err, "Could not abort failed game");
            }
        }
        SessionOutcome::Failed(e)
    }

    /// Releases the engine and writes the PGN.
    async fn finish(&mut self, outcome: &SessionOutcome) {
        self.ctx.registry.set_status(&self.game.id, SessionStatus::Ending);
        if matches!(outcome, SessionOutcome::GameOver | SessionOutcome::Aborted) {
            let ctx = self.ctx;
            let greetings = &ctx.config.greeting;
            self.greet(&greetings.goodbye, &greetings.goodbye_spectators).await;
            let result = self.game.result();
            let reason = self.game.result_reason();
            info!(game_id = %self.game.id, result, reason = %reason, "Game over");
            if let Err(e) = self.player.send_result(result, &reason).await {
                debug!(game_id = %self.game.id, error = %e, "Could not send result to engine");
            }
        }
        self.player.quit().await;
        self.save_pgn().await;
        self.ctx.registry.set_status(&self.game.id, SessionStatus::Closed);
    }

    async fn save_pgn(&mut self) {
        let Some(dir) = self.ctx.config.pgn_directory.as_ref() else {
            return;
        };
        let exported = match self.ctx.platform.game_pgn(&self.game.id).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(game_id = %self.game.id, error = %e, "Could not download PGN, using local data");
                None
            }
        };
        let pgn = build_pgn(&self.game, &self.board, &self.comments, exported.as_deref());
        let recorder = PgnRecorder::new(dir, self.ctx.config.pgn_file_grouping);
        if let Err(e) = recorder.save(&self.game, &pgn).await {
            warn!(game_id = %self.game.id, error = %e, "Could not save PGN");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::test_support::FakePlatform;
    use crate::config::{DrawOrResignConfig, EngineProtocol};
    use crate::engines::ConfiguredEngines;
    use async_trait::async_trait;
    use engine_protocol::{Homemade, SearchInfo};

    fn config() -> Config {
        let mut config = Config::default();
        config.engine.protocol = EngineProtocol::Homemade;
        config.engine.name = "FirstMove".into();
        config
    }

    fn context(platform: Arc<FakePlatform>, config: Config) -> SessionContext {
        let registry = SessionRegistry::new(config.max_games());
        assert!(registry.try_admit("g1"));
        SessionContext {
            platform,
            engines: Arc::new(ConfiguredEngines::new(config.engine.clone(), false)),
            config: Arc::new(config),
            books: Books::default(),
            tablebases: Tablebases::default(),
            username: "Bot".into(),
            challenge_queue: ChallengeQueueView::default(),
            takebacks: TakebackCounts::default(),
            registry,
        }
    }

    fn full(moves: &str, we_are_white: bool) -> GameEvent {
        let (white, black) = if we_are_white { ("Bot", "Alice") } else { ("Alice", "Bot") };
        let json = format!(
            r#"{{"type":"gameFull","id":"g1","variant":{{"key":"standard"}},"speed":"blitz",
            "perf":{{"name":"Blitz"}},"clock":{{"initial":180000,"increment":0}},
            "white":{{"name":"{white}"}},"black":{{"name":"{black}"}},
            "state":{{"type":"gameState","moves":"{moves}","wtime":180000,"btime":180000,
            "winc":0,"binc":0,"status":"started"}}}}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    fn state(moves: &str) -> GameState {
        GameState {
            moves: moves.into(),
            wtime: 180_000,
            btime: 180_000,
            status: "started".into(),
            ..GameState::default()
        }
    }

    fn update(moves: &str) -> GameEvent {
        GameEvent::GameState(state(moves))
    }

    fn finished(moves: &str, status: &str, winner: &str) -> GameEvent {
        GameEvent::GameState(GameState {
            status: status.into(),
            winner: Some(winner.into()),
            ..state(moves)
        })
    }

    #[tokio::test]
    async fn test_duplicate_states_send_one_move() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_game_stream(
            "g1",
            vec![
                full("", true),
                update(""),
                update("a2a3"),
                update("a2a3"),
                update("a2a3 e7e5"),
                finished("a2a3 e7e5 a1a2", "resign", "white"),
            ],
        );
        let ctx = context(platform.clone(), config());
        let report = run_session(ctx.clone(), "g1".into(), CancellationToken::new()).await;

        assert!(matches!(report.outcome, SessionOutcome::GameOver));
        assert_eq!(platform.calls_starting("move"), ["move g1 a2a3", "move g1 a1a2"]);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_server_replacing_our_move_is_desync() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_game_stream("g1", vec![full("", true), update("e2e4")]);
        let report = run_session(context(platform.clone(), config()), "g1".into(), CancellationToken::new()).await;

        assert!(matches!(report.outcome, SessionOutcome::Failed(BotError::Desync(_))));
        assert_eq!(platform.calls_starting("move"), ["move g1 a2a3"]);
        assert_eq!(platform.calls_starting("abort"), ["abort g1"]);
    }

    #[tokio::test]
    async fn test_diverging_history_is_desync() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_game_stream("g1", vec![full("e2e4", false), update("d2d4 d7d5")]);
        let report = run_session(context(platform.clone(), config()), "g1".into(), CancellationToken::new()).await;

        assert!(matches!(report.outcome, SessionOutcome::Failed(BotError::Desync(_))));
        assert_eq!(platform.calls_starting("move"), ["move g1 a7a5"]);
        assert!(platform.calls_starting("abort").is_empty());
    }

    struct Hopeless;

    impl Homemade for Hopeless {
        fn name(&self) -> &str {
            "Hopeless"
        }

        fn search(&mut self, board: &GameBoard, _: &SearchLimits, _: bool, _: &[Move]) -> PlayResult {
            PlayResult {
                best: board.legal_moves().into_iter().min_by_key(|m| board.to_uci(*m)),
                info: SearchInfo {
                    score: Some(Score::Cp(-2000)),
                    ..SearchInfo::default()
                },
                ..PlayResult::default()
            }
        }
    }

    struct HopelessEngines;

    #[async_trait]
    impl EngineFactory for HopelessEngines {
        async fn create(&self, _: &Game, _: CancellationToken) -> std::result::Result<Player, EngineError> {
            Ok(Player::homemade(Box::new(Hopeless)))
        }
    }

    #[tokio::test]
    async fn test_resigns_after_losing_scores() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_game_stream(
            "g1",
            vec![
                full("", true),
                update("a2a3 e7e5"),
                update("a2a3 e7e5 a1a2 d7d6"),
                finished("a2a3 e7e5 a1a2 d7d6", "resign", "black"),
            ],
        );
        let mut config = config();
        config.engine.draw_or_resign = DrawOrResignConfig {
            resign_enabled: true,
            resign_score: -1000,
            resign_moves: 2,
            ..DrawOrResignConfig::default()
        };
        let mut ctx = context(platform.clone(), config);
        ctx.engines = Arc::new(HopelessEngines);
        let report = run_session(ctx, "g1".into(), CancellationToken::new()).await;

        assert!(matches!(report.outcome, SessionOutcome::GameOver));
        assert_eq!(platform.calls_starting("move").len(), 2);
        assert_eq!(platform.calls_starting("resign"), ["resign g1"]);
    }

    #[tokio::test]
    async fn test_takebacks_accepted_up_to_limit() {
        let platform = Arc::new(FakePlatform::default());
        let request = |moves: &str| {
            GameEvent::GameState(GameState {
                btakeback: true,
                ..state(moves)
            })
        };
        platform.push_game_stream(
            "g1",
            vec![
                full("", true),
                update("a2a3 e7e5"),
                request("a2a3 e7e5 a1a2"),
                update("a2a3 e7e5"),
                request("a2a3 e7e5 a1a2"),
                finished("a2a3 e7e5 a1a2", "resign", "white"),
            ],
        );
        let mut config = config();
        config.max_takebacks_accepted = 1;
        let ctx = context(platform.clone(), config);
        let report = run_session(ctx.clone(), "g1".into(), CancellationToken::new()).await;

        assert!(matches!(report.outcome, SessionOutcome::GameOver));
        assert_eq!(platform.calls_starting("takeback"), ["takeback g1 true", "takeback g1 false"]);
        assert_eq!(platform.calls_starting("move"), ["move g1 a2a3", "move g1 a1a2", "move g1 a1a2"]);
        assert_eq!(ctx.takebacks.lock().unwrap().get("g1"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborts_when_opponent_never_moves() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_game_stream("g1", vec![full("", false)]);
        let report = run_session(context(platform.clone(), config()), "g1".into(), CancellationToken::new()).await;

        assert!(matches!(report.outcome, SessionOutcome::Aborted));
        assert_eq!(platform.calls_starting("abort"), ["abort g1"]);
        assert!(platform.calls_starting("move").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_correspondence_reconnect_disconnects_while_waiting() {
        let platform = Arc::new(FakePlatform::default());
        let json = r#"{"type":"gameFull","id":"g1","variant":{"key":"standard"},"speed":"correspondence",
            "perf":{"name":"Correspondence"},"daysPerTurn":3,
            "white":{"name":"Bot"},"black":{"name":"Alice"},
            "state":{"type":"gameState","moves":"e2e4","wtime":259200000,"btime":259200000,
            "winc":0,"binc":0,"status":"started"}}"#;
        platform.push_game_stream("g1", vec![serde_json::from_str(json).unwrap()]);
        let report = run_session(context(platform.clone(), config()), "g1".into(), CancellationToken::new()).await;

        assert!(matches!(report.outcome, SessionOutcome::Disconnected));
        assert!(report.unfinished_correspondence());
    }

    #[tokio::test]
    async fn test_cancelled_session_frees_slot() {
        let platform = Arc::new(FakePlatform::default());
        platform.push_game_stream("g1", vec![full("e2e4", true)]);
        let ctx = context(platform.clone(), config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run_session(ctx.clone(), "g1".into(), cancel).await;

        assert!(matches!(report.outcome, SessionOutcome::Cancelled));
        assert!(!ctx.registry.contains("g1"));
    }
}
