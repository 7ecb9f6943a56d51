//! The bot's main loop: reads the account event stream, decides on challenges,
//! starts game sessions within the slot limit and runs periodic upkeep.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chess_core::game_category;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, sleep, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blocklist::OnlineBlocklist;
use crate::challenge::{sort_challenges, AcceptanceContext, ChallengePolicy, ChallengePredicate, Decision};
use crate::clients::Platform;
use crate::matchmaking::Matchmaker;
use crate::model::{Challenge, Event, GameSummary, UserProfile};
use crate::session::{run_session, SessionContext, SessionReport};
use crate::timer::{hours, seconds, Timer};

const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);
const MAX_STREAM_BACKOFF: Duration = Duration::from_secs(60);
/// How long an accepted challenge holds its slot waiting for `gameStart`.
const RESERVATION_TIME: Duration = Duration::from_secs(60);
/// Correspondence games with less time than this many check-in cycles left
/// are started right away.
const URGENT_CHECKINS: u64 = 10;

/// Doubles a reconnect delay up to the cap.
fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_STREAM_BACKOFF)
}

/// Forwards account events until cancelled, reconnecting with backoff.
async fn forward_events(platform: Arc<dyn Platform>, tx: mpsc::Sender<Event>, cancel: CancellationToken) {
    let mut delay = Duration::from_secs(1);
    loop {
        match platform.stream_events().await {
            Ok(mut stream) => {
                info!("Connected to event stream");
                delay = Duration::from_secs(1);
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(Some(event))) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(None)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Event stream failed");
                            break;
                        }
                        None => {
                            warn!("Event stream closed");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not open event stream"),
        }
        debug!(delay_secs = delay.as_secs(), "Reconnecting to event stream");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
        delay = next_backoff(delay);
    }
}

/// Splits the ongoing games found at startup into games to start at once,
/// lowest time first, and correspondence games for the check-in queue.
fn partition_ongoing(games: Vec<GameSummary>, urgent_secs: u64) -> (Vec<GameSummary>, Vec<GameSummary>) {
    let (mut urgent, queued): (Vec<_>, Vec<_>) = games.into_iter().partition(|g| {
        !g.is_correspondence() || (g.is_my_turn && g.seconds_left.is_some_and(|s| s < urgent_secs))
    });
    urgent.sort_by_key(|g| g.seconds_left.unwrap_or(u64::MAX));
    (urgent, queued)
}

enum Wake {
    Event(Option<Event>),
    SessionEnded(Result<SessionReport, JoinError>),
    Housekeeping,
    Shutdown,
}

pub struct Controller {
    ctx: SessionContext,
    profile: UserProfile,
    policy: ChallengePolicy,
    matchmaker: Matchmaker,
    blocklist: OnlineBlocklist,
    /// Accepted-to-queue challenges, next to accept first.
    challenge_queue: Vec<Challenge>,
    /// Accepted challenges holding a slot until their game starts.
    reserved: HashMap<String, Timer>,
    /// Opponent name per running game.
    opponents: HashMap<String, String>,
    correspondence_queue: VecDeque<String>,
    startup_queue: VecDeque<String>,
    sessions: JoinSet<SessionReport>,
    shutdown: CancellationToken,
    force_quit: CancellationToken,
    checkin: Timer,
    online_check: Timer,
    blocklist_refresh: Timer,
    event_task: Option<(JoinHandle<()>, CancellationToken)>,
}

impl Controller {
    /// `shutdown` stops new work; `force_quit` also cancels running games.
    pub fn new(
        ctx: SessionContext,
        profile: UserProfile,
        shutdown: CancellationToken,
        force_quit: CancellationToken,
    ) -> Self {
        let config = ctx.config.clone();
        let mut urls = config.challenge.online_block_list.clone();
        for url in &config.matchmaking.online_block_list {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        Self {
            policy: ChallengePolicy::new(config.challenge.clone()),
            matchmaker: Matchmaker::new(config.matchmaking.clone(), &config.challenge.variants, profile.clone()),
            blocklist: OnlineBlocklist::new(urls),
            profile,
            challenge_queue: Vec::new(),
            reserved: HashMap::new(),
            opponents: HashMap::new(),
            correspondence_queue: VecDeque::new(),
            startup_queue: VecDeque::new(),
            sessions: JoinSet::new(),
            shutdown,
            force_quit,
            checkin: Timer::new(seconds(config.correspondence.checkin_period)),
            online_check: Timer::new(hours(1)),
            blocklist_refresh: Timer::new(hours(1)),
            event_task: None,
            ctx,
        }
    }

    /// Adds a caller-supplied acceptance test after the configured ones.
    pub fn with_predicate(mut self, predicate: Box<dyn ChallengePredicate>) -> Self {
        self.policy = self.policy.with_predicate(predicate);
        self
    }

    /// Runs until shutdown, then waits for or cancels the running games.
    pub async fn run(mut self) -> crate::error::Result<()> {
        info!(
            user = %self.ctx.username,
            max_games = self.ctx.registry.max(),
            "Starting controller"
        );
        self.refresh_blocklist().await;
        self.load_ongoing_games().await;

        let (tx, mut rx) = mpsc::channel(64);
        self.start_event_stream(tx.clone());
        let mut ticker = interval(HOUSEKEEPING_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                event = rx.recv() => Wake::Event(event),
                Some(joined) = self.sessions.join_next() => Wake::SessionEnded(joined),
                _ = ticker.tick() => Wake::Housekeeping,
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Event(Some(event)) => self.handle_event(event).await,
                Wake::Event(None) => {
                    warn!("Event channel closed");
                    break;
                }
                Wake::SessionEnded(joined) => self.session_ended(joined),
                Wake::Housekeeping => self.housekeeping(&tx).await,
            }
            self.start_urgent_games();
            self.accept_challenges().await;
        }

        self.stop_event_stream();
        self.shutdown_sessions().await;
        info!("Controller stopped");
        Ok(())
    }

    fn start_event_stream(&mut self, tx: mpsc::Sender<Event>) {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(forward_events(self.ctx.platform.clone(), tx, cancel.clone()));
        self.event_task = Some((handle, cancel));
    }

    fn stop_event_stream(&mut self) {
        if let Some((handle, cancel)) = self.event_task.take() {
            cancel.cancel();
            handle.abort();
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Challenge { challenge } => {
                let challenge = Challenge::new(challenge, &self.ctx.username);
                self.handle_challenge(challenge).await;
            }
            Event::ChallengeDeclined { challenge } => {
                let challenge = Challenge::new(challenge, &self.ctx.username);
                self.matchmaker.declined_challenge(&challenge);
            }
            Event::ChallengeCanceled { challenge } => {
                info!(challenge = %challenge.id, "Challenge canceled");
                self.challenge_queue.retain(|c| c.id != challenge.id);
                self.publish_queue();
                if self.reserved.remove(&challenge.id).is_some() {
                    self.ctx.registry.remove(&challenge.id);
                }
                self.matchmaker.discard_challenge(&challenge.id);
            }
            Event::GameStart { game } => self.start_game(game),
            Event::GameFinish { game } => {
                info!(game_id = %game.game_id, "Game finished");
                self.matchmaker.game_done();
            }
            Event::Unknown => {}
        }
    }

    async fn handle_challenge(&mut self, challenge: Challenge) {
        if challenge.from_self {
            return;
        }
        let active = self.opponent_counts();
        let ctx = AcceptanceContext {
            active_games: Some(&active),
            online_block_list: Some(self.blocklist.users()),
            my_rating: self.my_rating(&challenge),
        };
        match self.policy.evaluate(&challenge, &ctx) {
            Decision::Accept => {
                info!(
                    challenge = %challenge.id,
                    challenger = %challenge.challenger.label(),
                    variant = %challenge.variant.name(),
                    speed = %challenge.speed,
                    "Queued challenge"
                );
                self.challenge_queue.push(challenge);
                let config = self.policy.config();
                sort_challenges(&mut self.challenge_queue, config.sort_by, config.preference);
                self.publish_queue();
            }
            Decision::Decline(reason) => {
                info!(challenge = %challenge.id, challenger = %challenge.challenger.label(), %reason, "Declining challenge");
                if let Err(e) = self.ctx.platform.decline_challenge(&challenge.id, reason.key()).await {
                    warn!(challenge = %challenge.id, error = %e, "Could not decline challenge");
                }
            }
        }
    }

    fn opponent_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for name in self.opponents.values() {
            *counts.entry(name.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn my_rating(&self, challenge: &Challenge) -> Option<u32> {
        let category = game_category(
            challenge.variant,
            challenge.base.unwrap_or(0),
            challenge.increment.unwrap_or(0),
            challenge.days.unwrap_or(0),
        );
        Some(self.profile.perf(category).rating).filter(|r| *r > 0)
    }

    fn publish_queue(&self) {
        let names = self.challenge_queue.iter().map(|c| c.challenger.name.clone()).collect();
        *self.ctx.challenge_queue.lock().unwrap_or_else(PoisonError::into_inner) = names;
    }

    /// Accepts queued challenges while slots are free. An accepted challenge
    /// holds its slot until the game starts.
    async fn accept_challenges(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut changed = false;
        while !self.challenge_queue.is_empty() && self.ctx.registry.has_free_slot() {
            let challenge = self.challenge_queue.remove(0);
            changed = true;
            if !self.ctx.registry.try_admit(&challenge.id) {
                debug!(challenge = %challenge.id, "Challenge already has a slot");
                continue;
            }
            match self.ctx.platform.accept_challenge(&challenge.id).await {
                Ok(()) => {
                    info!(challenge = %challenge.id, challenger = %challenge.challenger.label(), "Accepted challenge");
                    self.policy.record_accepted(&challenge);
                    self.reserved.insert(challenge.id.clone(), Timer::new(RESERVATION_TIME));
                }
                Err(e) => {
                    warn!(challenge = %challenge.id, error = %e, "Could not accept challenge");
                    self.ctx.registry.remove(&challenge.id);
                }
            }
        }
        if changed {
            self.publish_queue();
        }
    }

    fn start_game(&mut self, game: GameSummary) {
        self.matchmaker.accepted_challenge(&game.game_id);
        self.correspondence_queue.retain(|id| *id != game.game_id);
        self.startup_queue.retain(|id| *id != game.game_id);

        let admitted = self.reserved.remove(&game.game_id).is_some() || self.ctx.registry.try_admit(&game.game_id);
        if !admitted {
            if self.ctx.registry.contains(&game.game_id) {
                debug!(game_id = %game.game_id, "Game already has a session");
            } else if game.is_correspondence() {
                info!(game_id = %game.game_id, "No free slot, queueing correspondence game");
                self.correspondence_queue.push_back(game.game_id);
            } else {
                warn!(game_id = %game.game_id, "No free slot, ignoring game start");
            }
            return;
        }
        if let Some(opponent) = &game.opponent {
            self.opponents.insert(game.game_id.clone(), opponent.username.clone());
        }
        self.spawn_session(game.game_id);
    }

    /// The slot must already be admitted.
    fn spawn_session(&mut self, game_id: String) {
        info!(
            game_id = %game_id,
            games = self.ctx.registry.len(),
            max_games = self.ctx.registry.max(),
            "Starting game session"
        );
        let cancel = self.force_quit.child_token();
        self.sessions.spawn(run_session(self.ctx.clone(), game_id, cancel));
    }

    /// Starts a queued game if a slot is free. False means no slot.
    fn try_start_queued(&mut self, game_id: &str) -> bool {
        if self.ctx.registry.contains(game_id) {
            return true;
        }
        if !self.ctx.registry.try_admit(game_id) {
            return false;
        }
        self.spawn_session(game_id.to_string());
        true
    }

    fn start_urgent_games(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        while let Some(game_id) = self.startup_queue.pop_front() {
            if !self.try_start_queued(&game_id) {
                self.startup_queue.push_front(game_id);
                break;
            }
        }
    }

    fn session_ended(&mut self, joined: Result<SessionReport, JoinError>) {
        match joined {
            Ok(report) => {
                self.opponents.remove(&report.game_id);
                if report.unfinished_correspondence() {
                    debug!(game_id = %report.game_id, "Correspondence game back in queue");
                    self.correspondence_queue.push_back(report.game_id);
                }
            }
            Err(e) if e.is_cancelled() => debug!("Game session task cancelled"),
            Err(e) => error!(error = %e, "Game session task panicked"),
        }
    }

    async fn load_ongoing_games(&mut self) {
        let games = match self.ctx.platform.ongoing_games().await {
            Ok(games) => games,
            Err(e) => {
                warn!(error = %e, "Could not load ongoing games");
                return;
            }
        };
        let corr = &self.ctx.config.correspondence;
        let urgent_secs = URGENT_CHECKINS * (corr.checkin_period + corr.move_time);
        let (urgent, queued) = partition_ongoing(games, urgent_secs);
        info!(urgent = urgent.len(), queued = queued.len(), "Found ongoing games");
        for game in urgent {
            if let Some(opponent) = &game.opponent {
                self.opponents.insert(game.game_id.clone(), opponent.username.clone());
            }
            self.startup_queue.push_back(game.game_id);
        }
        self.correspondence_queue.extend(queued.into_iter().map(|g| g.game_id));
    }

    async fn housekeeping(&mut self, tx: &mpsc::Sender<Event>) {
        let registry = &self.ctx.registry;
        self.reserved.retain(|id, timer| {
            if timer.is_expired() {
                warn!(challenge = %id, "Accepted challenge never started");
                registry.remove(id);
                false
            } else {
                true
            }
        });

        if self.online_check.is_expired() {
            self.online_check.reset();
            self.check_online(tx).await;
        }
        if self.blocklist_refresh.is_expired() {
            self.blocklist_refresh.reset();
            self.refresh_blocklist().await;
        }
        self.check_in_correspondence();

        if self.challenge_queue.is_empty() && !self.shutdown.is_cancelled() {
            let platform = self.ctx.platform.clone();
            let games = self.ctx.registry.len();
            let max = self.ctx.registry.max();
            if let Some(id) = self.matchmaker.challenge(platform.as_ref(), games, 0, max).await {
                info!(challenge = %id, "Created challenge");
            }
        }
    }

    /// A bot the server reports offline gets a fresh event stream.
    async fn check_online(&mut self, tx: &mpsc::Sender<Event>) {
        match self.ctx.platform.is_online(&self.ctx.username).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Bot is not reported online, reconnecting event stream");
                self.stop_event_stream();
                self.start_event_stream(tx.clone());
            }
            Err(e) => debug!(error = %e, "Could not check online status"),
        }
    }

    async fn refresh_blocklist(&mut self) {
        if self.blocklist.is_empty() {
            return;
        }
        self.blocklist.refresh(self.ctx.platform.as_ref()).await;
        self.matchmaker.extend_block_list(self.blocklist.users());
    }

    /// Starts queued correspondence games into free slots, but only while no
    /// challenge is waiting.
    fn check_in_correspondence(&mut self) {
        if !self.checkin.is_expired() || self.shutdown.is_cancelled() {
            return;
        }
        self.checkin.reset();
        if !self.challenge_queue.is_empty() {
            debug!("Skipping correspondence check-in while challenges wait");
            return;
        }
        if !self.correspondence_queue.is_empty() {
            info!(games = self.correspondence_queue.len(), "Checking in on correspondence games");
        }
        while let Some(game_id) = self.correspondence_queue.pop_front() {
            if !self.try_start_queued(&game_id) {
                self.correspondence_queue.push_front(game_id);
                break;
            }
        }
    }

    async fn shutdown_sessions(&mut self) {
        if self.ctx.config.quit_after_all_games_finish && !self.force_quit.is_cancelled() {
            info!(games = self.sessions.len(), "Waiting for running games to finish");
            loop {
                let joined = tokio::select! {
                    _ = self.force_quit.cancelled() => break,
                    joined = self.sessions.join_next() => joined,
                };
                match joined {
                    Some(joined) => self.session_ended(joined),
                    None => return,
                }
            }
        }

        self.force_quit.cancel();
        if self.sessions.is_empty() {
            return;
        }
        info!(games = self.sessions.len(), "Stopping running games");
        let deadline = Instant::now() + seconds(self.ctx.config.shutdown_timeout);
        loop {
            match timeout_at(deadline, self.sessions.join_next()).await {
                Ok(Some(joined)) => self.session_ended(joined),
                Ok(None) => return,
                Err(_) => {
                    warn!(games = self.sessions.len(), "Shutdown timeout, abandoning games");
                    self.sessions.abort_all();
                    while self.sessions.join_next().await.is_some() {}
                    return;
                }
            }
        }
    }
}
