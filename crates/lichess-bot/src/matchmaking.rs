//! Challenging other bots while idle.

use std::collections::HashSet;
use std::time::Duration;

use chess_core::{game_category, GameVariant};
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::challenge::DeclineReason;
use crate::clients::{ChallengeParams, Platform};
use crate::config::{ChallengeFilter, ChallengeMode, MatchmakingConfig, MatchmakingSettings, RatingPreference};
use crate::model::{Challenge, UserProfile};
use crate::timer::{hours, minutes, seconds, Timer};

/// Outgoing challenges expire on the server after 20 seconds.
const CHALLENGE_EXPIRY: Duration = Duration::from_secs(25);
const PROFILE_REFRESH: Duration = Duration::from_secs(300);
const MAX_WAIT_DURING_GAMES: Duration = Duration::from_secs(600);

/// One sampled matchmaking attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeChoice {
    pub username: Option<String>,
    pub base: u32,
    pub increment: u32,
    pub days: u32,
    pub variant: String,
    pub mode: &'static str,
}

impl ChallengeChoice {
    pub fn category(&self) -> &'static str {
        let variant = GameVariant::from_key(&self.variant).unwrap_or(GameVariant::Standard);
        game_category(variant, self.base, self.increment, self.days)
    }
}

pub struct Matchmaker {
    config: MatchmakingConfig,
    variants: Vec<GameVariant>,
    profile: UserProfile,
    rng: StdRng,
    last_challenge_created: Timer,
    last_game_ended: Timer,
    last_profile_update: Timer,
    min_wait_time: Duration,
    max_wait_time: Duration,
    challenge_id: Option<String>,
    daily_challenges: Vec<Timer>,
    /// (lowercased opponent, aspect) pairs we expect to be declined. The empty
    /// aspect blocks the opponent entirely.
    filters: HashSet<(String, String)>,
}

impl Matchmaker {
    pub fn new(config: MatchmakingConfig, challenge_variants: &[GameVariant], profile: UserProfile) -> Self {
        Self::with_rng(config, challenge_variants, profile, StdRng::from_entropy())
    }

    pub fn with_rng(
        config: MatchmakingConfig,
        challenge_variants: &[GameVariant],
        profile: UserProfile,
        rng: StdRng,
    ) -> Self {
        let max_wait_time = if config.allow_during_games {
            MAX_WAIT_DURING_GAMES
        } else {
            hours(24 * 365 * 10)
        };
        let mut matchmaker = Self {
            variants: challenge_variants
                .iter()
                .copied()
                .filter(|v| *v != GameVariant::FromPosition)
                .collect(),
            profile,
            rng,
            last_challenge_created: Timer::new(CHALLENGE_EXPIRY),
            last_game_ended: Timer::new(minutes(config.challenge_timeout)),
            last_profile_update: Timer::new(PROFILE_REFRESH),
            min_wait_time: seconds(60),
            max_wait_time,
            challenge_id: None,
            daily_challenges: Vec::new(),
            filters: HashSet::new(),
            config,
        };
        for name in matchmaker.config.block_list.clone() {
            matchmaker.add_to_block_list(&name);
        }
        matchmaker
    }

    pub fn challenge_id(&self) -> Option<&str> {
        self.challenge_id.as_deref()
    }

    pub fn min_wait_time(&self) -> Duration {
        self.min_wait_time
    }

    async fn should_create_challenge(&mut self, platform: &dyn Platform) -> bool {
        let challenge_expired = self.last_challenge_created.is_expired() && self.challenge_id.is_some();
        if challenge_expired {
            if let Some(id) = self.challenge_id.take() {
                if let Err(e) = platform.cancel_challenge(&id).await {
                    debug!(challenge = %id, error = %e, "Could not cancel challenge");
                }
                info!(challenge = %id, "Challenge cancelled");
            }
            self.show_earliest_challenge_time();
        }
        let min_wait_passed = self.last_challenge_created.time_since_reset() > self.min_wait_time;
        self.config.allow_matchmaking
            && (self.last_game_ended.is_expired() || challenge_expired)
            && min_wait_passed
    }

    /// Issues at most one challenge if the bot has been idle long enough.
    /// Returns the new challenge id.
    pub async fn challenge(
        &mut self,
        platform: &dyn Platform,
        active_games: usize,
        queued_challenges: usize,
        max_games: usize,
    ) -> Option<String> {
        let cap = if self.config.allow_during_games {
            max_games
        } else {
            max_games.min(1)
        };
        let game_count = active_games + queued_challenges;
        if game_count >= cap
            || (game_count > 0 && self.last_challenge_created.time_since_reset() < self.max_wait_time)
            || !self.should_create_challenge(platform).await
        {
            return None;
        }

        info!("Challenging a random bot");
        self.update_user_profile(platform).await;
        let choice = self.choose_opponent(platform).await;
        let username = choice.username.clone()?;
        info!(opponent = %username, variant = %choice.variant, "Will challenge");
        let id = self.create_challenge(platform, &username, &choice).await;
        self.challenge_id = id.clone();
        id
    }

    async fn update_user_profile(&mut self, platform: &dyn Platform) {
        if self.last_profile_update.is_expired() {
            self.last_profile_update.reset();
            match platform.profile().await {
                Ok(profile) => self.profile = profile,
                Err(e) => debug!(error = %e, "Could not refresh profile"),
            }
        }
    }

    fn settings(&mut self) -> MatchmakingSettings {
        let mut names: Vec<Option<&String>> = self.config.overrides.keys().map(Some).collect();
        names.push(None);
        let choice = names.choose(&mut self.rng).copied().flatten();
        info!(
            configuration = choice.map_or("default", String::as_str),
            "Using matchmaking configuration"
        );
        match choice.and_then(|name| self.config.overrides.get(name)) {
            Some(o) => self.config.settings.with_override(o),
            None => self.config.settings.clone(),
        }
    }

    /// Samples a configuration and a suitable opponent.
    pub async fn choose_opponent(&mut self, platform: &dyn Platform) -> ChallengeChoice {
        let settings = self.settings();

        let variant = if settings.challenge_variant == "random" {
            self.variants
                .choose(&mut self.rng)
                .map_or("standard", |v| v.key())
                .to_string()
        } else {
            settings.challenge_variant.clone()
        };
        let mode = match settings.challenge_mode {
            ChallengeMode::Casual => "casual",
            ChallengeMode::Rated => "rated",
            ChallengeMode::Random => *["casual", "rated"].choose(&mut self.rng).unwrap_or(&"casual"),
        };

        let mut base = settings.challenge_initial_time.choose(&mut self.rng).copied().unwrap_or(0);
        let mut increment = settings.challenge_increment.choose(&mut self.rng).copied().unwrap_or(0);
        let mut days = settings.challenge_days.choose(&mut self.rng).copied().unwrap_or(0);
        let correspondence_options = [days > 0, base == 0 && increment == 0];
        if correspondence_options.choose(&mut self.rng).copied().unwrap_or(false) {
            base = 0;
            increment = 0;
        } else {
            days = 0;
        }

        let mut choice = ChallengeChoice {
            username: None,
            base,
            increment,
            days,
            variant,
            mode,
        };
        let category = choice.category();

        let (mut min_rating, mut max_rating) =
            (i64::from(settings.opponent_min_rating), i64::from(settings.opponent_max_rating));
        let my_rating = i64::from(self.profile.perf(category).rating);
        if let Some(diff) = settings.opponent_rating_difference {
            if my_rating > 0 {
                min_rating = my_rating - i64::from(diff);
                max_rating = my_rating + i64::from(diff);
            }
        }
        info!(category, min_rating, max_rating, "Seeking game");

        let bots = match platform.online_bots().await {
            Ok(bots) => bots,
            Err(e) => {
                warn!(error = %e, "Could not fetch online bots");
                return choice;
            }
        };
        let me = self.profile.username.to_lowercase();
        let suitable: Vec<UserProfile> = bots
            .into_iter()
            .filter(|bot| {
                let perf = bot.perf(category);
                bot.username.to_lowercase() != me
                    && !self.in_block_list(&bot.username)
                    && !bot.disabled
                    && (settings.opponent_allow_tos_violation || !bot.tos_violation)
                    && perf.games > 0
                    && (min_rating..=max_rating).contains(&i64::from(perf.rating))
            })
            .collect();

        let aspects: Vec<&str> = if self.config.challenge_filter == ChallengeFilter::Fine {
            vec![choice.variant.as_str(), category, mode]
        } else {
            Vec::new()
        };
        let candidates: Vec<&UserProfile> = suitable
            .iter()
            .filter(|bot| aspects.iter().all(|a| self.should_accept_challenge(&bot.username, a)))
            .collect();
        if candidates.is_empty() {
            error!("No suitable bots found to challenge");
            return choice;
        }

        let weights = weights(&candidates, settings.rating_preference, min_rating, max_rating, category);
        let Ok(dist) = WeightedIndex::new(&weights) else {
            error!("Could not weight the candidate bots");
            return choice;
        };
        let bot = candidates[dist.sample(&mut self.rng)].username.clone();

        match platform.public_data(&bot).await {
            Ok(profile) if profile.blocking => {
                info!(opponent = %bot, "Opponent blocks us");
                self.add_to_block_list(&bot);
            }
            Ok(_) => choice.username = Some(bot),
            Err(e) => warn!(opponent = %bot, error = %e, "Could not fetch opponent data"),
        }
        choice
    }

    async fn create_challenge(
        &mut self,
        platform: &dyn Platform,
        username: &str,
        choice: &ChallengeChoice,
    ) -> Option<String> {
        let params = if choice.days > 0 {
            ChallengeParams {
                rated: choice.mode == "rated",
                clock_limit: None,
                clock_increment: None,
                days: Some(choice.days),
                color: "random".into(),
                variant: choice.variant.clone(),
            }
        } else if choice.base > 0 || choice.increment > 0 {
            ChallengeParams {
                rated: choice.mode == "rated",
                clock_limit: Some(choice.base),
                clock_increment: Some(choice.increment),
                days: None,
                color: "random".into(),
                variant: choice.variant.clone(),
            }
        } else {
            error!("Matchmaking needs a non-zero challenge_days, challenge_initial_time or challenge_increment");
            return None;
        };

        self.update_daily_challenge_record();
        self.last_challenge_created.reset();
        match platform.create_challenge(username, &params).await {
            Ok(Some(id)) => {
                info!(challenge = %id, opponent = username, "Challenge created");
                Some(id)
            }
            Ok(None) => {
                error!(opponent = username, "Challenge response had no id");
                self.add_to_block_list(username);
                self.show_earliest_challenge_time();
                None
            }
            Err(e) => {
                warn!(opponent = username, error = %e, "Could not create challenge");
                self.show_earliest_challenge_time();
                None
            }
        }
    }

    /// Minimum spacing grows by a minute for every 50 challenges in the last day.
    fn update_daily_challenge_record(&mut self) {
        self.daily_challenges.retain(|t| !t.is_expired());
        self.daily_challenges.push(Timer::new(hours(24)));
        self.min_wait_time = seconds(60) * (self.daily_challenges.len() / 50 + 1) as u32;
    }

    pub fn discard_challenge(&mut self, challenge_id: &str) {
        if self.challenge_id.as_deref() == Some(challenge_id) {
            self.challenge_id = None;
        }
    }

    /// A game started from our challenge; nothing to cancel any more.
    pub fn accepted_challenge(&mut self, game_id: &str) {
        self.discard_challenge(game_id);
    }

    pub fn game_done(&mut self) {
        self.last_game_ended.reset();
        self.show_earliest_challenge_time();
    }

    fn show_earliest_challenge_time(&self) {
        if self.config.allow_matchmaking {
            let postgame = self.last_game_ended.time_until_expiration();
            let spacing = self
                .min_wait_time
                .saturating_sub(self.last_challenge_created.time_since_reset());
            let wait = postgame.max(spacing);
            info!(
                wait_secs = wait.as_secs(),
                challenges_last_day = self.daily_challenges.len(),
                "Next challenge scheduled"
            );
        }
    }

    pub fn add_to_block_list(&mut self, username: &str) {
        self.add_challenge_filter(username, "");
    }

    pub fn in_block_list(&self, username: &str) -> bool {
        !self.should_accept_challenge(username, "")
    }

    pub fn add_challenge_filter(&mut self, username: &str, aspect: &str) {
        self.filters.insert((username.to_lowercase(), aspect.to_string()));
    }

    pub fn should_accept_challenge(&self, username: &str, aspect: &str) -> bool {
        !self.filters.contains(&(username.to_lowercase(), aspect.to_string()))
    }

    /// Blocks names from online block lists.
    pub fn extend_block_list<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            self.add_to_block_list(name);
        }
    }

    /// Our outgoing challenge was declined: remember what the opponent objected to.
    pub fn declined_challenge(&mut self, challenge: &Challenge) {
        let Some(opponent) = challenge.dest_user.as_ref() else {
            return;
        };
        let reason_key = challenge.decline_reason.as_deref().unwrap_or("generic");
        info!(opponent = %opponent.name, challenge = %challenge.id, reason = reason_key, "Challenge declined");
        self.discard_challenge(&challenge.id);
        if !challenge.from_self || self.config.challenge_filter == ChallengeFilter::None {
            return;
        }

        let aspect = match DeclineReason::from_key(reason_key) {
            Some(DeclineReason::TooFast | DeclineReason::TooSlow | DeclineReason::TimeControl) => {
                challenge.speed.clone()
            }
            Some(DeclineReason::Rated | DeclineReason::Casual) => challenge.mode().to_string(),
            Some(DeclineReason::Standard | DeclineReason::Variant) => challenge.variant.key().to_string(),
            Some(_) => String::new(),
            None => {
                warn!(reason = reason_key, "Unknown decline reason");
                String::new()
            }
        };
        let aspect = if self.config.challenge_filter == ChallengeFilter::Fine {
            aspect
        } else {
            String::new()
        };
        info!(opponent = %opponent.name, aspect = %aspect, "Will not repeat this challenge");
        self.add_challenge_filter(&opponent.name, &aspect);
        self.show_earliest_challenge_time();
    }
}

/// Selection weight per bot; a higher weight is more likely to be challenged.
pub fn weights(
    bots: &[&UserProfile],
    preference: RatingPreference,
    min_rating: i64,
    max_rating: i64,
    category: &str,
) -> Vec<i64> {
    let rating = |bot: &UserProfile| i64::from(bot.perf(category).rating);
    match preference {
        RatingPreference::High => {
            let reduce_by = (min_rating - (max_rating - min_rating)).min(min_rating - 1);
            bots.iter().map(|b| rating(b) - reduce_by).collect()
        }
        RatingPreference::Low => {
            let reduce_by = (max_rating - (min_rating - max_rating)).max(max_rating + 1);
            bots.iter().map(|b| reduce_by - rating(b)).collect()
        }
        RatingPreference::None => vec![1; bots.len()],
    }
}
