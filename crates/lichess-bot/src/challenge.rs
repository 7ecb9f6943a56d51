//! Acceptance policy for incoming challenges.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::config::{ChallengeConfig, Preference, SortBy};
use crate::model::Challenge;
use crate::timer::{seconds, Timer};

/// Reason sent to the platform when declining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclineReason {
    Generic,
    Later,
    TooFast,
    TooSlow,
    TimeControl,
    Rated,
    Casual,
    Standard,
    Variant,
    NoBot,
    OnlyBot,
}

impl DeclineReason {
    pub fn key(self) -> &'static str {
        match self {
            DeclineReason::Generic => "generic",
            DeclineReason::Later => "later",
            DeclineReason::TooFast => "tooFast",
            DeclineReason::TooSlow => "tooSlow",
            DeclineReason::TimeControl => "timeControl",
            DeclineReason::Rated => "rated",
            DeclineReason::Casual => "casual",
            DeclineReason::Standard => "standard",
            DeclineReason::Variant => "variant",
            DeclineReason::NoBot => "noBot",
            DeclineReason::OnlyBot => "onlyBot",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let reason = match key.to_ascii_lowercase().as_str() {
            "generic" => DeclineReason::Generic,
            "later" => DeclineReason::Later,
            "toofast" => DeclineReason::TooFast,
            "tooslow" => DeclineReason::TooSlow,
            "timecontrol" => DeclineReason::TimeControl,
            "rated" => DeclineReason::Rated,
            "casual" => DeclineReason::Casual,
            "standard" => DeclineReason::Standard,
            "variant" => DeclineReason::Variant,
            "nobot" => DeclineReason::NoBot,
            "onlybot" => DeclineReason::OnlyBot,
            _ => return None,
        };
        Some(reason)
    }
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Decline(DeclineReason),
}

impl Decision {
    fn unless(requirement_met: bool, reason: DeclineReason) -> Option<DeclineReason> {
        (!requirement_met).then_some(reason)
    }
}

/// Extra acceptance rule supplied by the embedding application.
pub trait ChallengePredicate: Send + Sync {
    fn accept(&self, challenge: &Challenge) -> bool;
}

impl<F> ChallengePredicate for F
where
    F: Fn(&Challenge) -> bool + Send + Sync,
{
    fn accept(&self, challenge: &Challenge) -> bool {
        self(challenge)
    }
}

/// State the policy reads but does not own.
#[derive(Debug, Default)]
pub struct AcceptanceContext<'a> {
    /// Active games per opponent name.
    pub active_games: Option<&'a HashMap<String, usize>>,
    /// Lowercased names from online block lists.
    pub online_block_list: Option<&'a HashSet<String>>,
    /// Our rating in the challenge's perf.
    pub my_rating: Option<u32>,
}

pub struct ChallengePolicy {
    config: ChallengeConfig,
    extra: Option<Box<dyn ChallengePredicate>>,
    recent_bot_challenges: HashMap<String, Vec<Timer>>,
}

impl ChallengePolicy {
    pub fn new(config: ChallengeConfig) -> Self {
        Self {
            config,
            extra: None,
            recent_bot_challenges: HashMap::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Box<dyn ChallengePredicate>) -> Self {
        self.extra = Some(predicate);
        self
    }

    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    /// Runs the predicates in order; the first failure decides the reason.
    pub fn evaluate(&mut self, challenge: &Challenge, ctx: &AcceptanceContext<'_>) -> Decision {
        if challenge.from_self {
            return Decision::Accept;
        }
        let c = &self.config;
        let challenger = &challenge.challenger;
        let name = challenger.name.to_lowercase();
        let is_bot = challenger.is_bot();

        let reason = Decision::unless(c.accept_bot || !is_bot, DeclineReason::NoBot)
            .or_else(|| Decision::unless(!c.only_bot || is_bot, DeclineReason::OnlyBot))
            .or_else(|| Decision::unless(self.is_supported_time_control(challenge), DeclineReason::TimeControl))
            .or_else(|| Decision::unless(c.variants.contains(&challenge.variant), DeclineReason::Variant))
            .or_else(|| {
                let reason = if challenge.rated {
                    DeclineReason::Casual
                } else {
                    DeclineReason::Rated
                };
                Decision::unless(c.modes.iter().any(|m| m == challenge.mode()), reason)
            })
            .or_else(|| Decision::unless(self.is_supported_rating(challenge, ctx.my_rating), DeclineReason::Generic))
            .or_else(|| {
                let blocked = c.block_list.iter().any(|b| b.eq_ignore_ascii_case(&name))
                    || ctx.online_block_list.is_some_and(|l| l.contains(&name));
                Decision::unless(!blocked, DeclineReason::Generic)
            })
            .or_else(|| {
                let allowed = c.allow_list.iter().all(|a| a.is_empty())
                    || c.allow_list.iter().any(|a| a.eq_ignore_ascii_case(&name));
                Decision::unless(allowed, DeclineReason::Generic)
            });

        let reason = reason
            .or_else(|| Decision::unless(self.is_supported_recent(challenge), DeclineReason::Later))
            .or_else(|| {
                let c = &self.config;
                let active = ctx
                    .active_games
                    .and_then(|g| g.get(&challenge.challenger.name))
                    .copied()
                    .unwrap_or(0);
                Decision::unless(active < c.max_simultaneous_games_per_user, DeclineReason::Later)
            })
            .or_else(|| {
                let extra_ok = self.extra.as_ref().map_or(true, |p| p.accept(challenge));
                Decision::unless(extra_ok, DeclineReason::Generic)
            });

        match reason {
            Some(reason) => {
                debug!(challenge = %challenge.id, %reason, "Challenge fails acceptance");
                Decision::Decline(reason)
            }
            None => Decision::Accept,
        }
    }

    fn is_supported_time_control(&self, challenge: &Challenge) -> bool {
        let c = &self.config;
        if !c.time_controls.iter().any(|tc| *tc == challenge.speed) {
            return false;
        }
        let requires_increment =
            challenge.challenger.is_bot() && challenge.speed == "bullet" && c.bullet_requires_increment;
        let min_increment = c.min_increment.max(u32::from(requires_increment));

        match (challenge.base, challenge.increment, challenge.days) {
            (Some(base), Some(inc), _) => {
                (min_increment..=c.max_increment).contains(&inc) && (c.min_base..=c.max_base).contains(&base)
            }
            (_, _, Some(days)) => (c.min_days..=c.max_days).contains(&days),
            _ => c.max_days == u32::MAX,
        }
    }

    fn is_supported_rating(&self, challenge: &Challenge, my_rating: Option<u32>) -> bool {
        let c = &self.config;
        let Some(rating) = challenge.challenger.rating else {
            return c.min_rating.is_none() && c.max_rating.is_none() && c.max_rating_diff.is_none();
        };
        let in_bounds = c.min_rating.map_or(true, |min| rating >= min) && c.max_rating.map_or(true, |max| rating <= max);
        let in_diff = match (c.max_rating_diff, my_rating) {
            (Some(diff), Some(mine)) => rating.abs_diff(mine) <= diff,
            _ => true,
        };
        in_bounds && in_diff
    }

    fn is_supported_recent(&mut self, challenge: &Challenge) -> bool {
        if !challenge.challenger.is_bot() {
            return true;
        }
        let Some(max) = self.config.max_recent_bot_challenges else {
            return true;
        };
        let timers = self
            .recent_bot_challenges
            .entry(challenge.challenger.name.clone())
            .or_default();
        timers.retain(|t| !t.is_expired());
        timers.len() < max
    }

    /// Remembers an accepted bot challenge for the recent-challenge cap.
    pub fn record_accepted(&mut self, challenge: &Challenge) {
        if !challenge.challenger.is_bot() {
            return;
        }
        if let Some(age) = self.config.recent_bot_challenge_age {
            self.recent_bot_challenges
                .entry(challenge.challenger.name.clone())
                .or_default()
                .push(Timer::new(seconds(age)));
        }
    }
}

/// Orders the accepted-challenge queue: best score first when configured, then
/// by the human/bot preference. Both sorts are stable.
pub fn sort_challenges(queue: &mut [Challenge], sort_by: SortBy, preference: Preference) {
    if sort_by == SortBy::Best {
        queue.sort_by_key(|c| std::cmp::Reverse(c.score()));
    }
    match preference {
        Preference::Bot => queue.sort_by_key(|c| !c.challenger.is_bot()),
        Preference::Human => queue.sort_by_key(|c| c.challenger.is_bot()),
        Preference::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Player;
    use chess_core::GameVariant;

    fn challenge(base: u32, inc: u32) -> Challenge {
        Challenge {
            id: "c1".into(),
            rated: true,
            variant: GameVariant::Standard,
            perf_name: "Blitz".into(),
            speed: "blitz".into(),
            base: Some(base),
            increment: Some(inc),
            days: None,
            challenger: Player {
                name: "Alice".into(),
                rating: Some(1800),
                ..Default::default()
            },
            dest_user: None,
            color: None,
            initial_fen: None,
            from_self: false,
            decline_reason: None,
        }
    }

    fn bot(mut c: Challenge, name: &str) -> Challenge {
        c.challenger.name = name.into();
        c.challenger.title = Some("BOT".into());
        c
    }

    fn bounded() -> ChallengeConfig {
        ChallengeConfig {
            variants: vec![GameVariant::Standard],
            time_controls: vec!["blitz".into()],
            min_base: 60,
            max_base: 300,
            min_increment: 0,
            max_increment: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_base_bounds() {
        let mut policy = ChallengePolicy::new(bounded());
        let ctx = AcceptanceContext::default();
        assert_eq!(policy.evaluate(&challenge(180, 2), &ctx), Decision::Accept);

        let mut fast = challenge(30, 2);
        assert_eq!(
            policy.evaluate(&fast, &ctx),
            Decision::Decline(DeclineReason::TimeControl)
        );
        fast.speed = "bullet".into();
        assert_eq!(
            policy.evaluate(&fast, &ctx),
            Decision::Decline(DeclineReason::TimeControl)
        );
    }

    #[test]
    fn test_predicate_order() {
        let mut policy = ChallengePolicy::new(ChallengeConfig {
            modes: vec!["casual".into()],
            ..bounded()
        });
        let ctx = AcceptanceContext::default();

        // A bot with an unsupported mode fails on the bot check first.
        assert_eq!(
            policy.evaluate(&bot(challenge(180, 2), "Robo"), &ctx),
            Decision::Decline(DeclineReason::NoBot)
        );
        assert_eq!(
            policy.evaluate(&challenge(180, 2), &ctx),
            Decision::Decline(DeclineReason::Casual)
        );

        let mut atomic = challenge(180, 2);
        atomic.variant = GameVariant::Atomic;
        assert_eq!(
            policy.evaluate(&atomic, &ctx),
            Decision::Decline(DeclineReason::Variant)
        );
    }

    #[test]
    fn test_lists_and_ratings() {
        let mut policy = ChallengePolicy::new(ChallengeConfig {
            block_list: vec!["mallory".into()],
            max_rating_diff: Some(300),
            ..bounded()
        });
        let mut blocked = challenge(180, 2);
        blocked.challenger.name = "Mallory".into();
        let ctx = AcceptanceContext {
            my_rating: Some(1600),
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(&blocked, &ctx),
            Decision::Decline(DeclineReason::Generic)
        );
        assert_eq!(policy.evaluate(&challenge(180, 2), &ctx), Decision::Accept);

        let far = AcceptanceContext {
            my_rating: Some(2400),
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(&challenge(180, 2), &far),
            Decision::Decline(DeclineReason::Generic)
        );

        let online: HashSet<String> = ["alice".to_string()].into();
        let ctx = AcceptanceContext {
            online_block_list: Some(&online),
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(&challenge(180, 2), &ctx),
            Decision::Decline(DeclineReason::Generic)
        );

        let mut allow = ChallengePolicy::new(ChallengeConfig {
            allow_list: vec!["bob".into()],
            ..bounded()
        });
        assert_eq!(
            allow.evaluate(&challenge(180, 2), &AcceptanceContext::default()),
            Decision::Decline(DeclineReason::Generic)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_bot_challenges_expire() {
        let mut policy = ChallengePolicy::new(ChallengeConfig {
            accept_bot: true,
            max_recent_bot_challenges: Some(1),
            recent_bot_challenge_age: Some(60),
            ..bounded()
        });
        let ctx = AcceptanceContext::default();
        let c = bot(challenge(180, 2), "Robo");

        assert_eq!(policy.evaluate(&c, &ctx), Decision::Accept);
        policy.record_accepted(&c);
        assert_eq!(policy.evaluate(&c, &ctx), Decision::Decline(DeclineReason::Later));

        tokio::time::advance(seconds(61)).await;
        assert_eq!(policy.evaluate(&c, &ctx), Decision::Accept);
    }

    #[test]
    fn test_per_user_cap_and_custom_predicate() {
        let mut policy = ChallengePolicy::new(ChallengeConfig {
            max_simultaneous_games_per_user: 1,
            ..bounded()
        });
        let active: HashMap<String, usize> = [("Alice".to_string(), 1)].into();
        let ctx = AcceptanceContext {
            active_games: Some(&active),
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(&challenge(180, 2), &ctx),
            Decision::Decline(DeclineReason::Later)
        );

        let mut picky = ChallengePolicy::new(bounded())
            .with_predicate(Box::new(|c: &Challenge| c.increment == Some(0)));
        assert_eq!(
            picky.evaluate(&challenge(180, 2), &AcceptanceContext::default()),
            Decision::Decline(DeclineReason::Generic)
        );
    }

    #[test]
    fn test_bullet_requires_increment_for_bots() {
        let mut policy = ChallengePolicy::new(ChallengeConfig {
            accept_bot: true,
            bullet_requires_increment: true,
            time_controls: vec!["bullet".into()],
            min_base: 0,
            ..bounded()
        });
        let mut c = bot(challenge(60, 0), "Robo");
        c.speed = "bullet".into();
        let ctx = AcceptanceContext::default();
        assert_eq!(
            policy.evaluate(&c, &ctx),
            Decision::Decline(DeclineReason::TimeControl)
        );
        c.increment = Some(1);
        assert_eq!(policy.evaluate(&c, &ctx), Decision::Accept);
    }

    #[test]
    fn test_sorting() {
        let low = challenge(180, 2);
        let mut high = challenge(180, 2);
        high.id = "high".into();
        high.challenger.rating = Some(2500);
        let robo = bot(challenge(180, 2), "Robo");

        let mut queue = vec![low.clone(), robo.clone(), high.clone()];
        sort_challenges(&mut queue, SortBy::Best, Preference::None);
        assert_eq!(queue[0].id, "high");

        let mut queue = vec![low, robo, high];
        sort_challenges(&mut queue, SortBy::First, Preference::Bot);
        assert_eq!(queue[0].challenger.name, "Robo");
    }
}
