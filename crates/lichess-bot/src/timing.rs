//! Search budgets and the artificial delays around our moves.

use std::time::Duration;

use engine_protocol::{ClockLimits, SearchLimits};

use crate::config::{Config, GoCommands};

/// The platform aborts games whose first move takes longer than 30 seconds.
pub const FIRST_MOVE_TIME: Duration = Duration::from_secs(10);

const MIN_TIME: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct TimeManager {
    move_overhead: Duration,
    correspondence_move_time: Duration,
    go_commands: GoCommands,
    fake_think_time: bool,
    rate_limiting_delay: Duration,
}

impl TimeManager {
    pub fn from_config(config: &Config) -> Self {
        Self {
            move_overhead: config.move_overhead(),
            correspondence_move_time: Duration::from_secs(config.correspondence.move_time),
            go_commands: config.engine.go_commands.clone(),
            fake_think_time: config.fake_think_time,
            rate_limiting_delay: config.rate_limiting_delay(),
        }
    }

    /// Budget for our next search. `setup` is the time spent since the
    /// position arrived from the server.
    pub fn limits(
        &self,
        ply: usize,
        white_to_move: bool,
        clock: &ClockLimits,
        correspondence: bool,
        setup: Duration,
        can_ponder: bool,
    ) -> SearchLimits {
        let overhead = setup + self.move_overhead;
        let mut limits = if ply < 2 {
            // a fresh clock starts after the first move, so no pondering
            SearchLimits {
                movetime: Some(FIRST_MOVE_TIME),
                ..SearchLimits::default()
            }
        } else if correspondence {
            let ours = if white_to_move { clock.wtime } else { clock.btime };
            let available = ours.saturating_sub(overhead).max(MIN_TIME);
            SearchLimits {
                movetime: Some(self.correspondence_move_time.min(available)),
                ponder: can_ponder,
                ..SearchLimits::default()
            }
        } else {
            let mut clock = *clock;
            let ours = if white_to_move { &mut clock.wtime } else { &mut clock.btime };
            *ours = ours.saturating_sub(overhead).max(MIN_TIME);
            SearchLimits {
                clock: Some(clock),
                ponder: can_ponder,
                ..SearchLimits::default()
            }
        };
        self.add_go_commands(&mut limits);
        limits
    }

    fn add_go_commands(&self, limits: &mut SearchLimits) {
        if let Some(ms) = self.go_commands.movetime {
            let cap = Duration::from_millis(ms);
            if limits.movetime.map_or(true, |t| t > cap) {
                limits.movetime = Some(cap);
            }
        }
        limits.depth = self.go_commands.depth;
        limits.nodes = self.go_commands.nodes;
    }

    /// Extra wait after our move so the bot does not answer instantly in
    /// long games. Shrinks by 1% per ply after the tenth.
    pub fn fake_think_time(&self, ply: usize, my_remaining: Duration) -> Duration {
        if !self.fake_think_time || ply <= 9 {
            return Duration::ZERO;
        }
        let remaining = my_remaining.saturating_sub(self.move_overhead);
        let accel = 0.99f64.powi(ply as i32 - 10);
        remaining.mul_f64(0.025 * accel)
    }

    pub fn rate_limiting_delay(&self) -> Duration {
        self.rate_limiting_delay
    }
}
