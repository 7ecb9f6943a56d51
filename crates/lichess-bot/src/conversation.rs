//! Game chat: logging, `!` commands and greetings.

use std::sync::{Arc, Mutex};

use chess_core::shakmaty::Color;
use chess_core::GameBoard;
use engine_protocol::{Score, SearchInfo};
use tracing::info;

use crate::model::ChatLine;
use crate::sources::MoveSource;

pub const MAX_CHAT_LEN: usize = 140;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Names of queued challengers, most recent last. Shared with the controller.
pub type ChallengeQueueView = Arc<Mutex<Vec<String>>>;

/// Fills `{me}` and `{opponent}` in a greeting template.
pub fn greeting(template: &str, me: &str, opponent: &str) -> String {
    template.replace("{me}", me).replace("{opponent}", opponent)
}

/// Search statistics of our last move, shown by `!eval`.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveStats {
    pub source: MoveSource,
    pub info: SearchInfo,
    /// Principal variation in numbered SAN.
    pub pv: String,
}

impl MoveStats {
    pub fn new(source: MoveSource, info: SearchInfo, board: &GameBoard) -> Self {
        let line = pv_moves(board, &info.pv);
        let pv = numbered_line(board.ply(), board.turn(), &board.san_line(&line));
        Self { source, info, pv }
    }

    /// `Name: value` items. For chat the PV is shortened to fit one message.
    pub fn lines(&self, for_chat: bool) -> Vec<String> {
        let mut stats = vec![("Source", self.source.to_string())];
        if let Some(score) = self.info.score {
            stats.push(("Evaluation", readable_score(score)));
        }
        if let Some(wdl) = self.info.wdl {
            stats.push(("Winrate", readable_wdl(wdl)));
        }
        if let Some(depth) = self.info.depth {
            stats.push(("Depth", depth.to_string()));
        }
        if let Some(nodes) = self.info.nodes {
            stats.push(("Nodes", readable_number(nodes)));
        }
        if let Some(nps) = self.info.nps {
            stats.push(("Speed", format!("{}nps", readable_number(nps))));
        }
        let mut lines: Vec<String> = stats.iter().map(|(k, v)| format!("{k}: {v}")).collect();

        let mut pv: Vec<&str> = self.pv.split_whitespace().collect();
        if for_chat {
            let used = lines.join(", ").len() + ", Pv: ".len();
            while !pv.is_empty() && used + pv.join(" ").len() > MAX_CHAT_LEN {
                pv.pop();
            }
            if pv.last().is_some_and(|t| t.ends_with('.')) {
                pv.pop();
            }
        }
        if !pv.is_empty() {
            lines.push(format!("Pv: {}", pv.join(" ")));
        }
        lines
    }
}

/// The legal prefix of a UCI principal variation.
pub(crate) fn pv_moves(board: &GameBoard, pv: &[String]) -> Vec<chess_core::shakmaty::Move> {
    let mut scratch = board.clone();
    let mut out = Vec::new();
    for uci in pv {
        match scratch.push_uci(uci) {
            Ok(m) => out.push(m),
            Err(_) => break,
        }
    }
    out
}

/// `12. Nf3 Nc6 13. Bb5` or `12... Nc6 13. Bb5` from the side to move.
pub fn numbered_line(ply: usize, turn: Color, sans: &[String]) -> String {
    let mut number = ply / 2 + 1;
    let mut white = turn == Color::White;
    let mut out = Vec::with_capacity(sans.len() * 2);
    for (i, san) in sans.iter().enumerate() {
        if white {
            out.push(format!("{number}."));
        } else if i == 0 {
            out.push(format!("{number}..."));
        }
        out.push(san.clone());
        if !white {
            number += 1;
        }
        white = !white;
    }
    out.join(" ")
}

pub fn readable_score(score: Score) -> String {
    match score {
        Score::Cp(cp) => format!("{:.2}", f64::from(cp) / 100.0),
        Score::Mate(n) => format!("#{n}"),
    }
}

fn readable_wdl((w, d, l): (u32, u32, u32)) -> String {
    let total = f64::from(w + d + l);
    if total == 0.0 {
        return "50.0%".into();
    }
    format!("{:.1}%", (f64::from(w) + f64::from(d) / 2.0) / total * 100.0)
}

pub fn readable_number(n: u64) -> String {
    let n = n as f64;
    if n >= 1e9 {
        format!("{:.1}B", n / 1e9)
    } else if n >= 1e6 {
        format!("{:.1}M", n / 1e6)
    } else if n >= 1e3 {
        format!("{:.1}K", n / 1e3)
    } else {
        format!("{n}")
    }
}

/// What the session should do about a chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub room: String,
    pub text: String,
    /// Extend the abort timer to give the opponent time for the first move.
    pub wait: bool,
}

/// Session facts a command may need.
#[derive(Debug, Default)]
pub struct ChatContext<'a> {
    pub abortable: bool,
    pub stats: Option<&'a MoveStats>,
}

pub struct Conversation {
    game_id: String,
    me: String,
    engine_name: String,
    queue: ChallengeQueueView,
}

impl Conversation {
    pub fn new(game_id: &str, me: &str, engine_name: &str, queue: ChallengeQueueView) -> Self {
        Self {
            game_id: game_id.to_string(),
            me: me.to_string(),
            engine_name: engine_name.to_string(),
            queue,
        }
    }

    pub fn react(&self, line: &ChatLine, ctx: &ChatContext<'_>) -> Option<ChatResponse> {
        info!(game_id = %self.game_id, room = %line.room, user = %line.username, text = %line.text, "Chat");
        let command = line.text.strip_prefix('!')?.to_lowercase();
        let reply = |text: String| ChatResponse {
            room: line.room.clone(),
            text,
            wait: false,
        };

        let from_self = line.username.eq_ignore_ascii_case(&self.me);
        if command == "commands" || command == "help" {
            return Some(reply(
                "Supported commands: !wait (wait a minute for my first move), !name, \
                 !eval (or any text starting with !eval), !queue"
                    .into(),
            ));
        }
        if command == "wait" && ctx.abortable {
            return Some(ChatResponse {
                wait: true,
                ..reply("Waiting 60 seconds...".into())
            });
        }
        if command == "name" {
            return Some(reply(format!(
                "{} running {} (lichess-bot v{VERSION})",
                self.me, self.engine_name
            )));
        }
        if command.starts_with("eval") {
            if from_self || line.room == "spectator" {
                let text = ctx
                    .stats
                    .map(|s| s.lines(true).join(", "))
                    .unwrap_or_else(|| "Source: Engine".into());
                return Some(reply(text));
            }
            return Some(reply("I don't tell that to my opponent, sorry.".into()));
        }
        if command == "queue" {
            let queue = self.queue.lock().map(|q| q.clone()).unwrap_or_default();
            if queue.is_empty() {
                return Some(reply("No challenges queued.".into()));
            }
            let names: Vec<String> = queue.iter().rev().map(|n| format!("@{n}")).collect();
            return Some(reply(format!("Challenge queue: {}", names.join(", "))));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess_core::GameVariant;

    fn line(room: &str, user: &str, text: &str) -> ChatLine {
        ChatLine {
            room: room.into(),
            username: user.into(),
            text: text.into(),
        }
    }

    fn conversation() -> Conversation {
        let queue: ChallengeQueueView = Arc::new(Mutex::new(vec!["alice".into(), "bob".into()]));
        Conversation::new("g1", "MyBot", "Stockfish", queue)
    }

    fn stats() -> MoveStats {
        let board = GameBoard::new(GameVariant::Standard, None).unwrap();
        let info = SearchInfo {
            depth: Some(20),
            score: Some(Score::Cp(35)),
            nodes: Some(1_234_567),
            pv: vec!["e2e4".into(), "e7e5".into(), "g1f3".into()],
            ..SearchInfo::default()
        };
        MoveStats::new(MoveSource::Engine, info, &board)
    }

    #[test]
    fn test_greeting_substitution() {
        assert_eq!(greeting("Hi {opponent}, I am {me}", "Bot", "Alice"), "Hi Alice, I am Bot");
    }

    #[test]
    fn test_stats_lines() {
        let lines = stats().lines(false);
        assert_eq!(
            lines,
            ["Source: Engine", "Evaluation: 0.35", "Depth: 20", "Nodes: 1.2M", "Pv: 1. e4 e5 2. Nf3"]
        );
    }

    #[test]
    fn test_numbered_line_from_black() {
        let sans = ["e5".to_string(), "Nf3".to_string()];
        assert_eq!(numbered_line(1, Color::Black, &sans), "1... e5 2. Nf3");
    }

    #[test]
    fn test_eval_refused_to_opponent() {
        let stats = stats();
        let ctx = ChatContext {
            abortable: false,
            stats: Some(&stats),
        };
        let c = conversation();
        let refused = c.react(&line("player", "alice", "!eval"), &ctx).unwrap();
        assert_eq!(refused.text, "I don't tell that to my opponent, sorry.");
        let shown = c.react(&line("spectator", "carol", "!eval please"), &ctx).unwrap();
        assert!(shown.text.starts_with("Source: Engine, Evaluation: 0.35"));
        assert!(shown.text.len() <= MAX_CHAT_LEN);
    }

    #[test]
    fn test_wait_only_while_abortable() {
        let c = conversation();
        let early = c.react(&line("player", "alice", "!wait"), &ChatContext {
            abortable: true,
            stats: None,
        });
        assert!(early.unwrap().wait);
        assert!(c.react(&line("player", "alice", "!wait"), &ChatContext::default()).is_none());
    }

    #[test]
    fn test_queue_and_name() {
        let c = conversation();
        let queue = c.react(&line("player", "alice", "!queue"), &ChatContext::default()).unwrap();
        assert_eq!(queue.text, "Challenge queue: @bob, @alice");
        let name = c.react(&line("player", "alice", "!Name"), &ChatContext::default()).unwrap();
        assert!(name.text.starts_with("MyBot running Stockfish (lichess-bot v"));
        assert!(c.react(&line("player", "alice", "hello"), &ChatContext::default()).is_none());
    }
}
