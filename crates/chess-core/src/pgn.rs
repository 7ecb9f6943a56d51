//! PGN utilities: regex-based header parsing, movetext rendering with engine
//! annotations, and file naming for saved games.

use std::fmt::Write as _;

use regex::Regex;
use serde::{Deserialize, Serialize};
use shakmaty::san::SanPlus;
use shakmaty::{Color, Move, Position};

use crate::board::GameBoard;

/// How finished games are grouped into files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PgnGrouping {
    #[default]
    Game,
    Opponent,
    All,
}

/// Annotation attached to one of our moves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveComment {
    /// Evaluation from White's point of view, already formatted (`0.35`, `#-3`).
    pub eval: Option<String>,
    pub depth: Option<u32>,
    /// Principal variation starting with the move that was played.
    pub pv: Vec<Move>,
}

impl MoveComment {
    /// Formats a centipawn or mate score from the mover's perspective as a
    /// White-relative `%eval` value.
    pub fn format_eval(cp: Option<i32>, mate: Option<i32>, mover: Color) -> Option<String> {
        let sign = if mover == Color::White { 1 } else { -1 };
        if let Some(mate) = mate {
            return Some(format!("#{}", mate * sign));
        }
        cp.map(|cp| format!("{:.2}", f64::from(cp * sign) / 100.0))
    }

    fn render(&self) -> Option<String> {
        let eval = self.eval.as_ref()?;
        Some(match self.depth {
            Some(depth) => format!("{{ [%eval {eval},{depth}] }}"),
            None => format!("{{ [%eval {eval}] }}"),
        })
    }
}

/// A PGN document: ordered headers plus rendered movetext.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgnGame {
    pub headers: Vec<(String, String)>,
    pub movetext: String,
}

impl PgnGame {
    /// Parses the headers of an exported game. The movetext is kept verbatim.
    pub fn parse(pgn: &str) -> Self {
        let headers = parse_headers(pgn);
        let movetext = pgn
            .lines()
            .filter(|l| !l.trim_start().starts_with('['))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        Self { headers, movetext }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Sets `name` only when it is absent, unknown (`?`-prefixed) or an unfinished result.
    pub fn fill_header(&mut self, name: &str, value: impl Into<String>) {
        let missing = match self.header(name) {
            None => true,
            Some(v) => v.is_empty() || v.starts_with('?') || (name == "Result" && v == "*"),
        };
        if missing {
            self.set_header(name, value);
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.header("Result"), None | Some("*"))
    }
}

impl std::fmt::Display for PgnGame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, v) in &self.headers {
            writeln!(f, "[{k} \"{}\"]", v.replace('"', "'"))?;
        }
        writeln!(f)?;
        let result = self.header("Result").unwrap_or("*");
        if self.movetext.is_empty() {
            writeln!(f, "{result}")
        } else if self.movetext.ends_with(result) {
            writeln!(f, "{}", self.movetext)
        } else {
            writeln!(f, "{} {result}", self.movetext)
        }
    }
}

/// Extract all `[Key "Value"]` pairs in order.
pub fn parse_headers(pgn: &str) -> Vec<(String, String)> {
    let Ok(header_re) = Regex::new(r#"\[(\w+)\s+"([^"]*)"\]"#) else {
        return Vec::new();
    };
    header_re
        .captures_iter(pgn)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect()
}

/// Extract a string value from a PGN header (e.g. WhiteTitle, BlackTitle).
pub fn extract_header(pgn: &str, header_name: &str) -> Option<String> {
    let pattern = format!(r#"\[{}\s+"([^"]*)"\]"#, regex::escape(header_name));
    let re = Regex::new(&pattern).ok()?;
    let value = re.captures(pgn)?.get(1)?.as_str().to_string();
    if value.is_empty() { None } else { Some(value) }
}

/// Extract an integer value from a PGN header.
pub fn extract_header_int(pgn: &str, header_name: &str) -> Option<i32> {
    let pattern = format!(r#"\[{}\s+"(\d+)"\]"#, regex::escape(header_name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(pgn)?.get(1)?.as_str().parse().ok()
}

/// Renders the board's move history in SAN. `comments[ply]` annotates the move at
/// that ply; the PV, when longer than the move itself, becomes a variation.
pub fn render_movetext(board: &GameBoard, comments: &[Option<MoveComment>]) -> String {
    let mut out = String::new();
    let mut need_number = true;

    for (ply, m) in board.moves().iter().enumerate() {
        let Some(pos) = board.position_at(ply) else {
            break;
        };
        let number = pos.fullmoves().get();
        if pos.turn() == Color::White {
            let _ = write!(out, "{number}. ");
        } else if need_number {
            let _ = write!(out, "{number}... ");
        }
        need_number = false;

        let mut after = pos.clone();
        let san = SanPlus::from_move_and_play_unchecked(&mut after, *m);
        let _ = write!(out, "{san} ");

        if let Some(Some(comment)) = comments.get(ply) {
            if let Some(text) = comment.render() {
                let _ = write!(out, "{text} ");
                need_number = true;
            }
            if comment.pv.len() > 1 {
                let _ = write!(out, "{} ", render_variation(pos, &comment.pv));
                need_number = true;
            }
        }
    }

    out.trim_end().to_string()
}

fn render_variation<P: Position + Clone>(start: &P, line: &[Move]) -> String {
    let mut pos = start.clone();
    let mut parts = Vec::with_capacity(line.len());
    for (i, m) in line.iter().enumerate() {
        if !pos.is_legal(*m) {
            break;
        }
        let number = pos.fullmoves().get();
        if pos.turn() == Color::White {
            parts.push(format!("{number}."));
        } else if i == 0 {
            parts.push(format!("{number}..."));
        }
        parts.push(SanPlus::from_move_and_play_unchecked(&mut pos, *m).to_string());
    }
    format!("({})", parts.join(" "))
}

/// Removes characters that are not allowed in file names on common platforms.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect()
}

/// File name for a game under the given grouping. Unfinished games always
/// go to the per-game file.
pub fn file_name(
    grouping: PgnGrouping,
    finished: bool,
    me: &str,
    opponent: &str,
    white: &str,
    black: &str,
    game_id: &str,
) -> String {
    let name = match (grouping, finished) {
        (PgnGrouping::Game, _) | (_, false) => format!("{white} vs {black} - {game_id}.pgn"),
        (PgnGrouping::Opponent, true) => format!("{me} games vs. {opponent}.pgn"),
        (PgnGrouping::All, true) => format!("{me} games.pgn"),
    };
    sanitize_filename(&name)
}
