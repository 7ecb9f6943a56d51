//! Syzygy tablebases read from local files.

use std::sync::Arc;

use chess_core::shakmaty::variant::{Antichess, Atomic, VariantPosition};
use chess_core::shakmaty::{Chess, Move, Position};
use chess_core::GameBoard;
use shakmaty_syzygy::{Syzygy, SyzygyError, Tablebase};
use tracing::{debug, info, warn};

use super::{TablebaseVerdict, Wdl};
use crate::config::{LocalTablebaseConfig, MoveQuality};
use crate::error::{BotError, Result};

/// Tables loaded once at startup and shared by every session.
pub type Tablebases = Arc<SyzygyTables>;

pub struct SyzygyTables {
    chess: Tablebase<Chess>,
    atomic: Tablebase<Atomic>,
    antichess: Tablebase<Antichess>,
    loaded: usize,
    max_pieces: usize,
    move_quality: MoveQuality,
}

impl Default for SyzygyTables {
    fn default() -> Self {
        Self {
            chess: Tablebase::new(),
            atomic: Tablebase::new(),
            antichess: Tablebase::new(),
            loaded: 0,
            max_pieces: 0,
            move_quality: MoveQuality::Best,
        }
    }
}

pub fn load_tablebases(config: &LocalTablebaseConfig) -> Result<Tablebases> {
    if config.gaviota.enabled {
        warn!("Gaviota tablebases are not supported, ignoring them");
    }
    let mut tables = SyzygyTables::default();
    let syzygy = &config.syzygy;
    if !syzygy.enabled {
        return Ok(Arc::new(tables));
    }
    for path in &syzygy.paths {
        let read = |e: std::io::Error| BotError::Config(format!("cannot read tablebases in {}: {e}", path.display()));
        let added = tables.chess.add_directory(path).map_err(read)?
            + tables.atomic.add_directory(path).map_err(read)?
            + tables.antichess.add_directory(path).map_err(read)?;
        info!(path = %path.display(), tables = added, "Loaded syzygy tablebases");
        tables.loaded += added;
    }
    tables.max_pieces = syzygy.max_pieces;
    tables.move_quality = syzygy.move_quality;
    Ok(Arc::new(tables))
}

impl SyzygyTables {
    pub fn move_quality(&self) -> MoveQuality {
        self.move_quality
    }

    /// Whether a lookup of this position is worth trying.
    pub fn covers(&self, board: &GameBoard) -> bool {
        self.loaded > 0
            && board.piece_count() <= self.max_pieces
            && !board.has_castling_rights()
            && matches!(
                board.position(),
                VariantPosition::Chess(_) | VariantPosition::Atomic(_) | VariantPosition::Antichess(_)
            )
    }

    /// Scores every legal move by DTZ and keeps those with the best WDL,
    /// best first. Blocks on file reads.
    pub fn lookup(&self, board: &GameBoard) -> Option<TablebaseVerdict> {
        if !self.covers(board) {
            return None;
        }
        let scored = match board.position() {
            VariantPosition::Chess(pos) => score_moves(&self.chess, pos),
            VariantPosition::Atomic(pos) => score_moves(&self.atomic, pos),
            VariantPosition::Antichess(pos) => score_moves(&self.antichess, pos),
            _ => return None,
        };
        match scored {
            Ok(scored) => best_moves(scored),
            Err(e) => {
                debug!(fen = %board.fen(), error = %e, "Syzygy lookup failed");
                None
            }
        }
    }
}

/// DTZ of each move from the mover's side, stretched by the halfmove clock
/// after the move so that the 50-move rule shows in the score.
fn score_moves<S>(tables: &Tablebase<S>, pos: &S) -> std::result::Result<Vec<(Move, i32)>, SyzygyError>
where
    S: Position + Clone + Syzygy,
{
    let mut scored = Vec::new();
    for m in pos.legal_moves() {
        let mut after = pos.clone();
        after.play_unchecked(m);
        if after.is_checkmate() {
            scored.push((m, 1));
            continue;
        }
        let dtz = -tables.probe_dtz(&after)?.ignore_rounding().0;
        scored.push((m, dtz + dtz.signum() * after.halfmoves() as i32));
    }
    Ok(scored)
}

/// Zeroing within 100 plies wins or loses, later than that the 50-move rule
/// turns it into a cursed win or blessed loss.
pub fn dtz_to_wdl(dtz: i32) -> Wdl {
    match dtz {
        i32::MIN..=-100 => -1,
        -99..=-1 => -2,
        0 => 0,
        1..=99 => 2,
        _ => 1,
    }
}

/// Moves with the best WDL, shortest win or longest loss first.
fn best_moves(scored: Vec<(Move, i32)>) -> Option<TablebaseVerdict> {
    let wdl = scored.iter().map(|&(_, dtz)| dtz_to_wdl(dtz)).max()?;
    let mut best: Vec<(Move, i32)> = scored
        .into_iter()
        .filter(|&(_, dtz)| dtz_to_wdl(dtz) == wdl)
        .collect();
    best.sort_by_key(|&(_, dtz)| dtz);
    Some(TablebaseVerdict {
        wdl,
        moves: best.into_iter().map(|(m, _)| m).collect(),
    })
}
