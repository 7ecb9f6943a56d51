//! Saving played games as PGN.

use std::path::{Path, PathBuf};

use chess_core::pgn::{file_name, render_movetext, MoveComment, PgnGame, PgnGrouping};
use chess_core::GameBoard;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{Game, Player};

/// Headers of the server's export, completed from local data, with the
/// movetext rendered from our board and annotations.
pub fn build_pgn(game: &Game, board: &GameBoard, comments: &[Option<MoveComment>], exported: Option<&str>) -> PgnGame {
    let mut pgn = exported.map(PgnGame::parse).unwrap_or_default();
    pgn.fill_header("Event", game.pgn_event());
    pgn.fill_header("Site", game.short_url());
    pgn.fill_header("Date", game.created_at.format("%Y.%m.%d").to_string());
    pgn.fill_header("White", game.white.display_name());
    pgn.fill_header("Black", game.black.display_name());
    pgn.fill_header("Result", game.result());
    fill_player(&mut pgn, "White", &game.white);
    fill_player(&mut pgn, "Black", &game.black);
    if !game.is_correspondence() {
        pgn.fill_header("TimeControl", format!("{}+{}", game.base, game.increment));
    }
    pgn.fill_header("UTCDate", game.created_at.format("%Y.%m.%d").to_string());
    pgn.fill_header("UTCTime", game.created_at.format("%H:%M:%S").to_string());
    pgn.fill_header("Variant", game.variant.name());
    if !board.is_standard_start() {
        pgn.fill_header("SetUp", "1");
        pgn.fill_header("FEN", board.initial_fen());
    }
    pgn.movetext = render_movetext(board, comments);
    pgn
}

fn fill_player(pgn: &mut PgnGame, color: &str, player: &Player) {
    let elo = player.rating.map_or_else(|| "?".to_string(), |r| r.to_string());
    pgn.fill_header(&format!("{color}Elo"), elo);
    if let Some(title) = &player.title {
        pgn.fill_header(&format!("{color}Title"), title.clone());
    }
}

#[derive(Debug, Clone)]
pub struct PgnRecorder {
    dir: PathBuf,
    grouping: PgnGrouping,
}

impl PgnRecorder {
    pub fn new(dir: impl Into<PathBuf>, grouping: PgnGrouping) -> Self {
        Self {
            dir: dir.into(),
            grouping,
        }
    }

    fn path(&self, game: &Game, finished: bool) -> PathBuf {
        self.dir.join(file_name(
            self.grouping,
            finished,
            &game.me().display_name(),
            &game.opponent().display_name(),
            &game.white.display_name(),
            &game.black.display_name(),
            &game.id,
        ))
    }

    /// Writes the game. Finished games in grouped files are appended and the
    /// per-game file of the unfinished game is removed.
    pub async fn save(&self, game: &Game, pgn: &PgnGame) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let finished = pgn.is_finished();
        let path = self.path(game, finished);
        let text = pgn.to_string();

        if self.grouping == PgnGrouping::Game || !finished {
            tokio::fs::write(&path, text).await?;
        } else {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(format!("{text}\n").as_bytes()).await?;
            file.flush().await?;
            remove_if_present(&self.path(game, false)).await?;
        }
        info!(game_id = %game.id, path = %path.display(), "Saved PGN");
        Ok(path)
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed per-game PGN");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
