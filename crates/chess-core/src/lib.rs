pub mod board;
pub mod pgn;
pub mod polyglot;
pub mod variant;

pub use board::{BoardError, GameBoard, SyncOutcome, STARTING_FEN};
pub use variant::{game_category, GameVariant};

pub use shakmaty;
