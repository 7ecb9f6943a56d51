//! Engine protocol adapters: UCI and XBoard subprocess drivers plus in-process
//! homemade move generators.

pub mod error;
pub mod homemade;
pub mod options;
pub mod process;
pub mod protocol;
pub mod uci;
pub mod xboard;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::EngineError;
pub use homemade::{homemade_by_name, Homemade, HOMEMADE_ENGINES};
pub use options::{OptionSchema, OptionValue};
pub use process::{EngineCommand, EngineIo, EngineProcess};
pub use protocol::{
    ClockLimits, Engine, EngineState, OpponentInfo, PlayResult, Score, SearchInfo, SearchLimits,
};
pub use uci::{UciEngine, UciSettings};
pub use xboard::{XBoardEngine, XBoardSettings};
