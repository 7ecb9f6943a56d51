//! Lichess variant keys and their mapping onto shakmaty rule sets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shakmaty::variant::Variant;

/// A variant as named by the platform (`variant.key` in game and challenge JSON).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameVariant {
    Standard,
    Chess960,
    FromPosition,
    Crazyhouse,
    Antichess,
    Atomic,
    Horde,
    KingOfTheHill,
    RacingKings,
    ThreeCheck,
}

impl GameVariant {
    pub const ALL: [GameVariant; 10] = [
        GameVariant::Standard,
        GameVariant::Chess960,
        GameVariant::FromPosition,
        GameVariant::Crazyhouse,
        GameVariant::Antichess,
        GameVariant::Atomic,
        GameVariant::Horde,
        GameVariant::KingOfTheHill,
        GameVariant::RacingKings,
        GameVariant::ThreeCheck,
    ];

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.key() == key)
    }

    /// Key used by the platform API and in configuration files.
    pub const fn key(self) -> &'static str {
        match self {
            GameVariant::Standard => "standard",
            GameVariant::Chess960 => "chess960",
            GameVariant::FromPosition => "fromPosition",
            GameVariant::Crazyhouse => "crazyhouse",
            GameVariant::Antichess => "antichess",
            GameVariant::Atomic => "atomic",
            GameVariant::Horde => "horde",
            GameVariant::KingOfTheHill => "kingOfTheHill",
            GameVariant::RacingKings => "racingKings",
            GameVariant::ThreeCheck => "threeCheck",
        }
    }

    /// Human readable name, as written to the PGN `Variant` header.
    pub const fn name(self) -> &'static str {
        match self {
            GameVariant::Standard => "Standard",
            GameVariant::Chess960 => "Chess960",
            GameVariant::FromPosition => "From Position",
            GameVariant::Crazyhouse => "Crazyhouse",
            GameVariant::Antichess => "Antichess",
            GameVariant::Atomic => "Atomic",
            GameVariant::Horde => "Horde",
            GameVariant::KingOfTheHill => "King of the Hill",
            GameVariant::RacingKings => "Racing Kings",
            GameVariant::ThreeCheck => "Three-check",
        }
    }

    /// The shakmaty rule set used to validate moves.
    pub const fn rules(self) -> Variant {
        match self {
            GameVariant::Standard | GameVariant::Chess960 | GameVariant::FromPosition => {
                Variant::Chess
            }
            GameVariant::Crazyhouse => Variant::Crazyhouse,
            GameVariant::Antichess => Variant::Antichess,
            GameVariant::Atomic => Variant::Atomic,
            GameVariant::Horde => Variant::Horde,
            GameVariant::KingOfTheHill => Variant::KingOfTheHill,
            GameVariant::RacingKings => Variant::RacingKings,
            GameVariant::ThreeCheck => Variant::ThreeCheck,
        }
    }

    pub const fn is_chess960(self) -> bool {
        matches!(self, GameVariant::Chess960)
    }

    /// Standard rules, regardless of the starting position.
    pub const fn is_standard_rules(self) -> bool {
        matches!(self.rules(), Variant::Chess)
    }

    /// Value for the UCI `UCI_Variant` option, `None` for orthodox chess.
    pub fn uci_variant(self) -> Option<&'static str> {
        if self.is_standard_rules() {
            None
        } else {
            Some(self.rules().uci())
        }
    }

    /// Argument of the XBoard `variant` command, `None` for orthodox chess.
    pub const fn xboard_variant(self) -> Option<&'static str> {
        match self {
            GameVariant::Standard | GameVariant::FromPosition => None,
            GameVariant::Chess960 => Some("fischerandom"),
            GameVariant::Crazyhouse => Some("crazyhouse"),
            GameVariant::Antichess => Some("giveaway"),
            GameVariant::Atomic => Some("atomic"),
            GameVariant::Horde => Some("horde"),
            GameVariant::KingOfTheHill => Some("kingofthehill"),
            GameVariant::RacingKings => Some("racingkings"),
            GameVariant::ThreeCheck => Some("3check"),
        }
    }

    /// Path segment of the lichess tablebase API, if the variant has tables.
    pub const fn tablebase_path(self) -> Option<&'static str> {
        match self {
            GameVariant::Standard | GameVariant::Chess960 | GameVariant::FromPosition => {
                Some("standard")
            }
            GameVariant::Atomic => Some("atomic"),
            GameVariant::Antichess => Some("antichess"),
            _ => None,
        }
    }

    /// Key under which opening books are configured.
    pub const fn book_key(self) -> &'static str {
        match self {
            GameVariant::FromPosition => "standard",
            other => other.key(),
        }
    }

    /// Variant parameter for the lichess explorer and cloud evaluation APIs.
    pub const fn api_variant(self) -> &'static str {
        match self {
            GameVariant::Chess960 | GameVariant::FromPosition => "standard",
            other => other.key(),
        }
    }
}

impl fmt::Display for GameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for GameVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GameVariant::from_key(s).ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Rating category of a game. Every non-standard variant has a single
/// rating regardless of the clock, so the variant key is returned for those.
pub fn game_category(variant: GameVariant, base_time: u32, increment: u32, days: u32) -> &'static str {
    let game_duration = base_time + increment * 40;
    if variant != GameVariant::Standard {
        return variant.key();
    }
    if days > 0 {
        return "correspondence";
    }
    if game_duration < 179 {
        "bullet"
    } else if game_duration < 479 {
        "blitz"
    } else if game_duration < 1499 {
        "rapid"
    } else {
        "classical"
    }
}
