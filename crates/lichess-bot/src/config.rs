//! Bot configuration, loaded from a TOML file with the token optionally taken
//! from the environment.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chess_core::pgn::PgnGrouping;
use chess_core::GameVariant;
use engine_protocol::{EngineCommand, OptionValue, HOMEMADE_ENGINES};
use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::error::BotError;

pub const TOKEN_ENV: &str = "LICHESS_BOT_TOKEN";

/// Accepts an integer, `inf`, or the string `"inf"`; infinity becomes `u32::MAX`.
fn limit<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(i) => Ok(i.clamp(0, i64::from(u32::MAX)) as u32),
        Raw::Float(f) if f.is_infinite() && f > 0.0 => Ok(u32::MAX),
        Raw::Float(f) => Ok(f.max(0.0).min(f64::from(u32::MAX)) as u32),
        Raw::Str(s) if s.eq_ignore_ascii_case("inf") => Ok(u32::MAX),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineProtocol {
    #[default]
    Uci,
    Xboard,
    Homemade,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveQuality {
    All,
    #[default]
    Good,
    Best,
    Suggest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookSelection {
    #[default]
    WeightedRandom,
    UniformRandom,
    BestMove,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplorerSource {
    #[default]
    Masters,
    Lichess,
    Player,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplorerSort {
    #[default]
    Winrate,
    GamesPlayed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgtbSource {
    #[default]
    Lichess,
    Chessdb,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Best,
    First,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    #[default]
    None,
    Human,
    Bot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeFilter {
    #[default]
    None,
    Coarse,
    Fine,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingPreference {
    #[default]
    None,
    High,
    Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeMode {
    Casual,
    Rated,
    #[default]
    Random,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GoCommands {
    /// Milliseconds.
    pub movetime: Option<u64>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrawOrResignConfig {
    pub resign_enabled: bool,
    pub resign_score: i32,
    pub resign_moves: u32,
    pub resign_for_egtb_minus_two: bool,
    pub offer_draw_enabled: bool,
    pub offer_draw_score: i32,
    pub offer_draw_moves: u32,
    pub offer_draw_pieces: usize,
    pub offer_draw_for_egtb_zero: bool,
}

impl Default for DrawOrResignConfig {
    fn default() -> Self {
        Self {
            resign_enabled: false,
            resign_score: -1000,
            resign_moves: 3,
            resign_for_egtb_minus_two: true,
            offer_draw_enabled: false,
            offer_draw_score: 0,
            offer_draw_moves: 5,
            offer_draw_pieces: 10,
            offer_draw_for_egtb_zero: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolyglotConfig {
    pub enabled: bool,
    /// Book files per variant key, tried in order.
    pub book: BTreeMap<String, Vec<PathBuf>>,
    pub min_weight: u16,
    pub selection: BookSelection,
    pub max_depth: u32,
}

impl Default for PolyglotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            book: BTreeMap::new(),
            min_weight: 1,
            selection: BookSelection::WeightedRandom,
            max_depth: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChessDbBookConfig {
    pub enabled: bool,
    pub min_time: u64,
    pub move_quality: MoveQuality,
    pub min_depth: u32,
}

impl Default for ChessDbBookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_time: 20,
            move_quality: MoveQuality::Good,
            min_depth: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudAnalysisConfig {
    pub enabled: bool,
    pub min_time: u64,
    pub move_quality: MoveQuality,
    pub max_score_difference: i32,
    pub min_depth: u32,
    pub min_knodes: u64,
}

impl Default for CloudAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_time: 20,
            move_quality: MoveQuality::Best,
            max_score_difference: 50,
            min_depth: 20,
            min_knodes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpeningExplorerConfig {
    pub enabled: bool,
    pub min_time: u64,
    pub source: ExplorerSource,
    pub player_name: Option<String>,
    pub sort: ExplorerSort,
    pub min_games: u64,
}

impl Default for OpeningExplorerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_time: 20,
            source: ExplorerSource::Masters,
            player_name: None,
            sort: ExplorerSort::Winrate,
            min_games: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OnlineEgtbConfig {
    pub enabled: bool,
    pub min_time: u64,
    pub max_pieces: usize,
    pub source: EgtbSource,
    pub move_quality: MoveQuality,
}

impl Default for OnlineEgtbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_time: 20,
            max_pieces: 7,
            source: EgtbSource::Lichess,
            move_quality: MoveQuality::Best,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OnlineMovesConfig {
    pub max_out_of_book_moves: u32,
    pub max_retries: u32,
    #[serde(deserialize_with = "limit")]
    pub max_depth: u32,
    pub chessdb_book: ChessDbBookConfig,
    pub lichess_cloud_analysis: CloudAnalysisConfig,
    pub lichess_opening_explorer: OpeningExplorerConfig,
    pub online_egtb: OnlineEgtbConfig,
}

impl Default for OnlineMovesConfig {
    fn default() -> Self {
        Self {
            max_out_of_book_moves: 10,
            max_retries: 2,
            max_depth: u32::MAX,
            chessdb_book: ChessDbBookConfig::default(),
            lichess_cloud_analysis: CloudAnalysisConfig::default(),
            lichess_opening_explorer: OpeningExplorerConfig::default(),
            online_egtb: OnlineEgtbConfig::default(),
        }
    }
}

/// Tablebase files on this machine, consulted before any online source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocalTablebaseConfig {
    pub syzygy: TablebaseFilesConfig,
    pub gaviota: TablebaseFilesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TablebaseFilesConfig {
    pub enabled: bool,
    /// Directories holding the table files.
    pub paths: Vec<PathBuf>,
    pub max_pieces: usize,
    pub move_quality: MoveQuality,
}

impl Default for TablebaseFilesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: Vec::new(),
            max_pieces: 7,
            move_quality: MoveQuality::Best,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dir: PathBuf,
    pub name: String,
    pub working_dir: Option<PathBuf>,
    pub protocol: EngineProtocol,
    pub interpreter: Option<String>,
    pub interpreter_options: Vec<String>,
    /// Extra `--key=value` command-line arguments.
    pub engine_options: BTreeMap<String, OptionValue>,
    pub silence_stderr: bool,
    pub ponder: bool,
    pub handshake_timeout: u64,
    pub response_grace: u64,
    pub max_search_time: u64,
    pub uci_options: BTreeMap<String, OptionValue>,
    pub xboard_options: BTreeMap<String, OptionValue>,
    pub homemade_options: BTreeMap<String, OptionValue>,
    pub go_commands: GoCommands,
    pub draw_or_resign: DrawOrResignConfig,
    pub polyglot: PolyglotConfig,
    pub online_moves: OnlineMovesConfig,
    pub lichess_bot_tbs: LocalTablebaseConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./engines"),
            name: String::new(),
            working_dir: None,
            protocol: EngineProtocol::Uci,
            interpreter: None,
            interpreter_options: Vec::new(),
            engine_options: BTreeMap::new(),
            silence_stderr: false,
            ponder: false,
            handshake_timeout: 30,
            response_grace: 10,
            max_search_time: 300,
            uci_options: BTreeMap::new(),
            xboard_options: BTreeMap::new(),
            homemade_options: BTreeMap::new(),
            go_commands: GoCommands::default(),
            draw_or_resign: DrawOrResignConfig::default(),
            polyglot: PolyglotConfig::default(),
            online_moves: OnlineMovesConfig::default(),
            lichess_bot_tbs: LocalTablebaseConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    /// The command line that starts the engine.
    pub fn command(&self) -> EngineCommand {
        let engine_args = self
            .engine_options
            .iter()
            .map(|(k, v)| format!("--{k}={v}"));
        let (program, args) = match &self.interpreter {
            Some(interpreter) => {
                let mut args = self.interpreter_options.clone();
                args.push(self.path().display().to_string());
                args.extend(engine_args);
                (PathBuf::from(interpreter), args)
            }
            None => (self.path(), engine_args.collect()),
        };
        EngineCommand {
            program,
            args,
            working_dir: self.working_dir.clone(),
            silence_stderr: self.silence_stderr,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn response_grace(&self) -> Duration {
        Duration::from_secs(self.response_grace)
    }

    pub fn max_search_time(&self) -> Duration {
        Duration::from_secs(self.max_search_time)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrespondenceConfig {
    /// Seconds of thinking per correspondence move.
    pub move_time: u64,
    pub checkin_period: u64,
    pub disconnect_time: u64,
    pub ponder: bool,
}

impl Default for CorrespondenceConfig {
    fn default() -> Self {
        Self {
            move_time: 60,
            checkin_period: 600,
            disconnect_time: 300,
            ponder: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub concurrency: usize,
    pub sort_by: SortBy,
    pub preference: Preference,
    pub accept_bot: bool,
    pub only_bot: bool,
    #[serde(deserialize_with = "limit")]
    pub max_increment: u32,
    pub min_increment: u32,
    #[serde(deserialize_with = "limit")]
    pub max_base: u32,
    pub min_base: u32,
    #[serde(deserialize_with = "limit")]
    pub max_days: u32,
    pub min_days: u32,
    pub variants: Vec<GameVariant>,
    pub time_controls: Vec<String>,
    pub modes: Vec<String>,
    pub bullet_requires_increment: bool,
    pub block_list: Vec<String>,
    pub online_block_list: Vec<String>,
    pub allow_list: Vec<String>,
    pub max_recent_bot_challenges: Option<usize>,
    /// Seconds.
    pub recent_bot_challenge_age: Option<u64>,
    pub max_simultaneous_games_per_user: usize,
    pub min_rating: Option<u32>,
    pub max_rating: Option<u32>,
    pub max_rating_diff: Option<u32>,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            sort_by: SortBy::Best,
            preference: Preference::None,
            accept_bot: false,
            only_bot: false,
            max_increment: 180,
            min_increment: 0,
            max_base: u32::MAX,
            min_base: 0,
            max_days: u32::MAX,
            min_days: 1,
            variants: vec![GameVariant::Standard],
            time_controls: vec!["blitz".into(), "rapid".into(), "classical".into()],
            modes: vec!["casual".into(), "rated".into()],
            bullet_requires_increment: false,
            block_list: Vec::new(),
            online_block_list: Vec::new(),
            allow_list: Vec::new(),
            max_recent_bot_challenges: None,
            recent_bot_challenge_age: None,
            max_simultaneous_games_per_user: 5,
            min_rating: None,
            max_rating: None,
            max_rating_diff: None,
        }
    }
}

/// Settings that a named matchmaking override may replace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// A variant key or `random`.
    pub challenge_variant: String,
    pub challenge_initial_time: Vec<u32>,
    pub challenge_increment: Vec<u32>,
    pub challenge_days: Vec<u32>,
    pub opponent_min_rating: u32,
    pub opponent_max_rating: u32,
    pub opponent_rating_difference: Option<u32>,
    pub rating_preference: RatingPreference,
    pub opponent_allow_tos_violation: bool,
    pub challenge_mode: ChallengeMode,
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            challenge_variant: "random".into(),
            challenge_initial_time: vec![60],
            challenge_increment: vec![2],
            challenge_days: Vec::new(),
            opponent_min_rating: 600,
            opponent_max_rating: 4000,
            opponent_rating_difference: None,
            rating_preference: RatingPreference::None,
            opponent_allow_tos_violation: true,
            challenge_mode: ChallengeMode::Random,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatchmakingOverride {
    pub challenge_variant: Option<String>,
    pub challenge_initial_time: Option<Vec<u32>>,
    pub challenge_increment: Option<Vec<u32>>,
    pub challenge_days: Option<Vec<u32>>,
    pub opponent_min_rating: Option<u32>,
    pub opponent_max_rating: Option<u32>,
    pub opponent_rating_difference: Option<u32>,
    pub rating_preference: Option<RatingPreference>,
    pub opponent_allow_tos_violation: Option<bool>,
    pub challenge_mode: Option<ChallengeMode>,
}

impl MatchmakingSettings {
    pub fn with_override(&self, o: &MatchmakingOverride) -> Self {
        Self {
            challenge_variant: o.challenge_variant.clone().unwrap_or_else(|| self.challenge_variant.clone()),
            challenge_initial_time: o
                .challenge_initial_time
                .clone()
                .unwrap_or_else(|| self.challenge_initial_time.clone()),
            challenge_increment: o
                .challenge_increment
                .clone()
                .unwrap_or_else(|| self.challenge_increment.clone()),
            challenge_days: o.challenge_days.clone().unwrap_or_else(|| self.challenge_days.clone()),
            opponent_min_rating: o.opponent_min_rating.unwrap_or(self.opponent_min_rating),
            opponent_max_rating: o.opponent_max_rating.unwrap_or(self.opponent_max_rating),
            opponent_rating_difference: o.opponent_rating_difference.or(self.opponent_rating_difference),
            rating_preference: o.rating_preference.unwrap_or(self.rating_preference),
            opponent_allow_tos_violation: o
                .opponent_allow_tos_violation
                .unwrap_or(self.opponent_allow_tos_violation),
            challenge_mode: o.challenge_mode.unwrap_or(self.challenge_mode),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    pub allow_matchmaking: bool,
    pub allow_during_games: bool,
    /// Minutes of inactivity before a challenge is sent.
    pub challenge_timeout: u64,
    pub challenge_filter: ChallengeFilter,
    pub block_list: Vec<String>,
    pub online_block_list: Vec<String>,
    #[serde(flatten)]
    pub settings: MatchmakingSettings,
    pub overrides: BTreeMap<String, MatchmakingOverride>,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            allow_matchmaking: false,
            allow_during_games: false,
            challenge_timeout: 30,
            challenge_filter: ChallengeFilter::None,
            block_list: Vec::new(),
            online_block_list: Vec::new(),
            settings: MatchmakingSettings::default(),
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GreetingConfig {
    pub hello: String,
    pub goodbye: String,
    pub hello_spectators: String,
    pub goodbye_spectators: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub token: String,
    pub url: String,
    /// Seconds without an opponent move before aborting during the first plies.
    pub abort_time: u64,
    pub fake_think_time: bool,
    /// Milliseconds slept after every move.
    pub rate_limiting_delay: u64,
    /// Milliseconds reserved per move for network latency.
    pub move_overhead: u64,
    pub max_takebacks_accepted: u32,
    pub quit_after_all_games_finish: bool,
    pub shutdown_timeout: u64,
    pub pgn_directory: Option<PathBuf>,
    pub pgn_file_grouping: PgnGrouping,
    pub engine: EngineConfig,
    pub correspondence: CorrespondenceConfig,
    pub challenge: ChallengeConfig,
    pub matchmaking: MatchmakingConfig,
    pub greeting: GreetingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            url: "https://lichess.org/".into(),
            abort_time: 20,
            fake_think_time: false,
            rate_limiting_delay: 0,
            move_overhead: 1000,
            max_takebacks_accepted: 0,
            quit_after_all_games_finish: false,
            shutdown_timeout: 10,
            pgn_directory: None,
            pgn_file_grouping: PgnGrouping::Game,
            engine: EngineConfig::default(),
            correspondence: CorrespondenceConfig::default(),
            challenge: ChallengeConfig::default(),
            matchmaking: MatchmakingConfig::default(),
            greeting: GreetingConfig::default(),
        }
    }
}

const TIME_CONTROLS: [&str; 6] = ["ultraBullet", "bullet", "blitz", "rapid", "classical", "correspondence"];

impl Config {
    /// Read and validate the configuration file. The token may come from
    /// `LICHESS_BOT_TOKEN` instead of the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BotError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml(&text)?;
        if config.token.is_empty() {
            if let Ok(token) = env::var(TOKEN_ENV) {
                info!("Using token from {TOKEN_ENV}");
                config.token = token;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating or consulting the environment.
    pub fn from_toml(text: &str) -> Result<Self, BotError> {
        let mut config: Config = toml::from_str(text)?;
        if !config.url.ends_with('/') {
            config.url.push('/');
        }
        Ok(config)
    }

    pub fn max_games(&self) -> usize {
        self.challenge.concurrency
    }

    pub fn abort_time(&self) -> Duration {
        Duration::from_secs(self.abort_time)
    }

    pub fn move_overhead(&self) -> Duration {
        Duration::from_millis(self.move_overhead)
    }

    pub fn rate_limiting_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limiting_delay)
    }

    pub fn validate(&self) -> Result<(), BotError> {
        let fail = |msg: String| Err(BotError::Config(msg));

        if self.token.trim().is_empty() {
            return fail(format!("no token: set `token` or {TOKEN_ENV}"));
        }
        if self.challenge.concurrency < 1 {
            return fail("challenge.concurrency must be at least 1".into());
        }

        let engine = &self.engine;
        match engine.protocol {
            EngineProtocol::Uci | EngineProtocol::Xboard => {
                if engine.name.is_empty() {
                    return fail("engine.name is required".into());
                }
                if !engine.path().is_file() {
                    return fail(format!("engine not found at {}", engine.path().display()));
                }
            }
            EngineProtocol::Homemade => {
                if !HOMEMADE_ENGINES.contains(&engine.name.as_str()) {
                    return fail(format!(
                        "unknown homemade engine {:?}, expected one of {HOMEMADE_ENGINES:?}",
                        engine.name
                    ));
                }
            }
        }

        if engine.polyglot.enabled {
            for (variant, books) in &engine.polyglot.book {
                for book in books {
                    if !book.is_file() {
                        return fail(format!("{variant} book not found at {}", book.display()));
                    }
                }
            }
        }

        let go = &engine.go_commands;
        if go.movetime == Some(0) || go.depth == Some(0) || go.nodes == Some(0) {
            return fail("engine.go_commands values must be positive".into());
        }

        let online = &engine.online_moves;
        if matches!(online.chessdb_book.move_quality, MoveQuality::Suggest) {
            return fail("chessdb_book.move_quality must be all, good or best".into());
        }
        if !matches!(online.lichess_cloud_analysis.move_quality, MoveQuality::Good | MoveQuality::Best) {
            return fail("lichess_cloud_analysis.move_quality must be good or best".into());
        }
        for (name, quality) in [
            ("online_egtb", online.online_egtb.move_quality),
            ("lichess_bot_tbs.syzygy", engine.lichess_bot_tbs.syzygy.move_quality),
        ] {
            if !matches!(quality, MoveQuality::Best | MoveQuality::Suggest) {
                return fail(format!("{name}.move_quality must be best or suggest"));
            }
        }
        let syzygy = &engine.lichess_bot_tbs.syzygy;
        if syzygy.enabled {
            if syzygy.paths.is_empty() {
                return fail("lichess_bot_tbs.syzygy.paths is required when enabled".into());
            }
            if let Some(missing) = syzygy.paths.iter().find(|p| !p.is_dir()) {
                return fail(format!("syzygy directory not found at {}", missing.display()));
            }
        }

        let c = &self.challenge;
        for (name, min, max) in [
            ("increment", c.min_increment, c.max_increment),
            ("base", c.min_base, c.max_base),
            ("days", c.min_days, c.max_days),
            (
                "rating",
                c.min_rating.unwrap_or(0),
                c.max_rating.unwrap_or(u32::MAX),
            ),
            (
                "opponent rating",
                self.matchmaking.settings.opponent_min_rating,
                self.matchmaking.settings.opponent_max_rating,
            ),
        ] {
            if min > max {
                return fail(format!("min {name} {min} is greater than max {max}"));
            }
        }
        for tc in &c.time_controls {
            if !TIME_CONTROLS.contains(&tc.as_str()) {
                return fail(format!("unknown time control {tc:?}"));
            }
        }
        for mode in &c.modes {
            if mode != "casual" && mode != "rated" {
                return fail(format!("unknown mode {mode:?}"));
            }
        }

        let mm = &self.matchmaking;
        let variants = std::iter::once(&mm.settings.challenge_variant)
            .chain(mm.overrides.values().filter_map(|o| o.challenge_variant.as_ref()));
        for variant in variants {
            if variant != "random" && GameVariant::from_key(variant).is_none() {
                return fail(format!("unknown matchmaking variant {variant:?}"));
            }
        }

        Ok(())
    }
}
