use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use lichess_bot::clients::{LichessClient, Platform};
use lichess_bot::conversation::{ChallengeQueueView, VERSION};
use lichess_bot::engines::ConfiguredEngines;
use lichess_bot::registry::SessionRegistry;
use lichess_bot::session::TakebackCounts;
use lichess_bot::sources::{load_books, load_tablebases};
use lichess_bot::{Config, Controller, SessionContext};

#[derive(Debug, Parser)]
#[command(name = "lichess-bot", version, about = "Play on lichess with a local chess engine")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Debug logging unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Also write the log to this file.
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Turn the account into a bot account first.
    #[arg(short, long)]
    upgrade: bool,
}

fn init_tracing(verbose: bool, logfile: Option<&Path>) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::io::stdout.and(Mutex::new(file)))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// First Ctrl-C stops new work, the second tears the running games down.
fn spawn_signal_handler(shutdown: CancellationToken, force_quit: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Shutdown requested, press Ctrl-C again to quit immediately");
        shutdown.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Force quitting");
            force_quit.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.logfile.as_deref())?;
    info!(version = VERSION, "lichess-bot starting");

    let config = Config::load(&cli.config)?;
    let client = LichessClient::new(&config.url, &config.token)?;

    let scopes = client.token_scopes().await.context("cannot check token")?;
    if !scopes.iter().any(|s| s == "bot:play") {
        bail!("token is missing the bot:play scope");
    }

    let profile = client.profile().await.context("cannot fetch profile")?;
    let is_bot = profile.title.as_deref() == Some("BOT");
    if !is_bot {
        if !cli.upgrade {
            bail!("{} is not a bot account, run with --upgrade to convert it", profile.username);
        }
        client.upgrade_to_bot().await.context("account upgrade failed")?;
        info!(user = %profile.username, "Upgraded to a bot account");
    }
    let platform: Arc<dyn Platform> = Arc::new(client.with_username(&profile.username)?);

    let books = load_books(&config.engine.polyglot)?;
    let tablebases = load_tablebases(&config.engine.lichess_bot_tbs)?;
    let engines = Arc::new(ConfiguredEngines::new(config.engine.clone(), config.correspondence.ponder));
    let ctx = SessionContext {
        platform,
        engines,
        books,
        tablebases,
        username: profile.username.clone(),
        challenge_queue: ChallengeQueueView::default(),
        takebacks: TakebackCounts::default(),
        registry: SessionRegistry::new(config.max_games()),
        config: Arc::new(config),
    };

    let shutdown = CancellationToken::new();
    let force_quit = CancellationToken::new();
    spawn_signal_handler(shutdown.clone(), force_quit.clone());

    Controller::new(ctx, profile, shutdown, force_quit).run().await?;
    info!("Goodbye");
    Ok(())
}
