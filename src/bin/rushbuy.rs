//! rushbuy CLI: run the scheduler against a fixture file, or check the
//! breaking service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rushbuy::captcha::{BreakingService, ChallengeImages, HttpBreaker};
use rushbuy::config::Config;
use rushbuy::engine::Engine;
use rushbuy::event::TracingBus;
use rushbuy::notify::LogNotifier;
use rushbuy::provider::{DryRunProvider, DryRunTokens};
use rushbuy::store::MemoryStore;
use rushbuy::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "rushbuy", about = "Multi-account purchase scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler in dry-run mode until Ctrl-C or every target completes
    Run {
        /// TOML file with [[accounts]] and [[targets]]
        #[arg(long)]
        fixtures: PathBuf,
        /// Make every dry-run preflight ask for a verification token.
        /// Tokens come from a local dry-run source, not a browser.
        #[arg(long)]
        need_captcha: bool,
    },
    /// Send a challenge image pair to the breaking service and print the offset
    BreakerCheck {
        /// Background image file
        #[arg(long)]
        background: PathBuf,
        /// Slider piece image file
        #[arg(long)]
        slider: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    match cli.command {
        Command::Run {
            fixtures,
            need_captcha,
        } => cmd_run(config, fixtures, need_captcha).await,
        Command::BreakerCheck { background, slider } => {
            cmd_breaker_check(config, background, slider).await
        }
    }
}

async fn cmd_run(config: Config, fixtures: PathBuf, need_captcha: bool) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::from_toml_file(&fixtures)?);
    let provider = Arc::new(DryRunProvider::new(need_captcha));
    let stop_timeout = config.engine.stop_timeout;

    let mut builder = Engine::builder(store, provider.clone())
        .notifier(Arc::new(LogNotifier))
        .bus(Arc::new(TracingBus))
        .config(config.engine)
        .limits(config.limits)
        .notify_settings(config.notify);
    if need_captcha {
        builder = builder.captcha(Arc::new(DryRunTokens::default()));
    }
    let engine = builder.build();
    engine.start_all().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if !engine.is_running() {
                    break;
                }
            }
        }
    }
    engine.stop_all(stop_timeout).await?;

    for state in engine.task_states() {
        println!(
            "{:<20}  {:>4}/{:<4}  {}",
            state.target_id,
            state.purchased_qty,
            state.target_qty,
            state.last_error.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} order(s) created", provider.orders_created());
    Ok(())
}

async fn cmd_breaker_check(
    config: Config,
    background: PathBuf,
    slider: PathBuf,
) -> anyhow::Result<()> {
    let Some(breaker_config) = config.breaker else {
        anyhow::bail!("RUSHBUY_BREAKER_URL is not set");
    };
    let breaker = HttpBreaker::new(breaker_config)?;
    let images = ChallengeImages {
        background: tokio::fs::read(&background).await?,
        slider: tokio::fs::read(&slider).await?,
    };
    let offset = breaker.locate(&images).await?;
    println!("offset: {offset}");
    Ok(())
}
