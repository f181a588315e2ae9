//! Cycle Farmer - Main Entry Point
//!
//! Runs the cycle loop against simulated venues. Live venue clients plug in
//! through the `MakerVenue` / `TakerVenue` traits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cycle_farmer::alert;
use cycle_farmer::config::{Config, ConfigHandle};
use cycle_farmer::control::ControlHandle;
use cycle_farmer::risk::{EmergencyUnwind, Exposure};
use cycle_farmer::exchange::{
    DryRunMaker, DryRunTaker, MakerVenue, MockMakerVenue, MockMarket, MockTakerVenue, TakerVenue,
};
use cycle_farmer::strategy::CycleFarmer;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Cycle Farmer CLI
#[derive(Parser)]
#[command(name = "cycle-farmer")]
#[command(version, about = "Delta-neutral maker/taker volume cycling")]
struct Cli {
    /// Config file (without extension)
    #[arg(short, long, default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cycle loop (default)
    Run {
        /// Start with trading paused
        #[arg(long)]
        paused: bool,

        /// Starting mid of the simulated market
        #[arg(long, default_value = "50000")]
        mid: f64,
    },
    /// Print the effective configuration and exit
    ShowConfig,
    /// Hedge the net position across both venues on the taker venue
    EmergencyHedge {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load_from(&cli.config)?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Some(Commands::ShowConfig) => show_config(&config),
        Some(Commands::Run { paused, mid }) => run(config, paused, mid).await,
        Some(Commands::EmergencyHedge { yes }) => emergency_hedge(config, yes).await,
        None => run(config, false, 50000.0).await,
    }
}

async fn run(config: Config, paused: bool, mid: f64) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Cycle Farmer v{} - Paper Trading              ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let tunables = ConfigHandle::with_persistence(config.tunables.clone(), &config.overrides_path);
    match tunables.load_overrides() {
        Ok(true) => info!(path = %config.overrides_path, "📂 Applied saved overrides"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "⚠️  Ignoring unreadable overrides"),
    }
    log_config(&config, &tunables);

    let alerts = alert::from_config(&config.alerts)?;
    let control = ControlHandle::new(tunables.clone());
    if paused {
        control.pause();
    }

    let market = MockMarket::new(cycle_farmer::utils::decimal::from_f64(mid), dec!(10));
    let maker: Arc<dyn MakerVenue> = Arc::new(DryRunMaker::new(
        Arc::new(MockMakerVenue::auto_filling(market.clone())),
        tunables.clone(),
    ));
    let taker: Arc<dyn TakerVenue> = Arc::new(DryRunTaker::new(
        Arc::new(MockTakerVenue::new(market.clone())),
        tunables.clone(),
    ));

    // Simulated price drift
    let drift = market.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            drift.random_walk(3).await;
        }
    });

    spawn_signal_handler(control.clone());
    spawn_console(control.clone());

    info!("🚀 Starting cycle loop...");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut farmer = CycleFarmer::new(config, maker, taker, alerts, control);
    farmer.run().await;

    match farmer.session_pnl().await {
        Ok(Some(pnl)) => info!(
            maker = %pnl.maker,
            taker = %pnl.taker,
            total = %pnl.total,
            cycles = farmer.cycles_completed(),
            "💰 Final session PnL"
        ),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Session PnL unavailable"),
    }

    info!("👋 Cycle Farmer shutdown complete");
    Ok(())
}

/// Recovery tool for a crash that left the legs unbalanced. Runs against
/// the same venue wiring as `run`.
async fn emergency_hedge(config: Config, yes: bool) -> Result<()> {
    info!("🚨 Emergency hedge");

    let alerts = alert::from_config(&config.alerts)?;
    let market = MockMarket::new(dec!(50000), dec!(10));
    let maker = MockMakerVenue::new(market.clone());
    let taker = MockTakerVenue::new(market);

    let exposure = Exposure::read(&maker, &taker)
        .await
        .context("Failed to read positions")?;
    println!("Maker position: {}", exposure.maker);
    println!("Taker position: {}", exposure.taker);
    println!("Net exposure:   {}", exposure.net());

    if cycle_farmer::utils::decimal::is_dust(exposure.net(), config.risk.fill_dust) {
        println!("✅ Already delta neutral, nothing to do");
        return Ok(());
    }

    if !yes {
        print!("Hedge {} on the taker venue? (y/n): ", -exposure.net());
        std::io::Write::flush(&mut std::io::stdout())?;
        let mut answer = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut answer)
            .await?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted");
            return Ok(());
        }
    }

    let unwinder = EmergencyUnwind::new(
        alerts,
        config.risk.fill_dust,
        config.instrument.price_tick,
        config.risk.emergency_slippage_bps,
    );
    match unwinder.neutralize(&maker, &taker).await? {
        Some(fill) => println!(
            "✅ Hedged {} @ {} ({})",
            fill.size, fill.price, fill.confirmation
        ),
        None => println!("✅ Already delta neutral, nothing to do"),
    }
    Ok(())
}

/// First Ctrl-C asks the loop to stop at the next safe point; a second one
/// exits immediately.
fn spawn_signal_handler(control: ControlHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("🛑 Shutdown signal received, finishing current phase (Ctrl-C again to force)");
        control.request_shutdown();

        if tokio::signal::ctrl_c().await.is_ok() {
            error!("🛑 Forced exit, positions may be left open");
            std::process::exit(130);
        }
    });
}

/// Line-based operator console on stdin.
fn spawn_console(control: ControlHandle) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut words = line.split_whitespace();
            let Some(command) = words.next() else {
                continue;
            };
            let args: Vec<&str> = words.collect();

            match command.to_lowercase().as_str() {
                "status" => println!("{}", control.status_report()),
                "balance" => println!("{}", control.balance_report()),
                "pause" => control.pause(),
                "resume" => control.resume(),
                "stop" => control.request_shutdown(),
                "settings" => println!("{}", control.config().settings_display()),
                "set" => match args.split_first() {
                    Some((key, values)) => match control.configure(key, values) {
                        Ok(change) => println!("✅ {}: {} → {}", change.key, change.old, change.new),
                        Err(e) => println!("❌ {}", e),
                    },
                    None => println!("Usage: set KEY VALUE [VALUE]"),
                },
                "help" => {
                    println!("Commands: status, balance, pause, resume, stop, settings, set KEY VALUE..., help");
                    println!("{}", ConfigHandle::help_text());
                }
                other => println!("Unknown command '{}', try 'help'", other),
            }
        }
    });
}

fn show_config(config: &Config) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "cycle-farmer.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cycle_farmer=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config, tunables: &ConfigHandle) {
    info!("📋 Configuration:");
    for line in tunables.settings_display().lines() {
        info!("   {}", line);
    }
    info!("   Symbol: {}", config.instrument.symbol);
    info!(
        "   Liquidation threshold: {}%",
        config.risk.liquidation_threshold * dec!(100)
    );
    info!("   Max fill attempts: {}", config.risk.max_fill_attempts);
    info!(
        "   Telegram alerts: {}",
        if config.alerts.telegram_bot_token.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
}
