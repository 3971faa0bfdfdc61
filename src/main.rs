mod types;
mod exchange;
mod settings;
mod web;
mod database;
mod dashboard;
mod ml;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dashboard::{Dashboard, DashboardOptions, SignalStatus};
use database::Ledger;
use exchange::{BinanceClient, MarketDataGateway};
use ml::SignalModel;
use settings::{AppConfig, LogFormat};
use types::Symbol;
use web::{start_dashboard_server, AppState};

#[derive(Parser)]
#[command(name = "paper-trader")]
#[command(version)]
#[command(about = "Paper-trading dashboard with a persistent USDT wallet and an ML buy signal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "paper_trader.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the web dashboard
    Serve {
        /// Dashboard port (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show wallet balance and totals
    Balance,
    /// List open positions, or the trade history with --closed
    Positions {
        #[arg(long)]
        closed: bool,
    },
    /// Open a position at the latest close
    Open {
        /// Coin to buy, e.g. ETH/USDT
        #[arg(short, long)]
        symbol: String,
        /// Amount to invest in USDT
        #[arg(short, long)]
        invest: Decimal,
    },
    /// Close a position at the live price
    Close {
        #[arg(long)]
        id: i64,
    },
    /// Show price and model signal for a coin
    Analyze {
        #[arg(short, long)]
        symbol: String,
    },
    /// Show live prices for the watchlist
    Prices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(Path::new(&cli.config))?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    init_logging(level, config.logging.format)?;

    info!("Paper Trader v{}", env!("CARGO_PKG_VERSION"));

    let dashboard = build_dashboard(&config).await?;
    let ledger = dashboard.ledger().clone();

    let result = run(cli.command, dashboard, &config).await;

    ledger.close().await;
    result
}

/// `RUST_LOG` wins over the configured or `--verbose` level.
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to init logging: {}", e))?;

    Ok(())
}

async fn build_dashboard(config: &AppConfig) -> Result<Dashboard> {
    let ledger = Ledger::connect(config.database_url()?, config.database.initial_balance).await?;

    let client = BinanceClient::new(&config.market.base_url, config.market.request_timeout())?;
    let gateway = MarketDataGateway::new(Arc::new(client), config.market.cache_ttl());

    let signal = match SignalModel::load(&config.model.model_path, &config.model.config_path) {
        Ok(model) => Some(model),
        Err(e) => {
            warn!("Signal disabled: {}", e);
            None
        }
    };

    Ok(Dashboard::new(ledger, gateway, signal, DashboardOptions::from(config)))
}

async fn run(command: Commands, dashboard: Dashboard, config: &AppConfig) -> Result<()> {
    match command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.dashboard.port);
            start_dashboard_server(AppState::new(dashboard), port).await?;
        }
        Commands::Balance => show_balance(&dashboard).await?,
        Commands::Positions { closed } => show_positions(&dashboard, closed).await?,
        Commands::Open { symbol, invest } => {
            let symbol = parse_symbol(&symbol)?;
            let outcome = dashboard.open_position(&symbol, invest).await?;
            println!("{}", outcome.message);
        }
        Commands::Close { id } => {
            let outcome = dashboard.close_position(id).await?;
            println!("{}", outcome.message);
        }
        Commands::Analyze { symbol } => analyze(&dashboard, &parse_symbol(&symbol)?).await,
        Commands::Prices => show_prices(&dashboard).await,
    }

    Ok(())
}

fn parse_symbol(raw: &str) -> Result<Symbol> {
    raw.parse::<Symbol>().map_err(|e| anyhow!(e))
}

async fn show_balance(dashboard: &Dashboard) -> Result<()> {
    let summary = dashboard.summary().await?;

    println!("\n=== Wallet ===");
    println!("Balance:            {:.2} USDT", summary.balance);
    println!("Open positions:     {} ({:.2} USDT at entry)", summary.open_positions, summary.open_value_at_entry);
    println!("Total at entry:     {:.2} USDT", summary.total_at_entry());
    println!("Initial balance:    {:.2} USDT", summary.initial_balance);

    Ok(())
}

async fn show_positions(dashboard: &Dashboard, closed: bool) -> Result<()> {
    if closed {
        let positions = dashboard.closed_positions().await?;
        println!("\n=== Trade History ({}) ===", positions.len());
        for p in positions {
            let pnl = p.pnl_pct.unwrap_or_default() * Decimal::from(100);
            println!(
                "#{} {} | {} @ {:.4} -> {:.4} | {:+.2}% | closed {}",
                p.id,
                p.symbol,
                p.amount,
                p.entry_price,
                p.close_price.unwrap_or_default(),
                pnl,
                p.close_date.map(|d| d.format("%Y-%m-%d %H:%M").to_string()).unwrap_or_default()
            );
        }
        return Ok(());
    }

    let overview = dashboard.overview().await?;
    println!("\n=== Open Positions ({}) ===", overview.positions.len());
    for view in overview.positions {
        let p = &view.position;
        let marker = if view.price_available { "" } else { " (entry, no live price)" };
        println!(
            "#{} {} | {} @ {:.4} | now {:.4}{} | {:+.2}% | opened {}",
            p.id,
            p.symbol,
            p.amount,
            p.entry_price,
            view.current_price,
            marker,
            view.unrealized_pnl_pct * Decimal::from(100),
            p.open_date.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn analyze(dashboard: &Dashboard, symbol: &Symbol) {
    let analysis = dashboard.analyze(symbol).await;

    println!("\n=== {} ===", analysis.symbol);
    match (analysis.current_price, analysis.market_error) {
        (Some(price), _) => println!("Price: {:.4}", price),
        (None, Some(e)) => {
            println!("Market data unavailable: {}", e);
            return;
        }
        (None, None) => println!("Price: n/a"),
    }

    match analysis.signal {
        SignalStatus::Ready(reading) => {
            println!(
                "Buy probability: {:.2}% (threshold {:.2}%) -> {}",
                reading.probability * 100.0,
                reading.threshold * 100.0,
                reading.label
            );
        }
        SignalStatus::InsufficientData => println!("Not enough aligned history for a prediction"),
        SignalStatus::Disabled => println!("Signal model not loaded"),
        SignalStatus::Failed { reason } => println!("Signal unavailable: {}", reason),
    }
}

async fn show_prices(dashboard: &Dashboard) {
    println!("\n=== Current Prices ===");
    for entry in dashboard.watchlist_prices().await {
        match (entry.price, entry.error) {
            (Some(price), _) => println!("{}: {}", entry.symbol, price),
            (None, Some(e)) => println!("{}: unavailable ({})", entry.symbol, e),
            (None, None) => println!("{}: n/a", entry.symbol),
        }
    }
}
