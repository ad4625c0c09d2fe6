//! MTF Backtest - Main Entry Point

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use mtf_backtest::backtest::{
    preload, BacktestEngine, BacktestReport, CsvCandleProvider, LoadOutcome, LoadRequest,
    Verdict, WalkForwardValidator,
};
use mtf_backtest::config::Config;
use mtf_backtest::notify::LogNotifier;
use mtf_backtest::persistence::{JsonFileSink, ResultSink, SqliteResultSink};
use mtf_backtest::strategy::TrendPullbackOracle;
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// MTF Backtest CLI
#[derive(Parser)]
#[command(name = "mtf-backtest")]
#[command(version, about = "Multi-timeframe candle replay backtester")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay historical candles through the reference strategy
    Backtest {
        /// Directory holding <SYMBOL>_<tf>.csv files (default: data.data_dir)
        #[arg(short, long)]
        data: Option<String>,

        /// First day replayed (YYYY-MM-DD)
        #[arg(short, long)]
        start: Option<String>,

        /// Last day replayed, inclusive (YYYY-MM-DD)
        #[arg(short, long)]
        end: Option<String>,

        /// Write the full report as JSON
        #[arg(short, long)]
        output: Option<String>,

        /// Append the run to a SQLite database
        #[arg(long)]
        db: Option<String>,

        /// Export the equity curve as CSV
        #[arg(long)]
        equity_csv: Option<String>,
    },

    /// Train on the early part of the data, test on the rest, compare
    WalkForward {
        #[arg(short, long)]
        data: Option<String>,

        /// Share of the data span used for training
        #[arg(short, long)]
        train_fraction: Option<f64>,

        /// Write the walk-forward report as JSON
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Load and validate data without replaying it
    Validate {
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.json)?;

    let mut config = Config::load()?;

    match cli.command {
        Commands::Backtest {
            data,
            start,
            end,
            output,
            db,
            equity_csv,
        } => {
            if let Some(start) = start {
                config.backtest.start = Some(parse_day(&start)?);
            }
            if let Some(end) = end {
                config.backtest.end = Some(parse_day(&end)? + Duration::days(1));
            }
            run_backtest(config, data, output, db, equity_csv).await
        }
        Commands::WalkForward {
            data,
            train_fraction,
            output,
        } => {
            if let Some(fraction) = train_fraction {
                config.walk_forward.train_fraction = fraction;
            }
            run_walk_forward(config, data, output).await
        }
        Commands::Validate { data } => run_validate(config, data).await,
    }
}

/// Initialize logging to stdout and hourly rolling files.
fn init_logging(json: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "mtf-backtest.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("mtf_backtest=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

fn parse_day(s: &str) -> Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid date '{}': {}", s, e))?;
    match day.and_hms_opt(0, 0, 0) {
        Some(t) => Ok(t.and_utc()),
        None => bail!("Invalid date '{}'", s),
    }
}

/// Load every configured series from CSV and log what was excluded.
async fn load(config: &Config, data_dir: Option<String>) -> Result<LoadOutcome> {
    let dir = data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    info!("📊 Loading data from: {}", dir);

    let provider = CsvCandleProvider::new(&dir);
    let outcome = preload(&provider, &LoadRequest::from_config(config)).await;

    for fault in &outcome.faults {
        warn!("   ⚠️  {}", fault);
    }
    let excluded = outcome.excluded_symbols();
    if !excluded.is_empty() {
        warn!("   Excluded symbols: {}", excluded.join(", "));
    }
    info!("   Symbols ready: {}", outcome.data.len());

    if outcome.data.is_empty() {
        bail!("No symbol survived data validation");
    }
    Ok(outcome)
}

fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Initial Capital: ${}", config.backtest.initial_capital);
    let tf = config.backtest.timeframes;
    info!("   Timeframes: {} / {} / {}", tf.htf, tf.primary, tf.entry);
    info!("   Risk Per Trade: {}", config.risk.risk_per_trade);
    info!("   Max Open Positions: {}", config.risk.max_open_positions);
    info!("   Max Weekly Loss: {}", config.risk.max_weekly_loss);
    info!(
        "   Slippage / Fee: {} / {}",
        config.execution.slippage, config.execution.taker_fee
    );
}

async fn run_backtest(
    config: Config,
    data_dir: Option<String>,
    output: Option<String>,
    db: Option<String>,
    equity_csv: Option<String>,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    config.validate()?;
    log_config(&config);
    let outcome = load(&config, data_dir).await?;

    let oracle = TrendPullbackOracle::new(config.strategy.clone());
    let engine = BacktestEngine::new(config, oracle)?.with_notifier(Arc::new(LogNotifier));
    let result = engine.run(&outcome.data)?;

    println!("\n{}", result.summary());

    if let Some(path) = equity_csv {
        result.equity_to_csv(&path)?;
        info!("📁 Equity curve saved to: {}", path);
    }

    let report = BacktestReport::new(result, outcome.faults);
    if let Some(path) = output {
        JsonFileSink::new(&path).publish(&report)?;
        info!("📁 Report saved to: {}", path);
    }
    if let Some(path) = db {
        let mut sink = SqliteResultSink::new(&path)?;
        sink.publish(&report)?;
        info!("📁 Run stored in: {}", path);
    }

    Ok(())
}

async fn run_walk_forward(config: Config, data_dir: Option<String>, output: Option<String>) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              WALK-FORWARD MODE                             ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    config.validate()?;
    log_config(&config);
    let outcome = load(&config, data_dir).await?;

    let oracle = TrendPullbackOracle::new(config.strategy.clone());
    let engine = BacktestEngine::new(config, oracle)?.with_notifier(Arc::new(LogNotifier));
    let validator = WalkForwardValidator::from_engine(engine);
    let report = validator.run(&outcome.data)?;

    println!("\n{}", report.summary());

    if let Some(path) = output {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.flush()?;
        info!("📁 Report saved to: {}", path);
    }

    if report.assessment.verdict == Verdict::Fail {
        warn!("❌ Strategy failed out-of-sample validation");
    }
    Ok(())
}

async fn run_validate(config: Config, data_dir: Option<String>) -> Result<()> {
    let dir = data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    let provider = CsvCandleProvider::new(&dir);
    let outcome = preload(&provider, &LoadRequest::from_config(&config)).await;

    println!("Symbols ready: {}", outcome.data.len());
    if outcome.faults.is_empty() {
        println!("No data faults found in {}", dir);
        return Ok(());
    }

    println!("Data faults ({}):", outcome.faults.len());
    for fault in &outcome.faults {
        println!("  {}", fault);
    }
    Ok(())
}
