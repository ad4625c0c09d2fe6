//! Historical candle loading.
//!
//! Loading is the only asynchronous stage of a run: every (symbol, timeframe)
//! series is fetched concurrently with a per-load timeout, then validated in
//! parallel. Replay starts only once everything is in memory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::validation::{validate_series, DataFault, DataFaultKind};
use crate::config::Config;
use crate::market::{Candle, CandleSeries, MarketData, SymbolSeries, Timeframe, TimeframeStack};

/// Source of historical candles. Caching is the provider's concern.
#[async_trait]
pub trait CandleProvider: Send + Sync {
    /// Candles of one series with open time in `[start, end)`, oldest first.
    /// `None` leaves that side unbounded.
    async fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>>;
}

fn in_range(candle: &Candle, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    start.map_or(true, |s| candle.timestamp >= s) && end.map_or(true, |e| candle.timestamp < e)
}

// ============================================================================
// CSV Provider
// ============================================================================

/// Reads `<dir>/<SYMBOL>_<tf>.csv`.
///
/// Expected CSV format:
/// ```csv
/// timestamp,open,high,low,close,volume
/// 2024-01-01T00:00:00Z,42000.5,42100,41950,42080.25,153.2
/// 1704067500000,42080.25,42110,42010,42030,98.7
/// ```
/// Timestamps are candle open times, RFC 3339 or epoch milliseconds.
#[derive(Debug, Clone)]
pub struct CsvCandleProvider {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    #[serde(with = "rust_decimal::serde::str")]
    open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    volume: Decimal,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.chars().all(|c| c.is_ascii_digit()) {
        let millis: i64 = raw.parse().with_context(|| format!("Invalid epoch millis: {raw}"))?;
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .with_context(|| format!("Epoch millis out of range: {raw}"));
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {raw}"))?
        .with_timezone(&Utc))
}

impl CsvCandleProvider {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir.join(format!("{}_{}.csv", symbol, timeframe))
    }

    /// Parse one CSV file into candles of the given series.
    pub fn read_file(path: &Path, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

        let mut candles = Vec::new();
        for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
            // Header is line 1
            let row = row.with_context(|| format!("Failed to parse line {} of {}", line + 2, path.display()))?;
            let timestamp = parse_timestamp(&row.timestamp)
                .with_context(|| format!("Line {} of {}", line + 2, path.display()))?;
            candles.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        Ok(candles)
    }
}

#[async_trait]
impl CandleProvider for CsvCandleProvider {
    async fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let path = self.path_for(symbol, timeframe);
        let owned_symbol = symbol.to_string();
        let candles = tokio::task::spawn_blocking(move || Self::read_file(&path, &owned_symbol, timeframe))
            .await
            .context("CSV reader task failed")??;

        let candles: Vec<Candle> = candles.into_iter().filter(|c| in_range(c, start, end)).collect();
        debug!(symbol, timeframe = %timeframe, candles = candles.len(), "Loaded CSV series");
        Ok(candles)
    }
}

// ============================================================================
// In-Memory Provider
// ============================================================================

/// Serves candles held in memory. Missing series fail to load.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    series: HashMap<(String, Timeframe), Vec<Candle>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.series.insert((symbol.to_string(), timeframe), candles);
    }

    pub fn with_series(mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        self.insert(symbol, timeframe, candles);
        self
    }
}

#[async_trait]
impl CandleProvider for InMemoryProvider {
    async fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let candles = self
            .series
            .get(&(symbol.to_string(), timeframe))
            .with_context(|| format!("No data for {} {}", symbol, timeframe))?;
        Ok(candles.iter().filter(|c| in_range(c, start, end)).cloned().collect())
    }
}

// ============================================================================
// Preload
// ============================================================================

/// What to load before a run.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub symbols: Vec<String>,
    pub timeframes: TimeframeStack,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Extra history per timeframe loaded before `start`
    pub warmup_candles: usize,
    pub max_gap_candles: u32,
    pub timeout: Duration,
}

impl LoadRequest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            symbols: config.backtest.symbols.clone(),
            timeframes: config.backtest.timeframes,
            start: config.backtest.start,
            end: config.backtest.end,
            warmup_candles: config.backtest.view_depth,
            max_gap_candles: config.data.max_gap_candles,
            timeout: Duration::from_secs(config.data.load_timeout_secs),
        }
    }

    fn load_start(&self, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        let warmup = i32::try_from(self.warmup_candles).unwrap_or(i32::MAX);
        self.start.map(|s| s - timeframe.duration() * warmup)
    }
}

/// Validated data for the surviving symbols plus every fault found.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub data: MarketData,
    pub faults: Vec<DataFault>,
}

impl LoadOutcome {
    /// Symbols excluded because of faults, sorted.
    pub fn excluded_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.faults.iter().map(|f| f.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

type Loaded = (String, Timeframe, Result<Vec<Candle>, DataFault>);

/// Load and validate every requested series.
///
/// Loads run concurrently; each is bounded by `request.timeout`. A symbol
/// with any failed load or validation fault is excluded.
pub async fn preload<P>(provider: &P, request: &LoadRequest) -> LoadOutcome
where
    P: CandleProvider + ?Sized,
{
    let stack = request.timeframes;
    let jobs = request.symbols.iter().flat_map(|symbol| {
        stack.all().into_iter().map(move |timeframe| async move {
            let load = provider.load(symbol, timeframe, request.load_start(timeframe), request.end);
            let result = match tokio::time::timeout(request.timeout, load).await {
                Ok(Ok(candles)) => Ok(candles),
                Ok(Err(e)) => Err(DataFault::new(
                    symbol,
                    timeframe,
                    DataFaultKind::LoadFailed { message: format!("{:#}", e) },
                )),
                Err(_) => Err(DataFault::new(
                    symbol,
                    timeframe,
                    DataFaultKind::LoadFailed {
                        message: format!("timed out after {:?}", request.timeout),
                    },
                )),
            };
            (symbol.clone(), timeframe, result)
        })
    });
    let loaded: Vec<Loaded> = join_all(jobs).await;

    let mut by_symbol: BTreeMap<String, Vec<(Timeframe, Result<Vec<Candle>, DataFault>)>> = BTreeMap::new();
    for (symbol, timeframe, result) in loaded {
        by_symbol.entry(symbol).or_default().push((timeframe, result));
    }

    let max_gap = request.max_gap_candles;
    let validated: Vec<Result<SymbolSeries, Vec<DataFault>>> = by_symbol
        .into_par_iter()
        .map(|(symbol, series)| assemble_symbol(&symbol, stack, series, max_gap))
        .collect();

    let mut data = MarketData::new(stack);
    let mut faults = Vec::new();
    for result in validated {
        match result {
            Ok(series) => data.insert(series),
            Err(mut symbol_faults) => {
                if let Some(first) = symbol_faults.first() {
                    warn!(symbol = %first.symbol, faults = symbol_faults.len(), "Excluding symbol");
                }
                faults.append(&mut symbol_faults);
            }
        }
    }

    info!(
        symbols = data.len(),
        excluded = faults.iter().map(|f| f.symbol.as_str()).collect::<std::collections::BTreeSet<_>>().len(),
        "Market data preloaded"
    );
    LoadOutcome { data, faults }
}

fn assemble_symbol(
    symbol: &str,
    stack: TimeframeStack,
    series: Vec<(Timeframe, Result<Vec<Candle>, DataFault>)>,
    max_gap: u32,
) -> Result<SymbolSeries, Vec<DataFault>> {
    let mut faults = Vec::new();
    let mut loaded: HashMap<Timeframe, Vec<Candle>> = HashMap::new();

    for (timeframe, result) in series {
        match result {
            Ok(candles) => {
                faults.extend(validate_series(symbol, timeframe, &candles, max_gap));
                loaded.insert(timeframe, candles);
            }
            Err(fault) => faults.push(fault),
        }
    }
    if !faults.is_empty() {
        return Err(faults);
    }

    let mut take = |timeframe: Timeframe| {
        CandleSeries::new(timeframe, loaded.remove(&timeframe).unwrap_or_default())
    };
    Ok(SymbolSeries {
        symbol: symbol.to_string(),
        htf: take(stack.htf),
        primary: take(stack.primary),
        entry: take(stack.entry),
    })
}
