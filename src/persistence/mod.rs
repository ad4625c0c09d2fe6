//! Result sinks for finished backtests.
//!
//! A sink receives the complete [`BacktestReport`]: config snapshot, trade
//! ledger with every fill, equity curve, metrics, skipped signals and data
//! faults. Decimals are stored as strings so every metric can be rebuilt.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::backtest::{BacktestReport, EquityPoint};

/// Receives finished backtest reports.
pub trait ResultSink {
    fn publish(&mut self, report: &BacktestReport) -> Result<()>;
}

/// Writes the report as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back a report written by this sink.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BacktestReport> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open report at {:?}", path.as_ref()))?;
        let report = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Malformed report at {:?}", path.as_ref()))?;
        Ok(report)
    }
}

impl ResultSink for JsonFileSink {
    fn publish(&mut self, report: &BacktestReport) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create report at {:?}", self.path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, report)?;
        writer.flush()?;

        info!(
            path = ?self.path,
            trades = report.result.trades.len(),
            "Report written"
        );
        Ok(())
    }
}

/// Closed trade as stored in the `trades` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrade {
    pub trade_id: u64,
    pub symbol: String,
    pub direction: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: Decimal,
    pub r_multiple: Decimal,
    pub exit_reason: String,
    pub fills: usize,
}

/// SQLite store holding one row per run plus its trades, fills and equity curve.
pub struct SqliteResultSink {
    conn: Connection,
    last_run_id: Option<i64>,
}

impl SqliteResultSink {
    /// Open the database, creating the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let sink = Self {
            conn,
            last_run_id: None,
        };
        sink.init_schema()?;

        info!("Result store initialized at {:?}", db_path.as_ref());
        Ok(sink)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                initial_equity TEXT NOT NULL,
                final_equity TEXT NOT NULL,
                total_trades INTEGER NOT NULL,
                config_json TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                skipped_json TEXT NOT NULL,
                risk_events_json TEXT NOT NULL,
                data_faults_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                run_id INTEGER NOT NULL REFERENCES runs(id),
                trade_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                original_stop_loss TEXT NOT NULL,
                final_stop_loss TEXT NOT NULL,
                entry_atr TEXT NOT NULL,
                regime TEXT NOT NULL,
                score INTEGER NOT NULL,
                equity_at_entry TEXT NOT NULL,
                pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                r_multiple TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                adaptive_stop_triggered INTEGER NOT NULL,
                PRIMARY KEY (run_id, trade_id)
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);

            CREATE TABLE IF NOT EXISTS fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                trade_id INTEGER NOT NULL,
                time TEXT NOT NULL,
                reason TEXT NOT NULL,
                trigger_price TEXT NOT NULL,
                fill_price TEXT NOT NULL,
                fraction TEXT NOT NULL,
                quantity TEXT NOT NULL,
                fee TEXT NOT NULL,
                pnl TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_trade ON fills(run_id, trade_id);

            CREATE TABLE IF NOT EXISTS equity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                balance TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                total_equity TEXT NOT NULL,
                drawdown TEXT NOT NULL,
                position_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_equity_run ON equity(run_id, timestamp);
            "#,
        )?;

        debug!("Result schema initialized");
        Ok(())
    }

    /// Store a report in one transaction and return its run id.
    pub fn save(&self, report: &BacktestReport) -> Result<i64> {
        let result = &report.result;
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO runs (strategy, saved_at, start_time, end_time, initial_equity, final_equity,
                              total_trades, config_json, metrics_json, skipped_json,
                              risk_events_json, data_faults_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                result.strategy,
                Utc::now().to_rfc3339(),
                result.start_time.map(|t| t.to_rfc3339()),
                result.end_time.map(|t| t.to_rfc3339()),
                result.metrics.initial_equity.to_string(),
                result.metrics.final_equity.to_string(),
                result.trades.len(),
                serde_json::to_string(&result.config)?,
                serde_json::to_string(&result.metrics)?,
                serde_json::to_string(&result.skipped_signals)?,
                serde_json::to_string(&result.risk_events)?,
                serde_json::to_string(&report.data_faults)?,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        for trade in &result.trades {
            tx.execute(
                r#"
                INSERT INTO trades (run_id, trade_id, symbol, direction, entry_time, exit_time,
                                    entry_price, exit_price, quantity, original_stop_loss,
                                    final_stop_loss, entry_atr, regime, score, equity_at_entry,
                                    pnl, fees, r_multiple, exit_reason, adaptive_stop_triggered)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                        ?18, ?19, ?20)
                "#,
                params![
                    run_id,
                    trade.id,
                    trade.symbol,
                    trade.direction.as_str(),
                    trade.entry_time.to_rfc3339(),
                    trade.exit_time.to_rfc3339(),
                    trade.entry_price.to_string(),
                    trade.exit_price.to_string(),
                    trade.quantity.to_string(),
                    trade.original_stop_loss.to_string(),
                    trade.final_stop_loss.to_string(),
                    trade.entry_atr.to_string(),
                    trade.entry_regime.as_str(),
                    trade.score,
                    trade.equity_at_entry.to_string(),
                    trade.pnl.to_string(),
                    trade.fees.to_string(),
                    trade.r_multiple.to_string(),
                    trade.exit_reason.label(),
                    trade.adaptive_stop_triggered as i32,
                ],
            )?;

            for fill in &trade.exits {
                tx.execute(
                    r#"
                    INSERT INTO fills (run_id, trade_id, time, reason, trigger_price, fill_price,
                                       fraction, quantity, fee, pnl)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                    params![
                        run_id,
                        trade.id,
                        fill.time.to_rfc3339(),
                        fill.reason.label(),
                        fill.trigger_price.to_string(),
                        fill.fill_price.to_string(),
                        fill.fraction.to_string(),
                        fill.quantity.to_string(),
                        fill.fee.to_string(),
                        fill.pnl.to_string(),
                    ],
                )?;
            }
        }

        for point in &result.equity_curve {
            tx.execute(
                r#"
                INSERT INTO equity (run_id, timestamp, balance, unrealized_pnl, total_equity,
                                    drawdown, position_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    run_id,
                    point.timestamp.to_rfc3339(),
                    point.balance.to_string(),
                    point.unrealized_pnl.to_string(),
                    point.total_equity.to_string(),
                    point.drawdown.to_string(),
                    point.position_count,
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            run_id,
            trades = result.trades.len(),
            points = result.equity_curve.len(),
            "Run saved to database"
        );
        Ok(run_id)
    }

    /// Id of the run stored by the last `publish`.
    pub fn last_run_id(&self) -> Option<i64> {
        self.last_run_id
    }

    pub fn run_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Trades of a run with their fill counts, in ledger order.
    pub fn load_trades(&self, run_id: i64) -> Result<Vec<StoredTrade>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.trade_id, t.symbol, t.direction, t.entry_time, t.exit_time, t.pnl,
                   t.r_multiple, t.exit_reason,
                   (SELECT COUNT(*) FROM fills f WHERE f.run_id = t.run_id AND f.trade_id = t.trade_id)
            FROM trades t
            WHERE t.run_id = ?1
            ORDER BY t.trade_id
            "#,
        )?;

        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, usize>(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(trade_id, symbol, direction, entry, exit, pnl, r_multiple, exit_reason, fills)| {
                    Ok(StoredTrade {
                        trade_id,
                        symbol,
                        direction,
                        entry_time: parse_time(&entry)?,
                        exit_time: parse_time(&exit)?,
                        pnl: parse_decimal(&pnl)?,
                        r_multiple: parse_decimal(&r_multiple)?,
                        exit_reason,
                        fills,
                    })
                },
            )
            .collect()
    }

    /// Equity curve of a run in timestamp order.
    pub fn load_equity(&self, run_id: i64) -> Result<Vec<EquityPoint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, balance, unrealized_pnl, total_equity, drawdown, position_count
            FROM equity
            WHERE run_id = ?1
            ORDER BY id
            "#,
        )?;

        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, usize>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(ts, balance, unrealized, total, drawdown, position_count)| {
                Ok(EquityPoint {
                    timestamp: parse_time(&ts)?,
                    balance: parse_decimal(&balance)?,
                    unrealized_pnl: parse_decimal(&unrealized)?,
                    total_equity: parse_decimal(&total)?,
                    drawdown: parse_decimal(&drawdown)?,
                    position_count,
                })
            })
            .collect()
    }
}

impl ResultSink for SqliteResultSink {
    fn publish(&mut self, report: &BacktestReport) -> Result<()> {
        let run_id = self.save(report)?;
        self.last_run_id = Some(run_id);
        info!(run_id, "Report stored");
        Ok(())
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Stored value {s:?} is not a decimal"))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s).with_context(|| format!("Stored value {s:?} is not a timestamp"))?;
    Ok(parsed.with_timezone(&Utc))
}
