//! Closed-trade ledger entries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::machine::{ExitFill, ExitReason, Position, StopChange};
use crate::market::{Direction, Regime};
use crate::utils::decimal::{safe_div, weighted_average};

/// A fully closed position as it appears in the trade ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    /// Quantity-weighted average exit fill
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub original_stop_loss: Decimal,
    pub final_stop_loss: Decimal,
    pub entry_atr: Decimal,
    pub entry_regime: Regime,
    pub score: u32,
    pub equity_at_entry: Decimal,
    /// Net of entry and exit fees
    pub pnl: Decimal,
    pub fees: Decimal,
    pub r_multiple: Decimal,
    /// Reason of the final exit slice
    pub exit_reason: ExitReason,
    pub adaptive_stop_triggered: bool,
    pub exits: Vec<ExitFill>,
    pub stop_history: Vec<StopChange>,
}

impl TradeRecord {
    /// Build the ledger entry for a closed position. `None` while any size remains.
    pub fn from_position(position: &Position) -> Option<Self> {
        if position.is_open() {
            return None;
        }
        let last = position.exits().last()?;

        let weighted: Vec<(Decimal, Decimal)> = position
            .exits()
            .iter()
            .map(|e| (e.fill_price, e.quantity))
            .collect();
        let exit_price = weighted_average(&weighted);
        let exit_fees: Decimal = position.exits().iter().map(|e| e.fee).sum();

        let initial_risk = position.risk_per_unit() * position.quantity();
        let r_multiple = safe_div(position.realized_pnl(), initial_risk);

        Some(Self {
            id: position.id(),
            symbol: position.symbol().to_string(),
            direction: position.direction(),
            entry_time: position.entry_time(),
            exit_time: last.time,
            entry_price: position.entry_price(),
            exit_price,
            quantity: position.quantity(),
            original_stop_loss: position.original_stop_loss(),
            final_stop_loss: position.stop_loss(),
            entry_atr: position.entry_atr(),
            entry_regime: position.entry_regime(),
            score: position.score(),
            equity_at_entry: position.equity_at_entry(),
            pnl: position.realized_pnl(),
            fees: position.entry_fee() + exit_fees,
            r_multiple,
            exit_reason: last.reason,
            adaptive_stop_triggered: position.adaptive_stop_triggered(),
            exits: position.exits().to_vec(),
            stop_history: position.stop_history().to_vec(),
        })
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.pnl < Decimal::ZERO
    }

    pub fn duration(&self) -> chrono::Duration {
        self.exit_time - self.entry_time
    }

    /// P&L relative to equity at entry.
    pub fn return_on_equity(&self) -> Decimal {
        safe_div(self.pnl, self.equity_at_entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{FillModel, OpenParams};
    use crate::strategy::TakeProfitLevel;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn open_position() -> Position {
        Position::open(OpenParams {
            id: 7,
            symbol: "SOLUSDT".to_string(),
            direction: Direction::Long,
            time: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            entry_price: dec!(100),
            quantity: dec!(4),
            entry_fee: dec!(0.2),
            stop_loss: dec!(90),
            take_profits: vec![TakeProfitLevel { price: dec!(120), fraction: dec!(1) }],
            atr: dec!(4),
            regime: Regime::Trending,
            score: 75,
            margin: dec!(40),
            equity_at_entry: dec!(1000),
        })
    }

    #[test]
    fn test_open_position_has_no_record() {
        assert!(TradeRecord::from_position(&open_position()).is_none());
    }

    #[test]
    fn test_record_from_closed_position() {
        let mut pos = open_position();
        let exit_time = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        pos.force_close(exit_time, dec!(110), &FillModel::frictionless());

        let record = TradeRecord::from_position(&pos).unwrap();
        assert_eq!(record.exit_price, dec!(110));
        assert_eq!(record.pnl, dec!(39.8));
        assert_eq!(record.fees, dec!(0.2));
        assert_eq!(record.r_multiple, dec!(0.995));
        assert_eq!(record.exit_reason, ExitReason::BacktestEnd);
        assert_eq!(record.duration(), Duration::hours(6));
        assert!(record.is_win());
        assert_eq!(record.return_on_equity(), dec!(0.0398));
    }
}
