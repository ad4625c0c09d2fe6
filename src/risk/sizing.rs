//! Risk-based position sizing with a leverage cap.

use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::strategy::CandidateRejection;

/// Size of an approved entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizedEntry {
    pub quantity: Decimal,
    pub notional: Decimal,
    pub margin: Decimal,
    /// Loss at the original stop, before costs
    pub risk_amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    risk_per_trade: Decimal,
    max_leverage: Decimal,
    min_notional: Decimal,
}

impl PositionSizer {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            risk_per_trade: config.risk_per_trade,
            max_leverage: config.max_leverage,
            min_notional: config.min_notional,
        }
    }

    /// Quantity that loses `risk_per_trade` of equity at the stop, capped so
    /// notional stays within `max_leverage` of equity.
    ///
    /// `margin_in_use` is the margin already committed to open positions.
    pub fn size(
        &self,
        equity: Decimal,
        margin_in_use: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
    ) -> Result<SizedEntry, CandidateRejection> {
        let available = equity - margin_in_use;
        if equity <= Decimal::ZERO {
            return Err(CandidateRejection::InsufficientEquity {
                required: Decimal::ZERO,
                available,
            });
        }

        let stop_distance = (entry_price - stop_loss).abs();
        if stop_distance.is_zero() {
            return Err(CandidateRejection::ZeroStopDistance);
        }

        let risk_amount = equity * self.risk_per_trade;
        let mut quantity = risk_amount / stop_distance;
        let mut notional = quantity * entry_price;

        let max_notional = equity * self.max_leverage;
        if notional > max_notional {
            quantity = max_notional / entry_price;
            notional = max_notional;
        }

        if notional < self.min_notional {
            return Err(CandidateRejection::BelowMinNotional {
                notional,
                minimum: self.min_notional,
            });
        }

        let margin = if self.max_leverage > Decimal::ZERO {
            notional / self.max_leverage
        } else {
            notional
        };
        if margin > available {
            return Err(CandidateRejection::InsufficientEquity {
                required: margin,
                available,
            });
        }

        Ok(SizedEntry {
            quantity,
            notional,
            margin,
            risk_amount: quantity * stop_distance,
        })
    }
}
