//! Fill model: adverse slippage and taker fees.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ExecutionConfig;
use crate::market::Direction;

/// Slippage and fee assumptions applied to every simulated fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FillModel {
    pub slippage: Decimal,
    pub stop_slippage: Decimal,
    pub taker_fee: Decimal,
}

impl FillModel {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            slippage: config.slippage,
            stop_slippage: config.stop_slippage,
            taker_fee: config.taker_fee,
        }
    }

    pub fn frictionless() -> Self {
        Self {
            slippage: Decimal::ZERO,
            stop_slippage: Decimal::ZERO,
            taker_fee: Decimal::ZERO,
        }
    }

    /// Entry fill: longs pay up, shorts sell lower.
    pub fn entry_price(&self, direction: Direction, reference: Decimal) -> Decimal {
        reference * (Decimal::ONE + direction.sign() * self.slippage)
    }

    /// Exit fill: longs sell lower, shorts buy higher. Stops slip further.
    pub fn exit_price(&self, direction: Direction, trigger: Decimal, stop_triggered: bool) -> Decimal {
        let slip = if stop_triggered {
            self.slippage + self.stop_slippage
        } else {
            self.slippage
        };
        trigger * (Decimal::ONE - direction.sign() * slip)
    }

    /// Taker fee on notional.
    pub fn fee(&self, price: Decimal, quantity: Decimal) -> Decimal {
        price * quantity * self.taker_fee
    }
}

impl Default for FillModel {
    fn default() -> Self {
        Self::new(&ExecutionConfig::default())
    }
}
