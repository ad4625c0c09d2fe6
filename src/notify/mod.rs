//! Trade event notifications.
//!
//! Delivery is fire-and-forget: sinks take `&self`, return nothing, and must
//! never block or fail the replay.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::market::{Direction, Regime};
use crate::position::{ExitReason, ProtectionTrigger};

/// A position lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeEvent {
    Opened {
        symbol: String,
        time: DateTime<Utc>,
        direction: Direction,
        entry_price: Decimal,
        quantity: Decimal,
        stop_loss: Decimal,
        regime: Regime,
        score: u32,
    },
    PartialExit {
        symbol: String,
        time: DateTime<Utc>,
        reason: ExitReason,
        fill_price: Decimal,
        fraction: Decimal,
        pnl: Decimal,
        remaining_fraction: Decimal,
    },
    Closed {
        symbol: String,
        time: DateTime<Utc>,
        reason: ExitReason,
        exit_price: Decimal,
        pnl: Decimal,
        r_multiple: Decimal,
    },
    ProtectionArmed {
        symbol: String,
        time: DateTime<Utc>,
        trigger: ProtectionTrigger,
        stop_loss: Decimal,
        partial: bool,
    },
}

impl TradeEvent {
    pub fn symbol(&self) -> &str {
        match self {
            TradeEvent::Opened { symbol, .. }
            | TradeEvent::PartialExit { symbol, .. }
            | TradeEvent::Closed { symbol, .. }
            | TradeEvent::ProtectionArmed { symbol, .. } => symbol,
        }
    }
}

/// Receives trade events during a replay.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &TradeEvent);
}

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, event: &TradeEvent) {
        let json = serde_json::to_string(event).unwrap_or_default();
        info!(target: "trade_event", symbol = event.symbol(), "TRADE_EVENT: {}", json);
    }
}

/// Forwards events to an unbounded channel. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<TradeEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::UnboundedSender<TradeEvent>) -> Self {
        Self { tx }
    }

    /// Notifier plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TradeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, event: &TradeEvent) {
        let _ = self.tx.send(event.clone());
    }
}
