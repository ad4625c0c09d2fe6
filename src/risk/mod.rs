//! Risk management for the backtest account.
//!
//! - Account-wide entry gating (cooldowns, weekly/daily loss caps)
//! - Risk-based position sizing
//! - Exposure limits across symbols
//! - Maximum drawdown tracking

mod governor;
mod limits;
mod mdd;
mod sizing;

pub use governor::{
    day_start_of, week_start_of, RiskEvent, RiskEventKind, RiskGovernor, RiskState, RiskVeto,
};
pub use limits::{ExposureBlock, ExposureLimits};
pub use mdd::{DrawdownStats, DrawdownTracker};
pub use sizing::{PositionSizer, SizedEntry};
