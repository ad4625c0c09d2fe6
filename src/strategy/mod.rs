//! Strategy layer.
//!
//! Contains:
//! - The oracle interface the engine consults at every tick
//! - Indicators and regime classification
//! - The trend-pullback reference strategy

pub mod indicators;
mod oracle;
mod reference;
mod regime;

pub use oracle::{
    AccountMode, AccountSnapshot, CandidateRejection, EntryCandidate, MarketConditions,
    MarketView, Signal, StrategyOracle, TakeProfitLevel,
};
pub use reference::TrendPullbackOracle;
pub use regime::{RegimeDetector, RegimeReading};
