//! Position lifecycle: entry, staged exits, adaptive protection, ledger entries.

mod costs;
mod machine;
mod trade;

pub use costs::FillModel;
pub use machine::{
    ExitFill, ExitReason, ExitRules, OpenParams, Position, PositionEvent, PositionStatus,
    ProtectionTrigger, StopCause, StopChange,
};
pub use trade::TradeRecord;
