pub mod engine;
pub mod outcome;
pub mod tiers;

pub use engine::{ExitLadder, FillKind, LadderParams, LadderState, PositionState};
pub use outcome::{ExitReason, ExitRecord, Outcome, TradeResult};
pub use tiers::{ExitTier, LadderPlan, StopMove};
