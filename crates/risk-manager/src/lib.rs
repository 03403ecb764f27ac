//! Risk Manager
//!
//! Position sizing, stop and target ladder math, and the daily loss breaker.

pub mod circuit_breaker;
pub mod position_sizing;
pub mod risk_engine;

pub use circuit_breaker::{DailyLossBreaker, DailyRiskState, TripReason};
pub use position_sizing::{compute_quantity, PositionSizer, SizingDecision};
pub use risk_engine::{
    apply_distance_factor, initial_stop, is_valid_stop, leg_quantities, tighten, RiskEngine,
};
