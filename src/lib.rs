//! ORB Bot: intraday opening-range / VWAP breakout trader
//!
//! This is the root crate that provides benchmark and integration test access
//! to the internal crates. For actual functionality, use them directly:
//!
//! - `orb-core`: Domain types, configuration, indicators, collaborator traits
//! - `risk-manager`: Position sizing, stop and ladder math, daily loss breaker
//! - `trading-engine`: Scanner, signals, exit state machine, execution, session loop
//! - `orb-trader`: The binary

pub use orb_core as core;
pub use risk_manager as risk;
pub use trading_engine as trading;
