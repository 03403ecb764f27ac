//! Core domain types for the ORB bot.

pub mod market;
pub mod order;
pub mod setup;
pub mod trade;

pub use market::*;
pub use order::*;
pub use setup::*;
pub use trade::*;
