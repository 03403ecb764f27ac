//! ORB Core Library
//!
//! Shared types, configuration, indicators and collaborator traits for the
//! opening-range breakout bot.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod indicators;
pub mod retry;
pub mod store;
pub mod types;

pub use error::{Error, Result};
