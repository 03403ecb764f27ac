//! Error types for the ORB bot.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Market data error: {message}")]
    MarketData { message: String },

    #[error("Invalid market data: {0}")]
    InvalidData(String),

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Order error: {message}")]
    Order { message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn market_data(message: impl Into<String>) -> Self {
        Self::MarketData {
            message: message.into(),
        }
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
