//! Failure taxonomy for the exchange boundary.

use thiserror::Error;

/// Errors raised by an [`ExchangeCapability`](super::ExchangeCapability).
///
/// The hedge engine retries all of these uniformly; the split exists for
/// logging and for startup, where authentication failures are fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("network error on {venue}: {message}")]
    Network { venue: String, message: String },

    #[error("authentication rejected by {venue}: {message}")]
    Authentication { venue: String, message: String },

    #[error("{venue} rejected request (code {code}): {message}")]
    Business {
        venue: String,
        code: i64,
        message: String,
    },

    #[error("rate limited by {venue}: {message}")]
    RateLimit { venue: String, message: String },
}

impl ExchangeError {
    pub fn network(venue: &str, message: impl Into<String>) -> Self {
        Self::Network {
            venue: venue.to_string(),
            message: message.into(),
        }
    }

    pub fn authentication(venue: &str, message: impl Into<String>) -> Self {
        Self::Authentication {
            venue: venue.to_string(),
            message: message.into(),
        }
    }

    pub fn business(venue: &str, code: i64, message: impl Into<String>) -> Self {
        Self::Business {
            venue: venue.to_string(),
            code,
            message: message.into(),
        }
    }

    pub fn rate_limit(venue: &str, message: impl Into<String>) -> Self {
        Self::RateLimit {
            venue: venue.to_string(),
            message: message.into(),
        }
    }

    /// Unknown instrument on a venue.
    pub fn unknown_symbol(venue: &str, symbol: &str) -> Self {
        Self::business(venue, -1121, format!("unknown symbol {symbol}"))
    }

    /// Short kind label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Authentication { .. } => "authentication",
            Self::Business { .. } => "business",
            Self::RateLimit { .. } => "rate_limit",
        }
    }
}
