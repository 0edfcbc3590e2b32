use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

use crate::exchange::ExchangeError;

/// Which side of the hedged pair an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    First,
    Second,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::First => write!(f, "first"),
            Leg::Second => write!(f, "second"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("hedge engine is already running")]
    AlreadyRunning,

    #[error("no symbols to trade")]
    NoSymbols,

    #[error("invalid reference price: {0}")]
    InvalidReferencePrice(Decimal),

    #[error("invalid hedge configuration: {0}")]
    InvalidConfig(String),

    #[error("{leg} leg failed on {symbol}: {source}")]
    LegFailed {
        symbol: String,
        leg: Leg,
        #[source]
        source: ExchangeError,
    },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
