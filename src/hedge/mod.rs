//! Delta-neutral hedge cycles across two venues.

mod engine;
mod error;
pub mod pricing;
pub mod random;

pub use engine::{HedgeEngine, CLOSE_MAX_ATTEMPTS, CLOSE_RETRY_DELAY};
pub use error::{EngineError, Leg};
pub use random::{RandomSource, SequenceRandom, StdRandom};
