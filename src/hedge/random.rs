//! Injectable randomness for cycle sizing and cadence.
//!
//! Every draw goes through a [`RandomSource`] producing unit values in
//! `[0, 1)`; the helpers below turn those into inclusive ranges. Tests swap
//! in [`SequenceRandom`] to make a run fully deterministic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::utils::decimal::round_to_precision;

/// Source of uniform unit draws.
pub trait RandomSource: Send {
    /// Uniform value in `[0, 1)`.
    fn next_unit(&mut self) -> f64;
}

/// Default source backed by `StdRng`.
pub struct StdRandom(StdRng);

impl StdRandom {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for StdRandom {
    fn next_unit(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Replays a fixed list of unit values, cycling when exhausted.
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    values: Vec<f64>,
    cursor: usize,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, cursor: 0 }
    }
}

impl RandomSource for SequenceRandom {
    fn next_unit(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        value
    }
}

fn unit(rng: &mut dyn RandomSource) -> f64 {
    let u = rng.next_unit();
    if u.is_finite() {
        u.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Uniform decimal in `[min, max]`, rounded to cents.
pub fn uniform_decimal(rng: &mut dyn RandomSource, min: Decimal, max: Decimal) -> Decimal {
    let u = Decimal::from_f64(unit(rng)).unwrap_or_default();
    let value = round_to_precision(min + (max - min) * u, 2);
    value.clamp(min, max)
}

/// Uniform integer in `[min, max]`.
pub fn uniform_u64(rng: &mut dyn RandomSource, min: u64, max: u64) -> u64 {
    let span = max.saturating_sub(min) as f64 + 1.0;
    let offset = (unit(rng) * span).floor() as u64;
    min.saturating_add(offset).min(max)
}

/// Uniform index into a collection of `len` items (`len > 0`).
pub fn pick_index(rng: &mut dyn RandomSource, len: usize) -> usize {
    let index = (unit(rng) * len as f64).floor() as usize;
    index.min(len.saturating_sub(1))
}

/// Fair coin.
pub fn coin_flip(rng: &mut dyn RandomSource) -> bool {
    unit(rng) < 0.5
}
