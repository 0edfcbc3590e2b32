//! # Volume Hedger
//!
//! Randomized delta-neutral hedge cycles across two perpetual futures
//! accounts. Each cycle opens opposite legs of equal size on both venues,
//! holds them for a random interval, then flattens both.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Venue abstraction with Binance futures and paper adapters
//! - `hedge`: The hedge cycle engine, sizing math and randomness
//! - `persistence`: SQLite trade records for each cycle
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod hedge;
pub mod persistence;
pub mod utils;

pub use config::Config;
