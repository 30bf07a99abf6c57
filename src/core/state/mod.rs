// src/core/state/mod.rs

//! Defines the central `BrokerState` struct and its statistics.

mod core;
mod stats;

pub use core::BrokerState;
pub use stats::StatsState;
