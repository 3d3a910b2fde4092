//! Shared helpers for the keeldb criterion benches.

pub mod utils;
