//! Shared utilities

pub mod ticker;

pub use ticker::Ticker;
