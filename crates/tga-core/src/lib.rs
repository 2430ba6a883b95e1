//! Core domain + application logic for Telegram group automation.
//!
//! This crate is intentionally framework-agnostic. The chat platform lives
//! behind the session port (traits) implemented in adapter crates.

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod errors;
pub mod groups;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod session;

#[cfg(test)]
mod test_support;

pub use errors::{Error, Result};
