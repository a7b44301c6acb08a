//! Core of the Forelka userbot host.
//!
//! Transport-agnostic: the chat network lives behind the traits in
//! [`transport`] and is implemented in adapter crates.

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod host;
pub mod logging;
pub mod modules;
pub mod repository;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
