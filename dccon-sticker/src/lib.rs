//! dccon-sticker library crate.
//!
//! This module exposes the core functionality for integration testing.

pub mod assembler;
pub mod bot;
pub mod config;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod source;
pub mod telegram;
pub mod utils;

pub use error::{Error, Result};
