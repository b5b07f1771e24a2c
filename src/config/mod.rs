//! Configuration module
//!
//! Handles loading relay settings from file.

mod relay;

pub use relay::*;
