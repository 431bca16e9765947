//! Error glue and small utilities shared by all clawport crates.

pub mod env;
pub mod error;
pub mod secret;

pub use error::FromMessage;
