pub mod backtesting;
pub mod config;
pub mod error;
pub mod exchange;
pub mod ladder;
pub mod models;
pub mod signals;
#[cfg(test)]
pub mod test_helpers;
pub mod trading;

pub use error::{Error, Result};
