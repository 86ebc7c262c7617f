pub mod backtest;
pub mod commands;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod storage;
pub mod tracker;

pub use error::{OrchestratorError, Result};
