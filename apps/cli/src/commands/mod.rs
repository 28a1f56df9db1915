//! Command implementations for the DocIntel CLI.

pub mod ask;
pub mod config;
pub mod history;
