//! The `dynasty_import` binary's library: CLI, configuration, job wiring and CSV export.

pub mod cli;
pub mod config;
pub mod export;
pub mod jobs;
