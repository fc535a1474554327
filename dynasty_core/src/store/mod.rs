//! PostgreSQL persistence for canonical records, checkpoints and run locks.

pub mod config;
pub mod postgres;

pub use config::PostgresConfig;
pub use postgres::{PgRunLease, PgStore, RankingPoint};
