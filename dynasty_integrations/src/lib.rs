//! Record sources and transformers for the dynasty import.

pub mod connectors;

pub use connectors::dynasty_process::DynastyProcessSource;
pub use connectors::keeptradecut::KeepTradeCutSource;
pub use connectors::rankings::RankingTransformer;
pub use connectors::sleeper::{SleeperPlayerSource, SleeperPlayerTransformer};
