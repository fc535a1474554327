//! Upstream connectors implementing `dynasty_core::RecordSource`.
//!
//! Every connector downloads one upstream snapshot and streams it with a `SnapshotCursor`,
//! so an interrupted run resumes inside the same snapshot and starts over on a new one.

pub mod cursor;
pub mod dynasty_process;
pub mod http;
pub mod keeptradecut;
pub mod rankings;
pub mod sleeper;
