//! Indexing and aggregation engine for append-only session transcript logs.
//!
//! [`engine::Engine`] is the entry point. It scans a date-partitioned tree of
//! `*.jsonl` transcripts into [`types::SessionRecord`]s through a persistent
//! cache, enriches them in the background, and keeps the filter, directory
//! tree and calendar views current as files change.

pub mod cache;
pub mod calendar;
pub mod config;
pub mod debug_log;
pub mod engine;
pub mod enrichment;
pub mod error;
pub mod filter;
pub mod heartbeat;
pub mod indexer;
pub mod notes;
pub mod parser;
pub mod path_tree;
pub mod search;
pub mod task;
pub mod types;
pub mod utils;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;
