//! Factor data storage for the analytics engine.
//!
//! This crate provides:
//! - [`FactorStore`], the versioned in-memory repository of factor series,
//!   forward returns, instrument profiles, and sentiment scores
//! - CSV ingestion of the input feed and CSV export of result records

pub mod csv_storage;
pub mod store;

pub use csv_storage::{CsvStorage, FeedPaths};
pub use store::{FactorMeta, FactorRow, FactorStore, ReturnRow, SentimentRow};
