//! Query API for the factor analytics engine.
//!
//! [`AnalyticsService`] owns a versioned [`factor_lab_data::FactorStore`] and
//! answers statistics, correlation, weighting, backtest, and stress queries
//! with a status envelope. Identical statistics and correlation requests are
//! memoized with at most one computation in flight per key.

pub mod cache;
pub mod service;

pub use cache::{cache_key, CacheKey, QueryCache};
pub use service::{AnalyticsService, BacktestRequest, CorrelationReport, FuseRequest};
