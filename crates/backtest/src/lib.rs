//! Regime classification, regime-aware backtesting, and stress testing.

pub mod constraints;
pub mod engine;
pub mod export;
pub mod metrics;
pub mod regimes;
pub mod stress;

pub use constraints::{ConstraintSet, CostModel, Neutrality, PortfolioWeighting, TradingMask};
pub use engine::{
    BacktestInputs, BacktestPeriod, BacktestResult, BacktestSimulator, BacktestSummary,
};
pub use export::BacktestRecord;
pub use metrics::{MetricsCalculator, PerformanceMetrics};
pub use regimes::{
    percentile_rank_scores, regime_performance, RegimeClassifier, RegimeObservation,
    RegimePerformance, RegimeSeries,
};
pub use stress::{StressOutcome, StressScenario, StressTester};
