//! Core types, error taxonomy, and configuration for the factor analytics engine.

pub mod cancel;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod score;
pub mod status;
pub mod types;

pub use cancel::CancellationToken;
pub use config::{
    BacktestConfig, CacheConfig, CorrelationConfig, CorrelationMethod, EngineConfig, GapPolicy,
    RegimeConfig, StatisticsConfig,
};
pub use config_loader::ConfigLoader;
pub use error::{EngineError, Result};
pub use score::CompositeScore;
pub use status::{QueryResponse, QueryStatus, Warning};
pub use types::{
    CrossSection, DateRange, FactorCategory, FactorId, FactorSeries, ForwardReturns,
    InstrumentId, InstrumentProfile, InstrumentProfiles, Observation, Regime,
};
