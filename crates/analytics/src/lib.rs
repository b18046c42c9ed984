//! Factor analytics: quality statistics, redundancy detection, and weighting.
//!
//! All entry points are pure functions over immutable inputs. Work that is
//! independent across factors or pairs is dispatched with rayon.

pub mod composite;
pub mod correlation;
pub mod export;
pub mod pca;
pub mod statistics;
pub mod stats;
pub mod weighting;

pub use composite::CompositeBuilder;
pub use correlation::{
    suggest_remediations, CorrelationAnalyzer, CorrelationCell, CorrelationMatrix,
    RedundantPair, RemediationAction, RemediationSuggestion,
};
pub use export::{QuantileRecord, StatisticsRecord};
pub use statistics::{
    DecayPoint, FactorDirection, FactorStatistics, HalfLife, IcObservation, QuantileReturn,
    StatisticsEngine,
};
pub use weighting::{
    equal_weights, FactorWeight, Fusion, FusionInputs, WeightMethod, WeightVector,
    WeightingOptimizer,
};
