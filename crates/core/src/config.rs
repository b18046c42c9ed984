use serde::{Deserialize, Serialize};

/// Top-level engine configuration. Every section falls back to its defaults
/// so partial config files are valid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub statistics: StatisticsConfig,
    pub correlation: CorrelationConfig,
    pub regime: RegimeConfig,
    pub backtest: BacktestConfig,
    pub cache: CacheConfig,
}

/// Correlation flavour used for IC and pairwise factor correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    Pearson,
    /// Spearman rank correlation.
    Rank,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Periods with fewer valid instruments are excluded from IC.
    pub min_instruments: usize,
    /// Minimum valid periods across the window before statistics are reported.
    pub min_valid_periods: usize,
    /// Number of quantile buckets.
    pub quantiles: usize,
    /// Top-N size used for turnover.
    pub top_n: usize,
    /// Largest forward lag sampled for the decay curve.
    pub max_decay_lag: usize,
    pub ic_method: CorrelationMethod,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            min_instruments: 30,
            min_valid_periods: 1,
            quantiles: 5,
            top_n: 50,
            max_decay_lag: 20,
            ic_method: CorrelationMethod::Rank,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Pairs with |r| strictly above this are redundant.
    pub redundancy_threshold: f64,
    /// Pairs with a smaller overlapping sample are undefined.
    pub min_overlap: usize,
    pub method: CorrelationMethod,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            redundancy_threshold: 0.7,
            min_overlap: 30,
            method: CorrelationMethod::Pearson,
        }
    }
}

/// What to do with dates that have no sentiment score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Reuse the last known regime and mark the date stale.
    CarryForward,
    /// Leave the date without a regime.
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Four increasing boundaries splitting [0, 100] into five bands.
    pub boundaries: [f64; 4],
    /// Margin a score must clear past a boundary before the regime changes.
    pub hysteresis: f64,
    pub gap_policy: GapPolicy,
    /// When set, the sentiment feed holds a raw indicator that is turned into
    /// [0, 100] scores by trailing percentile rank over this many dates.
    pub percentile_lookback: Option<usize>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            boundaries: [20.0, 40.0, 60.0, 80.0],
            hysteresis: 0.0,
            gap_policy: GapPolicy::CarryForward,
            percentile_lookback: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_nav: f64,
    /// Periods per year used for annualization (252 for daily data).
    pub periods_per_year: f64,
    /// Max fraction of an instrument's daily traded value the strategy may take.
    pub capacity_participation: f64,
    /// Price-limit move (e.g. 0.1 for +/-10%) that locks an instrument next period.
    pub price_limit: Option<f64>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_nav: 1.0,
            periods_per_year: 252.0,
            capacity_participation: 0.1,
            price_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Query scopes held per cache before the least recently used is evicted.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 256,
        }
    }
}
