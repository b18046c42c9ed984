//! Factor quality statistics: IC, IC-IR, decay, turnover, and quantile returns.
//!
//! Every statistic is evaluated over a fixed window. Periods whose paired
//! (factor, forward return) sample is smaller than the configured minimum are
//! excluded and reported as insufficient, never counted as a zero IC.

use chrono::NaiveDate;
use factor_lab_core::{
    CancellationToken, CrossSection, DateRange, EngineError, FactorId, FactorSeries,
    ForwardReturns, Result, StatisticsConfig, Warning,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::stats::{correlation, mean, sample_std};

/// IC of one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcObservation {
    pub date: NaiveDate,
    pub ic: f64,
    pub instruments: usize,
}

/// Mean IC at one forward lag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayPoint {
    pub lag: usize,
    pub ic: Option<f64>,
    pub periods: usize,
}

/// Number of periods for predictive power to halve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "periods", rename_all = "snake_case")]
pub enum HalfLife {
    /// Interpolated lag at which |IC| first drops below half its lag-1 value.
    Periods(f64),
    NoDecayWithinHorizon,
    /// Lag-1 IC is missing or zero.
    Undefined,
}

/// Mean forward return of one factor-value bucket. Bucket 1 holds the lowest
/// factor values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileReturn {
    pub quantile: usize,
    pub mean_return: Option<f64>,
    pub periods: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorDirection {
    /// Higher factor values earn higher returns.
    Positive,
    Negative,
    Flat,
}

impl FactorDirection {
    /// Multiplier applied to factor values so that higher is better.
    #[must_use]
    pub const fn sign(self) -> f64 {
        match self {
            Self::Negative => -1.0,
            Self::Positive | Self::Flat => 1.0,
        }
    }
}

/// Immutable statistics snapshot of one factor over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorStatistics {
    pub factor_id: FactorId,
    pub window: DateRange,
    pub ic_series: Vec<IcObservation>,
    /// Periods excluded for having too few instruments: (date, instruments).
    pub insufficient_periods: Vec<(NaiveDate, usize)>,
    pub ic_mean: f64,
    pub ic_std: Option<f64>,
    pub ic_ir: Option<f64>,
    pub ic_t_stat: Option<f64>,
    pub decay: Vec<DecayPoint>,
    pub half_life: HalfLife,
    pub turnover: Option<f64>,
    pub quantile_returns: Vec<QuantileReturn>,
    /// Top bucket minus bottom bucket mean return.
    pub quantile_spread: Option<f64>,
    pub monotonic: bool,
    pub direction: FactorDirection,
}

impl FactorStatistics {
    #[must_use]
    pub fn valid_periods(&self) -> usize {
        self.ic_series.len()
    }

    #[must_use]
    pub fn warnings(&self) -> Vec<Warning> {
        self.insufficient_periods
            .iter()
            .map(|(date, instruments)| Warning::InsufficientSample {
                date: *date,
                instruments: *instruments,
            })
            .collect()
    }
}

/// Computes [`FactorStatistics`] for factors against a forward return panel.
#[derive(Debug, Clone, Default)]
pub struct StatisticsEngine {
    config: StatisticsConfig,
}

impl StatisticsEngine {
    #[must_use]
    pub const fn new(config: StatisticsConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &StatisticsConfig {
        &self.config
    }

    /// Computes statistics for one factor over `window`.
    ///
    /// # Errors
    /// Returns [`EngineError::DataInsufficient`] when fewer valid periods than
    /// the configured minimum exist in the window, and
    /// [`EngineError::Cancelled`] if the token fires.
    pub fn compute(
        &self,
        factor: &FactorSeries,
        returns: &ForwardReturns,
        window: DateRange,
        cancel: &CancellationToken,
    ) -> Result<FactorStatistics> {
        if self.config.quantiles == 0 {
            return Err(EngineError::invalid("quantile count must be positive"));
        }

        let dates: Vec<NaiveDate> = factor.dates().filter(|d| window.contains(*d)).collect();

        let mut ic_series = Vec::new();
        let mut insufficient_periods = Vec::new();
        let mut bucket_sums = vec![0.0; self.config.quantiles];
        let mut bucket_periods = vec![0usize; self.config.quantiles];

        for &date in &dates {
            cancel.check()?;
            let values = factor.cross_section(date);
            let paired = pair_with(&values, returns.cross_section(date));

            let Some(ic) = self.period_ic(&paired) else {
                insufficient_periods.push((date, paired.len()));
                continue;
            };
            ic_series.push(IcObservation {
                date,
                ic,
                instruments: paired.len(),
            });

            if paired.len() >= self.config.quantiles {
                for (bucket, mean_ret) in bucket_means(&paired, self.config.quantiles)
                    .into_iter()
                    .enumerate()
                {
                    if let Some(m) = mean_ret {
                        bucket_sums[bucket] += m;
                        bucket_periods[bucket] += 1;
                    }
                }
            }
        }

        let required = self.config.min_valid_periods.max(1);
        if ic_series.len() < required {
            return Err(EngineError::insufficient(
                format!("IC periods for factor {}", factor.id()),
                ic_series.len(),
                required,
            ));
        }

        let ics: Vec<f64> = ic_series.iter().map(|o| o.ic).collect();
        let ic_mean = mean(&ics).unwrap_or(0.0);
        let ic_std = sample_std(&ics);
        let (ic_ir, ic_t_stat) = match ic_std {
            Some(sd) if sd > f64::EPSILON => {
                let ir = ic_mean / sd;
                (Some(ir), Some(ir * (ics.len() as f64).sqrt()))
            }
            _ => (None, None),
        };

        let valid_dates: Vec<NaiveDate> = ic_series.iter().map(|o| o.date).collect();
        let decay = self.decay_curve(factor, returns, &valid_dates, cancel)?;
        let half_life = half_life(&decay);
        let turnover = self.top_n_turnover(factor, &dates);

        let quantile_returns: Vec<QuantileReturn> = bucket_sums
            .iter()
            .zip(&bucket_periods)
            .enumerate()
            .map(|(i, (sum, periods))| QuantileReturn {
                quantile: i + 1,
                mean_return: (*periods > 0).then(|| sum / *periods as f64),
                periods: *periods,
            })
            .collect();
        let (quantile_spread, monotonic, direction) = quantile_shape(&quantile_returns);

        debug!(
            factor = factor.id(),
            valid_periods = ic_series.len(),
            insufficient = insufficient_periods.len(),
            ic_mean,
            "Computed factor statistics"
        );

        Ok(FactorStatistics {
            factor_id: factor.id().to_string(),
            window,
            ic_series,
            insufficient_periods,
            ic_mean,
            ic_std,
            ic_ir,
            ic_t_stat,
            decay,
            half_life,
            turnover,
            quantile_returns,
            quantile_spread,
            monotonic,
            direction,
        })
    }

    /// Computes statistics for several factors in parallel. Results keep the
    /// input order.
    #[must_use]
    pub fn compute_many(
        &self,
        factors: &[Arc<FactorSeries>],
        returns: &ForwardReturns,
        window: DateRange,
        cancel: &CancellationToken,
    ) -> Vec<Result<FactorStatistics>> {
        factors
            .par_iter()
            .map(|factor| self.compute(factor, returns, window, cancel))
            .collect()
    }

    fn period_ic(&self, paired: &[(f64, f64)]) -> Option<f64> {
        if paired.len() < self.config.min_instruments.max(2) {
            return None;
        }
        let (x, y): (Vec<f64>, Vec<f64>) = paired.iter().copied().unzip();
        correlation(self.config.ic_method, &x, &y)
    }

    fn decay_curve(
        &self,
        factor: &FactorSeries,
        returns: &ForwardReturns,
        dates: &[NaiveDate],
        cancel: &CancellationToken,
    ) -> Result<Vec<DecayPoint>> {
        let mut curve = Vec::with_capacity(self.config.max_decay_lag);
        for lag in 1..=self.config.max_decay_lag {
            cancel.check()?;
            let ics: Vec<f64> = dates
                .iter()
                .filter_map(|&date| {
                    let values = factor.cross_section(date);
                    let paired = pair_with(&values, returns.cross_section_after(date, lag - 1));
                    self.period_ic(&paired)
                })
                .collect();
            curve.push(DecayPoint {
                lag,
                ic: mean(&ics),
                periods: ics.len(),
            });
        }
        Ok(curve)
    }

    fn top_n_turnover(&self, factor: &FactorSeries, dates: &[NaiveDate]) -> Option<f64> {
        if self.config.top_n == 0 {
            return None;
        }
        let mut previous: Option<BTreeSet<String>> = None;
        let mut changes = Vec::new();

        for &date in dates {
            let top = top_n(&factor.cross_section(date), self.config.top_n);
            if top.is_empty() {
                continue;
            }
            if let Some(prev) = &previous {
                let replaced = top.difference(prev).count();
                changes.push(replaced as f64 / top.len() as f64);
            }
            previous = Some(top);
        }

        mean(&changes)
    }
}

/// Pairs valid factor values with the matching returns, sorted by instrument.
fn pair_with(values: &CrossSection, returns: Option<&CrossSection>) -> Vec<(f64, f64)> {
    let Some(returns) = returns else {
        return Vec::new();
    };
    values
        .iter()
        .filter_map(|(inst, v)| returns.get(inst).map(|r| (*v, *r)))
        .collect()
}

/// Instruments with the `n` highest values; ties broken by instrument id.
fn top_n(values: &CrossSection, n: usize) -> BTreeSet<String> {
    let mut ranked: Vec<(&String, f64)> = values.iter().map(|(k, v)| (k, *v)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().take(n).map(|(k, _)| k.clone()).collect()
}

/// Mean return per bucket; bucket of rank r (0-based, ascending value) is
/// `floor(r * q / n)`.
fn bucket_means(paired: &[(f64, f64)], q: usize) -> Vec<Option<f64>> {
    let mut sorted = paired.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let n = sorted.len();

    let mut sums = vec![0.0; q];
    let mut counts = vec![0usize; q];
    for (rank, (_, ret)) in sorted.iter().enumerate() {
        let bucket = (rank * q / n).min(q - 1);
        sums[bucket] += ret;
        counts[bucket] += 1;
    }

    sums.iter()
        .zip(counts)
        .map(|(s, c)| (c > 0).then(|| s / c as f64))
        .collect()
}

fn quantile_shape(buckets: &[QuantileReturn]) -> (Option<f64>, bool, FactorDirection) {
    let means: Vec<f64> = buckets.iter().filter_map(|b| b.mean_return).collect();
    if means.len() != buckets.len() || means.len() < 2 {
        return (None, false, FactorDirection::Flat);
    }

    let spread = means[means.len() - 1] - means[0];
    let increasing = means.windows(2).all(|w| w[1] >= w[0]);
    let decreasing = means.windows(2).all(|w| w[1] <= w[0]);
    let direction = if spread > 0.0 {
        FactorDirection::Positive
    } else if spread < 0.0 {
        FactorDirection::Negative
    } else {
        FactorDirection::Flat
    };

    (Some(spread), increasing || decreasing, direction)
}

fn half_life(decay: &[DecayPoint]) -> HalfLife {
    let Some(ic1) = decay.first().and_then(|p| p.ic) else {
        return HalfLife::Undefined;
    };
    if ic1.abs() < f64::EPSILON {
        return HalfLife::Undefined;
    }

    let threshold = ic1.abs() / 2.0;
    let mut prev = (1.0, ic1.abs());
    for point in &decay[1..] {
        let Some(ic) = point.ic else { continue };
        let current = ic.abs();
        let lag = point.lag as f64;
        if current < threshold {
            let (prev_lag, prev_ic) = prev;
            let fraction = (prev_ic - threshold) / (prev_ic - current);
            return HalfLife::Periods(prev_lag + fraction * (lag - prev_lag));
        }
        prev = (lag, current);
    }
    HalfLife::NoDecayWithinHorizon
}
