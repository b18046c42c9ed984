//! Composite score construction from a weight vector.

use chrono::NaiveDate;
use factor_lab_core::{
    CompositeScore, CrossSection, DateRange, EngineError, FactorId, FactorSeries, Result,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::statistics::FactorDirection;
use crate::stats::zscores;
use crate::weighting::WeightVector;

/// Builds per-date composite scores: the weighted mean of each factor's
/// cross-sectional z-score, signed by factor direction so higher is better.
///
/// An instrument missing some factors is scored over the factors it has,
/// with their weights renormalized.
#[derive(Debug, Clone, Default)]
pub struct CompositeBuilder {
    directions: BTreeMap<FactorId, FactorDirection>,
}

impl CompositeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips factors whose direction is negative. Factors without a known
    /// direction are taken as-is.
    #[must_use]
    pub fn with_directions(mut self, directions: BTreeMap<FactorId, FactorDirection>) -> Self {
        self.directions = directions;
        self
    }

    /// # Errors
    /// Returns [`EngineError::UnknownFactor`] if a weighted factor has no
    /// series in `series`.
    pub fn build(
        &self,
        weights: &WeightVector,
        series: &[Arc<FactorSeries>],
        window: DateRange,
    ) -> Result<CompositeScore> {
        let mut active: Vec<(Arc<FactorSeries>, f64)> = Vec::new();
        for fw in weights.iter() {
            if fw.weight <= 0.0 {
                continue;
            }
            let factor = series
                .iter()
                .find(|s| s.id() == fw.factor_id)
                .ok_or_else(|| EngineError::UnknownFactor(fw.factor_id.clone()))?;
            let sign = self
                .directions
                .get(&fw.factor_id)
                .map_or(1.0, |d| d.sign());
            active.push((Arc::clone(factor), fw.weight * sign));
        }

        let dates: BTreeSet<NaiveDate> = active
            .iter()
            .flat_map(|(f, _)| f.dates().filter(|d| window.contains(*d)))
            .collect();

        let mut by_date = BTreeMap::new();
        for date in dates {
            let day = score_date(&active, date);
            if !day.is_empty() {
                by_date.insert(date, day);
            }
        }

        debug!(
            factors = active.len(),
            dates = by_date.len(),
            "Built composite score"
        );
        CompositeScore::new(by_date)
    }
}

fn score_date(active: &[(Arc<FactorSeries>, f64)], date: NaiveDate) -> CrossSection {
    let mut numerator: BTreeMap<String, f64> = BTreeMap::new();
    let mut denominator: BTreeMap<String, f64> = BTreeMap::new();

    for (factor, signed_weight) in active {
        let section = factor.cross_section(date);
        let values: Vec<f64> = section.values().copied().collect();
        let Some(z) = zscores(&values) else { continue };

        for (inst, z) in section.keys().zip(z) {
            *numerator.entry(inst.clone()).or_default() += signed_weight * z;
            *denominator.entry(inst.clone()).or_default() += signed_weight.abs();
        }
    }

    numerator
        .into_iter()
        .filter_map(|(inst, num)| {
            let den = denominator.get(&inst).copied().unwrap_or(0.0);
            (den > f64::EPSILON).then(|| (inst, num / den))
        })
        .collect()
}
