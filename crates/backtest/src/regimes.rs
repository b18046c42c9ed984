//! Sentiment / volatility regime classification.
//!
//! Four configurable boundaries split [0, 100] into five contiguous bands.
//! A score on a boundary belongs to the band above it. With a hysteresis
//! margin `h` the regime only moves up once the score clears a boundary by
//! more than `h`, and likewise downwards, so a score oscillating around a
//! boundary does not flip the regime on every point.

use chrono::NaiveDate;
use factor_lab_core::{EngineError, GapPolicy, Regime, RegimeConfig, Result, Warning};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Regime assigned to one date. `stale` marks a carried-forward regime on a
/// date without a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeObservation {
    pub date: NaiveDate,
    pub regime: Option<Regime>,
    pub stale: bool,
}

/// Ordered per-date regime labels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegimeSeries {
    observations: Vec<RegimeObservation>,
}

impl RegimeSeries {
    #[must_use]
    pub fn get(&self, date: NaiveDate) -> Option<Regime> {
        self.observations
            .binary_search_by_key(&date, |o| o.date)
            .ok()
            .and_then(|i| self.observations[i].regime)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegimeObservation> {
        self.observations.iter()
    }

    #[must_use]
    pub fn regimes(&self) -> Vec<Option<Regime>> {
        self.observations.iter().map(|o| o.regime).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Number of regime changes between consecutive labelled dates.
    #[must_use]
    pub fn transitions(&self) -> usize {
        let labelled: Vec<Regime> = self.observations.iter().filter_map(|o| o.regime).collect();
        labelled.windows(2).filter(|w| w[0] != w[1]).count()
    }

    #[must_use]
    pub fn warnings(&self) -> Vec<Warning> {
        self.observations
            .iter()
            .filter(|o| o.stale)
            .map(|o| Warning::StaleRegime { date: o.date })
            .collect()
    }
}

/// Labels dates with a [`Regime`] from a [0, 100] score series.
#[derive(Debug, Clone, Default)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    /// # Errors
    /// Rejects boundaries that are not strictly increasing inside [0, 100]
    /// and negative or non-finite hysteresis.
    pub fn new(config: RegimeConfig) -> Result<Self> {
        let b = config.boundaries;
        let ordered = b.windows(2).all(|w| w[0] < w[1]);
        let in_range = b.iter().all(|v| v.is_finite() && (0.0..=100.0).contains(v));
        if !ordered || !in_range {
            return Err(EngineError::invalid(format!(
                "regime boundaries {b:?} must be strictly increasing within [0, 100]"
            )));
        }
        if !config.hysteresis.is_finite() || config.hysteresis < 0.0 {
            return Err(EngineError::invalid(format!(
                "hysteresis {} must be a non-negative number",
                config.hysteresis
            )));
        }
        Ok(Self { config })
    }

    /// Band containing `score`, ignoring hysteresis.
    #[must_use]
    pub fn band(&self, score: f64) -> Regime {
        Regime::from_index(self.band_index(score))
    }

    fn band_index(&self, score: f64) -> usize {
        self.config
            .boundaries
            .iter()
            .filter(|b| score >= **b)
            .count()
    }

    /// Boundaries the score clears upwards by more than the hysteresis
    /// margin. With no margin this is the plain band.
    fn cleared_above(&self, score: f64) -> usize {
        let h = self.config.hysteresis;
        if h == 0.0 {
            return self.band_index(score);
        }
        self.config
            .boundaries
            .iter()
            .filter(|b| score > **b + h)
            .count()
    }

    fn next_index(&self, current: usize, score: f64) -> usize {
        let h = self.config.hysteresis;
        let up = self.cleared_above(score);
        if up > current {
            return up;
        }
        let down = self.band_index(score + h);
        if down < current {
            return down;
        }
        current
    }

    /// Classifies an ordered score series.
    ///
    /// # Errors
    /// Returns [`EngineError::MalformedInput`] for scores outside [0, 100]
    /// and [`EngineError::InvalidParameter`] for dates that are not strictly
    /// increasing.
    pub fn classify(&self, scores: &[(NaiveDate, Option<f64>)]) -> Result<RegimeSeries> {
        for pair in scores.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return Err(EngineError::invalid(format!(
                    "score dates must be strictly increasing ({} then {})",
                    pair[0].0, pair[1].0
                )));
            }
        }

        let mut current: Option<usize> = None;
        let mut observations = Vec::with_capacity(scores.len());

        for &(date, score) in scores {
            match score {
                Some(s) => {
                    if !s.is_finite() || !(0.0..=100.0).contains(&s) {
                        return Err(EngineError::malformed(
                            date,
                            "*",
                            "regime_score",
                            format!("score {s} outside [0, 100]"),
                        ));
                    }
                    let next = match current {
                        None => self.band_index(s),
                        Some(c) => self.next_index(c, s),
                    };
                    current = Some(next);
                    observations.push(RegimeObservation {
                        date,
                        regime: Some(Regime::from_index(next)),
                        stale: false,
                    });
                }
                None => {
                    let carried = match self.config.gap_policy {
                        GapPolicy::CarryForward => current.map(Regime::from_index),
                        GapPolicy::Unassigned => None,
                    };
                    observations.push(RegimeObservation {
                        date,
                        regime: carried,
                        stale: carried.is_some(),
                    });
                }
            }
        }

        let series = RegimeSeries { observations };
        debug!(
            dates = series.len(),
            transitions = series.transitions(),
            "Classified regimes"
        );
        Ok(series)
    }
}

/// Converts a raw indicator such as realized volatility into a [0, 100]
/// score: the percentile rank of each value among the trailing `lookback`
/// valid values, itself included. A lone value scores 50. The service applies
/// it to the stored sentiment feed when `regime.percentile_lookback` is set.
#[must_use]
pub fn percentile_rank_scores(
    values: &[(NaiveDate, Option<f64>)],
    lookback: usize,
) -> Vec<(NaiveDate, Option<f64>)> {
    let lookback = lookback.max(1);
    let mut history: Vec<f64> = Vec::new();

    values
        .iter()
        .map(|&(date, value)| {
            let Some(v) = value.filter(|v| v.is_finite()) else {
                return (date, None);
            };
            history.push(v);
            let start = history.len().saturating_sub(lookback);
            let window = &history[start..];
            let n = window.len();
            if n < 2 {
                return (date, Some(50.0));
            }
            let below = window.iter().filter(|x| **x < v).count() as f64;
            let equal = window.iter().filter(|x| (**x - v).abs() < f64::EPSILON).count() as f64;
            let rank = below + (equal - 1.0) / 2.0;
            (date, Some(100.0 * rank / (n - 1) as f64))
        })
        .collect()
}

/// Performance of the periods spent in one regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimePerformance {
    pub regime: Regime,
    pub periods: usize,
    pub mean_return: f64,
    pub cumulative_return: f64,
    /// Share of periods with a positive net return.
    pub hit_rate: f64,
}

/// Aggregates `(regime, net return)` pairs per regime, ascending by regime.
/// Untagged periods are ignored.
#[must_use]
pub fn regime_performance(tagged: &[(Option<Regime>, f64)]) -> Vec<RegimePerformance> {
    let mut grouped: BTreeMap<Regime, Vec<f64>> = BTreeMap::new();
    for (regime, ret) in tagged {
        if let Some(regime) = regime {
            grouped.entry(*regime).or_default().push(*ret);
        }
    }

    grouped
        .into_iter()
        .map(|(regime, returns)| {
            let n = returns.len() as f64;
            RegimePerformance {
                regime,
                periods: returns.len(),
                mean_return: returns.iter().sum::<f64>() / n,
                cumulative_return: returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0,
                hit_rate: returns.iter().filter(|r| **r > 0.0).count() as f64 / n,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, day).unwrap()
    }

    fn series(scores: &[Option<f64>]) -> Vec<(NaiveDate, Option<f64>)> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| (date(i as u32 + 1), *s))
            .collect()
    }

    fn classifier(hysteresis: f64, gap_policy: GapPolicy) -> RegimeClassifier {
        RegimeClassifier::new(RegimeConfig {
            boundaries: [20.0, 40.0, 60.0, 80.0],
            hysteresis,
            gap_policy,
            percentile_lookback: None,
        })
        .unwrap()
    }

    // ============================================
    // Classification Tests
    // ============================================

    #[test]
    fn score_below_first_boundary_is_extreme_low() {
        let result = classifier(0.0, GapPolicy::CarryForward)
            .classify(&series(&[Some(15.0), Some(25.0), Some(45.0), Some(65.0), Some(85.0)]))
            .unwrap();

        // 15 sits in the lowest band [0, 20)
        assert_eq!(
            result.regimes(),
            vec![
                Some(Regime::ExtremeLow),
                Some(Regime::Low),
                Some(Regime::Neutral),
                Some(Regime::High),
                Some(Regime::ExtremeHigh),
            ]
        );
    }

    #[test]
    fn boundary_belongs_to_upper_band() {
        let c = classifier(0.0, GapPolicy::CarryForward);
        assert_eq!(c.band(20.0), Regime::Low);
        assert_eq!(c.band(0.0), Regime::ExtremeLow);
        assert_eq!(c.band(100.0), Regime::ExtremeHigh);
    }

    #[test]
    fn hysteresis_suppresses_small_crossings() {
        let result = classifier(3.0, GapPolicy::CarryForward)
            .classify(&series(&[Some(38.0), Some(41.0), Some(39.0), Some(44.0), Some(38.5)]))
            .unwrap();

        assert_eq!(
            result.regimes(),
            vec![
                Some(Regime::Low),
                Some(Regime::Low),
                Some(Regime::Low),
                Some(Regime::Neutral),
                Some(Regime::Neutral),
            ]
        );
    }

    #[test]
    fn crossing_exactly_by_the_margin_keeps_regime() {
        let result = classifier(3.0, GapPolicy::CarryForward)
            .classify(&series(&[
                Some(38.0),
                Some(43.0),
                Some(43.5),
                Some(37.0),
                Some(36.9),
            ]))
            .unwrap();

        // up needs > 43, down needs < 37
        assert_eq!(
            result.regimes(),
            vec![
                Some(Regime::Low),
                Some(Regime::Low),
                Some(Regime::Neutral),
                Some(Regime::Neutral),
                Some(Regime::Low),
            ]
        );
    }

    #[test]
    fn gaps_carry_forward_and_are_stale() {
        let result = classifier(0.0, GapPolicy::CarryForward)
            .classify(&series(&[None, Some(50.0), None]))
            .unwrap();

        assert_eq!(result.regimes(), vec![None, Some(Regime::Neutral), Some(Regime::Neutral)]);
        assert_eq!(result.warnings(), vec![Warning::StaleRegime { date: date(3) }]);
    }

    #[test]
    fn unassigned_policy_leaves_gaps_empty() {
        let result = classifier(0.0, GapPolicy::Unassigned)
            .classify(&series(&[Some(50.0), None]))
            .unwrap();
        assert_eq!(result.regimes(), vec![Some(Regime::Neutral), None]);
        assert!(result.warnings().is_empty());
    }

    #[test]
    fn out_of_range_score_is_malformed() {
        let err = classifier(0.0, GapPolicy::CarryForward)
            .classify(&series(&[Some(101.0)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedInput { .. }));
    }

    #[test]
    fn unordered_boundaries_are_rejected() {
        let result = RegimeClassifier::new(RegimeConfig {
            boundaries: [20.0, 60.0, 40.0, 80.0],
            ..RegimeConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn classification_is_deterministic() {
        let scores = series(&[Some(10.0), Some(55.0), None, Some(90.0)]);
        let c = classifier(2.0, GapPolicy::CarryForward);
        assert_eq!(c.classify(&scores).unwrap(), c.classify(&scores).unwrap());
    }

    // ============================================
    // Helper Tests
    // ============================================

    #[test]
    fn percentile_scores_stay_in_range() {
        let raw = series(&[Some(1.0), Some(3.0), Some(2.0), None, Some(5.0)]);
        let scores = percentile_rank_scores(&raw, 3);

        assert_eq!(scores[0].1, Some(50.0));
        assert_eq!(scores[1].1, Some(100.0));
        assert_eq!(scores[2].1, Some(50.0));
        assert_eq!(scores[3].1, None);
        assert_eq!(scores[4].1, Some(100.0));
    }

    #[test]
    fn regime_performance_groups_returns() {
        let perf = regime_performance(&[
            (Some(Regime::High), 0.01),
            (Some(Regime::Low), -0.02),
            (Some(Regime::High), 0.03),
            (None, 0.5),
        ]);

        assert_eq!(perf.len(), 2);
        assert_eq!(perf[0].regime, Regime::Low);
        assert_eq!(perf[1].periods, 2);
        assert!((perf[1].mean_return - 0.02).abs() < 1e-12);
        assert!((perf[1].hit_rate - 1.0).abs() < f64::EPSILON);
    }
}
