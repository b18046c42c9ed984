//! Flat records for tabular export of factor statistics.

use chrono::NaiveDate;
use factor_lab_core::FactorId;
use serde::{Deserialize, Serialize};

use crate::statistics::FactorStatistics;

/// One period of a factor's IC series, with the factor's window summary
/// repeated on each row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub factor_id: FactorId,
    pub date: NaiveDate,
    pub ic: f64,
    pub instruments: usize,
    pub ic_mean: f64,
    pub ic_ir: Option<f64>,
}

impl StatisticsRecord {
    #[must_use]
    pub fn from_statistics(stats: &FactorStatistics) -> Vec<Self> {
        stats
            .ic_series
            .iter()
            .map(|obs| Self {
                factor_id: stats.factor_id.clone(),
                date: obs.date,
                ic: obs.ic,
                instruments: obs.instruments,
                ic_mean: stats.ic_mean,
                ic_ir: stats.ic_ir,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileRecord {
    pub factor_id: FactorId,
    pub quantile: usize,
    pub mean_return: Option<f64>,
    pub periods: usize,
}

impl QuantileRecord {
    #[must_use]
    pub fn from_statistics(stats: &FactorStatistics) -> Vec<Self> {
        stats
            .quantile_returns
            .iter()
            .map(|q| Self {
                factor_id: stats.factor_id.clone(),
                quantile: q.quantile,
                mean_return: q.mean_return,
                periods: q.periods,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::{FactorDirection, HalfLife, IcObservation, QuantileReturn};
    use factor_lab_core::DateRange;

    #[test]
    fn one_row_per_ic_period_and_bucket() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        let stats = FactorStatistics {
            factor_id: "momentum".to_string(),
            window: DateRange::all(),
            ic_series: vec![IcObservation {
                date,
                ic: 0.031_234_567_891_234,
                instruments: 120,
            }],
            insufficient_periods: Vec::new(),
            ic_mean: 0.031_234_567_891_234,
            ic_std: None,
            ic_ir: None,
            ic_t_stat: None,
            decay: Vec::new(),
            half_life: HalfLife::Undefined,
            turnover: None,
            quantile_returns: vec![
                QuantileReturn {
                    quantile: 1,
                    mean_return: Some(-0.01),
                    periods: 1,
                },
                QuantileReturn {
                    quantile: 2,
                    mean_return: None,
                    periods: 0,
                },
            ],
            quantile_spread: None,
            monotonic: false,
            direction: FactorDirection::Positive,
        };

        let rows = StatisticsRecord::from_statistics(&stats);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ic, 0.031_234_567_891_234);

        let buckets = QuantileRecord::from_statistics(&stats);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[1].mean_return, None);
    }
}
