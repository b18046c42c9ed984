//! Pairwise factor correlation and redundancy remediation.

use factor_lab_core::{
    CancellationToken, CorrelationConfig, CorrelationMethod, DateRange, EngineError, FactorId,
    FactorSeries, Result, Warning,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::stats::correlation;

/// One matrix cell. Every pair has a cell; pairs without enough overlapping
/// data carry an explicit undefined state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CorrelationCell {
    Defined { coefficient: f64, overlap: usize },
    Undefined { overlap: usize },
}

impl CorrelationCell {
    #[must_use]
    pub const fn coefficient(&self) -> Option<f64> {
        match self {
            Self::Defined { coefficient, .. } => Some(*coefficient),
            Self::Undefined { .. } => None,
        }
    }

    #[must_use]
    pub const fn overlap(&self) -> usize {
        match self {
            Self::Defined { overlap, .. } | Self::Undefined { overlap } => *overlap,
        }
    }
}

/// A pair whose absolute correlation exceeds the redundancy threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedundantPair {
    pub a: FactorId,
    pub b: FactorId,
    pub coefficient: f64,
}

/// Square, symmetric correlation matrix over an ordered factor list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    factor_ids: Vec<FactorId>,
    /// Row-major, `factor_ids.len()` squared.
    cells: Vec<CorrelationCell>,
    method: CorrelationMethod,
    window: DateRange,
}

impl CorrelationMatrix {
    #[must_use]
    pub fn factor_ids(&self) -> &[FactorId] {
        &self.factor_ids
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.factor_ids.len()
    }

    #[must_use]
    pub const fn method(&self) -> CorrelationMethod {
        self.method
    }

    #[must_use]
    pub const fn window(&self) -> DateRange {
        self.window
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.factor_ids.iter().position(|f| f == id)
    }

    #[must_use]
    pub fn cell_at(&self, row: usize, col: usize) -> Option<&CorrelationCell> {
        if row >= self.size() || col >= self.size() {
            return None;
        }
        self.cells.get(row * self.size() + col)
    }

    #[must_use]
    pub fn get(&self, a: &str, b: &str) -> Option<&CorrelationCell> {
        self.cell_at(self.index_of(a)?, self.index_of(b)?)
    }

    #[must_use]
    pub fn coefficient(&self, a: &str, b: &str) -> Option<f64> {
        self.get(a, b).and_then(CorrelationCell::coefficient)
    }

    /// Pairs (upper triangle) with `|r| > threshold`.
    #[must_use]
    pub fn redundant_pairs(&self, threshold: f64) -> Vec<RedundantPair> {
        let n = self.size();
        let mut pairs = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                if let Some(r) = self.cells[i * n + j].coefficient() {
                    if r.abs() > threshold {
                        pairs.push(RedundantPair {
                            a: self.factor_ids[i].clone(),
                            b: self.factor_ids[j].clone(),
                            coefficient: r,
                        });
                    }
                }
            }
        }
        pairs
    }

    /// One warning per undefined off-diagonal pair.
    #[must_use]
    pub fn warnings(&self) -> Vec<Warning> {
        let n = self.size();
        let mut warnings = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                if let CorrelationCell::Undefined { overlap } = self.cells[i * n + j] {
                    warnings.push(Warning::UndefinedCorrelation {
                        a: self.factor_ids[i].clone(),
                        b: self.factor_ids[j].clone(),
                        overlap,
                    });
                }
            }
        }
        warnings
    }
}

/// Builds [`CorrelationMatrix`] values from factor series.
#[derive(Debug, Clone, Default)]
pub struct CorrelationAnalyzer {
    config: CorrelationConfig,
}

impl CorrelationAnalyzer {
    #[must_use]
    pub const fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Correlates every pair of `factors` over the non-missing
    /// date x instrument intersection inside `window`.
    ///
    /// # Errors
    /// Rejects duplicate factor ids and returns [`EngineError::Cancelled`]
    /// if the token fires.
    pub fn compute(
        &self,
        factors: &[Arc<FactorSeries>],
        window: DateRange,
        cancel: &CancellationToken,
    ) -> Result<CorrelationMatrix> {
        let mut seen = BTreeSet::new();
        for factor in factors {
            if !seen.insert(factor.id()) {
                return Err(EngineError::invalid(format!(
                    "factor {} selected more than once",
                    factor.id()
                )));
            }
        }

        let n = factors.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (i..n).map(move |j| (i, j)))
            .collect();

        let computed: Vec<((usize, usize), CorrelationCell)> = pairs
            .par_iter()
            .map(|&(i, j)| -> Result<((usize, usize), CorrelationCell)> {
                cancel.check()?;
                let cell = if i == j {
                    diagonal_cell(&factors[i], window)
                } else {
                    self.pair_cell(&factors[i], &factors[j], window)
                };
                Ok(((i, j), cell))
            })
            .collect::<Result<_>>()?;

        let mut cells = vec![CorrelationCell::Undefined { overlap: 0 }; n * n];
        for ((i, j), cell) in computed {
            cells[i * n + j] = cell;
            cells[j * n + i] = cell;
        }

        debug!(factors = n, method = ?self.config.method, "Computed correlation matrix");

        Ok(CorrelationMatrix {
            factor_ids: factors.iter().map(|f| f.id().to_string()).collect(),
            cells,
            method: self.config.method,
            window,
        })
    }

    fn pair_cell(&self, a: &FactorSeries, b: &FactorSeries, window: DateRange) -> CorrelationCell {
        let (x, y): (Vec<f64>, Vec<f64>) = a
            .valid_values(window)
            .filter_map(|(date, inst, va)| b.value(date, inst).map(|vb| (va, vb)))
            .unzip();

        let overlap = x.len();
        if overlap < self.config.min_overlap.max(2) {
            return CorrelationCell::Undefined { overlap };
        }
        match correlation(self.config.method, &x, &y) {
            Some(coefficient) => CorrelationCell::Defined {
                coefficient,
                overlap,
            },
            None => CorrelationCell::Undefined { overlap },
        }
    }
}

fn diagonal_cell(factor: &FactorSeries, window: DateRange) -> CorrelationCell {
    let overlap = factor.valid_values(window).count();
    if overlap == 0 {
        CorrelationCell::Undefined { overlap }
    } else {
        CorrelationCell::Defined {
            coefficient: 1.0,
            overlap,
        }
    }
}

/// Recommended action for a redundant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    DropLowerIr,
    /// Regress the target on the kept factor and use the residual.
    Orthogonalize,
    PcaMerge,
}

/// Structured suggestion for a redundant pair; formatting into prose is left
/// to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationSuggestion {
    pub factor_a: FactorId,
    pub factor_b: FactorId,
    pub coefficient: f64,
    pub action: RemediationAction,
    /// The lower IC-IR factor, acted upon by `action`.
    pub target: FactorId,
    pub keep: FactorId,
    pub target_ic_ir: Option<f64>,
    pub keep_ic_ir: Option<f64>,
}

const NEAR_DUPLICATE: f64 = 0.9;
const ORTHOGONALIZE_GAP: f64 = 0.3;

/// Flags redundant pairs and picks a deterministic remediation for each.
///
/// The target is the factor with the lower IC-IR; an undefined IC-IR ranks
/// below any defined one and ties go against the later id.
#[must_use]
pub fn suggest_remediations(
    matrix: &CorrelationMatrix,
    threshold: f64,
    ic_ir: &BTreeMap<FactorId, Option<f64>>,
) -> Vec<RemediationSuggestion> {
    matrix
        .redundant_pairs(threshold)
        .into_iter()
        .map(|pair| {
            let ir_a = ic_ir.get(&pair.a).copied().flatten();
            let ir_b = ic_ir.get(&pair.b).copied().flatten();

            let a_is_lower = match (ir_a, ir_b) {
                (Some(x), Some(y)) if (x - y).abs() > f64::EPSILON => x < y,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                _ => pair.a > pair.b,
            };
            let (target, target_ir, keep, keep_ir) = if a_is_lower {
                (pair.a.clone(), ir_a, pair.b.clone(), ir_b)
            } else {
                (pair.b.clone(), ir_b, pair.a.clone(), ir_a)
            };

            let action = remediation_action(pair.coefficient, target_ir, keep_ir);

            RemediationSuggestion {
                factor_a: pair.a,
                factor_b: pair.b,
                coefficient: pair.coefficient,
                action,
                target,
                keep,
                target_ic_ir: target_ir,
                keep_ic_ir: keep_ir,
            }
        })
        .collect()
}

fn remediation_action(r: f64, target_ir: Option<f64>, keep_ir: Option<f64>) -> RemediationAction {
    let Some(target_ir) = target_ir.filter(|ir| *ir > 0.0) else {
        return RemediationAction::DropLowerIr;
    };
    if r.abs() >= NEAR_DUPLICATE {
        return RemediationAction::DropLowerIr;
    }
    let keep_ir = keep_ir.unwrap_or(target_ir);
    let gap = (keep_ir - target_ir) / keep_ir.abs().max(f64::EPSILON);
    if gap >= ORTHOGONALIZE_GAP {
        RemediationAction::Orthogonalize
    } else {
        RemediationAction::PcaMerge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use factor_lab_core::{FactorCategory, Observation};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, day).unwrap()
    }

    fn series(id: &str, values: &[(u32, &str, Option<f64>)]) -> Arc<FactorSeries> {
        let obs = values
            .iter()
            .map(|(d, inst, v)| Observation::new(date(*d), *inst, *v));
        Arc::new(FactorSeries::new(id, id, FactorCategory::Technical, obs).unwrap())
    }

    fn analyzer(min_overlap: usize) -> CorrelationAnalyzer {
        CorrelationAnalyzer::new(CorrelationConfig {
            redundancy_threshold: 0.7,
            min_overlap,
            method: CorrelationMethod::Pearson,
        })
    }

    // ============================================
    // Matrix Tests
    // ============================================

    #[test]
    fn matrix_is_symmetric_with_unit_diagonal() {
        let a = series("a", &[(1, "X", Some(1.0)), (1, "Y", Some(2.0)), (2, "X", Some(3.0))]);
        let b = series("b", &[(1, "X", Some(2.0)), (1, "Y", Some(1.0)), (2, "X", Some(5.0))]);

        let matrix = analyzer(2)
            .compute(&[a, b], DateRange::all(), &CancellationToken::new())
            .unwrap();

        assert_eq!(matrix.coefficient("a", "a"), Some(1.0));
        assert_eq!(matrix.coefficient("b", "b"), Some(1.0));
        assert_eq!(matrix.get("a", "b"), matrix.get("b", "a"));
        assert_eq!(matrix.get("a", "b").unwrap().overlap(), 3);
    }

    #[test]
    fn small_overlap_is_undefined_not_zero() {
        let a = series("a", &[(1, "X", Some(1.0)), (1, "Y", Some(2.0))]);
        let b = series("b", &[(1, "X", Some(2.0)), (1, "Y", None)]);

        let matrix = analyzer(2)
            .compute(&[a, b], DateRange::all(), &CancellationToken::new())
            .unwrap();

        assert_eq!(
            matrix.get("a", "b"),
            Some(&CorrelationCell::Undefined { overlap: 1 })
        );
        assert_eq!(
            matrix.warnings(),
            vec![Warning::UndefinedCorrelation {
                a: "a".to_string(),
                b: "b".to_string(),
                overlap: 1
            }]
        );
    }

    #[test]
    fn empty_series_has_undefined_diagonal() {
        let empty = series("e", &[(1, "X", None)]);
        let matrix = analyzer(2)
            .compute(&[empty], DateRange::all(), &CancellationToken::new())
            .unwrap();
        assert_eq!(matrix.coefficient("e", "e"), None);
    }

    #[test]
    fn duplicate_selection_is_rejected() {
        let a = series("a", &[(1, "X", Some(1.0))]);
        let result = analyzer(2).compute(
            &[Arc::clone(&a), a],
            DateRange::all(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(EngineError::InvalidParameter(_))));
    }

    // ============================================
    // Remediation Tests
    // ============================================

    fn matrix_with(coefficient: f64) -> CorrelationMatrix {
        let cell = CorrelationCell::Defined {
            coefficient,
            overlap: 100,
        };
        let unit = CorrelationCell::Defined {
            coefficient: 1.0,
            overlap: 100,
        };
        CorrelationMatrix {
            factor_ids: vec!["a".to_string(), "b".to_string()],
            cells: vec![unit, cell, cell, unit],
            method: CorrelationMethod::Pearson,
            window: DateRange::all(),
        }
    }

    #[test]
    fn lower_ir_factor_is_the_target() {
        let irs = BTreeMap::from([("a".to_string(), Some(0.5)), ("b".to_string(), Some(0.45))]);
        let suggestions = suggest_remediations(&matrix_with(0.8), 0.7, &irs);

        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].target, "b");
        assert_eq!(suggestions[0].keep, "a");
        assert_eq!(suggestions[0].action, RemediationAction::PcaMerge);
    }

    #[test]
    fn action_follows_gap_and_strength() {
        let irs = BTreeMap::from([("a".to_string(), Some(0.2)), ("b".to_string(), Some(0.6))]);
        let s = suggest_remediations(&matrix_with(-0.75), 0.7, &irs);
        assert_eq!(s[0].target, "a");
        assert_eq!(s[0].action, RemediationAction::Orthogonalize);

        let s = suggest_remediations(&matrix_with(0.95), 0.7, &irs);
        assert_eq!(s[0].action, RemediationAction::DropLowerIr);

        let irs = BTreeMap::from([("a".to_string(), None), ("b".to_string(), Some(0.6))]);
        let s = suggest_remediations(&matrix_with(0.75), 0.7, &irs);
        assert_eq!(s[0].target, "a");
        assert_eq!(s[0].action, RemediationAction::DropLowerIr);
    }

    #[test]
    fn threshold_is_strict() {
        let irs = BTreeMap::new();
        assert!(suggest_remediations(&matrix_with(0.7), 0.7, &irs).is_empty());
    }
}
