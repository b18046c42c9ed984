//! Fusion of selected factors into a single weight vector.

use factor_lab_core::{
    CancellationToken, DateRange, EngineError, FactorId, FactorSeries, Result, Warning,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::pca::first_component_loadings;
use crate::statistics::FactorStatistics;

/// Total weight of every [`WeightVector`].
pub const WEIGHT_TOTAL: f64 = 100.0;

/// Allowed deviation of caller-entered weights from [`WEIGHT_TOTAL`].
pub const CUSTOM_TOLERANCE: f64 = 0.5;

/// Weighting policy selected by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WeightMethod {
    Equal,
    IcIrWeighted,
    Pca,
    Custom { weights: BTreeMap<FactorId, f64> },
}

impl WeightMethod {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::IcIrWeighted => "ic_ir_weighted",
            Self::Pca => "pca",
            Self::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorWeight {
    pub factor_id: FactorId,
    pub weight: f64,
}

/// Weights in [0, 100] summing to 100, in selection order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeightVector {
    weights: Vec<FactorWeight>,
}

impl WeightVector {
    fn from_pairs(pairs: impl IntoIterator<Item = (FactorId, f64)>) -> Self {
        Self {
            weights: pairs
                .into_iter()
                .map(|(factor_id, weight)| FactorWeight { factor_id, weight })
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, factor_id: &str) -> Option<f64> {
        self.weights
            .iter()
            .find(|w| w.factor_id == factor_id)
            .map(|w| w.weight)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FactorWeight> {
        self.weights.iter()
    }

    #[must_use]
    pub fn factor_ids(&self) -> Vec<FactorId> {
        self.weights.iter().map(|w| w.factor_id.clone()).collect()
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.weights.iter().map(|w| w.weight).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Weighted-sum expression, e.g. `34 * momentum + 33 * value + 33 * quality`.
    ///
    /// Weights use shortest round-trip formatting, so parsing the string back
    /// recovers the exact values.
    #[must_use]
    pub fn formula(&self) -> String {
        let mut out = String::new();
        for (i, w) in self.weights.iter().enumerate() {
            if i > 0 {
                out.push_str(" + ");
            }
            let _ = write!(out, "{} * {}", w.weight, w.factor_id);
        }
        out
    }
}

/// A fused weight vector plus the warnings raised while producing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fusion {
    pub weights: WeightVector,
    pub warnings: Vec<Warning>,
}

/// Inputs for one fusion request. `series` is only read by PCA.
#[derive(Debug, Clone, Copy)]
pub struct FusionInputs<'a> {
    pub statistics: &'a [FactorStatistics],
    pub series: &'a [Arc<FactorSeries>],
    pub window: DateRange,
}

/// Dispatches a [`WeightMethod`] over a selected factor set.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightingOptimizer;

impl WeightingOptimizer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Produces weights for the factors in `inputs.statistics`, in that order.
    ///
    /// # Errors
    /// Rejects empty or duplicated selections, invalid custom weights, and
    /// PCA on an insufficient common sample.
    pub fn fuse(
        &self,
        inputs: FusionInputs<'_>,
        method: &WeightMethod,
        cancel: &CancellationToken,
    ) -> Result<Fusion> {
        let ids: Vec<FactorId> = inputs
            .statistics
            .iter()
            .map(|s| s.factor_id.clone())
            .collect();
        validate_selection(&ids)?;

        let fusion = match method {
            WeightMethod::Equal => Fusion {
                weights: equal_weights(&ids),
                warnings: Vec::new(),
            },
            WeightMethod::IcIrWeighted => icir_weights(inputs.statistics),
            WeightMethod::Pca => pca_weights(&ids, inputs, cancel)?,
            WeightMethod::Custom { weights } => custom_weights(&ids, weights)?,
        };

        debug!(
            method = method.name(),
            factors = ids.len(),
            formula = %fusion.weights.formula(),
            "Fused factor weights"
        );
        Ok(fusion)
    }
}

fn validate_selection(ids: &[FactorId]) -> Result<()> {
    if ids.is_empty() {
        return Err(EngineError::invalid("no factors selected"));
    }
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(EngineError::invalid(format!("factor {id} selected more than once")));
        }
    }
    Ok(())
}

/// 100 / n in whole units, with the rounding remainder on the first id in
/// id order. Above 100 factors whole units are impossible, so the share is
/// fractional.
#[must_use]
pub fn equal_weights(ids: &[FactorId]) -> WeightVector {
    let n = ids.len();
    if n == 0 {
        return WeightVector::default();
    }
    if n > 100 {
        let share = WEIGHT_TOTAL / n as f64;
        return WeightVector::from_pairs(ids.iter().map(|id| (id.clone(), share)));
    }

    let base = 100 / n;
    let remainder = 100 - base * n;
    let first = ids.iter().min();

    WeightVector::from_pairs(ids.iter().map(|id| {
        let extra = if Some(id) == first { remainder } else { 0 };
        (id.clone(), (base + extra) as f64)
    }))
}

fn icir_weights(statistics: &[FactorStatistics]) -> Fusion {
    let raw: Vec<f64> = statistics
        .iter()
        .map(|s| s.ic_ir.unwrap_or(0.0).max(0.0))
        .collect();
    let total: f64 = raw.iter().sum();

    if total <= f64::EPSILON {
        warn!("No factor has positive IC-IR; falling back to equal weights");
        let ids: Vec<FactorId> = statistics.iter().map(|s| s.factor_id.clone()).collect();
        return Fusion {
            weights: equal_weights(&ids),
            warnings: vec![Warning::IcIrFallbackToEqual],
        };
    }

    Fusion {
        weights: WeightVector::from_pairs(
            statistics
                .iter()
                .zip(raw)
                .map(|(s, r)| (s.factor_id.clone(), WEIGHT_TOTAL * r / total)),
        ),
        warnings: Vec::new(),
    }
}

fn pca_weights(
    ids: &[FactorId],
    inputs: FusionInputs<'_>,
    cancel: &CancellationToken,
) -> Result<Fusion> {
    if ids.len() == 1 {
        return Ok(Fusion {
            weights: equal_weights(ids),
            warnings: Vec::new(),
        });
    }

    // align series with the selection order
    let series: Vec<Arc<FactorSeries>> = ids
        .iter()
        .map(|id| {
            inputs
                .series
                .iter()
                .find(|s| s.id() == id)
                .cloned()
                .ok_or_else(|| EngineError::UnknownFactor(id.clone()))
        })
        .collect::<Result<_>>()?;

    match first_component_loadings(&series, inputs.window, cancel)? {
        Some(loadings) => {
            let total: f64 = loadings.iter().sum();
            Ok(Fusion {
                weights: WeightVector::from_pairs(
                    ids.iter()
                        .cloned()
                        .zip(loadings.iter().map(|l| WEIGHT_TOTAL * l / total)),
                ),
                warnings: Vec::new(),
            })
        }
        None => {
            warn!("First principal component has no positive loading; falling back to equal weights");
            Ok(Fusion {
                weights: equal_weights(ids),
                warnings: vec![Warning::PcaFallbackToEqual],
            })
        }
    }
}

fn custom_weights(ids: &[FactorId], custom: &BTreeMap<FactorId, f64>) -> Result<Fusion> {
    for (id, w) in custom {
        if !ids.contains(id) {
            return Err(EngineError::invalid(format!(
                "custom weight given for unselected factor {id}"
            )));
        }
        if !w.is_finite() || *w < 0.0 {
            return Err(EngineError::invalid(format!(
                "custom weight {w} for factor {id} must be a non-negative number"
            )));
        }
    }

    let entered: Vec<(FactorId, f64)> = ids
        .iter()
        .map(|id| (id.clone(), custom.get(id).copied().unwrap_or(0.0)))
        .collect();
    let sum: f64 = entered.iter().map(|(_, w)| w).sum();
    if sum <= f64::EPSILON {
        return Err(EngineError::invalid("custom weights sum to zero"));
    }

    if (sum - WEIGHT_TOTAL).abs() <= CUSTOM_TOLERANCE {
        return Ok(Fusion {
            weights: WeightVector::from_pairs(entered),
            warnings: Vec::new(),
        });
    }

    warn!(original_sum = sum, "Custom weights renormalized to 100");
    Ok(Fusion {
        weights: WeightVector::from_pairs(
            entered
                .into_iter()
                .map(|(id, w)| (id, WEIGHT_TOTAL * w / sum)),
        ),
        warnings: vec![Warning::WeightNormalization { original_sum: sum }],
    })
}
