//! First principal component loadings of a factor panel.

use factor_lab_core::{CancellationToken, DateRange, EngineError, FactorSeries, Result};
use nalgebra::DMatrix;
use std::sync::Arc;
use tracing::debug;

use crate::stats::{mean, sample_std};

/// Rows where every factor has a valid value: one row per (date, instrument),
/// one column per factor.
fn common_sample(
    factors: &[Arc<FactorSeries>],
    window: DateRange,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f64>>> {
    let Some((first, rest)) = factors.split_first() else {
        return Ok(Vec::new());
    };
    cancel.check()?;

    let rows = first
        .valid_values(window)
        .filter_map(|(date, inst, v)| {
            let mut row = Vec::with_capacity(factors.len());
            row.push(v);
            for other in rest {
                row.push(other.value(date, inst)?);
            }
            Some(row)
        })
        .collect();
    Ok(rows)
}

/// Standardized first-component loadings, sign-normalized so their sum is
/// non-negative, with negative loadings clamped to zero.
///
/// Returns `Ok(None)` when no loading is positive after normalization.
///
/// # Errors
/// Returns [`EngineError::DataInsufficient`] when the common sample has fewer
/// than `max(factors + 1, 3)` rows.
pub fn first_component_loadings(
    factors: &[Arc<FactorSeries>],
    window: DateRange,
    cancel: &CancellationToken,
) -> Result<Option<Vec<f64>>> {
    let k = factors.len();
    let rows = common_sample(factors, window, cancel)?;
    let required = (k + 1).max(3);
    if rows.len() < required {
        return Err(EngineError::insufficient(
            "common sample for PCA",
            rows.len(),
            required,
        ));
    }

    let m = rows.len();
    let mut standardized = DMatrix::<f64>::zeros(m, k);
    for col in 0..k {
        cancel.check()?;
        let column: Vec<f64> = rows.iter().map(|r| r[col]).collect();
        let mu = mean(&column).unwrap_or(0.0);
        let sd = sample_std(&column).unwrap_or(0.0);
        if sd < f64::EPSILON {
            // constant column carries no variance; leave it at zero
            continue;
        }
        for (row, value) in column.iter().enumerate() {
            standardized[(row, col)] = (value - mu) / sd;
        }
    }

    let corr = (standardized.transpose() * &standardized) / (m - 1) as f64;
    cancel.check()?;
    let eigen = corr.symmetric_eigen();

    let (leading, eigenvalue) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, v)| (i, *v))
        .ok_or_else(|| EngineError::invalid("empty factor selection for PCA"))?;

    let mut loadings: Vec<f64> = eigen.eigenvectors.column(leading).iter().copied().collect();
    if loadings.iter().sum::<f64>() < 0.0 {
        for l in &mut loadings {
            *l = -*l;
        }
    }
    for l in &mut loadings {
        *l = l.max(0.0);
    }

    debug!(factors = k, samples = m, eigenvalue, "Computed first principal component");

    if loadings.iter().sum::<f64>() <= f64::EPSILON {
        return Ok(None);
    }
    Ok(Some(loadings))
}
