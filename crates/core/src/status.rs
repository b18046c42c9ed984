//! Warnings and query status envelope.
//!
//! A result flagged with warnings was computed but with reduced confidence.
//! Presentation layers must surface that distinction instead of showing the
//! value as fully trustworthy.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A recoverable condition encountered while producing a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Selection universe was empty for a period; the period was skipped.
    ConstraintInfeasible { date: NaiveDate },
    /// Custom weights did not sum to 100 and were rescaled.
    WeightNormalization { original_sum: f64 },
    /// IC-IR weighting found no positive IC-IR and fell back to equal weights.
    IcIrFallbackToEqual,
    /// PCA produced no positive loading and fell back to equal weights.
    PcaFallbackToEqual,
    /// A period had too few instruments and was excluded from IC statistics.
    InsufficientSample { date: NaiveDate, instruments: usize },
    /// A correlation cell could not be computed from the overlapping sample.
    UndefinedCorrelation { a: String, b: String, overlap: usize },
    /// Regime for a gap date was carried forward from the last known score.
    StaleRegime { date: NaiveDate },
    /// Factor statistics failed, so the factor entered the composite unsigned.
    DirectionUnknown { factor: String },
    /// Factor statistics failed, so its IC-IR ranks as undefined in remediation.
    StatisticsUnavailable { factor: String },
}

impl Warning {
    /// Short machine-friendly code for the warning.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConstraintInfeasible { .. } => "constraint_infeasible",
            Self::WeightNormalization { .. } => "weight_normalization",
            Self::IcIrFallbackToEqual => "icir_fallback_to_equal",
            Self::PcaFallbackToEqual => "pca_fallback_to_equal",
            Self::InsufficientSample { .. } => "insufficient_sample",
            Self::UndefinedCorrelation { .. } => "undefined_correlation",
            Self::StaleRegime { .. } => "stale_regime",
            Self::DirectionUnknown { .. } => "direction_unknown",
            Self::StatisticsUnavailable { .. } => "statistics_unavailable",
        }
    }
}

/// Outcome classification attached to every query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryStatus {
    /// Computed with full confidence.
    Ok,
    /// Computed, but with warnings the caller must surface.
    PartialData { warnings: Vec<Warning> },
    /// The caller cancelled the request; no value is produced.
    Cancelled,
    /// Computation failed.
    Error { reason: String },
}

impl QueryStatus {
    /// Builds a status from the warnings gathered during a successful computation.
    #[must_use]
    pub fn from_warnings(warnings: Vec<Warning>) -> Self {
        if warnings.is_empty() {
            Self::Ok
        } else {
            Self::PartialData { warnings }
        }
    }

    /// Returns true if a value accompanies this status.
    #[must_use]
    pub const fn has_value(&self) -> bool {
        matches!(self, Self::Ok | Self::PartialData { .. })
    }
}

/// Result object plus status returned by every query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse<T> {
    /// Outcome classification.
    pub status: QueryStatus,
    /// The computed value, absent on error or cancellation.
    pub value: Option<T>,
}

impl<T> QueryResponse<T> {
    /// Successful response with the given warnings.
    #[must_use]
    pub fn computed(value: T, warnings: Vec<Warning>) -> Self {
        Self {
            status: QueryStatus::from_warnings(warnings),
            value: Some(value),
        }
    }

    /// Response for a failed or cancelled computation.
    #[must_use]
    pub fn failed(error: &EngineError) -> Self {
        let status = if error.is_cancellation() {
            QueryStatus::Cancelled
        } else {
            QueryStatus::Error {
                reason: error.to_string(),
            }
        };
        Self {
            status,
            value: None,
        }
    }

    /// Returns true if the value was produced without warnings.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self.status, QueryStatus::Ok)
    }

    /// Returns the warnings attached to the response, if any.
    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        match &self.status {
            QueryStatus::PartialData { warnings } => warnings,
            _ => &[],
        }
    }
}
