//! Error types for the factor analytics engine.
//!
//! Hard failures only. Recoverable conditions (skipped periods, renormalized
//! weights, undefined correlations) are reported as [`crate::Warning`] values
//! alongside a result instead of aborting the computation.

use chrono::NaiveDate;
use thiserror::Error;

/// Convenience alias used across the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while computing analytics or running simulations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Too few valid periods or observations to compute a statistic.
    #[error("insufficient data for {context}: {valid} valid, {required} required")]
    DataInsufficient {
        /// What was being computed (e.g. a factor id or "pca").
        context: String,
        /// Number of usable periods/observations found.
        valid: usize,
        /// Minimum required.
        required: usize,
    },

    /// An input record violates the schema (NaN value, impossible return).
    #[error("malformed input at {date} / {instrument} ({field}): {reason}")]
    MalformedInput {
        /// Date of the offending record.
        date: NaiveDate,
        /// Instrument of the offending record.
        instrument: String,
        /// Field that failed validation.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Two observations share the same (date, instrument) key.
    #[error("duplicate observation for factor {factor} at {date} / {instrument}")]
    DuplicateObservation {
        /// Factor id.
        factor: String,
        /// Duplicated date.
        date: NaiveDate,
        /// Duplicated instrument.
        instrument: String,
    },

    /// The requested factor is not in the store.
    #[error("unknown factor: {0}")]
    UnknownFactor(String),

    /// A request parameter is out of range or inconsistent.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The caller aborted the computation.
    #[error("computation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Creates a malformed-input error with full record context.
    pub fn malformed(
        date: NaiveDate,
        instrument: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedInput {
            date,
            instrument: instrument.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a data-insufficient error.
    pub fn insufficient(context: impl Into<String>, valid: usize, required: usize) -> Self {
        Self::DataInsufficient {
            context: context.into(),
            valid,
            required,
        }
    }

    /// Creates an invalid-parameter error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Returns true if this error is a caller-initiated abort rather than a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
