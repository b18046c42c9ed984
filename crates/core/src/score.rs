use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::types::CrossSection;

/// Per-date, per-instrument composite score driving portfolio selection.
/// Higher is better.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompositeScore {
    by_date: BTreeMap<NaiveDate, CrossSection>,
}

impl CompositeScore {
    /// # Errors
    /// Returns [`EngineError::MalformedInput`] for non-finite scores.
    pub fn new(by_date: BTreeMap<NaiveDate, CrossSection>) -> Result<Self> {
        for (date, day) in &by_date {
            if let Some((inst, v)) = day.iter().find(|(_, v)| !v.is_finite()) {
                return Err(EngineError::malformed(
                    *date,
                    inst.clone(),
                    "composite_score",
                    format!("non-finite score {v}"),
                ));
            }
        }
        Ok(Self { by_date })
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.by_date.keys().copied()
    }

    #[must_use]
    pub fn cross_section(&self, date: NaiveDate) -> Option<&CrossSection> {
        self.by_date.get(&date)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_date.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }
}
