//! Versioned repository of raw factor series and auxiliary inputs.
//!
//! The store owns no computation. Every mutation bumps a revision counter and
//! stamps the affected entry with it, so derived results can be memoized by
//! `(entry version, parameters)` and invalidated automatically on refresh.

use chrono::NaiveDate;
use factor_lab_core::{
    EngineError, FactorCategory, FactorId, FactorSeries, ForwardReturns, InstrumentProfiles,
    Observation, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One row of the factor input feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorRow {
    pub date: NaiveDate,
    pub instrument: String,
    pub factor_id: FactorId,
    /// Empty cell in the feed means "no observation".
    pub value: Option<f64>,
}

/// One row of the forward return feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnRow {
    pub date: NaiveDate,
    pub instrument: String,
    pub forward_return: f64,
}

/// Display metadata for a factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorMeta {
    pub factor_id: FactorId,
    pub name: String,
    pub category: FactorCategory,
}

/// One row of the sentiment / volatility feed: a [0, 100] score, or a raw
/// indicator when regimes are scored by percentile rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentRow {
    pub date: NaiveDate,
    pub score: Option<f64>,
}

#[derive(Debug, Clone)]
struct Versioned<T> {
    value: Arc<T>,
    version: u64,
}

/// Repository of factor series, forward returns, instrument profiles, and
/// the sentiment score series used for regime classification.
#[derive(Debug, Clone)]
pub struct FactorStore {
    factors: BTreeMap<FactorId, Versioned<FactorSeries>>,
    returns: Versioned<ForwardReturns>,
    profiles: Versioned<InstrumentProfiles>,
    sentiment: Versioned<Vec<SentimentRow>>,
    revision: u64,
}

impl Default for FactorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactorStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            factors: BTreeMap::new(),
            returns: Versioned {
                value: Arc::new(ForwardReturns::default()),
                version: 0,
            },
            profiles: Versioned {
                value: Arc::new(InstrumentProfiles::default()),
                version: 0,
            },
            sentiment: Versioned {
                value: Arc::new(Vec::new()),
                version: 0,
            },
            revision: 0,
        }
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Current store revision; increases on every mutation.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Inserts or replaces a factor series, returning its new version.
    pub fn insert_factor(&mut self, series: FactorSeries) -> u64 {
        let version = self.bump();
        debug!(factor = series.id(), version, "Stored factor series");
        self.factors.insert(
            series.id().to_string(),
            Versioned {
                value: Arc::new(series),
                version,
            },
        );
        version
    }

    /// Returns a shared handle to a factor series.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownFactor`] if the id is not stored.
    pub fn factor(&self, id: &str) -> Result<Arc<FactorSeries>> {
        self.factors
            .get(id)
            .map(|v| Arc::clone(&v.value))
            .ok_or_else(|| EngineError::UnknownFactor(id.to_string()))
    }

    /// Version stamp of a stored factor.
    #[must_use]
    pub fn factor_version(&self, id: &str) -> Option<u64> {
        self.factors.get(id).map(|v| v.version)
    }

    /// Stored factor ids in ascending order.
    #[must_use]
    pub fn factor_ids(&self) -> Vec<FactorId> {
        self.factors.keys().cloned().collect()
    }

    pub fn set_forward_returns(&mut self, returns: ForwardReturns) -> u64 {
        let version = self.bump();
        self.returns = Versioned {
            value: Arc::new(returns),
            version,
        };
        version
    }

    #[must_use]
    pub fn forward_returns(&self) -> Arc<ForwardReturns> {
        Arc::clone(&self.returns.value)
    }

    #[must_use]
    pub const fn returns_version(&self) -> u64 {
        self.returns.version
    }

    pub fn set_profiles(&mut self, profiles: InstrumentProfiles) -> u64 {
        let version = self.bump();
        self.profiles = Versioned {
            value: Arc::new(profiles),
            version,
        };
        version
    }

    #[must_use]
    pub fn profiles(&self) -> Arc<InstrumentProfiles> {
        Arc::clone(&self.profiles.value)
    }

    #[must_use]
    pub const fn profiles_version(&self) -> u64 {
        self.profiles.version
    }

    /// Replaces the sentiment series. Rows are sorted by date.
    ///
    /// # Errors
    /// Rejects duplicate dates and non-finite scores.
    pub fn set_sentiment(&mut self, mut rows: Vec<SentimentRow>) -> Result<u64> {
        rows.sort_by_key(|r| r.date);
        for pair in rows.windows(2) {
            if pair[0].date == pair[1].date {
                return Err(EngineError::malformed(
                    pair[1].date,
                    "*",
                    "sentiment_score",
                    "duplicate date",
                ));
            }
        }
        if let Some(bad) = rows
            .iter()
            .find(|r| r.score.is_some_and(|s| !s.is_finite()))
        {
            return Err(EngineError::malformed(
                bad.date,
                "*",
                "sentiment_score",
                "non-finite score",
            ));
        }
        let version = self.bump();
        self.sentiment = Versioned {
            value: Arc::new(rows),
            version,
        };
        Ok(version)
    }

    #[must_use]
    pub fn sentiment(&self) -> Arc<Vec<SentimentRow>> {
        Arc::clone(&self.sentiment.value)
    }

    #[must_use]
    pub const fn sentiment_version(&self) -> u64 {
        self.sentiment.version
    }

    /// Groups feed rows by factor and stores one series per factor.
    ///
    /// Factors without metadata get their id as display name and the
    /// `Technical` category.
    ///
    /// # Errors
    /// Propagates series validation failures (duplicates, non-finite values).
    pub fn ingest_factor_rows(
        &mut self,
        rows: Vec<FactorRow>,
        metadata: &[FactorMeta],
    ) -> Result<Vec<FactorId>> {
        let mut grouped: BTreeMap<FactorId, Vec<Observation>> = BTreeMap::new();
        for row in rows {
            grouped
                .entry(row.factor_id)
                .or_default()
                .push(Observation::new(row.date, row.instrument, row.value));
        }

        let mut ingested = Vec::with_capacity(grouped.len());
        for (factor_id, observations) in grouped {
            let meta = metadata.iter().find(|m| m.factor_id == factor_id);
            let (name, category) = meta.map_or_else(
                || (factor_id.clone(), FactorCategory::Technical),
                |m| (m.name.clone(), m.category),
            );
            let series = FactorSeries::new(factor_id.clone(), name, category, observations)?;
            self.insert_factor(series);
            ingested.push(factor_id);
        }

        info!(factors = ingested.len(), revision = self.revision, "Ingested factor feed");
        Ok(ingested)
    }

    /// Builds the forward return panel from feed rows.
    ///
    /// # Errors
    /// Propagates return validation failures.
    pub fn ingest_return_rows(&mut self, rows: Vec<ReturnRow>) -> Result<u64> {
        let returns = ForwardReturns::new(
            rows.into_iter()
                .map(|r| (r.date, r.instrument, r.forward_return)),
        )?;
        Ok(self.set_forward_returns(returns))
    }
}
