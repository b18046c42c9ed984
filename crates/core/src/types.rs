//! Domain types shared by every engine component.
//!
//! Factor and return panels are immutable once built: construction validates
//! the `(date, instrument)` key uniqueness and numeric sanity, and every
//! derived result is computed from these snapshots without mutating them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Identifier of a factor (e.g. "momentum_20d").
pub type FactorId = String;

/// Identifier of a tradable instrument (e.g. "600519.SH").
pub type InstrumentId = String;

/// Valid values of one date, keyed by instrument.
pub type CrossSection = BTreeMap<InstrumentId, f64>;

/// Factor family used for grouping in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorCategory {
    Technical,
    Fundamental,
    Valuation,
    MoneyFlow,
}

impl FromStr for FactorCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "technical" => Ok(Self::Technical),
            "fundamental" => Ok(Self::Fundamental),
            "valuation" => Ok(Self::Valuation),
            "money_flow" | "moneyflow" => Ok(Self::MoneyFlow),
            other => Err(EngineError::invalid(format!("unknown factor category '{other}'"))),
        }
    }
}

impl fmt::Display for FactorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Technical => write!(f, "technical"),
            Self::Fundamental => write!(f, "fundamental"),
            Self::Valuation => write!(f, "valuation"),
            Self::MoneyFlow => write!(f, "money_flow"),
        }
    }
}

/// Inclusive date window used to scope every computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Creates a window, rejecting `start > end`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidParameter`] if the range is inverted.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(EngineError::invalid(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// A window covering every representable date.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        }
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl Default for DateRange {
    fn default() -> Self {
        Self::all()
    }
}

/// One raw factor observation. `value: None` is an explicit "no observation".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub instrument: InstrumentId,
    pub value: Option<f64>,
}

impl Observation {
    #[must_use]
    pub fn new(date: NaiveDate, instrument: impl Into<InstrumentId>, value: Option<f64>) -> Self {
        Self {
            date,
            instrument: instrument.into(),
            value,
        }
    }
}

/// Raw time series of one factor across instruments.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorSeries {
    id: FactorId,
    name: String,
    category: FactorCategory,
    cross_sections: BTreeMap<NaiveDate, BTreeMap<InstrumentId, Option<f64>>>,
}

impl FactorSeries {
    /// Builds a series from observations.
    ///
    /// # Errors
    /// Returns [`EngineError::DuplicateObservation`] when a `(date, instrument)`
    /// key repeats and [`EngineError::MalformedInput`] for non-finite values.
    pub fn new(
        id: impl Into<FactorId>,
        name: impl Into<String>,
        category: FactorCategory,
        observations: impl IntoIterator<Item = Observation>,
    ) -> Result<Self> {
        let id = id.into();
        let mut cross_sections: BTreeMap<NaiveDate, BTreeMap<InstrumentId, Option<f64>>> =
            BTreeMap::new();

        for obs in observations {
            if let Some(v) = obs.value {
                if !v.is_finite() {
                    return Err(EngineError::malformed(
                        obs.date,
                        obs.instrument,
                        format!("factor:{id}"),
                        format!("non-finite value {v}"),
                    ));
                }
            }
            let day = cross_sections.entry(obs.date).or_default();
            if day.contains_key(&obs.instrument) {
                return Err(EngineError::DuplicateObservation {
                    factor: id,
                    date: obs.date,
                    instrument: obs.instrument,
                });
            }
            day.insert(obs.instrument, obs.value);
        }

        Ok(Self {
            id,
            name: name.into(),
            category,
            cross_sections,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn category(&self) -> FactorCategory {
        self.category
    }

    /// Dates with at least one observation (valid or missing), ascending.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.cross_sections.keys().copied()
    }

    /// Value at `(date, instrument)`; `None` when missing or absent.
    #[must_use]
    pub fn value(&self, date: NaiveDate, instrument: &str) -> Option<f64> {
        self.cross_sections
            .get(&date)
            .and_then(|day| day.get(instrument))
            .copied()
            .flatten()
    }

    /// Valid (non-missing) values of one date.
    #[must_use]
    pub fn cross_section(&self, date: NaiveDate) -> CrossSection {
        self.cross_sections
            .get(&date)
            .map(|day| {
                day.iter()
                    .filter_map(|(inst, v)| v.map(|v| (inst.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterates valid values inside `window` as `(date, instrument, value)`.
    pub fn valid_values(
        &self,
        window: DateRange,
    ) -> impl Iterator<Item = (NaiveDate, &str, f64)> + '_ {
        self.cross_sections
            .range(window.start..=window.end)
            .flat_map(|(date, day)| {
                day.iter()
                    .filter_map(move |(inst, v)| v.map(|v| (*date, inst.as_str(), v)))
            })
    }

    /// Every stored observation including explicit missing markers.
    pub fn observations(&self) -> impl Iterator<Item = Observation> + '_ {
        self.cross_sections.iter().flat_map(|(date, day)| {
            day.iter()
                .map(move |(inst, v)| Observation::new(*date, inst.clone(), *v))
        })
    }

    /// Total number of stored observations, missing markers included.
    #[must_use]
    pub fn observation_count(&self) -> usize {
        self.cross_sections.values().map(BTreeMap::len).sum()
    }

    /// Number of non-missing observations.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.cross_sections
            .values()
            .flat_map(BTreeMap::values)
            .filter(|v| v.is_some())
            .count()
    }

    /// Returns true when the series has no valid observation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.valid_count() == 0
    }
}

/// Realized forward returns: the value at `(t, instrument)` is the return
/// earned by holding the instrument from `t` to the next period.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForwardReturns {
    dates: Vec<NaiveDate>,
    by_date: BTreeMap<NaiveDate, CrossSection>,
}

impl ForwardReturns {
    /// Builds the panel from `(date, instrument, return)` rows.
    ///
    /// # Errors
    /// Rejects duplicate keys, non-finite returns, and returns at or below
    /// -100% (which would imply a non-positive price).
    pub fn new(rows: impl IntoIterator<Item = (NaiveDate, InstrumentId, f64)>) -> Result<Self> {
        let mut by_date: BTreeMap<NaiveDate, CrossSection> = BTreeMap::new();
        for (date, instrument, ret) in rows {
            if !ret.is_finite() {
                return Err(EngineError::malformed(
                    date,
                    instrument,
                    "forward_return",
                    format!("non-finite return {ret}"),
                ));
            }
            if ret <= -1.0 {
                return Err(EngineError::malformed(
                    date,
                    instrument,
                    "forward_return",
                    format!("return {ret} implies a non-positive price"),
                ));
            }
            let day = by_date.entry(date).or_default();
            if day.contains_key(&instrument) {
                return Err(EngineError::DuplicateObservation {
                    factor: "forward_return".to_string(),
                    date,
                    instrument,
                });
            }
            day.insert(instrument, ret);
        }
        Ok(Self::from_panel(by_date))
    }

    fn from_panel(by_date: BTreeMap<NaiveDate, CrossSection>) -> Self {
        Self {
            dates: by_date.keys().copied().collect(),
            by_date,
        }
    }

    /// Return dates in ascending order.
    #[must_use]
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    #[must_use]
    pub fn get(&self, date: NaiveDate, instrument: &str) -> Option<f64> {
        self.by_date.get(&date).and_then(|day| day.get(instrument)).copied()
    }

    #[must_use]
    pub fn cross_section(&self, date: NaiveDate) -> Option<&CrossSection> {
        self.by_date.get(&date)
    }

    /// Cross-section `lag` periods after `date` (lag 0 is `date` itself).
    #[must_use]
    pub fn cross_section_after(&self, date: NaiveDate, lag: usize) -> Option<&CrossSection> {
        let idx = self.dates.binary_search(&date).ok()?;
        let target = self.dates.get(idx + lag)?;
        self.by_date.get(target)
    }

    /// Returns a new panel with each value transformed by `f`.
    ///
    /// Results are clamped just above -100% to keep the panel's invariant.
    #[must_use]
    pub fn map_values<F>(&self, mut f: F) -> Self
    where
        F: FnMut(NaiveDate, &str, f64) -> f64,
    {
        let by_date = self
            .by_date
            .iter()
            .map(|(date, day)| {
                let mapped = day
                    .iter()
                    .map(|(inst, r)| {
                        let v = f(*date, inst, *r).max(-1.0 + f64::EPSILON);
                        (inst.clone(), v)
                    })
                    .collect();
                (*date, mapped)
            })
            .collect();
        Self::from_panel(by_date)
    }

    /// Distinct instruments present anywhere in the panel, sorted.
    #[must_use]
    pub fn instruments(&self) -> Vec<InstrumentId> {
        let mut all: Vec<InstrumentId> = self
            .by_date
            .values()
            .flat_map(|day| day.keys().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }
}

/// Static attributes of an instrument used by neutrality constraints,
/// cap weighting, and capacity estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentProfile {
    pub instrument: InstrumentId,
    pub industry: Option<String>,
    pub market_cap: Option<f64>,
    /// Average daily traded value, in the same currency as capacity.
    pub avg_daily_value: Option<f64>,
}

/// Profiles keyed by instrument.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstrumentProfiles {
    by_instrument: BTreeMap<InstrumentId, InstrumentProfile>,
}

impl InstrumentProfiles {
    /// Builds the profile table.
    ///
    /// # Errors
    /// Rejects duplicate instruments and non-positive or non-finite
    /// market caps / traded values.
    pub fn new(profiles: impl IntoIterator<Item = InstrumentProfile>) -> Result<Self> {
        let mut by_instrument = BTreeMap::new();
        for profile in profiles {
            for (field, value) in [
                ("market_cap", profile.market_cap),
                ("avg_daily_value", profile.avg_daily_value),
            ] {
                if let Some(v) = value {
                    if !v.is_finite() || v <= 0.0 {
                        return Err(EngineError::invalid(format!(
                            "instrument {} has invalid {field} {v}",
                            profile.instrument
                        )));
                    }
                }
            }
            if by_instrument.contains_key(&profile.instrument) {
                return Err(EngineError::invalid(format!(
                    "duplicate profile for instrument {}",
                    profile.instrument
                )));
            }
            by_instrument.insert(profile.instrument.clone(), profile);
        }
        Ok(Self { by_instrument })
    }

    #[must_use]
    pub fn get(&self, instrument: &str) -> Option<&InstrumentProfile> {
        self.by_instrument.get(instrument)
    }

    #[must_use]
    pub fn industry(&self, instrument: &str) -> Option<&str> {
        self.get(instrument).and_then(|p| p.industry.as_deref())
    }

    #[must_use]
    pub fn market_cap(&self, instrument: &str) -> Option<f64> {
        self.get(instrument).and_then(|p| p.market_cap)
    }

    #[must_use]
    pub fn avg_daily_value(&self, instrument: &str) -> Option<f64> {
        self.get(instrument).and_then(|p| p.avg_daily_value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentProfile> {
        self.by_instrument.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_instrument.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_instrument.is_empty()
    }
}

/// Discretized sentiment / volatility state, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    ExtremeLow,
    Low,
    Neutral,
    High,
    ExtremeHigh,
}

impl Regime {
    /// All regimes in ascending order.
    pub const ALL: [Self; 5] = [
        Self::ExtremeLow,
        Self::Low,
        Self::Neutral,
        Self::High,
        Self::ExtremeHigh,
    ];

    /// Band index, 0 for `ExtremeLow` through 4 for `ExtremeHigh`.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Regime for a band index, saturating at the extremes.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => Self::ExtremeLow,
            1 => Self::Low,
            2 => Self::Neutral,
            3 => Self::High,
            _ => Self::ExtremeHigh,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ExtremeLow => "extreme_low",
            Self::Low => "low",
            Self::Neutral => "neutral",
            Self::High => "high",
            Self::ExtremeHigh => "extreme_high",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    // ============================================
    // FactorSeries Tests
    // ============================================

    #[test]
    fn series_keeps_missing_markers_distinct_from_zero() {
        let series = FactorSeries::new(
            "pe",
            "Price / Earnings",
            FactorCategory::Valuation,
            vec![
                Observation::new(date(2), "A", Some(0.0)),
                Observation::new(date(2), "B", None),
            ],
        )
        .unwrap();

        assert_eq!(series.observation_count(), 2);
        assert_eq!(series.valid_count(), 1);
        assert_eq!(series.value(date(2), "A"), Some(0.0));
        assert_eq!(series.value(date(2), "B"), None);
        assert_eq!(series.cross_section(date(2)).len(), 1);
    }

    #[test]
    fn series_rejects_duplicate_key() {
        let result = FactorSeries::new(
            "pe",
            "PE",
            FactorCategory::Valuation,
            vec![
                Observation::new(date(2), "A", Some(1.0)),
                Observation::new(date(2), "A", Some(2.0)),
            ],
        );

        assert!(matches!(
            result,
            Err(EngineError::DuplicateObservation { .. })
        ));
    }

    #[test]
    fn series_rejects_nan() {
        let result = FactorSeries::new(
            "pe",
            "PE",
            FactorCategory::Valuation,
            vec![Observation::new(date(2), "A", Some(f64::NAN))],
        );

        assert!(matches!(result, Err(EngineError::MalformedInput { .. })));
    }

    #[test]
    fn valid_values_respect_window() {
        let series = FactorSeries::new(
            "mom",
            "Momentum",
            FactorCategory::Technical,
            (1..=5).map(|d| Observation::new(date(d), "A", Some(f64::from(d)))),
        )
        .unwrap();

        let window = DateRange::new(date(2), date(4)).unwrap();
        let values: Vec<f64> = series.valid_values(window).map(|(_, _, v)| v).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    // ============================================
    // ForwardReturns Tests
    // ============================================

    #[test]
    fn returns_reject_total_loss_or_worse() {
        let result = ForwardReturns::new(vec![(date(2), "A".to_string(), -1.0)]);
        match result {
            Err(EngineError::MalformedInput { field, .. }) => assert_eq!(field, "forward_return"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cross_section_after_walks_return_dates() {
        let returns = ForwardReturns::new(vec![
            (date(2), "A".to_string(), 0.01),
            (date(3), "A".to_string(), 0.02),
            (date(5), "A".to_string(), 0.03),
        ])
        .unwrap();

        let lag2 = returns.cross_section_after(date(2), 2).unwrap();
        assert_eq!(lag2.get("A"), Some(&0.03));
        assert!(returns.cross_section_after(date(3), 5).is_none());
    }

    #[test]
    fn map_values_preserves_keys() {
        let returns = ForwardReturns::new(vec![
            (date(2), "A".to_string(), 0.01),
            (date(2), "B".to_string(), 0.02),
        ])
        .unwrap();

        let shocked = returns.map_values(|_, _, r| r - 5.0);
        assert_eq!(shocked.dates(), returns.dates());
        assert!(shocked.get(date(2), "A").unwrap() > -1.0);
    }

    // ============================================
    // Misc Tests
    // ============================================

    #[test]
    fn inverted_range_is_rejected() {
        assert!(DateRange::new(date(5), date(1)).is_err());
    }

    #[test]
    fn regime_ordering_follows_bands() {
        assert!(Regime::ExtremeLow < Regime::Low);
        assert!(Regime::High < Regime::ExtremeHigh);
        assert_eq!(Regime::from_index(2), Regime::Neutral);
        assert_eq!(Regime::from_index(9), Regime::ExtremeHigh);
    }

    #[test]
    fn category_parses_loose_spellings() {
        assert_eq!(
            "Money Flow".parse::<FactorCategory>().unwrap(),
            FactorCategory::MoneyFlow
        );
        assert!("sentiment".parse::<FactorCategory>().is_err());
    }

    #[test]
    fn profiles_reject_non_positive_cap() {
        let result = InstrumentProfiles::new(vec![InstrumentProfile {
            instrument: "A".to_string(),
            industry: None,
            market_cap: Some(0.0),
            avg_daily_value: None,
        }]);
        assert!(result.is_err());
    }
}
