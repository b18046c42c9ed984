//! Portfolio construction constraints, trading cost model, and the trading
//! availability mask.

use chrono::NaiveDate;
use factor_lab_core::{EngineError, ForwardReturns, InstrumentId, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How strongly a neutrality constraint is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Neutrality {
    #[default]
    Off,
    /// Post-selection rebalancing of group weights toward universe shares.
    Soft,
    /// Top-N slots are allocated across groups in proportion to the universe.
    Mandatory,
}

/// How selected instruments are weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioWeighting {
    #[default]
    Equal,
    CapWeighted,
}

/// Instruments that cannot be traded on a date.
///
/// A locked instrument cannot be newly bought, and a locked holding cannot be
/// sold, so it stays in the book at its previous weight.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TradingMask {
    locked: BTreeMap<NaiveDate, BTreeSet<InstrumentId>>,
}

impl TradingMask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&mut self, date: NaiveDate, instrument: impl Into<InstrumentId>) {
        self.locked.entry(date).or_default().insert(instrument.into());
    }

    #[must_use]
    pub fn is_locked(&self, date: NaiveDate, instrument: &str) -> bool {
        self.locked
            .get(&date)
            .is_some_and(|set| set.contains(instrument))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locked.is_empty()
    }

    /// Price-limit lockout: an instrument whose move over period `t` reached
    /// `+/-limit` closed at the limit and is locked on the next return date.
    #[must_use]
    pub fn from_price_limit(returns: &ForwardReturns, limit: f64) -> Self {
        let mut mask = Self::new();
        let dates = returns.dates();
        for pair in dates.windows(2) {
            let Some(section) = returns.cross_section(pair[0]) else {
                continue;
            };
            for (inst, r) in section {
                if r.abs() >= limit - 1e-12 {
                    mask.lock(pair[1], inst.clone());
                }
            }
        }
        mask
    }

    /// Union of two masks.
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        for (date, set) in &other.locked {
            self.locked
                .entry(*date)
                .or_default()
                .extend(set.iter().cloned());
        }
        self
    }
}

/// Caller-owned portfolio constraints, passed by value into a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub top_n: usize,
    pub industry_neutral: Neutrality,
    pub cap_neutral: Neutrality,
    pub weighting: PortfolioWeighting,
    /// Restricts the holding universe; `None` admits every instrument.
    pub universe: Option<BTreeSet<InstrumentId>>,
    /// Strength of soft neutrality rebalancing in [0, 1].
    pub soft_strength: f64,
    #[serde(default)]
    pub mask: TradingMask,
}

impl ConstraintSet {
    #[must_use]
    pub fn top_n(n: usize) -> Self {
        Self {
            top_n: n,
            industry_neutral: Neutrality::Off,
            cap_neutral: Neutrality::Off,
            weighting: PortfolioWeighting::Equal,
            universe: None,
            soft_strength: 0.5,
            mask: TradingMask::new(),
        }
    }

    #[must_use]
    pub fn with_industry_neutral(mut self, neutrality: Neutrality) -> Self {
        self.industry_neutral = neutrality;
        self
    }

    #[must_use]
    pub fn with_cap_neutral(mut self, neutrality: Neutrality) -> Self {
        self.cap_neutral = neutrality;
        self
    }

    #[must_use]
    pub fn with_weighting(mut self, weighting: PortfolioWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    #[must_use]
    pub fn with_universe(mut self, universe: impl IntoIterator<Item = InstrumentId>) -> Self {
        self.universe = Some(universe.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_soft_strength(mut self, strength: f64) -> Self {
        self.soft_strength = strength;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask: TradingMask) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn admits(&self, instrument: &str) -> bool {
        self.universe
            .as_ref()
            .map_or(true, |u| u.contains(instrument))
    }

    /// # Errors
    /// Rejects a zero Top-N and a soft strength outside [0, 1].
    pub fn validate(&self) -> Result<()> {
        if self.top_n == 0 {
            return Err(EngineError::invalid("top_n must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.soft_strength) {
            return Err(EngineError::invalid(format!(
                "soft neutrality strength {} must be within [0, 1]",
                self.soft_strength
            )));
        }
        Ok(())
    }
}

/// Trading costs charged on turnover, in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostModel {
    /// Commission and slippage per unit of buy-side turnover.
    pub cost_bps: f64,
    /// Stamp tax charged on the sell side only.
    #[serde(default)]
    pub sell_tax_bps: f64,
}

impl CostModel {
    #[must_use]
    pub const fn new(cost_bps: f64) -> Self {
        Self {
            cost_bps,
            sell_tax_bps: 0.0,
        }
    }

    #[must_use]
    pub const fn with_sell_tax(mut self, sell_tax_bps: f64) -> Self {
        self.sell_tax_bps = sell_tax_bps;
        self
    }

    /// Cost as a fraction of NAV for the given turnover fractions.
    #[must_use]
    pub fn cost(&self, buy_turnover: f64, sell_turnover: f64) -> f64 {
        buy_turnover * self.cost_bps / 10_000.0 + sell_turnover * self.sell_tax_bps / 10_000.0
    }

    /// # Errors
    /// Rejects negative or non-finite rates.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("cost_bps", self.cost_bps), ("sell_tax_bps", self.sell_tax_bps)] {
            if !v.is_finite() || v < 0.0 {
                return Err(EngineError::invalid(format!("{name} {v} must be non-negative")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, day).unwrap()
    }

    #[test]
    fn limit_move_locks_the_next_date() {
        let returns = ForwardReturns::new(vec![
            (date(1), "A".to_string(), 0.10),
            (date(1), "B".to_string(), 0.02),
            (date(2), "A".to_string(), -0.10),
            (date(2), "B".to_string(), 0.01),
            (date(5), "A".to_string(), 0.0),
        ])
        .unwrap();

        let mask = TradingMask::from_price_limit(&returns, 0.10);
        assert!(mask.is_locked(date(2), "A"));
        assert!(!mask.is_locked(date(2), "B"));
        assert!(mask.is_locked(date(5), "A"));
        assert!(!mask.is_locked(date(1), "A"));
    }

    #[test]
    fn merged_mask_keeps_both_sides() {
        let mut a = TradingMask::new();
        a.lock(date(1), "X");
        let mut b = TradingMask::new();
        b.lock(date(1), "Y");

        let merged = a.merged(&b);
        assert!(merged.is_locked(date(1), "X"));
        assert!(merged.is_locked(date(1), "Y"));
    }

    #[test]
    fn cost_is_linear_in_turnover() {
        let model = CostModel::new(10.0).with_sell_tax(5.0);
        assert!((model.cost(0.5, 0.0) - 0.0005).abs() < 1e-15);
        assert!((model.cost(0.5, 0.5) - 0.00075).abs() < 1e-15);
    }

    #[test]
    fn zero_top_n_is_invalid() {
        assert!(ConstraintSet::top_n(0).validate().is_err());
        assert!(ConstraintSet::top_n(5).with_soft_strength(1.5).validate().is_err());
        assert!(CostModel::new(-1.0).validate().is_err());
    }
}
