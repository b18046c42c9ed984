//! Period-by-period replay of composite-score driven portfolios.
//!
//! Runs are strictly sequential across periods: NAV and drawdown depend on
//! the previous period. Independent runs may execute concurrently.
//!
//! Rebalancing happens every period to target weights; the previous
//! period's target book is the reference for turnover.

use chrono::NaiveDate;
use factor_lab_core::{
    BacktestConfig, CancellationToken, CompositeScore, CrossSection, DateRange, EngineError,
    ForwardReturns, InstrumentId, InstrumentProfiles, Regime, Result, Warning,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::constraints::{ConstraintSet, CostModel, Neutrality, PortfolioWeighting, TradingMask};
use crate::metrics::{MetricsCalculator, PerformanceMetrics};
use crate::regimes::{regime_performance, RegimePerformance, RegimeSeries};

const UNCLASSIFIED: &str = "unclassified";

/// Read-only inputs of one simulation.
#[derive(Debug, Clone, Copy)]
pub struct BacktestInputs<'a> {
    pub score: &'a CompositeScore,
    pub returns: &'a ForwardReturns,
    pub profiles: &'a InstrumentProfiles,
    pub regimes: Option<&'a RegimeSeries>,
    pub window: DateRange,
}

/// One simulated period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestPeriod {
    pub date: NaiveDate,
    pub nav: f64,
    pub benchmark_nav: f64,
    pub drawdown: f64,
    pub regime: Option<Regime>,
    pub gross_return: f64,
    pub benchmark_return: f64,
    pub net_return: f64,
    pub cost: f64,
    pub turnover: f64,
    pub holdings: BTreeMap<InstrumentId, f64>,
    /// The selection universe was empty; zero return was booked.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub metrics: PerformanceMetrics,
    /// Median NAV at which the tightest holding reaches the participation cap.
    pub capacity: Option<f64>,
    pub by_regime: Vec<RegimePerformance>,
}

/// Immutable outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub periods: Vec<BacktestPeriod>,
    pub summary: BacktestSummary,
    pub warnings: Vec<Warning>,
}

impl BacktestResult {
    #[must_use]
    pub fn final_nav(&self) -> Option<f64> {
        self.periods.last().map(|p| p.nav)
    }

    pub fn skipped_dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.periods.iter().filter(|p| p.skipped).map(|p| p.date)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BacktestSimulator {
    config: BacktestConfig,
}

impl BacktestSimulator {
    #[must_use]
    pub const fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replays the composite score through `inputs.window`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidParameter`] for invalid constraints or
    /// configuration, [`EngineError::DataInsufficient`] when the window holds
    /// no scored date, and [`EngineError::Cancelled`] if the token fires.
    pub fn run(
        &self,
        inputs: BacktestInputs<'_>,
        constraints: &ConstraintSet,
        cost_model: &CostModel,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        constraints.validate()?;
        cost_model.validate()?;
        self.validate_config()?;

        let dates: Vec<NaiveDate> = inputs
            .score
            .dates()
            .filter(|d| inputs.window.contains(*d))
            .collect();
        if dates.is_empty() {
            return Err(EngineError::insufficient("scored dates in backtest window", 0, 1));
        }

        let mask = match self.config.price_limit {
            Some(limit) => {
                TradingMask::from_price_limit(inputs.returns, limit).merged(&constraints.mask)
            }
            None => constraints.mask.clone(),
        };

        let empty = CrossSection::new();
        let mut calc = MetricsCalculator::new(self.config.initial_nav, self.config.periods_per_year);
        let mut benchmark_nav = self.config.initial_nav;
        let mut peak = self.config.initial_nav;
        let mut book: BTreeMap<InstrumentId, f64> = BTreeMap::new();
        let mut periods = Vec::with_capacity(dates.len());
        let mut warnings = Vec::new();

        for date in dates {
            cancel.check()?;

            let scores = inputs.score.cross_section(date).unwrap_or(&empty);
            let returns = inputs.returns.cross_section(date).unwrap_or(&empty);
            let benchmark_return = benchmark(returns, constraints);
            let regime = inputs.regimes.and_then(|r| r.get(date));

            let selection = Selection {
                date,
                scores,
                returns,
                previous: &book,
                constraints,
                mask: &mask,
                profiles: inputs.profiles,
            };

            let (holdings, gross, turnover, cost, skipped) = match selection.target_book() {
                Some(target) => {
                    let gross: f64 = target
                        .iter()
                        .map(|(inst, w)| w * returns.get(inst).copied().unwrap_or(0.0))
                        .sum();
                    let (buy, sell) = turnover_between(&book, &target);
                    let cost = cost_model.cost(buy, sell);
                    book = target.clone();
                    (target, gross, buy, cost, false)
                }
                None => {
                    warn!(%date, "Selection universe empty; period skipped");
                    warnings.push(Warning::ConstraintInfeasible { date });
                    (BTreeMap::new(), 0.0, 0.0, 0.0, true)
                }
            };

            let net_return = gross - cost;
            let nav = calc.add_period(net_return, benchmark_return, turnover, skipped);
            benchmark_nav *= 1.0 + benchmark_return;
            peak = peak.max(nav);

            periods.push(BacktestPeriod {
                date,
                nav,
                benchmark_nav,
                drawdown: nav / peak - 1.0,
                regime,
                gross_return: gross,
                benchmark_return,
                net_return,
                cost,
                turnover,
                holdings,
                skipped,
            });
        }

        if let Some(regimes) = inputs.regimes {
            let dates: BTreeSet<NaiveDate> = periods.iter().map(|p| p.date).collect();
            warnings.extend(regimes.warnings().into_iter().filter(|w| match w {
                Warning::StaleRegime { date } => dates.contains(date),
                _ => true,
            }));
        }

        let tagged: Vec<(Option<Regime>, f64)> =
            periods.iter().map(|p| (p.regime, p.net_return)).collect();
        let summary = BacktestSummary {
            metrics: calc.calculate(),
            capacity: self.capacity(&periods, inputs.profiles),
            by_regime: regime_performance(&tagged),
        };

        debug!(
            periods = periods.len(),
            skipped = summary.metrics.skipped_periods,
            final_nav = calc.nav(),
            "Backtest complete"
        );

        Ok(BacktestResult {
            periods,
            summary,
            warnings,
        })
    }

    fn validate_config(&self) -> Result<()> {
        if !(self.config.initial_nav.is_finite() && self.config.initial_nav > 0.0) {
            return Err(EngineError::invalid("initial NAV must be positive"));
        }
        if !(self.config.periods_per_year.is_finite() && self.config.periods_per_year > 0.0) {
            return Err(EngineError::invalid("periods per year must be positive"));
        }
        if let Some(limit) = self.config.price_limit {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(EngineError::invalid("price limit must be positive"));
            }
        }
        Ok(())
    }

    fn capacity(&self, periods: &[BacktestPeriod], profiles: &InstrumentProfiles) -> Option<f64> {
        let participation = self.config.capacity_participation;
        let mut per_period: Vec<f64> = periods
            .iter()
            .filter(|p| !p.skipped)
            .filter_map(|p| {
                p.holdings
                    .iter()
                    .filter(|(_, w)| **w > 0.0)
                    .map(|(inst, w)| profiles.avg_daily_value(inst).map(|adv| participation * adv / w))
                    .collect::<Option<Vec<f64>>>()
                    .and_then(|caps| caps.into_iter().reduce(f64::min))
            })
            .collect();

        if per_period.is_empty() {
            return None;
        }
        per_period.sort_by(f64::total_cmp);
        let mid = per_period.len() / 2;
        if per_period.len() % 2 == 0 {
            Some((per_period[mid - 1] + per_period[mid]) / 2.0)
        } else {
            Some(per_period[mid])
        }
    }
}

fn benchmark(returns: &CrossSection, constraints: &ConstraintSet) -> f64 {
    let admitted: Vec<f64> = returns
        .iter()
        .filter(|(inst, _)| constraints.admits(inst))
        .map(|(_, r)| *r)
        .collect();
    if admitted.is_empty() {
        0.0
    } else {
        admitted.iter().sum::<f64>() / admitted.len() as f64
    }
}

/// Buy-side and sell-side turnover between two books.
fn turnover_between(
    previous: &BTreeMap<InstrumentId, f64>,
    target: &BTreeMap<InstrumentId, f64>,
) -> (f64, f64) {
    let keys: BTreeSet<&InstrumentId> = previous.keys().chain(target.keys()).collect();
    keys.into_iter().fold((0.0, 0.0), |(buy, sell), inst| {
        let before = previous.get(inst).copied().unwrap_or(0.0);
        let after = target.get(inst).copied().unwrap_or(0.0);
        let delta = after - before;
        if delta > 0.0 {
            (buy + delta, sell)
        } else {
            (buy, sell - delta)
        }
    })
}

/// Per-period portfolio construction.
struct Selection<'a> {
    date: NaiveDate,
    scores: &'a CrossSection,
    returns: &'a CrossSection,
    previous: &'a BTreeMap<InstrumentId, f64>,
    constraints: &'a ConstraintSet,
    mask: &'a TradingMask,
    profiles: &'a InstrumentProfiles,
}

impl Selection<'_> {
    /// Target weights, or `None` when nothing can be held this period.
    fn target_book(&self) -> Option<BTreeMap<InstrumentId, f64>> {
        // locked holdings cannot be sold and keep their weight; a suspended
        // name with no return row books 0 for the period
        let frozen: BTreeMap<InstrumentId, f64> = self
            .previous
            .iter()
            .filter(|(inst, _)| self.mask.is_locked(self.date, inst))
            .map(|(inst, w)| (inst.clone(), *w))
            .collect();

        let mut candidates: Vec<(&str, f64)> = self
            .scores
            .iter()
            .filter(|(inst, _)| {
                self.constraints.admits(inst)
                    && self.returns.contains_key(*inst)
                    && !self.mask.is_locked(self.date, inst)
                    && !frozen.contains_key(*inst)
            })
            .map(|(inst, s)| (inst.as_str(), *s))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let slots = self.constraints.top_n.saturating_sub(frozen.len());
        let cap_buckets = cap_terciles(&candidates, self.profiles);
        let selected = self.pick(&candidates, slots, &cap_buckets);

        if selected.is_empty() && frozen.is_empty() {
            return None;
        }

        let budget = (1.0 - frozen.values().sum::<f64>()).max(0.0);
        let mut weights = self.base_weights(&selected, budget);

        for (neutrality, key) in [
            (self.constraints.industry_neutral, GroupKey::Industry),
            (self.constraints.cap_neutral, GroupKey::Cap),
        ] {
            if neutrality == Neutrality::Soft {
                self.soft_rebalance(&mut weights, &candidates, key, &cap_buckets);
            }
        }

        let mut book = frozen;
        book.extend(weights);
        Some(book)
    }

    fn group_of(&self, inst: &str, key: GroupKey, cap_buckets: &BTreeMap<&str, usize>) -> String {
        match key {
            GroupKey::Industry => self.profiles.industry(inst).unwrap_or(UNCLASSIFIED).to_string(),
            GroupKey::Cap => cap_buckets
                .get(inst)
                .map_or_else(|| UNCLASSIFIED.to_string(), |b| format!("cap{b}")),
        }
    }

    fn mandatory_key(&self, inst: &str, cap_buckets: &BTreeMap<&str, usize>) -> String {
        let mut key = String::new();
        if self.constraints.industry_neutral == Neutrality::Mandatory {
            key.push_str(&self.group_of(inst, GroupKey::Industry, cap_buckets));
        }
        if self.constraints.cap_neutral == Neutrality::Mandatory {
            key.push('/');
            key.push_str(&self.group_of(inst, GroupKey::Cap, cap_buckets));
        }
        key
    }

    /// Top `slots` candidates. With mandatory neutrality, slots are split
    /// across groups by largest remainder on universe counts.
    fn pick<'c>(
        &self,
        ranked: &[(&'c str, f64)],
        slots: usize,
        cap_buckets: &BTreeMap<&str, usize>,
    ) -> Vec<&'c str> {
        let mandatory = self.constraints.industry_neutral == Neutrality::Mandatory
            || self.constraints.cap_neutral == Neutrality::Mandatory;

        if slots >= ranked.len() {
            return ranked.iter().map(|(inst, _)| *inst).collect();
        }
        if !mandatory {
            return ranked.iter().take(slots).map(|(inst, _)| *inst).collect();
        }

        let mut groups: BTreeMap<String, Vec<&'c str>> = BTreeMap::new();
        for (inst, _) in ranked {
            groups
                .entry(self.mandatory_key(inst, cap_buckets))
                .or_default()
                .push(*inst);
        }

        let universe = ranked.len() as f64;
        let mut quotas: Vec<(String, usize, f64, usize)> = groups
            .iter()
            .map(|(key, members)| {
                let exact = slots as f64 * members.len() as f64 / universe;
                (key.clone(), exact.floor() as usize, exact.fract(), members.len())
            })
            .collect();

        let assigned: usize = quotas.iter().map(|q| q.1).sum();
        let mut order: Vec<usize> = (0..quotas.len()).collect();
        order.sort_by(|&a, &b| {
            quotas[b]
                .2
                .total_cmp(&quotas[a].2)
                .then_with(|| quotas[b].3.cmp(&quotas[a].3))
                .then_with(|| quotas[a].0.cmp(&quotas[b].0))
        });
        for idx in order.into_iter().take(slots.saturating_sub(assigned)) {
            quotas[idx].1 += 1;
        }

        quotas
            .iter()
            .flat_map(|(key, quota, _, _)| {
                groups
                    .get(key)
                    .map(|members| members.iter().take(*quota).copied().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect()
    }

    fn base_weights(&self, selected: &[&str], budget: f64) -> BTreeMap<InstrumentId, f64> {
        if selected.is_empty() {
            return BTreeMap::new();
        }
        let equal = || -> BTreeMap<InstrumentId, f64> {
            let share = budget / selected.len() as f64;
            selected.iter().map(|inst| ((*inst).to_string(), share)).collect()
        };

        match self.constraints.weighting {
            PortfolioWeighting::Equal => equal(),
            PortfolioWeighting::CapWeighted => {
                let known: Vec<f64> = selected
                    .iter()
                    .filter_map(|inst| self.profiles.market_cap(inst))
                    .collect();
                if known.is_empty() {
                    return equal();
                }
                // missing caps are filled with the mean known cap
                let fill = known.iter().sum::<f64>() / known.len() as f64;
                let caps: Vec<f64> = selected
                    .iter()
                    .map(|inst| self.profiles.market_cap(inst).unwrap_or(fill))
                    .collect();
                let total: f64 = caps.iter().sum();
                selected
                    .iter()
                    .zip(caps)
                    .map(|(inst, cap)| ((*inst).to_string(), budget * cap / total))
                    .collect()
            }
        }
    }

    /// Moves each group's weight toward its share of the eligible universe,
    /// restricted to groups present in the book.
    fn soft_rebalance(
        &self,
        weights: &mut BTreeMap<InstrumentId, f64>,
        universe: &[(&str, f64)],
        key: GroupKey,
        cap_buckets: &BTreeMap<&str, usize>,
    ) {
        let budget: f64 = weights.values().sum();
        if budget <= f64::EPSILON {
            return;
        }

        let mut current: BTreeMap<String, f64> = BTreeMap::new();
        for (inst, w) in weights.iter() {
            *current.entry(self.group_of(inst, key, cap_buckets)).or_default() += w;
        }

        let mut universe_counts: BTreeMap<String, f64> = BTreeMap::new();
        for (inst, _) in universe {
            let group = self.group_of(inst, key, cap_buckets);
            if current.contains_key(&group) {
                *universe_counts.entry(group).or_default() += 1.0;
            }
        }
        let universe_total: f64 = universe_counts.values().sum();
        if universe_total <= 0.0 {
            return;
        }

        let lambda = self.constraints.soft_strength;
        let scale: BTreeMap<String, f64> = current
            .iter()
            .map(|(group, w)| {
                let share = w / budget;
                let target = universe_counts.get(group).copied().unwrap_or(0.0) / universe_total;
                let blended = (1.0 - lambda) * share + lambda * target;
                (group.clone(), if share > 0.0 { blended / share } else { 1.0 })
            })
            .collect();

        for (inst, w) in weights.iter_mut() {
            if let Some(s) = scale.get(&self.group_of(inst, key, cap_buckets)) {
                *w *= s;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupKey {
    Industry,
    Cap,
}

/// Market-cap tercile (0 = smallest) of each candidate with a known cap.
fn cap_terciles<'c>(
    candidates: &[(&'c str, f64)],
    profiles: &InstrumentProfiles,
) -> BTreeMap<&'c str, usize> {
    let mut with_cap: Vec<(&'c str, f64)> = candidates
        .iter()
        .filter_map(|(inst, _)| profiles.market_cap(inst).map(|c| (*inst, c)))
        .collect();
    with_cap.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    let n = with_cap.len();
    with_cap
        .into_iter()
        .enumerate()
        .map(|(rank, (inst, _))| (inst, rank * 3 / n.max(1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use factor_lab_core::InstrumentProfile;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, day).unwrap()
    }

    fn score(rows: &[(u32, &str, f64)]) -> CompositeScore {
        let mut by_date: BTreeMap<NaiveDate, CrossSection> = BTreeMap::new();
        for (d, inst, s) in rows {
            by_date.entry(date(*d)).or_default().insert((*inst).to_string(), *s);
        }
        CompositeScore::new(by_date).unwrap()
    }

    fn returns(rows: &[(u32, &str, f64)]) -> ForwardReturns {
        ForwardReturns::new(rows.iter().map(|(d, i, r)| (date(*d), (*i).to_string(), *r))).unwrap()
    }

    fn run(
        score: &CompositeScore,
        returns: &ForwardReturns,
        profiles: &InstrumentProfiles,
        constraints: &ConstraintSet,
        cost: &CostModel,
    ) -> BacktestResult {
        BacktestSimulator::default()
            .run(
                BacktestInputs {
                    score,
                    returns,
                    profiles,
                    regimes: None,
                    window: DateRange::all(),
                },
                constraints,
                cost,
                &CancellationToken::new(),
            )
            .unwrap()
    }

    // ============================================
    // Selection Tests
    // ============================================

    #[test]
    fn top_n_equal_weight_return() {
        let s = score(&[(1, "A", 3.0), (1, "B", 2.0), (1, "C", 1.0)]);
        let r = returns(&[(1, "A", 0.02), (1, "B", 0.04), (1, "C", -0.10)]);
        let result = run(
            &s,
            &r,
            &InstrumentProfiles::default(),
            &ConstraintSet::top_n(2),
            &CostModel::new(0.0),
        );

        let period = &result.periods[0];
        assert!((period.gross_return - 0.03).abs() < 1e-12);
        assert_eq!(period.holdings.len(), 2);
        assert!((period.nav - 1.03).abs() < 1e-12);
        assert!((period.benchmark_return - (-0.04 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn cost_scales_with_turnover() {
        let s = score(&[(1, "A", 2.0), (1, "B", 1.0), (2, "A", 1.0), (2, "B", 2.0)]);
        let r = returns(&[(1, "A", 0.0), (1, "B", 0.0), (2, "A", 0.0), (2, "B", 0.0)]);
        let result = run(
            &s,
            &r,
            &InstrumentProfiles::default(),
            &ConstraintSet::top_n(1),
            &CostModel::new(10.0),
        );

        // full book bought on day one, fully swapped on day two
        assert!((result.periods[0].turnover - 1.0).abs() < 1e-12);
        assert!((result.periods[1].turnover - 1.0).abs() < 1e-12);
        assert!((result.periods[1].net_return + 0.001).abs() < 1e-12);
    }

    #[test]
    fn empty_universe_skips_period_without_aborting() {
        let s = score(&[(1, "A", 1.0), (2, "A", 1.0), (3, "A", 1.0)]);
        let r = returns(&[(1, "A", 0.01), (3, "A", 0.02)]);
        let result = run(
            &s,
            &r,
            &InstrumentProfiles::default(),
            &ConstraintSet::top_n(1),
            &CostModel::new(0.0),
        );

        assert_eq!(result.periods.len(), 3);
        assert!(result.periods[1].skipped);
        assert_eq!(result.periods[1].net_return, 0.0);
        assert_eq!(
            result.warnings,
            vec![Warning::ConstraintInfeasible { date: date(2) }]
        );
        assert_eq!(result.summary.metrics.skipped_periods, 1);
    }

    #[test]
    fn nav_recursion_and_drawdown_hold() {
        let s = score(&[(1, "A", 1.0), (2, "A", 1.0), (3, "A", 1.0), (4, "A", 1.0)]);
        let r = returns(&[(1, "A", 0.05), (2, "A", -0.10), (3, "A", 0.02), (4, "A", 0.20)]);
        let result = run(
            &s,
            &r,
            &InstrumentProfiles::default(),
            &ConstraintSet::top_n(1),
            &CostModel::new(5.0),
        );

        let mut prev = 1.0;
        for p in &result.periods {
            assert!((p.nav - prev * (1.0 + p.net_return)).abs() < 1e-12);
            assert!(p.drawdown <= 0.0);
            prev = p.nav;
        }
        assert!(result.summary.metrics.max_drawdown < 0.0);
    }

    #[test]
    fn locked_name_cannot_be_bought_and_held_name_stays() {
        let s = score(&[(1, "A", 2.0), (1, "B", 1.0), (2, "A", 1.0), (2, "B", 2.0)]);
        let r = returns(&[(1, "A", 0.0), (1, "B", 0.0), (2, "A", 0.01), (2, "B", 0.03)]);
        let mut mask = TradingMask::new();
        mask.lock(date(2), "A");
        mask.lock(date(2), "B");

        let result = run(
            &s,
            &r,
            &InstrumentProfiles::default(),
            &ConstraintSet::top_n(1).with_mask(mask),
            &CostModel::new(0.0),
        );

        // A is held and locked, so it stays; B is locked and cannot be bought
        let day2 = &result.periods[1];
        assert_eq!(day2.holdings.keys().collect::<Vec<_>>(), vec!["A"]);
        assert!((day2.gross_return - 0.01).abs() < 1e-12);
        assert!(day2.turnover.abs() < 1e-12);
    }

    #[test]
    fn locked_holding_without_return_is_kept_not_sold() {
        let s = score(&[(1, "A", 2.0), (1, "B", 1.0), (2, "A", 1.0), (2, "B", 2.0)]);
        // A is suspended on day two: locked and no return row
        let r = returns(&[(1, "A", 0.0), (1, "B", 0.0), (2, "B", 0.03)]);
        let mut mask = TradingMask::new();
        mask.lock(date(2), "A");

        let result = run(
            &s,
            &r,
            &InstrumentProfiles::default(),
            &ConstraintSet::top_n(1).with_mask(mask),
            &CostModel::new(10.0),
        );

        let day2 = &result.periods[1];
        assert!(!day2.skipped);
        assert_eq!(day2.holdings.keys().collect::<Vec<_>>(), vec!["A"]);
        assert!((day2.holdings["A"] - 1.0).abs() < 1e-12);
        assert!(day2.gross_return.abs() < 1e-12);
        assert!(day2.turnover.abs() < 1e-12);
        assert!(day2.cost.abs() < 1e-12);
    }

    #[test]
    fn price_limit_move_locks_name_next_period() {
        // A hits limit-up on day one; on day two it ranks first but is locked
        let s = score(&[(1, "B", 2.0), (1, "A", 1.0), (2, "A", 3.0), (2, "B", 1.0)]);
        let r = returns(&[(1, "A", 0.10), (1, "B", 0.01), (2, "A", 0.05), (2, "B", 0.02)]);
        let config = BacktestConfig {
            price_limit: Some(0.10),
            ..BacktestConfig::default()
        };
        let constraints = ConstraintSet::top_n(1);
        let cost = CostModel::new(0.0);
        let inputs = BacktestInputs {
            score: &s,
            returns: &r,
            profiles: &InstrumentProfiles::default(),
            regimes: None,
            window: DateRange::all(),
        };

        let limited = BacktestSimulator::new(config)
            .run(inputs, &constraints, &cost, &CancellationToken::new())
            .unwrap();
        assert_eq!(limited.periods[1].holdings.keys().collect::<Vec<_>>(), vec!["B"]);
        assert!(limited.periods[1].turnover.abs() < 1e-12);

        let free = BacktestSimulator::default()
            .run(inputs, &constraints, &cost, &CancellationToken::new())
            .unwrap();
        assert_eq!(free.periods[1].holdings.keys().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn price_limit_merges_with_caller_mask() {
        let s = score(&[
            (1, "A", 3.0),
            (1, "B", 2.0),
            (1, "C", 1.0),
            (2, "A", 3.0),
            (2, "B", 2.0),
            (2, "C", 1.0),
        ]);
        let r = returns(&[
            (1, "A", -0.10),
            (1, "B", 0.0),
            (1, "C", 0.0),
            (2, "A", 0.0),
            (2, "B", 0.0),
            (2, "C", 0.04),
        ]);
        let mut mask = TradingMask::new();
        mask.lock(date(2), "B");
        let config = BacktestConfig {
            price_limit: Some(0.10),
            ..BacktestConfig::default()
        };

        let result = BacktestSimulator::new(config)
            .run(
                BacktestInputs {
                    score: &s,
                    returns: &r,
                    profiles: &InstrumentProfiles::default(),
                    regimes: None,
                    window: DateRange::all(),
                },
                &ConstraintSet::top_n(2).with_mask(mask),
                &CostModel::new(0.0),
                &CancellationToken::new(),
            )
            .unwrap();

        // A (limit-down) and B (caller lock) are both frozen from day one
        let day2 = &result.periods[1];
        assert_eq!(day2.holdings.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert!(day2.turnover.abs() < 1e-12);
        assert!(!day2.holdings.contains_key("C"));
    }

    // ============================================
    // Neutrality / Weighting Tests
    // ============================================

    fn profiles() -> InstrumentProfiles {
        let rows = [
            ("A", "Banks", 100.0),
            ("B", "Banks", 200.0),
            ("C", "Banks", 300.0),
            ("D", "Tech", 400.0),
        ];
        InstrumentProfiles::new(rows.iter().map(|(i, ind, cap)| InstrumentProfile {
            instrument: (*i).to_string(),
            industry: Some((*ind).to_string()),
            market_cap: Some(*cap),
            avg_daily_value: Some(1_000.0),
        }))
        .unwrap()
    }

    #[test]
    fn mandatory_industry_neutrality_allocates_slots() {
        let s = score(&[(1, "A", 4.0), (1, "B", 3.0), (1, "C", 2.0), (1, "D", 1.0)]);
        let r = returns(&[(1, "A", 0.0), (1, "B", 0.0), (1, "C", 0.0), (1, "D", 0.0)]);
        let constraints = ConstraintSet::top_n(3).with_industry_neutral(Neutrality::Mandatory);
        let result = run(&s, &r, &profiles(), &constraints, &CostModel::new(0.0));

        // banks 2.25 slots -> 2, tech 0.75 -> 0 plus the remainder slot
        let held: Vec<&str> = result.periods[0].holdings.keys().map(String::as_str).collect();
        assert_eq!(held, vec!["A", "B", "D"]);
    }

    #[test]
    fn soft_neutrality_tilts_toward_universe_share() {
        let s = score(&[(1, "A", 4.0), (1, "B", 3.0), (1, "D", 1.0), (1, "C", 0.5)]);
        let r = returns(&[(1, "A", 0.0), (1, "B", 0.0), (1, "C", 0.0), (1, "D", 0.0)]);
        let constraints = ConstraintSet::top_n(3)
            .with_industry_neutral(Neutrality::Soft)
            .with_soft_strength(1.0);
        let result = run(&s, &r, &profiles(), &constraints, &CostModel::new(0.0));

        let h = &result.periods[0].holdings;
        // universe share: banks 3/4, tech 1/4
        assert!((h["A"] + h["B"] - 0.75).abs() < 1e-12);
        assert!((h["D"] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn cap_weighting_and_capacity() {
        let s = score(&[(1, "A", 2.0), (1, "D", 1.0)]);
        let r = returns(&[(1, "A", 0.0), (1, "D", 0.0)]);
        let constraints = ConstraintSet::top_n(2).with_weighting(PortfolioWeighting::CapWeighted);
        let result = run(&s, &r, &profiles(), &constraints, &CostModel::new(0.0));

        let h = &result.periods[0].holdings;
        assert!((h["A"] - 0.2).abs() < 1e-12);
        assert!((h["D"] - 0.8).abs() < 1e-12);
        // tightest holding is D: 0.1 * 1000 / 0.8
        assert!((result.summary.capacity.unwrap() - 125.0).abs() < 1e-9);
    }

    #[test]
    fn cancelled_run_aborts() {
        let s = score(&[(1, "A", 1.0)]);
        let r = returns(&[(1, "A", 0.0)]);
        let token = CancellationToken::new();
        token.cancel();
        let err = BacktestSimulator::default()
            .run(
                BacktestInputs {
                    score: &s,
                    returns: &r,
                    profiles: &InstrumentProfiles::default(),
                    regimes: None,
                    window: DateRange::all(),
                },
                &ConstraintSet::top_n(1),
                &CostModel::new(0.0),
                &token,
            )
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }
}
