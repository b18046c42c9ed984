//! Stress testing by deterministic return perturbation.
//!
//! A scenario shocks a fraction of instruments' forward returns downward on a
//! date window and replays the unchanged [`BacktestSimulator`] on the
//! perturbed panel, so baseline and stressed runs share one code path.

use factor_lab_core::{
    CancellationToken, DateRange, EngineError, ForwardReturns, InstrumentId, Result,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::constraints::{ConstraintSet, CostModel};
use crate::engine::{BacktestInputs, BacktestResult, BacktestSimulator};

/// A downward shock applied to part of the universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    /// Fraction of instruments shocked, in [0, 1].
    pub shock_fraction: f64,
    /// Subtracted from each shocked return, in [0, 1].
    pub shock_magnitude: f64,
    #[serde(default)]
    pub window: DateRange,
    /// Seeds the instrument selection; equal seeds shock equal instruments.
    #[serde(default)]
    pub seed: u64,
}

impl StressScenario {
    #[must_use]
    pub fn new(name: impl Into<String>, shock_fraction: f64, shock_magnitude: f64) -> Self {
        Self {
            name: name.into(),
            shock_fraction,
            shock_magnitude,
            window: DateRange::all(),
            seed: 0,
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: DateRange) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Broad sell-off: 80% of names down 10% over the window.
    #[must_use]
    pub fn market_crash(window: DateRange) -> Self {
        Self::new("market_crash", 0.8, 0.10).with_window(window)
    }

    /// # Errors
    /// Rejects a fraction or magnitude outside [0, 1].
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.shock_fraction) {
            return Err(EngineError::invalid(format!(
                "shock fraction {} must be within [0, 1]",
                self.shock_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.shock_magnitude) {
            return Err(EngineError::invalid(format!(
                "shock magnitude {} must be within [0, 1]",
                self.shock_magnitude
            )));
        }
        Ok(())
    }

    /// Instruments hit by this scenario, chosen by a seeded shuffle of the
    /// sorted universe.
    #[must_use]
    pub fn shocked_instruments(&self, returns: &ForwardReturns) -> BTreeSet<InstrumentId> {
        let mut universe = returns.instruments();
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let count = (self.shock_fraction * universe.len() as f64).round() as usize;
        if count == 0 {
            return BTreeSet::new();
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        universe.shuffle(&mut rng);
        universe.into_iter().take(count).collect()
    }
}

/// A stressed run and the instruments it shocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressOutcome {
    pub scenario: StressScenario,
    pub shocked: BTreeSet<InstrumentId>,
    pub result: BacktestResult,
}

#[derive(Debug, Clone, Default)]
pub struct StressTester {
    simulator: BacktestSimulator,
}

impl StressTester {
    #[must_use]
    pub const fn new(simulator: BacktestSimulator) -> Self {
        Self { simulator }
    }

    /// Runs one scenario. A scenario that shocks nothing replays the baseline
    /// inputs untouched.
    ///
    /// # Errors
    /// Propagates scenario validation and simulator errors.
    pub fn stress(
        &self,
        inputs: BacktestInputs<'_>,
        constraints: &ConstraintSet,
        cost_model: &CostModel,
        scenario: &StressScenario,
        cancel: &CancellationToken,
    ) -> Result<StressOutcome> {
        scenario.validate()?;
        let shocked = scenario.shocked_instruments(inputs.returns);

        let result = if shocked.is_empty() || scenario.shock_magnitude == 0.0 {
            self.simulator.run(inputs, constraints, cost_model, cancel)?
        } else {
            let perturbed = inputs.returns.map_values(|date, inst, r| {
                if scenario.window.contains(date) && shocked.contains(inst) {
                    r - scenario.shock_magnitude
                } else {
                    r
                }
            });
            let stressed = BacktestInputs {
                returns: &perturbed,
                ..inputs
            };
            self.simulator.run(stressed, constraints, cost_model, cancel)?
        };

        debug!(
            scenario = %scenario.name,
            shocked = shocked.len(),
            final_nav = ?result.final_nav(),
            "Stress scenario complete"
        );

        Ok(StressOutcome {
            scenario: scenario.clone(),
            shocked,
            result,
        })
    }

    /// Runs independent scenarios in parallel, preserving input order.
    pub fn stress_many(
        &self,
        inputs: BacktestInputs<'_>,
        constraints: &ConstraintSet,
        cost_model: &CostModel,
        scenarios: &[StressScenario],
        cancel: &CancellationToken,
    ) -> Vec<Result<StressOutcome>> {
        info!(scenarios = scenarios.len(), "Running stress scenarios");
        scenarios
            .par_iter()
            .map(|scenario| self.stress(inputs, constraints, cost_model, scenario, cancel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use factor_lab_core::{CompositeScore, CrossSection, InstrumentProfiles};
    use std::collections::BTreeMap;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, day).unwrap()
    }

    fn fixture() -> (CompositeScore, ForwardReturns) {
        let mut by_date: BTreeMap<NaiveDate, CrossSection> = BTreeMap::new();
        let mut rows = Vec::new();
        for day in 1..=10 {
            for i in 0..10 {
                let inst = format!("S{i}");
                by_date
                    .entry(date(day))
                    .or_default()
                    .insert(inst.clone(), f64::from(i * day));
                rows.push((date(day), inst, 0.001 * f64::from(i) - 0.004));
            }
        }
        (
            CompositeScore::new(by_date).unwrap(),
            ForwardReturns::new(rows).unwrap(),
        )
    }

    fn stress(
        scenario: &StressScenario,
        score: &CompositeScore,
        returns: &ForwardReturns,
    ) -> StressOutcome {
        let profiles = InstrumentProfiles::default();
        StressTester::default()
            .stress(
                BacktestInputs {
                    score,
                    returns,
                    profiles: &profiles,
                    regimes: None,
                    window: DateRange::all(),
                },
                &ConstraintSet::top_n(5),
                &CostModel::new(10.0),
                scenario,
                &CancellationToken::new(),
            )
            .unwrap()
    }

    // ============================================
    // Scenario Tests
    // ============================================

    #[test]
    fn zero_fraction_reproduces_baseline() {
        let (score, returns) = fixture();
        let profiles = InstrumentProfiles::default();
        let baseline = BacktestSimulator::default()
            .run(
                BacktestInputs {
                    score: &score,
                    returns: &returns,
                    profiles: &profiles,
                    regimes: None,
                    window: DateRange::all(),
                },
                &ConstraintSet::top_n(5),
                &CostModel::new(10.0),
                &CancellationToken::new(),
            )
            .unwrap();

        let outcome = stress(&StressScenario::new("none", 0.0, 0.5), &score, &returns);
        assert!(outcome.shocked.is_empty());
        assert_eq!(outcome.result, baseline);
    }

    #[test]
    fn full_shock_lowers_every_period() {
        let (score, returns) = fixture();
        let calm = stress(&StressScenario::new("none", 0.0, 0.0), &score, &returns);
        let crash = stress(&StressScenario::new("all", 1.0, 0.05), &score, &returns);

        assert_eq!(crash.shocked.len(), 10);
        for (a, b) in calm.result.periods.iter().zip(&crash.result.periods) {
            assert!((a.gross_return - b.gross_return - 0.05).abs() < 1e-12);
        }
    }

    #[test]
    fn selection_is_seeded() {
        let (_, returns) = fixture();
        let a = StressScenario::new("a", 0.3, 0.1).with_seed(7);
        let b = StressScenario::new("b", 0.3, 0.1).with_seed(7);
        assert_eq!(a.shocked_instruments(&returns), b.shocked_instruments(&returns));
        assert_eq!(a.shocked_instruments(&returns).len(), 3);
    }

    #[test]
    fn window_limits_the_shock() {
        let (score, returns) = fixture();
        let window = DateRange::new(date(3), date(4)).unwrap();
        let calm = stress(&StressScenario::new("none", 0.0, 0.0), &score, &returns);
        let hit = stress(&StressScenario::market_crash(window).with_seed(1), &score, &returns);

        let moved: Vec<NaiveDate> = calm
            .result
            .periods
            .iter()
            .zip(&hit.result.periods)
            .filter(|(a, b)| (a.gross_return - b.gross_return).abs() > 1e-12)
            .map(|(a, _)| a.date)
            .collect();
        assert!(moved.iter().all(|d| window.contains(*d)));
    }

    #[test]
    fn shock_through_price_limit_locks_names_next_period() {
        let mut by_date: BTreeMap<NaiveDate, CrossSection> = BTreeMap::new();
        for (day, inst, s) in [(1, "A", 2.0), (1, "B", 1.0), (2, "A", 1.0), (2, "B", 2.0)] {
            by_date.entry(date(day)).or_default().insert(inst.to_string(), s);
        }
        let score = CompositeScore::new(by_date).unwrap();
        let returns = ForwardReturns::new(vec![
            (date(1), "A".to_string(), 0.0),
            (date(1), "B".to_string(), 0.0),
            (date(2), "A".to_string(), 0.01),
            (date(2), "B".to_string(), 0.01),
        ])
        .unwrap();
        let profiles = InstrumentProfiles::default();
        let tester = StressTester::new(BacktestSimulator::new(factor_lab_core::BacktestConfig {
            price_limit: Some(0.10),
            ..Default::default()
        }));
        let run = |scenario: &StressScenario| {
            tester
                .stress(
                    BacktestInputs {
                        score: &score,
                        returns: &returns,
                        profiles: &profiles,
                        regimes: None,
                        window: DateRange::all(),
                    },
                    &ConstraintSet::top_n(1),
                    &CostModel::new(0.0),
                    scenario,
                    &CancellationToken::new(),
                )
                .unwrap()
        };

        let calm = run(&StressScenario::new("none", 0.0, 0.10));
        assert_eq!(calm.result.periods[1].holdings.keys().collect::<Vec<_>>(), vec!["B"]);

        // limit-down on day one freezes the book on day two
        let day_one = DateRange::new(date(1), date(1)).unwrap();
        let crash = run(&StressScenario::new("limit_down", 1.0, 0.10).with_window(day_one));
        let day2 = &crash.result.periods[1];
        assert_eq!(day2.holdings.keys().collect::<Vec<_>>(), vec!["A"]);
        assert!(day2.turnover.abs() < 1e-12);
    }

    #[test]
    fn many_scenarios_keep_order() {
        let (score, returns) = fixture();
        let profiles = InstrumentProfiles::default();
        let scenarios = vec![
            StressScenario::new("mild", 0.2, 0.02),
            StressScenario::new("bad", 2.0, 0.02),
        ];
        let outcomes = StressTester::default().stress_many(
            BacktestInputs {
                score: &score,
                returns: &returns,
                profiles: &profiles,
                regimes: None,
                window: DateRange::all(),
            },
            &ConstraintSet::top_n(5),
            &CostModel::new(0.0),
            &scenarios,
            &CancellationToken::new(),
        );

        assert_eq!(outcomes[0].as_ref().unwrap().scenario.name, "mild");
        assert!(matches!(outcomes[1], Err(EngineError::InvalidParameter(_))));
    }
}
