//! Two factors with population correlation 0.82 over 252 dates x 300
//! instruments must be flagged redundant, targeting the lower IC-IR factor.

use chrono::{Days, NaiveDate};
use factor_lab_analytics::{
    suggest_remediations, CorrelationAnalyzer, StatisticsEngine, WeightMethod,
    WeightingOptimizer, FusionInputs,
};
use factor_lab_core::{
    CancellationToken, CorrelationConfig, DateRange, FactorCategory, FactorSeries,
    ForwardReturns, Observation, StatisticsConfig,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

const DATES: u64 = 252;
const INSTRUMENTS: usize = 300;
const RHO: f64 = 0.82;

fn fixture() -> (Arc<FactorSeries>, Arc<FactorSeries>, ForwardReturns) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let mix = (1.0 - RHO * RHO).sqrt();

    let mut a_obs = Vec::new();
    let mut b_obs = Vec::new();
    let mut returns = Vec::new();

    for d in 0..DATES {
        let date = start + Days::new(d);
        for i in 0..INSTRUMENTS {
            let inst = format!("S{i:04}");
            let x: f64 = rng.gen();
            let y: f64 = rng.gen();
            let b = RHO * x + mix * y;
            let noise: f64 = rng.gen::<f64>() - 0.5;
            let ret = 0.02 * (x - 0.5) + 0.05 * noise;

            a_obs.push(Observation::new(date, inst.clone(), Some(x)));
            b_obs.push(Observation::new(date, inst.clone(), Some(b)));
            returns.push((date, inst, ret));
        }
    }

    (
        Arc::new(FactorSeries::new("alpha", "Alpha", FactorCategory::Technical, a_obs).unwrap()),
        Arc::new(FactorSeries::new("beta", "Beta", FactorCategory::Technical, b_obs).unwrap()),
        ForwardReturns::new(returns).unwrap(),
    )
}

#[test]
fn correlated_pair_is_flagged_with_lower_ir_target() {
    let (a, b, returns) = fixture();
    let token = CancellationToken::new();

    let matrix = CorrelationAnalyzer::new(CorrelationConfig::default())
        .compute(&[Arc::clone(&a), Arc::clone(&b)], DateRange::all(), &token)
        .unwrap();
    let r = matrix.coefficient("alpha", "beta").unwrap();
    assert!((r - RHO).abs() < 0.02, "sample correlation {r}");

    let stats = StatisticsEngine::new(StatisticsConfig {
        max_decay_lag: 2,
        ..StatisticsConfig::default()
    })
    .compute_many(&[Arc::clone(&a), Arc::clone(&b)], &returns, DateRange::all(), &token);
    let stats: Vec<_> = stats.into_iter().map(Result::unwrap).collect();
    let irs: BTreeMap<String, Option<f64>> = stats
        .iter()
        .map(|s| (s.factor_id.clone(), s.ic_ir))
        .collect();

    let suggestions = suggest_remediations(&matrix, 0.7, &irs);
    assert_eq!(suggestions.len(), 1);

    let lower = if irs["alpha"].unwrap() < irs["beta"].unwrap() {
        "alpha"
    } else {
        "beta"
    };
    assert_eq!(suggestions[0].target, lower);
}

#[test]
fn every_method_sums_to_one_hundred() {
    let (a, b, returns) = fixture();
    let token = CancellationToken::new();
    let series = vec![a, b];
    let stats: Vec<_> = StatisticsEngine::new(StatisticsConfig {
        max_decay_lag: 1,
        ..StatisticsConfig::default()
    })
    .compute_many(&series, &returns, DateRange::all(), &token)
    .into_iter()
    .map(Result::unwrap)
    .collect();

    let inputs = FusionInputs {
        statistics: &stats,
        series: &series,
        window: DateRange::all(),
    };
    let custom = BTreeMap::from([("alpha".to_string(), 3.0), ("beta".to_string(), 1.0)]);

    for method in [
        WeightMethod::Equal,
        WeightMethod::IcIrWeighted,
        WeightMethod::Pca,
        WeightMethod::Custom { weights: custom },
    ] {
        let fusion = WeightingOptimizer::new().fuse(inputs, &method, &token).unwrap();
        assert!(
            (fusion.weights.sum() - 100.0).abs() <= 0.5,
            "{} summed to {}",
            method.name(),
            fusion.weights.sum()
        );
        assert!(fusion.weights.iter().all(|w| (0.0..=100.0).contains(&w.weight)));
    }
}
