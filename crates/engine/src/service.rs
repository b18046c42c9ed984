//! Query API over a [`FactorStore`].
//!
//! Every query takes caller-owned request parameters, runs CPU-bound work on
//! the blocking pool and answers with a [`QueryResponse`]. Factor statistics
//! and correlation matrices are memoized by input versions and parameters;
//! backtests and stress runs always produce a fresh result.

use factor_lab_analytics::{
    suggest_remediations, CompositeBuilder, CorrelationAnalyzer, CorrelationMatrix,
    FactorStatistics, FusionInputs, RemediationSuggestion, StatisticsEngine, WeightMethod,
    WeightVector, WeightingOptimizer,
};
use factor_lab_backtest::{
    percentile_rank_scores, BacktestInputs, BacktestResult, BacktestSimulator, ConstraintSet,
    CostModel, RegimeClassifier, RegimeSeries, StressOutcome, StressScenario, StressTester,
};
use factor_lab_core::{
    CancellationToken, CompositeScore, DateRange, EngineConfig, EngineError, FactorId,
    QueryResponse, Result, Warning,
};
use factor_lab_data::FactorStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::{CacheKey, QueryCache};

/// Correlation matrix plus remediation suggestions for its redundant pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub matrix: CorrelationMatrix,
    pub threshold: f64,
    pub suggestions: Vec<RemediationSuggestion>,
    /// Factors whose statistics failed; their IC-IR ranks as undefined.
    #[serde(default)]
    pub unranked: Vec<FactorId>,
}

impl CorrelationReport {
    #[must_use]
    pub fn warnings(&self) -> Vec<Warning> {
        let mut warnings = self.matrix.warnings();
        warnings.extend(
            self.unranked
                .iter()
                .map(|factor| Warning::StatisticsUnavailable {
                    factor: factor.clone(),
                }),
        );
        warnings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuseRequest {
    pub factor_ids: Vec<FactorId>,
    pub method: WeightMethod,
    #[serde(default)]
    pub window: DateRange,
}

impl FuseRequest {
    #[must_use]
    pub fn new(factor_ids: Vec<FactorId>, method: WeightMethod) -> Self {
        Self {
            factor_ids,
            method,
            window: DateRange::all(),
        }
    }
}

/// Parameters of one simulation.
#[derive(Debug, Clone)]
pub struct BacktestRequest {
    pub score: Arc<CompositeScore>,
    pub constraints: ConstraintSet,
    pub cost_model: CostModel,
    pub window: DateRange,
    /// Tag periods with regimes classified from the stored sentiment series.
    pub use_regimes: bool,
}

impl BacktestRequest {
    #[must_use]
    pub fn new(score: CompositeScore, constraints: ConstraintSet, cost_model: CostModel) -> Self {
        Self {
            score: Arc::new(score),
            constraints,
            cost_model,
            window: DateRange::all(),
            use_regimes: true,
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: DateRange) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn without_regimes(mut self) -> Self {
        self.use_regimes = false;
        self
    }
}

/// Engine entry point shared by presentation layers.
pub struct AnalyticsService {
    store: RwLock<FactorStore>,
    config: EngineConfig,
    statistics_cache: QueryCache<Arc<FactorStatistics>>,
    correlation_cache: QueryCache<Arc<CorrelationReport>>,
}

impl AnalyticsService {
    #[must_use]
    pub fn new(store: FactorStore, config: EngineConfig) -> Self {
        Self {
            store: RwLock::new(store),
            statistics_cache: QueryCache::new(&config.cache),
            correlation_cache: QueryCache::new(&config.cache),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Applies a mutation to the store. Versions bumped by the mutation
    /// invalidate memoized results that depended on the replaced data.
    pub async fn update_store<F, R>(&self, mutate: F) -> R
    where
        F: FnOnce(&mut FactorStore) -> R,
    {
        let mut store = self.store.write().await;
        mutate(&mut store)
    }

    /// Cheap copy of the current store; series are shared, not cloned.
    pub async fn snapshot(&self) -> FactorStore {
        self.store.read().await.clone()
    }

    pub fn clear_cache(&self) {
        self.statistics_cache.clear();
        self.correlation_cache.clear();
    }

    // ============================================
    // Queries
    // ============================================

    pub async fn get_statistics(
        &self,
        factor_id: &str,
        window: DateRange,
        cancel: &CancellationToken,
    ) -> QueryResponse<FactorStatistics> {
        info!(factor = %factor_id, "Statistics query");
        let result = self.statistics(factor_id, window, cancel).await.map(|stats| {
            let warnings = stats.warnings();
            (FactorStatistics::clone(&stats), warnings)
        });
        respond("statistics", result)
    }

    pub async fn get_correlation(
        &self,
        factor_ids: &[FactorId],
        window: DateRange,
        cancel: &CancellationToken,
    ) -> QueryResponse<CorrelationReport> {
        info!(factors = factor_ids.len(), "Correlation query");
        let result = self.correlation(factor_ids, window, cancel).await.map(|report| {
            let warnings = report.warnings();
            (CorrelationReport::clone(&report), warnings)
        });
        respond("correlation", result)
    }

    pub async fn fuse_weights(
        &self,
        request: &FuseRequest,
        cancel: &CancellationToken,
    ) -> QueryResponse<WeightVector> {
        info!(
            factors = request.factor_ids.len(),
            method = request.method.name(),
            "Fuse weights query"
        );
        respond("fuse_weights", self.fuse(request, cancel).await)
    }

    /// Composite score of the weighted factors, each signed by its direction.
    pub async fn composite_score(
        &self,
        weights: &WeightVector,
        window: DateRange,
        cancel: &CancellationToken,
    ) -> QueryResponse<CompositeScore> {
        info!(factors = weights.len(), formula = %weights.formula(), "Composite score query");
        respond("composite_score", self.composite(weights, window, cancel).await)
    }

    pub async fn run_backtest(
        &self,
        request: &BacktestRequest,
        cancel: &CancellationToken,
    ) -> QueryResponse<BacktestResult> {
        info!(top_n = request.constraints.top_n, "Backtest query");
        let result = self.backtest(request, cancel).await.map(|r| {
            let warnings = r.warnings.clone();
            (r, warnings)
        });
        respond("backtest", result)
    }

    pub async fn run_stress(
        &self,
        request: &BacktestRequest,
        scenario: &StressScenario,
        cancel: &CancellationToken,
    ) -> QueryResponse<StressOutcome> {
        info!(scenario = %scenario.name, "Stress query");
        let outcome = self
            .stress(request, vec![scenario.clone()], cancel)
            .await
            .and_then(|mut outcomes| {
                outcomes
                    .pop()
                    .unwrap_or_else(|| Err(EngineError::invalid("no stress outcome produced")))
            });
        respond(
            "stress",
            outcome.map(|o| {
                let warnings = o.result.warnings.clone();
                (o, warnings)
            }),
        )
    }

    /// Runs independent scenarios in parallel; one response per scenario.
    pub async fn run_stress_many(
        &self,
        request: &BacktestRequest,
        scenarios: &[StressScenario],
        cancel: &CancellationToken,
    ) -> Vec<QueryResponse<StressOutcome>> {
        info!(scenarios = scenarios.len(), "Stress batch query");
        match self.stress(request, scenarios.to_vec(), cancel).await {
            Ok(outcomes) => outcomes
                .into_iter()
                .map(|outcome| {
                    respond(
                        "stress",
                        outcome.map(|o| {
                            let warnings = o.result.warnings.clone();
                            (o, warnings)
                        }),
                    )
                })
                .collect(),
            Err(e) => scenarios.iter().map(|_| QueryResponse::failed(&e)).collect(),
        }
    }

    // ============================================
    // Computation
    // ============================================

    async fn statistics(
        &self,
        factor_id: &str,
        window: DateRange,
        cancel: &CancellationToken,
    ) -> Result<Arc<FactorStatistics>> {
        let store = self.snapshot().await;
        let factor = store.factor(factor_id)?;
        let returns = store.forward_returns();
        let key = CacheKey::new(
            &("statistics", factor_id, window),
            &(store.factor_version(factor_id), store.returns_version()),
        );

        let engine = StatisticsEngine::new(self.config.statistics.clone());
        let cancel = cancel.clone();
        self.statistics_cache
            .get_or_try_compute(key, move || async move {
                blocking(move || {
                    engine
                        .compute(&factor, &returns, window, &cancel)
                        .map(Arc::new)
                })
                .await
            })
            .await
    }

    /// IC-IR per factor for ranking. A factor whose statistics cannot be
    /// computed ranks as undefined; cancellation still aborts.
    async fn ic_irs(
        &self,
        factor_ids: &[FactorId],
        window: DateRange,
        cancel: &CancellationToken,
    ) -> Result<(BTreeMap<FactorId, Option<f64>>, Vec<FactorId>)> {
        let mut out = BTreeMap::new();
        let mut unranked = Vec::new();
        for id in factor_ids {
            let ir = match self.statistics(id, window, cancel).await {
                Ok(stats) => stats.ic_ir,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(factor = %id, error = %e, "Statistics unavailable; IC-IR undefined");
                    unranked.push(id.clone());
                    None
                }
            };
            out.insert(id.clone(), ir);
        }
        Ok((out, unranked))
    }

    async fn correlation(
        &self,
        factor_ids: &[FactorId],
        window: DateRange,
        cancel: &CancellationToken,
    ) -> Result<Arc<CorrelationReport>> {
        let store = self.snapshot().await;
        let series = factor_ids
            .iter()
            .map(|id| store.factor(id))
            .collect::<Result<Vec<_>>>()?;
        let versions: Vec<Option<u64>> = factor_ids
            .iter()
            .map(|id| store.factor_version(id))
            .collect();
        let key = CacheKey::new(
            &("correlation", factor_ids, window),
            &(versions, store.returns_version()),
        );

        let config = self.config.correlation.clone();
        let threshold = config.redundancy_threshold;
        self.correlation_cache
            .get_or_try_compute(key, || async {
                let token = cancel.clone();
                let matrix = blocking(move || {
                    CorrelationAnalyzer::new(config).compute(&series, window, &token)
                })
                .await?;
                let (irs, unranked) = self.ic_irs(factor_ids, window, cancel).await?;
                let suggestions = suggest_remediations(&matrix, threshold, &irs);
                Ok(Arc::new(CorrelationReport {
                    matrix,
                    threshold,
                    suggestions,
                    unranked,
                }))
            })
            .await
    }

    async fn fuse(
        &self,
        request: &FuseRequest,
        cancel: &CancellationToken,
    ) -> Result<(WeightVector, Vec<Warning>)> {
        let mut statistics = Vec::with_capacity(request.factor_ids.len());
        for id in &request.factor_ids {
            let stats = self.statistics(id, request.window, cancel).await?;
            statistics.push(FactorStatistics::clone(&stats));
        }

        let store = self.snapshot().await;
        let series = request
            .factor_ids
            .iter()
            .map(|id| store.factor(id))
            .collect::<Result<Vec<_>>>()?;
        let method = request.method.clone();
        let window = request.window;
        let cancel = cancel.clone();

        let fusion = blocking(move || {
            let inputs = FusionInputs {
                statistics: &statistics,
                series: &series,
                window,
            };
            WeightingOptimizer::new().fuse(inputs, &method, &cancel)
        })
        .await?;
        Ok((fusion.weights, fusion.warnings))
    }

    async fn composite(
        &self,
        weights: &WeightVector,
        window: DateRange,
        cancel: &CancellationToken,
    ) -> Result<(CompositeScore, Vec<Warning>)> {
        let ids = weights.factor_ids();
        let mut directions = BTreeMap::new();
        let mut warnings = Vec::new();
        for id in &ids {
            match self.statistics(id, window, cancel).await {
                Ok(stats) => {
                    directions.insert(id.clone(), stats.direction);
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(factor = %id, error = %e, "Direction unknown; factor used as-is");
                    warnings.push(Warning::DirectionUnknown { factor: id.clone() });
                }
            }
        }

        let store = self.snapshot().await;
        let series = ids
            .iter()
            .map(|id| store.factor(id))
            .collect::<Result<Vec<_>>>()?;
        let weights = weights.clone();
        let score = blocking(move || {
            CompositeBuilder::new()
                .with_directions(directions)
                .build(&weights, &series, window)
        })
        .await?;
        Ok((score, warnings))
    }

    /// Regime labels from the stored sentiment series, if requested and present.
    fn regimes(&self, store: &FactorStore, use_regimes: bool) -> Result<Option<RegimeSeries>> {
        let sentiment = store.sentiment();
        if !use_regimes || sentiment.is_empty() {
            return Ok(None);
        }
        let mut scores: Vec<_> = sentiment.iter().map(|row| (row.date, row.score)).collect();
        if let Some(lookback) = self.config.regime.percentile_lookback {
            scores = percentile_rank_scores(&scores, lookback);
        }
        RegimeClassifier::new(self.config.regime.clone())?
            .classify(&scores)
            .map(Some)
    }

    async fn backtest(
        &self,
        request: &BacktestRequest,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        let store = self.snapshot().await;
        let regimes = self.regimes(&store, request.use_regimes)?;
        let simulator = BacktestSimulator::new(self.config.backtest.clone());
        let request = request.clone();
        let cancel = cancel.clone();

        blocking(move || {
            let returns = store.forward_returns();
            let profiles = store.profiles();
            let inputs = BacktestInputs {
                score: &request.score,
                returns: &returns,
                profiles: &profiles,
                regimes: regimes.as_ref(),
                window: request.window,
            };
            simulator.run(inputs, &request.constraints, &request.cost_model, &cancel)
        })
        .await
    }

    async fn stress(
        &self,
        request: &BacktestRequest,
        scenarios: Vec<StressScenario>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Result<StressOutcome>>> {
        let store = self.snapshot().await;
        let regimes = self.regimes(&store, request.use_regimes)?;
        let tester = StressTester::new(BacktestSimulator::new(self.config.backtest.clone()));
        let request = request.clone();
        let cancel = cancel.clone();

        blocking(move || {
            let returns = store.forward_returns();
            let profiles = store.profiles();
            let inputs = BacktestInputs {
                score: &request.score,
                returns: &returns,
                profiles: &profiles,
                regimes: regimes.as_ref(),
                window: request.window,
            };
            Ok(tester.stress_many(
                inputs,
                &request.constraints,
                &request.cost_model,
                &scenarios,
                &cancel,
            ))
        })
        .await
    }
}

/// Runs CPU-bound work on the blocking pool. Panics resume on the caller; a
/// task dropped by runtime shutdown reads as cancelled.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(join_error) => match join_error.try_into_panic() {
            Ok(panic) => std::panic::resume_unwind(panic),
            Err(_) => Err(EngineError::Cancelled),
        },
    }
}

fn respond<T>(query: &str, result: Result<(T, Vec<Warning>)>) -> QueryResponse<T> {
    match result {
        Ok((value, warnings)) => {
            if !warnings.is_empty() {
                warn!(query, warnings = warnings.len(), "Query completed with warnings");
            }
            QueryResponse::computed(value, warnings)
        }
        Err(e) => {
            if e.is_cancellation() {
                info!(query, "Query cancelled");
            } else {
                warn!(query, error = %e, "Query failed");
            }
            QueryResponse::failed(&e)
        }
    }
}
