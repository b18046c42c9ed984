//! Factor analysis commands: statistics, correlation, and weight fusion.

use anyhow::{anyhow, Context, Result};
use clap::{Args, ValueEnum};
use factor_lab_analytics::{QuantileRecord, StatisticsRecord, WeightMethod};
use factor_lab_core::{CancellationToken, FactorId};
use factor_lab_data::CsvStorage;
use factor_lab_engine::{AnalyticsService, FuseRequest};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::feed::{emit, FeedArgs};

#[derive(Args, Debug, Clone)]
pub struct StatsArgs {
    /// Factor ids; all stored factors when omitted
    pub factors: Vec<FactorId>,

    /// Write per-period IC rows to this CSV file
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Write quantile bucket rows to this CSV file
    #[arg(long)]
    pub export_quantiles: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CorrelateArgs {
    /// Factor ids; all stored factors when omitted
    pub factors: Vec<FactorId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MethodArg {
    Equal,
    IcIr,
    Pca,
    Custom,
}

/// Factor selection plus weighting method, shared by fuse and backtest.
#[derive(Args, Debug, Clone)]
pub struct FuseArgs {
    /// Factor ids to combine
    #[arg(required = true)]
    pub factors: Vec<FactorId>,

    #[arg(short, long, value_enum, default_value = "equal")]
    pub method: MethodArg,

    /// Custom weights as id=weight pairs, e.g. "momentum=60,value=40"
    #[arg(long, required_if_eq("method", "custom"))]
    pub weights: Option<String>,
}

impl FuseArgs {
    pub fn request(&self, feed: &FeedArgs) -> Result<FuseRequest> {
        let method = match self.method {
            MethodArg::Equal => WeightMethod::Equal,
            MethodArg::IcIr => WeightMethod::IcIrWeighted,
            MethodArg::Pca => WeightMethod::Pca,
            MethodArg::Custom => {
                let raw = self
                    .weights
                    .as_deref()
                    .ok_or_else(|| anyhow!("--weights is required for the custom method"))?;
                WeightMethod::Custom {
                    weights: parse_custom_weights(raw)?,
                }
            }
        };
        let mut request = FuseRequest::new(self.factors.clone(), method);
        request.window = feed.window()?;
        Ok(request)
    }
}

/// Parses `id=weight` pairs separated by commas.
pub fn parse_custom_weights(raw: &str) -> Result<BTreeMap<FactorId, f64>> {
    let mut weights = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, weight) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected id=weight, got '{pair}'"))?;
        let weight: f64 = weight
            .trim()
            .parse()
            .with_context(|| format!("Invalid weight for factor '{}'", id.trim()))?;
        if weights.insert(id.trim().to_string(), weight).is_some() {
            anyhow::bail!("Factor '{}' given more than once", id.trim());
        }
    }
    Ok(weights)
}

async fn selected(service: &AnalyticsService, factors: &[FactorId]) -> Vec<FactorId> {
    if factors.is_empty() {
        service.snapshot().await.factor_ids()
    } else {
        factors.to_vec()
    }
}

pub async fn run_stats(feed: &FeedArgs, args: StatsArgs) -> Result<()> {
    let service = feed.service()?;
    let window = feed.window()?;
    let token = CancellationToken::new();

    let mut ic_rows = Vec::new();
    let mut quantile_rows = Vec::new();
    let mut failed = 0_usize;

    for id in selected(&service, &args.factors).await {
        let response = service.get_statistics(&id, window, &token).await;
        if let Some(stats) = &response.value {
            ic_rows.extend(StatisticsRecord::from_statistics(stats));
            quantile_rows.extend(QuantileRecord::from_statistics(stats));
        }
        if emit(&response).is_err() {
            failed += 1;
        }
    }

    if let Some(path) = &args.export {
        CsvStorage::write_records(path, &ic_rows)?;
        tracing::info!(rows = ic_rows.len(), path = %path.display(), "Exported IC series");
    }
    if let Some(path) = &args.export_quantiles {
        CsvStorage::write_records(path, &quantile_rows)?;
        tracing::info!(rows = quantile_rows.len(), path = %path.display(), "Exported quantile returns");
    }

    if failed > 0 {
        anyhow::bail!("{failed} factor(s) failed");
    }
    Ok(())
}

pub async fn run_correlate(feed: &FeedArgs, args: CorrelateArgs) -> Result<()> {
    let service = feed.service()?;
    let factors = selected(&service, &args.factors).await;
    let response = service
        .get_correlation(&factors, feed.window()?, &CancellationToken::new())
        .await;
    emit(&response)
}

pub async fn run_fuse(feed: &FeedArgs, args: FuseArgs) -> Result<()> {
    let service = feed.service()?;
    let request = args.request(feed)?;
    let response = service
        .fuse_weights(&request, &CancellationToken::new())
        .await;
    if let Some(weights) = &response.value {
        tracing::info!(formula = %weights.formula(), "Composite formula");
    }
    emit(&response)
}
