//! Backtest and stress commands.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use factor_lab_backtest::{
    BacktestRecord, BacktestSummary, ConstraintSet, CostModel, Neutrality, PortfolioWeighting,
    StressOutcome, StressScenario,
};
use factor_lab_core::{CancellationToken, QueryResponse, QueryStatus, Warning};
use factor_lab_data::CsvStorage;
use factor_lab_engine::{AnalyticsService, BacktestRequest};
use serde::Serialize;
use std::path::PathBuf;

use super::analysis::FuseArgs;
use super::feed::{check, FeedArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NeutralityArg {
    Off,
    Soft,
    Mandatory,
}

impl From<NeutralityArg> for Neutrality {
    fn from(arg: NeutralityArg) -> Self {
        match arg {
            NeutralityArg::Off => Self::Off,
            NeutralityArg::Soft => Self::Soft,
            NeutralityArg::Mandatory => Self::Mandatory,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BacktestArgs {
    #[command(flatten)]
    pub fuse: FuseArgs,

    /// Number of instruments held each period
    #[arg(short = 'n', long, default_value_t = 50)]
    pub top_n: usize,

    /// Commission plus slippage in bps of turnover
    #[arg(long, default_value_t = 10.0)]
    pub cost_bps: f64,

    /// Sell-side stamp tax in bps
    #[arg(long, default_value_t = 0.0)]
    pub sell_tax_bps: f64,

    #[arg(long, value_enum, default_value = "off")]
    pub industry_neutral: NeutralityArg,

    #[arg(long, value_enum, default_value = "off")]
    pub cap_neutral: NeutralityArg,

    /// Weight holdings by market cap instead of equally
    #[arg(long)]
    pub cap_weighted: bool,

    /// Skip regime tagging even when a sentiment series is loaded
    #[arg(long)]
    pub no_regimes: bool,

    /// Write one row per period to this CSV file
    #[arg(long)]
    pub export: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StressArgs {
    #[command(flatten)]
    pub backtest: BacktestArgs,

    /// Fraction of instruments shocked, in [0, 1]
    #[arg(long, default_value_t = 0.8)]
    pub shock_fraction: f64,

    /// Return subtracted from each shocked instrument per period
    #[arg(long, default_value_t = 0.1)]
    pub shock_magnitude: f64,

    /// Seed for the shocked-instrument selection
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

/// Printed backtest report; periods go to the CSV export instead.
///
/// `warnings` holds the fusion and composite warnings followed by the
/// simulation's own.
#[derive(Debug, Serialize)]
struct BacktestReport<'a> {
    formula: String,
    status: &'a QueryStatus,
    summary: Option<&'a BacktestSummary>,
    warnings: Vec<Warning>,
}

/// Printed stress report.
#[derive(Debug, Serialize)]
struct StressReport<'a> {
    formula: String,
    input_warnings: Vec<Warning>,
    #[serde(flatten)]
    response: &'a QueryResponse<StressOutcome>,
}

/// Composite request plus the warnings raised while building it.
struct PreparedRequest {
    formula: String,
    request: BacktestRequest,
    warnings: Vec<Warning>,
}

impl BacktestArgs {
    fn constraints(&self) -> ConstraintSet {
        let weighting = if self.cap_weighted {
            PortfolioWeighting::CapWeighted
        } else {
            PortfolioWeighting::Equal
        };
        ConstraintSet::top_n(self.top_n)
            .with_industry_neutral(self.industry_neutral.into())
            .with_cap_neutral(self.cap_neutral.into())
            .with_weighting(weighting)
    }

    /// Fuses the selected factors and builds the composite score request.
    async fn request(
        &self,
        service: &AnalyticsService,
        feed: &FeedArgs,
        token: &CancellationToken,
    ) -> Result<PreparedRequest> {
        let fused = service.fuse_weights(&self.fuse.request(feed)?, token).await;
        let mut warnings = fused.warnings().to_vec();
        let weights = fused
            .value
            .with_context(|| format!("Weight fusion failed: {:?}", fused.status))?;
        let formula = weights.formula();
        tracing::info!(formula = %formula, "Composite formula");

        let window = feed.window()?;
        let scored = service.composite_score(&weights, window, token).await;
        warnings.extend_from_slice(scored.warnings());
        let score = scored
            .value
            .with_context(|| format!("Composite score failed: {:?}", scored.status))?;

        let cost = CostModel::new(self.cost_bps).with_sell_tax(self.sell_tax_bps);
        let mut request = BacktestRequest::new(score, self.constraints(), cost).with_window(window);
        if self.no_regimes {
            request = request.without_regimes();
        }
        Ok(PreparedRequest {
            formula,
            request,
            warnings,
        })
    }
}

pub async fn run_backtest(feed: &FeedArgs, args: BacktestArgs) -> Result<()> {
    let service = feed.service()?;
    let token = CancellationToken::new();
    let prepared = args.request(&service, feed, &token).await?;

    let response = service.run_backtest(&prepared.request, &token).await;
    let mut warnings = prepared.warnings;
    warnings.extend_from_slice(response.warnings());
    let report = BacktestReport {
        formula: prepared.formula,
        status: &response.status,
        summary: response.value.as_ref().map(|r| &r.summary),
        warnings,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    let result = response
        .value
        .with_context(|| format!("Backtest failed: {:?}", response.status))?;
    if let Some(path) = &args.export {
        let records = BacktestRecord::from_result(&result);
        CsvStorage::write_records(path, &records)?;
        tracing::info!(rows = records.len(), path = %path.display(), "Exported backtest periods");
    }
    Ok(())
}

pub async fn run_stress(feed: &FeedArgs, args: StressArgs) -> Result<()> {
    let service = feed.service()?;
    let token = CancellationToken::new();
    let prepared = args.backtest.request(&service, feed, &token).await?;

    let scenario = StressScenario::new("cli", args.shock_fraction, args.shock_magnitude)
        .with_window(feed.window()?)
        .with_seed(args.seed);
    let response = service.run_stress(&prepared.request, &scenario, &token).await;

    if let (Some(path), Some(outcome)) = (&args.backtest.export, &response.value) {
        let records = BacktestRecord::from_result(&outcome.result);
        CsvStorage::write_records(path, &records)?;
        tracing::info!(rows = records.len(), path = %path.display(), "Exported stressed periods");
    }
    let report = StressReport {
        formula: prepared.formula,
        input_warnings: prepared.warnings,
        response: &response,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    check(&response.status)
}
