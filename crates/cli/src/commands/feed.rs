//! Shared input-feed arguments and service construction.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;
use factor_lab_core::{ConfigLoader, DateRange, QueryResponse, QueryStatus};
use factor_lab_data::{CsvStorage, FeedPaths};
use factor_lab_engine::AnalyticsService;
use serde::Serialize;
use std::path::PathBuf;

/// CSV input feed and evaluation window.
#[derive(Args, Debug, Clone)]
pub struct FeedArgs {
    /// Factor values: date,instrument,factor_id,value
    #[arg(long, global = true, default_value = "data/factors.csv")]
    pub factors: PathBuf,

    /// Forward returns: date,instrument,forward_return
    #[arg(long, global = true, default_value = "data/returns.csv")]
    pub returns: PathBuf,

    /// Factor metadata: factor_id,name,category
    #[arg(long, global = true)]
    pub metadata: Option<PathBuf>,

    /// Instrument profiles: instrument,industry,market_cap,avg_daily_value
    #[arg(long, global = true)]
    pub profiles: Option<PathBuf>,

    /// Sentiment / volatility score series: date,score
    #[arg(long, global = true)]
    pub sentiment: Option<PathBuf>,

    /// Engine config TOML (defaults to config/FactorLab.toml layering)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// First date of the evaluation window (YYYY-MM-DD)
    #[arg(long, global = true)]
    pub start: Option<NaiveDate>,

    /// Last date of the evaluation window (YYYY-MM-DD)
    #[arg(long, global = true)]
    pub end: Option<NaiveDate>,
}

impl FeedArgs {
    pub fn window(&self) -> Result<DateRange> {
        let window = DateRange::new(
            self.start.unwrap_or(NaiveDate::MIN),
            self.end.unwrap_or(NaiveDate::MAX),
        )?;
        Ok(window)
    }

    /// Loads config and the feed into a ready [`AnalyticsService`].
    pub fn service(&self) -> Result<AnalyticsService> {
        let config = match &self.config {
            Some(path) => ConfigLoader::load_from(path)?,
            None => ConfigLoader::load()?,
        };

        let paths = FeedPaths {
            factors: self.factors.clone(),
            returns: self.returns.clone(),
            metadata: self.metadata.clone(),
            profiles: self.profiles.clone(),
            sentiment: self.sentiment.clone(),
        };
        let store = CsvStorage::load_store(&paths).context("Failed to load input feed")?;
        tracing::info!(
            factors = store.factor_ids().len(),
            revision = store.revision(),
            "Loaded input feed"
        );
        Ok(AnalyticsService::new(store, config))
    }
}

/// Prints a response as JSON; a failed or cancelled query is an error exit.
pub fn emit<T: Serialize>(response: &QueryResponse<T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    check(&response.status)
}

/// Maps a failed or cancelled status to an error exit.
pub fn check(status: &QueryStatus) -> Result<()> {
    match status {
        QueryStatus::Error { reason } => anyhow::bail!("Query failed: {reason}"),
        QueryStatus::Cancelled => anyhow::bail!("Query cancelled"),
        QueryStatus::Ok | QueryStatus::PartialData { .. } => Ok(()),
    }
}
