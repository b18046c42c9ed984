//! Flat per-date rows for tabular export of a backtest.

use chrono::NaiveDate;
use factor_lab_core::Regime;
use serde::{Deserialize, Serialize};

use crate::engine::{BacktestPeriod, BacktestResult};

/// One backtest period as a flat record.
///
/// Holdings are encoded as `instrument=weight` pairs joined by `;` so the row
/// stays flat. Floats keep full precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub date: NaiveDate,
    pub nav: f64,
    pub benchmark_nav: f64,
    pub drawdown: f64,
    pub regime: Option<Regime>,
    pub gross_return: f64,
    pub net_return: f64,
    pub cost: f64,
    pub turnover: f64,
    pub holdings: String,
    pub skipped: bool,
}

impl From<&BacktestPeriod> for BacktestRecord {
    fn from(period: &BacktestPeriod) -> Self {
        let holdings = period
            .holdings
            .iter()
            .map(|(inst, w)| format!("{inst}={w}"))
            .collect::<Vec<_>>()
            .join(";");

        Self {
            date: period.date,
            nav: period.nav,
            benchmark_nav: period.benchmark_nav,
            drawdown: period.drawdown,
            regime: period.regime,
            gross_return: period.gross_return,
            net_return: period.net_return,
            cost: period.cost,
            turnover: period.turnover,
            holdings,
            skipped: period.skipped,
        }
    }
}

impl BacktestRecord {
    /// One record per period, in date order.
    #[must_use]
    pub fn from_result(result: &BacktestResult) -> Vec<Self> {
        result.periods.iter().map(Self::from).collect()
    }
}
