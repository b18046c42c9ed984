use serde::{Deserialize, Serialize};

/// Summary statistics of a simulated equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub periods: usize,
    pub skipped_periods: usize,
    pub total_return: f64,
    pub annualized_return: f64,
    pub annualized_volatility: Option<f64>,
    /// Annualized; undefined without return dispersion.
    pub sharpe_ratio: Option<f64>,
    /// Deepest drawdown as a non-positive fraction.
    pub max_drawdown: f64,
    pub information_ratio: Option<f64>,
    /// Mean buy-side turnover over traded periods.
    pub average_turnover: f64,
}

pub struct MetricsCalculator {
    periods_per_year: f64,
    net_returns: Vec<f64>,
    active_returns: Vec<f64>,
    turnovers: Vec<f64>,
    equity_curve: Vec<f64>,
    skipped: usize,
}

impl MetricsCalculator {
    /// Creates a new `MetricsCalculator` with the specified initial NAV.
    #[must_use]
    pub fn new(initial_nav: f64, periods_per_year: f64) -> Self {
        Self {
            periods_per_year,
            net_returns: Vec::new(),
            active_returns: Vec::new(),
            turnovers: Vec::new(),
            equity_curve: vec![initial_nav],
            skipped: 0,
        }
    }

    /// Records one period and returns the updated NAV.
    pub fn add_period(
        &mut self,
        net_return: f64,
        benchmark_return: f64,
        turnover: f64,
        skipped: bool,
    ) -> f64 {
        let current = self.nav();
        let next = current * (1.0 + net_return);
        self.equity_curve.push(next);
        self.net_returns.push(net_return);
        self.active_returns.push(net_return - benchmark_return);
        if skipped {
            self.skipped += 1;
        } else {
            self.turnovers.push(turnover);
        }
        next
    }

    #[must_use]
    pub fn nav(&self) -> f64 {
        self.equity_curve.last().copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn calculate(&self) -> PerformanceMetrics {
        let periods = self.net_returns.len();
        let initial = self.equity_curve.first().copied().unwrap_or(0.0);
        let total_return = if initial > 0.0 {
            self.nav() / initial - 1.0
        } else {
            0.0
        };

        #[allow(clippy::cast_precision_loss)]
        let annualized_return = if periods > 0 {
            (1.0 + total_return).powf(self.periods_per_year / periods as f64) - 1.0
        } else {
            0.0
        };

        let annualized_volatility =
            sample_std(&self.net_returns).map(|sd| sd * self.periods_per_year.sqrt());
        let sharpe_ratio = annualized_ratio(&self.net_returns, self.periods_per_year);
        let information_ratio = annualized_ratio(&self.active_returns, self.periods_per_year);

        #[allow(clippy::cast_precision_loss)]
        let average_turnover = if self.turnovers.is_empty() {
            0.0
        } else {
            self.turnovers.iter().sum::<f64>() / self.turnovers.len() as f64
        };

        PerformanceMetrics {
            periods,
            skipped_periods: self.skipped,
            total_return,
            annualized_return,
            annualized_volatility,
            sharpe_ratio,
            max_drawdown: self.calculate_max_drawdown(),
            information_ratio,
            average_turnover,
        }
    }

    fn calculate_max_drawdown(&self) -> f64 {
        let mut max_drawdown = 0.0_f64;
        let mut peak = f64::MIN;

        for &equity in &self.equity_curve {
            peak = peak.max(equity);
            if peak > 0.0 {
                max_drawdown = max_drawdown.min(equity / peak - 1.0);
            }
        }

        max_drawdown
    }
}

#[allow(clippy::cast_precision_loss)]
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

#[allow(clippy::cast_precision_loss)]
fn annualized_ratio(values: &[f64], periods_per_year: f64) -> Option<f64> {
    let sd = sample_std(values)?;
    if sd < f64::EPSILON {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some(mean / sd * periods_per_year.sqrt())
}
