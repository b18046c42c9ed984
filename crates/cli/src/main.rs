use clap::{Parser, Subcommand};

mod commands;

use commands::{BacktestArgs, CorrelateArgs, FeedArgs, FuseArgs, StatsArgs, StressArgs};

#[derive(Parser)]
#[command(name = "factor-lab")]
#[command(about = "Factor analytics, weighting, and regime-aware backtesting", long_about = None)]
struct Cli {
    #[command(flatten)]
    feed: FeedArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute IC, IC-IR, decay, turnover, and quantile returns per factor
    Stats(StatsArgs),
    /// Pairwise factor correlation with redundancy remediation suggestions
    Correlate(CorrelateArgs),
    /// Fuse factors into a weight vector summing to 100
    Fuse(FuseArgs),
    /// Backtest a Top-N portfolio on the fused composite score
    Backtest(BacktestArgs),
    /// Rerun a backtest with a downward return shock
    Stress(StressArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Stats(args) => {
            commands::run_stats(&cli.feed, args).await?;
        }
        Commands::Correlate(args) => {
            commands::run_correlate(&cli.feed, args).await?;
        }
        Commands::Fuse(args) => {
            commands::run_fuse(&cli.feed, args).await?;
        }
        Commands::Backtest(args) => {
            commands::run_backtest(&cli.feed, args).await?;
        }
        Commands::Stress(args) => {
            commands::run_stress(&cli.feed, args).await?;
        }
    }

    Ok(())
}
