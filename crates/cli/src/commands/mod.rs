pub mod analysis;
pub mod feed;
pub mod simulation;

pub use analysis::{run_correlate, run_fuse, run_stats, CorrelateArgs, FuseArgs, StatsArgs};
pub use feed::FeedArgs;
pub use simulation::{run_backtest, run_stress, BacktestArgs, StressArgs};
