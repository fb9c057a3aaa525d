//! Batch load orchestration for daily parcel drops: batch resolution, the
//! staged loader state machine, analytic rebuild triggering and run reports.

pub mod config;
pub mod loader;
pub mod pipeline;
pub mod report;
pub mod resolver;

pub use config::{LoaderConfig, PipelineConfig, RunOptions};
pub use loader::{CommitStats, LoadOutcome, LoadState, SkipReason, StagedLoader, StagedRow};
pub use pipeline::{Pipeline, RebuildOutcome, RunSummary, UnitReport};
pub use report::{summary_line, write_run_report};
pub use resolver::{resolve, LoadPolicy, ResolveError, ALL_DATES, CURRENT_DATE};

pub const CRATE_NAME: &str = "parcels-sync";
