//! Run orchestration: resolve batches, load each (ownership then geometry),
//! then optionally rebuild the analytic tables.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use parcels_core::{BatchId, RawTable};
use parcels_sources::{DataRoot, GeometryReader, OwnershipReader};
use parcels_storage::{RawStore, RebuildCounts};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{PipelineConfig, RunOptions};
use crate::loader::{LoadOutcome, StagedLoader};
use crate::report::write_run_report;
use crate::resolver::{resolve, ResolveError};

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub batch: BatchId,
    pub table: RawTable,
    pub outcome: LoadOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RebuildOutcome {
    Completed(RebuildCounts),
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub options: RunOptions,
    pub batches: Vec<BatchId>,
    /// Set when raw loading was skipped because the requested date was invalid.
    pub invalid_date: Option<String>,
    pub units: Vec<UnitReport>,
    pub rebuild: Option<RebuildOutcome>,
    pub report_path: Option<String>,
}

impl RunSummary {
    pub fn committed(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.outcome, LoadOutcome::Committed(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.outcome, LoadOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.units.iter().filter(|u| u.outcome.is_failed()).count()
    }

    /// False when a load unit or the rebuild failed. An invalid date or
    /// missing source data does not count as failure.
    pub fn succeeded(&self) -> bool {
        self.failed() == 0 && !matches!(self.rebuild, Some(RebuildOutcome::Failed { .. }))
    }
}

pub struct Pipeline<'a> {
    store: &'a dyn RawStore,
    config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn RawStore, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, today: NaiveDate) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(run_id, today).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, today: NaiveDate) -> Result<RunSummary> {
        let started_at = Utc::now();
        let options = &self.config.run;
        let root = DataRoot::new(self.config.loader.data_dir.clone());
        info!(policy = ?options.policy, overwrite = options.overwrite, rebuild = options.rebuild, "run started");

        let (batches, invalid_date) = match resolve(&options.policy, &root, today) {
            Ok(batches) => (batches, None),
            Err(err @ ResolveError::InvalidDate { .. }) => {
                error!("{err}; raw loading skipped for this run");
                (Vec::new(), Some(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        info!(batches = batches.len(), "batches resolved");

        let loader = StagedLoader::new(self.store, options.overwrite, self.config.loader.stage_chunk);
        let mut units = Vec::with_capacity(batches.len() * 2);
        for batch in &batches {
            let outcome = loader
                .load(batch, root.owner_path(batch), OwnershipReader::open)
                .await;
            units.push(UnitReport {
                batch: batch.clone(),
                table: RawTable::Owners,
                outcome,
            });
            let outcome = loader
                .load(batch, root.parcel_path(batch), GeometryReader::open)
                .await;
            units.push(UnitReport {
                batch: batch.clone(),
                table: RawTable::Parcels,
                outcome,
            });
        }

        let rebuild = if options.rebuild {
            Some(self.rebuild().await)
        } else {
            None
        };

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            options: options.clone(),
            batches,
            invalid_date,
            units,
            rebuild,
            report_path: None,
        };

        if self.config.loader.write_reports {
            match write_run_report(&self.config.loader.reports_dir, &summary).await {
                Ok(path) => summary.report_path = Some(path.display().to_string()),
                Err(err) => warn!("writing run report failed: {err:#}"),
            }
        }

        info!(
            committed = summary.committed(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "run finished"
        );
        Ok(summary)
    }

    async fn rebuild(&self) -> RebuildOutcome {
        info!("rebuilding analytic tables");
        match self.store.rebuild_analytics().await {
            Ok(counts) => {
                info!(
                    owner_rows = counts.owner_summary_rows,
                    land_type_rows = counts.land_type_summary_rows,
                    "analytic rebuild committed"
                );
                RebuildOutcome::Completed(counts)
            }
            Err(err) => {
                error!("analytic rebuild failed: {err}");
                RebuildOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}
