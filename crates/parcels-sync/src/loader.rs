//! Per (batch, raw table) staged load.
//!
//! A unit moves `NotStarted -> Staged -> FileIndexed -> [Purged] -> Committed`
//! inside one storage transaction, or ends `Skipped` before touching storage,
//! or `Failed` with the transaction rolled back.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parcels_core::{BatchId, GeometryRecord, OwnerSourceRow, RawTable};
use parcels_sources::{fingerprint, SourceError, SourceFingerprint, SourceReader};
use parcels_storage::{RawStore, StagingSession, StoreError};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    NotStarted,
    Staged,
    FileIndexed,
    Purged,
    Committed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No source file for the batch.
    NoSource,
    /// Raw rows exist and overwrite was not requested.
    AlreadyLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub staged: u64,
    pub purged: u64,
    pub inserted: u64,
    pub skipped_records: usize,
    pub source: SourceFingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Committed(CommitStats),
    Skipped { reason: SkipReason },
    Failed { at: LoadState, error: String },
}

impl LoadOutcome {
    pub fn state(&self) -> LoadState {
        match self {
            LoadOutcome::Committed(_) => LoadState::Committed,
            LoadOutcome::Skipped { .. } => LoadState::Skipped,
            LoadOutcome::Failed { .. } => LoadState::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadOutcome::Failed { .. })
    }
}

/// Row types that have a staging session in the raw store.
#[async_trait]
pub trait StagedRow: Sized + Send + Sync + 'static {
    const TABLE: RawTable;

    async fn open_session<'a>(
        store: &'a dyn RawStore,
        batch: &'a BatchId,
    ) -> Result<Box<dyn StagingSession<Self> + 'a>, StoreError>;
}

#[async_trait]
impl StagedRow for OwnerSourceRow {
    const TABLE: RawTable = RawTable::Owners;

    async fn open_session<'a>(
        store: &'a dyn RawStore,
        batch: &'a BatchId,
    ) -> Result<Box<dyn StagingSession<Self> + 'a>, StoreError> {
        store.owner_session(batch).await
    }
}

#[async_trait]
impl StagedRow for GeometryRecord {
    const TABLE: RawTable = RawTable::Parcels;

    async fn open_session<'a>(
        store: &'a dyn RawStore,
        batch: &'a BatchId,
    ) -> Result<Box<dyn StagingSession<Self> + 'a>, StoreError> {
        store.parcel_session(batch).await
    }
}

struct Progress {
    state: LoadState,
}

impl Progress {
    fn advance(&mut self, next: LoadState) {
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }
}

pub struct StagedLoader<'a> {
    store: &'a dyn RawStore,
    overwrite: bool,
    chunk_size: usize,
}

impl<'a> StagedLoader<'a> {
    pub fn new(store: &'a dyn RawStore, overwrite: bool, chunk_size: usize) -> Self {
        Self {
            store,
            overwrite,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Loads one source file for one batch. A missing file is a skip. `open`
    /// runs only once the batch is known to need loading, so a batch that is
    /// already present is skipped even when its file no longer parses.
    pub async fn load<S, F>(&self, batch: &BatchId, path: PathBuf, open: F) -> LoadOutcome
    where
        S: SourceReader,
        S::Row: StagedRow,
        F: FnOnce(PathBuf) -> Result<S, SourceError> + Send,
    {
        let table = <S::Row as StagedRow>::TABLE;
        let span = info_span!("staged_load", batch = %batch, table = %table);
        self.run(batch, path, open).instrument(span).await
    }

    async fn run<S, F>(&self, batch: &BatchId, path: PathBuf, open: F) -> LoadOutcome
    where
        S: SourceReader,
        S::Row: StagedRow,
        F: FnOnce(PathBuf) -> Result<S, SourceError> + Send,
    {
        let table = <S::Row as StagedRow>::TABLE;
        if !path.is_file() {
            warn!(path = %path.display(), "no {table} source for batch {batch}; skipping");
            return LoadOutcome::Skipped {
                reason: SkipReason::NoSource,
            };
        }

        match self.store.batch_exists(table, batch).await {
            Ok(true) if !self.overwrite => {
                warn!("batch {batch} already present in {table}; skipping without --overwrite");
                return LoadOutcome::Skipped {
                    reason: SkipReason::AlreadyLoaded,
                };
            }
            Ok(true) => info!("batch {batch} already present in {table}; replacing"),
            Ok(false) => {}
            Err(err) => {
                return failed(
                    LoadState::NotStarted,
                    anyhow::Error::new(err).context("checking for existing rows"),
                )
            }
        }

        let source = match fingerprint(&path) {
            Ok(source) => source,
            Err(err) => return failed(LoadState::NotStarted, err),
        };

        let mut reader = match open(path) {
            Ok(reader) => reader,
            Err(err) => {
                return failed(
                    LoadState::NotStarted,
                    anyhow::Error::new(err).context("opening source"),
                )
            }
        };

        let mut session = match S::Row::open_session(self.store, batch).await {
            Ok(session) => session,
            Err(err) => {
                return failed(
                    LoadState::NotStarted,
                    anyhow::Error::new(err).context("opening staging transaction"),
                )
            }
        };

        let mut progress = Progress {
            state: LoadState::NotStarted,
        };
        let result = self
            .drive(session.as_mut(), &mut reader, &mut progress)
            .await;
        let (staged, purged, inserted) = match result {
            Ok(counts) => counts,
            Err(err) => {
                if let Err(rollback) = session.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return failed(progress.state, err);
            }
        };
        if let Err(err) = session.commit().await {
            return failed(
                progress.state,
                anyhow::Error::new(err).context("committing transaction"),
            );
        }
        progress.advance(LoadState::Committed);

        let skipped_records = reader.skipped();
        if skipped_records > 0 {
            info!(skipped_records, "skipped records without geometry");
        }
        info!(staged, purged, inserted, "batch committed");
        LoadOutcome::Committed(CommitStats {
            staged,
            purged,
            inserted,
            skipped_records,
            source,
        })
    }

    async fn drive<S>(
        &self,
        session: &mut (dyn StagingSession<S::Row> + '_),
        reader: &mut S,
        progress: &mut Progress,
    ) -> Result<(u64, u64, u64)>
    where
        S: SourceReader,
        S::Row: StagedRow,
    {
        session
            .prepare()
            .await
            .context("creating transient table")?;

        let mut staged = 0u64;
        let mut read = 0usize;
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while let Some(row) = reader.next_row() {
            read += 1;
            chunk.push(row.with_context(|| format!("reading record {read}"))?);
            if chunk.len() >= self.chunk_size {
                staged += session.stage(&chunk).await.context("staging rows")?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            staged += session.stage(&chunk).await.context("staging rows")?;
        }
        progress.advance(LoadState::Staged);

        session.tag_batch().await.context("tagging staged rows")?;
        progress.advance(LoadState::FileIndexed);

        let mut purged = 0;
        if self.overwrite {
            purged = session.purge().await.context("purging existing rows")?;
            progress.advance(LoadState::Purged);
        }

        let inserted = session
            .commit_raw()
            .await
            .context("inserting into raw table")?;
        Ok((staged, purged, inserted))
    }
}

fn failed(at: LoadState, err: anyhow::Error) -> LoadOutcome {
    error!(state = ?at, "load failed: {err:#}");
    LoadOutcome::Failed {
        at,
        error: format!("{err:#}"),
    }
}
