//! Raw/analytic storage boundary for parcel batches.
//!
//! A [`RawStore`] answers existence checks, hands out one [`StagingSession`]
//! per (batch, source) and rebuilds the analytic tables. Each session owns a
//! single transaction: nothing it stages, purges or projects is visible until
//! [`StagingSession::commit`] succeeds, and dropping it uncommitted discards
//! everything.

use async_trait::async_trait;
use parcels_core::{BatchId, GeometryRecord, OwnerSourceRow, ProjectionError, RawTable};
use serde::Serialize;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgRawStore;

pub const CRATE_NAME: &str = "parcels-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("encoding staged rows: {0}")]
    Encode(String),
    #[error("staging session used out of order: {0}")]
    Session(&'static str),
}

/// Row counts written by an analytic rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RebuildCounts {
    pub owner_summary_rows: u64,
    pub land_type_summary_rows: u64,
}

/// Transactional staging of one batch of one source into its raw table.
#[async_trait]
pub trait StagingSession<R: Send + Sync>: Send {
    /// Drops any leftover transient table and creates a fresh one.
    async fn prepare(&mut self) -> Result<(), StoreError>;

    /// Bulk-inserts one chunk of source rows into the transient table.
    async fn stage(&mut self, rows: &[R]) -> Result<u64, StoreError>;

    /// Tags staged rows with the session's batch identifier.
    async fn tag_batch(&mut self) -> Result<u64, StoreError>;

    /// Deletes existing raw rows for the session's batch.
    async fn purge(&mut self) -> Result<u64, StoreError>;

    /// Inserts the typed projection of the staged rows into the raw table and
    /// drops the transient table.
    async fn commit_raw(&mut self) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub type OwnerSession<'a> = Box<dyn StagingSession<OwnerSourceRow> + 'a>;
pub type ParcelSession<'a> = Box<dyn StagingSession<GeometryRecord> + 'a>;

#[async_trait]
pub trait RawStore: Send + Sync {
    async fn batch_exists(&self, table: RawTable, batch: &BatchId) -> Result<bool, StoreError>;

    async fn owner_session(&self, batch: &BatchId) -> Result<OwnerSession<'_>, StoreError>;

    async fn parcel_session(&self, batch: &BatchId) -> Result<ParcelSession<'_>, StoreError>;

    /// Truncates and recomputes every analytic table from the full raw history.
    async fn rebuild_analytics(&self) -> Result<RebuildCounts, StoreError>;
}
