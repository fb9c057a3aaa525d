//! In-process store with the same staging and rebuild semantics as PostgreSQL.
//!
//! Sessions keep staged rows to themselves and apply purge + insert under a
//! single lock on commit, so an uncommitted session never leaves a trace.

use std::collections::BTreeSet;

use async_trait::async_trait;
use parcels_core::analytics::{
    geodesic_area_m2, land_type_daily_summaries, owner_daily_summaries, parcel_areas,
    LandTypeDailySummary, OwnerDailySummary,
};
use parcels_core::{
    BatchId, GeometryRecord, OwnerSourceRow, OwnershipRecord, ParcelGeometry, ProjectionError,
    RawTable,
};
use tokio::sync::Mutex;

use crate::{
    OwnerSession, ParcelSession, RawStore, RebuildCounts, StagingSession, StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    owners: Vec<OwnershipRecord>,
    parcels: Vec<ParcelGeometry>,
    owner_summary: Vec<OwnerDailySummary>,
    land_type_summary: Vec<LandTypeDailySummary>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn owners(&self) -> Vec<OwnershipRecord> {
        self.state.lock().await.owners.clone()
    }

    pub async fn parcels(&self) -> Vec<ParcelGeometry> {
        self.state.lock().await.parcels.clone()
    }

    pub async fn owner_summary(&self) -> Vec<OwnerDailySummary> {
        self.state.lock().await.owner_summary.clone()
    }

    pub async fn land_type_summary(&self) -> Vec<LandTypeDailySummary> {
        self.state.lock().await.land_type_summary.clone()
    }
}

/// A raw table row type and the projection that produces it from staged rows.
trait MemoryTable: Sized + Send + 'static {
    type Staged: Clone + Send + Sync;

    fn project(staged: &[Self::Staged], batch: &BatchId) -> Result<Vec<Self>, ProjectionError>;

    /// Rejects rows the transient table itself would refuse.
    fn validate(_staged: &Self::Staged) -> Result<(), ProjectionError> {
        Ok(())
    }

    fn batch(&self) -> &BatchId;

    fn rows(state: &mut MemoryState) -> &mut Vec<Self>;
}

impl MemoryTable for OwnershipRecord {
    type Staged = OwnerSourceRow;

    fn project(staged: &[OwnerSourceRow], batch: &BatchId) -> Result<Vec<Self>, ProjectionError> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for row in staged {
            let record = OwnershipRecord::project(row, batch)?;
            if seen.insert(record.clone()) {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn batch(&self) -> &BatchId {
        &self.file_index
    }

    fn rows(state: &mut MemoryState) -> &mut Vec<Self> {
        &mut state.owners
    }
}

impl MemoryTable for ParcelGeometry {
    type Staged = GeometryRecord;

    fn project(staged: &[GeometryRecord], batch: &BatchId) -> Result<Vec<Self>, ProjectionError> {
        Ok(staged
            .iter()
            .filter_map(|record| ParcelGeometry::project(record, batch))
            .collect())
    }

    fn validate(staged: &GeometryRecord) -> Result<(), ProjectionError> {
        validate_geometry(staged)
    }

    fn batch(&self) -> &BatchId {
        &self.file_index
    }

    fn rows(state: &mut MemoryState) -> &mut Vec<Self> {
        &mut state.parcels
    }
}

struct MemorySession<'a, T: MemoryTable> {
    store: &'a MemoryStore,
    batch: BatchId,
    staged: Option<Vec<T::Staged>>,
    tagged: bool,
    purge: bool,
    projected: Option<Vec<T>>,
}

impl<'a, T: MemoryTable> MemorySession<'a, T> {
    fn new(store: &'a MemoryStore, batch: &BatchId) -> Self {
        Self {
            store,
            batch: batch.clone(),
            staged: None,
            tagged: false,
            purge: false,
            projected: None,
        }
    }
}

#[async_trait]
impl<'a, T: MemoryTable> StagingSession<T::Staged> for MemorySession<'a, T> {
    async fn prepare(&mut self) -> Result<(), StoreError> {
        self.staged = Some(Vec::new());
        self.tagged = false;
        self.projected = None;
        Ok(())
    }

    async fn stage(&mut self, rows: &[T::Staged]) -> Result<u64, StoreError> {
        let staged = self
            .staged
            .as_mut()
            .ok_or(StoreError::Session("stage before prepare"))?;
        for row in rows {
            T::validate(row)?;
        }
        staged.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn tag_batch(&mut self) -> Result<u64, StoreError> {
        let staged = self
            .staged
            .as_ref()
            .ok_or(StoreError::Session("tag before prepare"))?;
        self.tagged = true;
        Ok(staged.len() as u64)
    }

    async fn purge(&mut self) -> Result<u64, StoreError> {
        self.purge = true;
        let mut state = self.store.state.lock().await;
        let existing = T::rows(&mut state)
            .iter()
            .filter(|row| row.batch() == &self.batch)
            .count();
        Ok(existing as u64)
    }

    async fn commit_raw(&mut self) -> Result<u64, StoreError> {
        if !self.tagged {
            return Err(StoreError::Session("commit before tagging"));
        }
        let staged = self
            .staged
            .take()
            .ok_or(StoreError::Session("commit before prepare"))?;
        let projected = T::project(&staged, &self.batch)?;
        let inserted = projected.len() as u64;
        self.projected = Some(projected);
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemorySession {
            store,
            batch,
            purge,
            projected,
            ..
        } = *self;
        let mut state = store.state.lock().await;
        let rows = T::rows(&mut state);
        if purge {
            rows.retain(|row| row.batch() != &batch);
        }
        rows.extend(projected.unwrap_or_default());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn batch_exists(&self, table: RawTable, batch: &BatchId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(match table {
            RawTable::Owners => state.owners.iter().any(|o| &o.file_index == batch),
            RawTable::Parcels => state.parcels.iter().any(|p| &p.file_index == batch),
        })
    }

    async fn owner_session(&self, batch: &BatchId) -> Result<OwnerSession<'_>, StoreError> {
        Ok(Box::new(MemorySession::<OwnershipRecord>::new(self, batch)))
    }

    async fn parcel_session(&self, batch: &BatchId) -> Result<ParcelSession<'_>, StoreError> {
        Ok(Box::new(MemorySession::<ParcelGeometry>::new(self, batch)))
    }

    async fn rebuild_analytics(&self) -> Result<RebuildCounts, StoreError> {
        let mut state = self.state.lock().await;
        let areas = parcel_areas(&state.parcels)?;
        let owner_summary = owner_daily_summaries(&state.owners, &areas);
        let land_type_summary = land_type_daily_summaries(&state.owners, &areas);
        let counts = RebuildCounts {
            owner_summary_rows: owner_summary.len() as u64,
            land_type_summary_rows: land_type_summary.len() as u64,
        };
        state.owner_summary = owner_summary;
        state.land_type_summary = land_type_summary;
        Ok(counts)
    }
}

/// Mirrors `ST_GeomFromText` rejecting unreadable geometry at staging time.
fn validate_geometry(record: &GeometryRecord) -> Result<(), ProjectionError> {
    geodesic_area_m2(&record.wkt)
        .map(|_| ())
        .map_err(|message| ProjectionError::Geometry {
            parcel_id: record.parcel_no.clone(),
            message,
        })
}
