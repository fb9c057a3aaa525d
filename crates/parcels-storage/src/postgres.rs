//! PostgreSQL/PostGIS store.

use async_trait::async_trait;
use parcels_core::analytics::{ACRES_PER_SQUARE_METER, RESIDENTIAL_ACCOUNT_TYPES};
use parcels_core::{BatchId, GeometryRecord, OwnerSourceRow, RawTable, OWNER_COLUMNS};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

use crate::{
    OwnerSession, ParcelSession, RawStore, RebuildCounts, StagingSession, StoreError,
};

fn owner_insert_raw() -> String {
    format!(
        r#"
    INSERT INTO raw.owners
        (account_id, parcel_id, lot, is_real_property, status_cd, address,
         address_unit, city, owner_name, pct_own, account_type, file_index)
    SELECT DISTINCT
        strap AS account_id,
        folio AS parcel_id,
        lot,
        COALESCE(strap LIKE 'R%', false) AS is_real_property,
        status_cd,
        COALESCE(street_num, '') || ' ' ||
            CASE WHEN street_prefix IS NULL THEN '' ELSE street_prefix || ' ' END ||
            COALESCE(street, '') || ' ' || COALESCE(street_suffix, '') AS address,
        street_unit AS address_unit,
        city,
        owner_name,
        pct_own::decimal(10,3),
        account_type,
        file_index
      FROM {staging}
"#,
        staging = RawTable::Owners.staging_name()
    )
}

fn parcel_create_staging() -> String {
    format!(
        r#"
    CREATE TABLE {staging} (
        object_id varchar,
        parcel_no varchar,
        shape_area varchar,
        shape_len varchar,
        geom geometry,
        file_index varchar
    )
"#,
        staging = RawTable::Parcels.staging_name()
    )
}

fn parcel_stage() -> String {
    format!(
        r#"
    INSERT INTO {staging} (object_id, parcel_no, shape_area, shape_len, geom, file_index)
    SELECT t.object_id, t.parcel_no, t.shape_area, t.shape_len, ST_GeomFromText(t.wkt, 4326), $6
      FROM UNNEST($1::varchar[], $2::varchar[], $3::varchar[], $4::varchar[], $5::text[])
        AS t(object_id, parcel_no, shape_area, shape_len, wkt)
"#,
        staging = RawTable::Parcels.staging_name()
    )
}

fn parcel_insert_raw() -> String {
    format!(
        r#"
    INSERT INTO raw.parcels (object_id, parcel_id, shape_area, shape_len, geom, file_index)
    SELECT
        object_id::bigint,
        parcel_no AS parcel_id,
        shape_area::double precision,
        shape_len::double precision,
        geom,
        file_index
      FROM {staging}
     WHERE parcel_no <> ''
"#,
        staging = RawTable::Parcels.staging_name()
    )
}

const OWNER_SUMMARY_REBUILD: &str = r#"
    INSERT INTO analytics.owner_daily_summary
        (report_date, owner_name, total_real_property_owned, total_building_property_owned,
         total_real_property_land_area_owned_m2, total_real_property_land_area_owned_acres,
         total_residential_parcels_owned, total_residential_land_area_owned_m2,
         total_residential_land_area_owned_acres, avg_real_property_investment_stake,
         avg_building_property_investment_stake, real_property_gain_loss, pct_land_area_gain_loss)
    WITH ownership AS (
        SELECT DISTINCT owner_name, parcel_id, is_real_property, pct_own, account_type, file_index
          FROM raw.owners
    ),
    parcels AS (
        SELECT parcel_id, file_index, SUM(ST_Area(geom::geography, true)) AS area_m2
          FROM raw.parcels
         GROUP BY 1, 2
    ),
    daily_summary AS (
        SELECT
            to_date(o.file_index, 'YYYYMMDD') AS report_date,
            o.owner_name,
            COUNT(DISTINCT CASE WHEN o.is_real_property THEN o.parcel_id END) AS real_owned,
            COUNT(DISTINCT CASE WHEN NOT o.is_real_property THEN o.parcel_id END) AS building_owned,
            SUM(CASE WHEN o.is_real_property THEN p.area_m2 * o.pct_own END) AS real_m2,
            SUM(CASE WHEN o.is_real_property THEN p.area_m2 * o.pct_own * $2::double precision END) AS real_acres,
            COUNT(DISTINCT CASE WHEN o.is_real_property AND o.account_type = ANY($1::text[])
                THEN o.parcel_id END) AS residential_owned,
            COALESCE(SUM(CASE WHEN o.is_real_property AND o.account_type = ANY($1::text[])
                THEN p.area_m2 * o.pct_own END), 0) AS residential_m2,
            COALESCE(SUM(CASE WHEN o.is_real_property AND o.account_type = ANY($1::text[])
                THEN p.area_m2 * o.pct_own * $2::double precision END), 0) AS residential_acres,
            AVG(CASE WHEN o.is_real_property THEN o.pct_own END) AS avg_real_stake,
            COALESCE(AVG(CASE WHEN NOT o.is_real_property THEN o.pct_own END), 0) AS avg_building_stake
          FROM ownership o
          JOIN parcels p ON p.parcel_id = o.parcel_id AND p.file_index = o.file_index
         GROUP BY 1, 2
    )
    SELECT
        report_date, owner_name, real_owned, building_owned, real_m2, real_acres,
        residential_owned, residential_m2, residential_acres, avg_real_stake, avg_building_stake,
        real_owned - COALESCE(LAG(real_owned) OVER w, 0),
        CASE WHEN COALESCE(LAG(real_m2) OVER w, 0) = 0 OR COALESCE(real_m2, 0) = 0 THEN NULL
             ELSE 1 - LAG(real_m2) OVER w / real_m2 END
      FROM daily_summary
    WINDOW w AS (PARTITION BY owner_name ORDER BY report_date)
"#;

const LAND_TYPE_SUMMARY_REBUILD: &str = r#"
    INSERT INTO analytics.land_type_daily_summary
        (report_date, account_type, total_parcels, total_owners, total_land_area_m2,
         total_land_area_acres, pct_of_total_land_area, parcel_gain_loss, pct_land_area_gain_loss)
    WITH ownership AS (
        SELECT DISTINCT owner_name, parcel_id, account_type, file_index
          FROM raw.owners
         WHERE is_real_property
    ),
    parcels AS (
        SELECT parcel_id, file_index, SUM(ST_Area(geom::geography, true)) AS area_m2
          FROM raw.parcels
         GROUP BY 1, 2
    ),
    parcel_types AS (
        SELECT o.file_index, o.account_type, o.parcel_id,
               COUNT(DISTINCT o.owner_name) AS owner_count,
               MAX(p.area_m2) AS area_m2
          FROM ownership o
          JOIN parcels p ON p.parcel_id = o.parcel_id AND p.file_index = o.file_index
         GROUP BY 1, 2, 3
    ),
    daily_summary AS (
        SELECT to_date(file_index, 'YYYYMMDD') AS report_date,
               account_type,
               COUNT(*) AS total_parcels,
               SUM(owner_count) AS total_owners,
               SUM(area_m2) AS land_m2
          FROM parcel_types
         GROUP BY 1, 2
    )
    SELECT
        report_date, account_type, total_parcels, total_owners, land_m2,
        land_m2 * $1::double precision,
        land_m2 / NULLIF(SUM(land_m2) OVER (PARTITION BY report_date), 0),
        total_parcels - COALESCE(LAG(total_parcels) OVER w, 0),
        CASE WHEN COALESCE(LAG(land_m2) OVER w, 0) = 0 OR COALESCE(land_m2, 0) = 0 THEN NULL
             ELSE 1 - LAG(land_m2) OVER w / land_m2 END
      FROM daily_summary
    WINDOW w AS (PARTITION BY account_type ORDER BY report_date)
"#;

fn owner_create_staging() -> String {
    let columns = OWNER_COLUMNS
        .iter()
        .map(|c| format!("{c} varchar"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE {} ({columns}, file_index varchar)",
        RawTable::Owners.staging_name()
    )
}

fn owner_copy_statement() -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, NULL '')",
        RawTable::Owners.staging_name(),
        OWNER_COLUMNS.join(", ")
    )
}

fn drop_staging(table: RawTable, if_exists: bool) -> String {
    let guard = if if_exists { "IF EXISTS " } else { "" };
    format!("DROP TABLE {guard}{}", table.staging_name())
}

/// Renders ownership rows as headerless CSV for `COPY ... FROM STDIN`.
fn encode_copy_chunk(rows: &[OwnerSourceRow]) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer
            .write_record(row.fields())
            .map_err(|err| StoreError::Encode(err.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|err| StoreError::Encode(err.to_string()))
}

#[derive(Debug, Clone)]
pub struct PgRawStore {
    pool: PgPool,
}

impl PgRawStore {
    /// Connects with a single pooled connection; batches load sequentially.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await?;
        info!(%version, "connected to database");
        Ok(Self { pool })
    }

}

#[async_trait]
impl RawStore for PgRawStore {
    async fn batch_exists(&self, table: RawTable, batch: &BatchId) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE file_index = $1)",
            table.qualified_name()
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(batch.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn owner_session(&self, batch: &BatchId) -> Result<OwnerSession<'_>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgOwnerSession {
            tx,
            batch: batch.clone(),
        }))
    }

    async fn parcel_session(&self, batch: &BatchId) -> Result<ParcelSession<'_>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgParcelSession {
            tx,
            batch: batch.clone(),
            staged: 0,
        }))
    }

    async fn rebuild_analytics(&self) -> Result<RebuildCounts, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("TRUNCATE TABLE analytics.owner_daily_summary")
            .execute(&mut *tx)
            .await?;
        let owner_summary_rows = sqlx::query(OWNER_SUMMARY_REBUILD)
            .bind(RESIDENTIAL_ACCOUNT_TYPES.to_vec())
            .bind(ACRES_PER_SQUARE_METER)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("TRUNCATE TABLE analytics.land_type_daily_summary")
            .execute(&mut *tx)
            .await?;
        let land_type_summary_rows = sqlx::query(LAND_TYPE_SUMMARY_REBUILD)
            .bind(ACRES_PER_SQUARE_METER)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(RebuildCounts {
            owner_summary_rows,
            land_type_summary_rows,
        })
    }
}

struct PgOwnerSession {
    tx: Transaction<'static, Postgres>,
    batch: BatchId,
}

#[async_trait]
impl StagingSession<OwnerSourceRow> for PgOwnerSession {
    async fn prepare(&mut self) -> Result<(), StoreError> {
        sqlx::query(&drop_staging(RawTable::Owners, true))
            .execute(&mut *self.tx)
            .await?;
        sqlx::query(&owner_create_staging())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn stage(&mut self, rows: &[OwnerSourceRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let chunk = encode_copy_chunk(rows)?;
        let mut copy = self.tx.copy_in_raw(&owner_copy_statement()).await?;
        copy.send(chunk).await?;
        let copied = copy.finish().await?;
        debug!(batch = %self.batch, copied, "copied ownership chunk");
        Ok(copied)
    }

    async fn tag_batch(&mut self) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {} SET file_index = $1",
            RawTable::Owners.staging_name()
        );
        let tagged = sqlx::query(&sql)
            .bind(self.batch.as_str())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(tagged)
    }

    async fn purge(&mut self) -> Result<u64, StoreError> {
        let purged = sqlx::query("DELETE FROM raw.owners WHERE file_index = $1")
            .bind(self.batch.as_str())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(purged)
    }

    async fn commit_raw(&mut self) -> Result<u64, StoreError> {
        let inserted = sqlx::query(&owner_insert_raw())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        sqlx::query(&drop_staging(RawTable::Owners, false))
            .execute(&mut *self.tx)
            .await?;
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

struct PgParcelSession {
    tx: Transaction<'static, Postgres>,
    batch: BatchId,
    staged: u64,
}

#[async_trait]
impl StagingSession<GeometryRecord> for PgParcelSession {
    async fn prepare(&mut self) -> Result<(), StoreError> {
        sqlx::query(&drop_staging(RawTable::Parcels, true))
            .execute(&mut *self.tx)
            .await?;
        sqlx::query(&parcel_create_staging())
            .execute(&mut *self.tx)
            .await?;
        self.staged = 0;
        Ok(())
    }

    async fn stage(&mut self, rows: &[GeometryRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let object_ids: Vec<Option<String>> = rows
            .iter()
            .map(|r| r.object_id.map(|id| id.to_string()))
            .collect();
        let parcel_nos: Vec<String> = rows.iter().map(|r| r.parcel_no.clone()).collect();
        let areas: Vec<Option<String>> = rows
            .iter()
            .map(|r| r.shape_area.map(|v| v.to_string()))
            .collect();
        let lengths: Vec<Option<String>> = rows
            .iter()
            .map(|r| r.shape_len.map(|v| v.to_string()))
            .collect();
        let wkts: Vec<String> = rows.iter().map(|r| r.wkt.clone()).collect();

        let inserted = sqlx::query(&parcel_stage())
            .bind(object_ids)
            .bind(parcel_nos)
            .bind(areas)
            .bind(lengths)
            .bind(wkts)
            .bind(self.batch.as_str())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        self.staged += inserted;
        Ok(inserted)
    }

    async fn tag_batch(&mut self) -> Result<u64, StoreError> {
        // file_index is bound at insert time
        Ok(self.staged)
    }

    async fn purge(&mut self) -> Result<u64, StoreError> {
        let purged = sqlx::query("DELETE FROM raw.parcels WHERE file_index = $1")
            .bind(self.batch.as_str())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(purged)
    }

    async fn commit_raw(&mut self) -> Result<u64, StoreError> {
        let inserted = sqlx::query(&parcel_insert_raw())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        sqlx::query(&drop_staging(RawTable::Parcels, false))
            .execute(&mut *self.tx)
            .await?;
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
