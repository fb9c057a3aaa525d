//! Core domain model for daily parcel batches: batch identifiers, source rows,
//! raw records and the staged-to-raw projection rules.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Serialize, Serializer};
use thiserror::Error;

pub mod analytics;

pub const CRATE_NAME: &str = "parcels-core";

/// Columns of the ownership CSV, in file order.
pub const OWNER_COLUMNS: [&str; 34] = [
    "created_date",
    "strap",
    "folio",
    "status_cd",
    "building_num",
    "street_num",
    "street",
    "street_prefix",
    "street_suffix",
    "street_unit",
    "city",
    "sub_code",
    "sub_description",
    "section",
    "township",
    "range",
    "block",
    "lot",
    "owner_name",
    "mail_to",
    "mailing_addr1",
    "mailing_addr2",
    "mailing_city",
    "mailing_state",
    "mailing_zip",
    "mailing_country",
    "role_cd",
    "pct_own",
    "tax_area",
    "nh",
    "mill_levy",
    "legal_dscr",
    "water_fee",
    "account_type",
];

/// Largest magnitude representable as `decimal(10,3)`.
const STAKE_LIMIT: i64 = 10_000_000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("ownership row has {found} columns, expected {expected}")]
    ColumnCount { expected: usize, found: usize },
    #[error("ownership stake {value:?} is not numeric")]
    InvalidStake { value: String },
    #[error("ownership stake {value:?} does not fit decimal(10,3)")]
    StakeOutOfRange { value: String },
    #[error("geometry for parcel {parcel_id}: {message}")]
    Geometry { parcel_id: String, message: String },
}

/// One day's data drop, identified as `YYYYMMDD`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId {
    id: String,
    date: NaiveDate,
}

impl BatchId {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            id: date.format("%Y%m%d").to_string(),
            date,
        }
    }

    /// Accepts exactly eight digits naming a real calendar date.
    pub fn parse(value: &str) -> Option<Self> {
        if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        Some(Self {
            id: value.to_string(),
            date,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn report_date(&self) -> NaiveDate {
        self.date
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl Serialize for BatchId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id)
    }
}

/// Raw tables partitioned by batch identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawTable {
    Owners,
    Parcels,
}

impl RawTable {
    pub fn qualified_name(self) -> &'static str {
        match self {
            RawTable::Owners => "raw.owners",
            RawTable::Parcels => "raw.parcels",
        }
    }

    pub fn staging_name(self) -> &'static str {
        match self {
            RawTable::Owners => "raw.temp_owners",
            RawTable::Parcels => "raw.temp_parcels",
        }
    }
}

impl fmt::Display for RawTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qualified_name())
    }
}

/// Untyped ownership row, aligned with [`OWNER_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerSourceRow {
    fields: Vec<String>,
}

impl OwnerSourceRow {
    pub fn new(fields: Vec<String>) -> Result<Self, ProjectionError> {
        if fields.len() != OWNER_COLUMNS.len() {
            return Err(ProjectionError::ColumnCount {
                expected: OWNER_COLUMNS.len(),
                found: fields.len(),
            });
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Named field lookup; empty strings read as absent, like `NULL AS ''`.
    pub fn field(&self, column: &str) -> Option<&str> {
        let index = OWNER_COLUMNS.iter().position(|c| *c == column)?;
        self.fields
            .get(index)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Typed geometry record decoded from the parcel shapefile.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryRecord {
    /// Null in the attribute table stays null in `raw.parcels`.
    pub object_id: Option<i64>,
    pub parcel_no: String,
    /// Declared area and perimeter; informational only.
    pub shape_area: Option<f64>,
    pub shape_len: Option<f64>,
    /// Well-known text, SRID 4326.
    pub wkt: String,
}

/// Typed row of `raw.owners`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OwnershipRecord {
    pub account_id: Option<String>,
    pub parcel_id: Option<String>,
    pub lot: Option<String>,
    pub is_real_property: bool,
    pub status_cd: Option<String>,
    pub address: String,
    pub address_unit: Option<String>,
    pub city: Option<String>,
    pub owner_name: Option<String>,
    pub pct_own: Option<Decimal>,
    pub account_type: Option<String>,
    pub file_index: BatchId,
}

impl OwnershipRecord {
    pub fn project(row: &OwnerSourceRow, batch: &BatchId) -> Result<Self, ProjectionError> {
        let owned = |column: &str| row.field(column).map(ToString::to_string);
        Ok(Self {
            account_id: owned("strap"),
            parcel_id: owned("folio"),
            lot: owned("lot"),
            is_real_property: is_real_property(row.field("strap")),
            status_cd: owned("status_cd"),
            address: compose_address(
                row.field("street_num"),
                row.field("street_prefix"),
                row.field("street"),
                row.field("street_suffix"),
            ),
            address_unit: owned("street_unit"),
            city: owned("city"),
            owner_name: owned("owner_name"),
            pct_own: parse_stake(row.field("pct_own"))?,
            account_type: owned("account_type"),
            file_index: batch.clone(),
        })
    }
}

/// Typed row of `raw.parcels`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParcelGeometry {
    pub object_id: Option<i64>,
    pub parcel_id: String,
    pub shape_area: Option<f64>,
    pub shape_len: Option<f64>,
    pub geometry_wkt: String,
    pub file_index: BatchId,
}

impl ParcelGeometry {
    /// `None` for records without a parcel identifier.
    pub fn project(record: &GeometryRecord, batch: &BatchId) -> Option<Self> {
        if record.parcel_no.is_empty() {
            return None;
        }
        Some(Self {
            object_id: record.object_id,
            parcel_id: record.parcel_no.clone(),
            shape_area: record.shape_area,
            shape_len: record.shape_len,
            geometry_wkt: record.wkt.clone(),
            file_index: batch.clone(),
        })
    }
}

/// Real-property accounts carry an `R` prefix; everything else is an improvement.
pub fn is_real_property(account_id: Option<&str>) -> bool {
    account_id.is_some_and(|id| id.starts_with('R'))
}

pub fn compose_address(
    street_num: Option<&str>,
    street_prefix: Option<&str>,
    street: Option<&str>,
    street_suffix: Option<&str>,
) -> String {
    let prefix = street_prefix
        .map(|p| format!("{p} "))
        .unwrap_or_default();
    format!(
        "{} {}{} {}",
        street_num.unwrap_or_default(),
        prefix,
        street.unwrap_or_default(),
        street_suffix.unwrap_or_default()
    )
}

/// Coerces a raw stake to `decimal(10,3)`, rounding half away from zero.
pub fn parse_stake(raw: Option<&str>) -> Result<Option<Decimal>, ProjectionError> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let parsed = if raw.contains(['e', 'E']) {
        Decimal::from_scientific(raw)
    } else {
        Decimal::from_str(raw)
    };
    let value = parsed.map_err(|_| ProjectionError::InvalidStake {
        value: raw.to_string(),
    })?;

    let mut rounded = value.round_dp_with_strategy(3, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(3);
    if rounded.abs() >= Decimal::from(STAKE_LIMIT) {
        return Err(ProjectionError::StakeOutOfRange {
            value: raw.to_string(),
        });
    }
    Ok(Some(rounded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_row(pairs: &[(&str, &str)]) -> OwnerSourceRow {
        let mut fields = vec![String::new(); OWNER_COLUMNS.len()];
        for (column, value) in pairs {
            let index = OWNER_COLUMNS
                .iter()
                .position(|c| c == column)
                .expect("known column");
            fields[index] = value.to_string();
        }
        OwnerSourceRow::new(fields).expect("aligned row")
    }

    fn batch() -> BatchId {
        BatchId::parse("20240101").expect("batch")
    }

    #[test]
    fn batch_ids_require_real_calendar_dates() {
        assert!(BatchId::parse("20240229").is_some());
        assert!(BatchId::parse("20230229").is_none());
        assert!(BatchId::parse("2024010").is_none());
        assert!(BatchId::parse("2024-01-01").is_none());

        let from_date = BatchId::from_date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(from_date.as_str(), "20240105");
        assert_eq!(from_date, BatchId::parse("20240105").unwrap());
    }

    #[test]
    fn batch_ids_sort_chronologically() {
        let mut ids = vec![
            BatchId::parse("20240115").unwrap(),
            BatchId::parse("20231231").unwrap(),
            BatchId::parse("20240102").unwrap(),
        ];
        ids.sort();
        let ordered: Vec<_> = ids.iter().map(BatchId::as_str).collect();
        assert_eq!(ordered, ["20231231", "20240102", "20240115"]);
    }

    #[test]
    fn real_property_follows_account_prefix() {
        assert!(is_real_property(Some("R123456")));
        assert!(!is_real_property(Some("B123456")));
        assert!(!is_real_property(Some("r123456")));
        assert!(!is_real_property(None));
    }

    #[test]
    fn address_skips_missing_prefix() {
        assert_eq!(
            compose_address(Some("1200"), Some("N"), Some("BROADWAY"), Some("ST")),
            "1200 N BROADWAY ST"
        );
        assert_eq!(
            compose_address(Some("1200"), None, Some("BROADWAY"), None),
            "1200 BROADWAY "
        );
    }

    #[test]
    fn stake_coercion_rounds_and_rejects_garbage() {
        assert_eq!(parse_stake(None).unwrap(), None);
        assert_eq!(parse_stake(Some("  ")).unwrap(), None);
        assert_eq!(
            parse_stake(Some("0.5")).unwrap(),
            Some(Decimal::from_str("0.500").unwrap())
        );
        assert_eq!(
            parse_stake(Some("0.3335")).unwrap(),
            Some(Decimal::from_str("0.334").unwrap())
        );
        assert_eq!(
            parse_stake(Some("5e-1")).unwrap(),
            Some(Decimal::from_str("0.5").unwrap())
        );
        assert!(matches!(
            parse_stake(Some("half")),
            Err(ProjectionError::InvalidStake { .. })
        ));
        assert!(matches!(
            parse_stake(Some("10000000")),
            Err(ProjectionError::StakeOutOfRange { .. })
        ));
    }

    #[test]
    fn ownership_projection_types_the_row() {
        let row = owner_row(&[
            ("strap", "R0001"),
            ("folio", "146317000001"),
            ("street_num", "10"),
            ("street", "PEARL"),
            ("street_suffix", "ST"),
            ("owner_name", "ACME LLC"),
            ("pct_own", "1"),
            ("account_type", "RESIDENTIAL"),
        ]);
        let record = OwnershipRecord::project(&row, &batch()).unwrap();
        assert!(record.is_real_property);
        assert_eq!(record.parcel_id.as_deref(), Some("146317000001"));
        assert_eq!(record.address, "10 PEARL ST");
        assert_eq!(record.pct_own, Some(Decimal::from_str("1.000").unwrap()));
        assert_eq!(record.file_index, batch());
        assert_eq!(record.lot, None);
    }

    #[test]
    fn ownership_projection_fails_on_non_numeric_stake() {
        let row = owner_row(&[("strap", "R0001"), ("pct_own", "n/a")]);
        assert!(OwnershipRecord::project(&row, &batch()).is_err());
    }

    #[test]
    fn misaligned_rows_are_rejected() {
        let err = OwnerSourceRow::new(vec!["x".into(); 33]).unwrap_err();
        assert_eq!(
            err,
            ProjectionError::ColumnCount {
                expected: 34,
                found: 33
            }
        );
    }

    #[test]
    fn parcels_without_identifier_are_dropped() {
        let mut record = GeometryRecord {
            object_id: None,
            parcel_no: String::new(),
            shape_area: Some(10.0),
            shape_len: None,
            wkt: "POLYGON((0 0,0 1,1 1,0 0))".into(),
        };
        assert!(ParcelGeometry::project(&record, &batch()).is_none());

        record.parcel_no = "146317000001".into();
        let parcel = ParcelGeometry::project(&record, &batch()).unwrap();
        assert_eq!(parcel.parcel_id, "146317000001");
        assert_eq!(parcel.object_id, None);
        assert_eq!(parcel.file_index, batch());
    }
}
