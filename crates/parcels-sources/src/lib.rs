//! Readers for the two per-day source files: the ownership CSV and the parcel
//! geometry shapefile, laid out as `<data>/<YYYYMMDD>/...`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::StringRecord;
use geo::{CoordsIter, Geometry};
use parcels_core::{BatchId, GeometryRecord, OwnerSourceRow, ProjectionError, OWNER_COLUMNS};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shapefile::dbase::{FieldValue, Record};
use shapefile::Shape;
use thiserror::Error;
use tracing::{debug, warn};
use wkt::ToWkt;

pub const CRATE_NAME: &str = "parcels-sources";

pub const OWNER_FILE: &str = "Owner_Address.csv";
pub const PARCEL_DIR: &str = "Parcels";
pub const PARCEL_FILE: &str = "Parcels.shp";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reading {path}")]
    Shapefile {
        path: PathBuf,
        #[source]
        source: shapefile::Error,
    },
    #[error("invalid row in {path}")]
    Projection {
        path: PathBuf,
        #[source]
        source: ProjectionError,
    },
    #[error("attribute {0} is missing")]
    MissingField(&'static str),
    #[error("attribute {field} has unsupported type {found}")]
    FieldType { field: &'static str, found: String },
    #[error("converting shape: {0}")]
    Geometry(String),
}

/// A single pass over one source file, yielding rows for one raw table.
pub trait SourceReader: Send {
    type Row: Send + Sync;

    /// `None` once the file is exhausted.
    fn next_row(&mut self) -> Option<Result<Self::Row, SourceError>>;

    /// Records dropped by the reader without being an error.
    fn skipped(&self) -> usize {
        0
    }
}

/// Root of the per-day source directories.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn batch_dir(&self, batch: &BatchId) -> PathBuf {
        self.root.join(batch.as_str())
    }

    pub fn owner_path(&self, batch: &BatchId) -> PathBuf {
        self.batch_dir(batch).join(OWNER_FILE)
    }

    pub fn parcel_path(&self, batch: &BatchId) -> PathBuf {
        self.batch_dir(batch).join(PARCEL_DIR).join(PARCEL_FILE)
    }

    /// Batch directories present under the root, ascending. Hidden entries are
    /// ignored and names that are not `YYYYMMDD` dates are skipped with a warning.
    pub fn available_batches(&self) -> Result<Vec<BatchId>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut batches = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", self.root.display()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry
                .file_type()
                .with_context(|| format!("inspecting {}", entry.path().display()))?;
            if !file_type.is_dir() {
                continue;
            }
            match BatchId::parse(&name) {
                Some(batch) => batches.push(batch),
                None => warn!(directory = %name, "ignoring directory that is not a YYYYMMDD batch"),
            }
        }
        batches.sort();
        Ok(batches)
    }
}

/// Streams ownership rows one at a time; the header row is checked on open.
pub struct OwnershipReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    record: StringRecord,
}

impl OwnershipReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_path(&path)
            .map_err(|source| SourceError::Csv {
                path: path.clone(),
                source,
            })?;
        let found = reader
            .headers()
            .map_err(|source| SourceError::Csv {
                path: path.clone(),
                source,
            })?
            .len();
        if found != OWNER_COLUMNS.len() {
            return Err(SourceError::Projection {
                path,
                source: ProjectionError::ColumnCount {
                    expected: OWNER_COLUMNS.len(),
                    found,
                },
            });
        }
        debug!(path = %path.display(), "opened ownership source");
        Ok(Self {
            path,
            reader,
            record: StringRecord::new(),
        })
    }
}

impl SourceReader for OwnershipReader {
    type Row = OwnerSourceRow;

    fn next_row(&mut self) -> Option<Result<OwnerSourceRow, SourceError>> {
        match self.reader.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => {
                let fields = self.record.iter().map(ToString::to_string).collect();
                Some(
                    OwnerSourceRow::new(fields).map_err(|source| SourceError::Projection {
                        path: self.path.clone(),
                        source,
                    }),
                )
            }
            Err(source) => Some(Err(SourceError::Csv {
                path: self.path.clone(),
                source,
            })),
        }
    }
}

type ShapeEntry = std::result::Result<(Shape, Record), shapefile::Error>;

/// Parcel shapefile reader. The shapefile crate decodes the file up front;
/// conversion to [`GeometryRecord`] happens per row.
pub struct GeometryReader {
    path: PathBuf,
    entries: std::vec::IntoIter<ShapeEntry>,
    skipped: usize,
}

impl GeometryReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let mut reader =
            shapefile::Reader::from_path(&path).map_err(|source| SourceError::Shapefile {
                path: path.clone(),
                source,
            })?;
        let entries: Vec<ShapeEntry> = reader.iter_shapes_and_records().collect();
        debug!(path = %path.display(), shapes = entries.len(), "opened geometry source");
        Ok(Self {
            path,
            entries: entries.into_iter(),
            skipped: 0,
        })
    }
}

impl SourceReader for GeometryReader {
    type Row = GeometryRecord;

    fn next_row(&mut self) -> Option<Result<GeometryRecord, SourceError>> {
        loop {
            let (shape, record) = match self.entries.next()? {
                Ok(entry) => entry,
                Err(source) => {
                    return Some(Err(SourceError::Shapefile {
                        path: self.path.clone(),
                        source,
                    }))
                }
            };
            match geometry_record(shape, &record) {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => self.skipped += 1,
                Err(err) => return Some(Err(err)),
            }
        }
    }

    fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Converts one shape and its attributes. Null or coordinate-free shapes yield
/// `Ok(None)`.
pub fn geometry_record(shape: Shape, record: &Record) -> Result<Option<GeometryRecord>, SourceError> {
    if matches!(shape, Shape::NullShape) {
        return Ok(None);
    }
    let geometry = Geometry::<f64>::try_from(shape)
        .map_err(|err| SourceError::Geometry(err.to_string()))?;
    if geometry.coords_count() == 0 {
        return Ok(None);
    }
    Ok(Some(GeometryRecord {
        object_id: integer_field(record, "OBJECTID")?,
        parcel_no: text_field(record, "PARCEL_NO")?,
        shape_area: number_field(record, "SHAPEarea")?,
        shape_len: number_field(record, "SHAPElen")?,
        wkt: geometry.wkt_string(),
    }))
}

fn field<'a>(record: &'a Record, name: &'static str) -> Result<&'a FieldValue, SourceError> {
    record.get(name).ok_or(SourceError::MissingField(name))
}

fn unsupported(name: &'static str, value: &FieldValue) -> SourceError {
    SourceError::FieldType {
        field: name,
        found: format!("{value:?}"),
    }
}

fn integer_field(record: &Record, name: &'static str) -> Result<Option<i64>, SourceError> {
    match field(record, name)? {
        FieldValue::Integer(v) => Ok(Some(i64::from(*v))),
        FieldValue::Numeric(Some(v)) | FieldValue::Double(v) if v.fract() == 0.0 => {
            Ok(Some(*v as i64))
        }
        FieldValue::Numeric(None) => Ok(None),
        other => Err(unsupported(name, other)),
    }
}

fn number_field(record: &Record, name: &'static str) -> Result<Option<f64>, SourceError> {
    match field(record, name)? {
        FieldValue::Numeric(v) => Ok(*v),
        FieldValue::Float(v) => Ok(v.map(f64::from)),
        FieldValue::Double(v) | FieldValue::Currency(v) => Ok(Some(*v)),
        FieldValue::Integer(v) => Ok(Some(f64::from(*v))),
        other => Err(unsupported(name, other)),
    }
}

fn text_field(record: &Record, name: &'static str) -> Result<String, SourceError> {
    match field(record, name)? {
        FieldValue::Character(v) => Ok(v.as_deref().map(str::trim).unwrap_or_default().to_string()),
        FieldValue::Numeric(Some(v)) if v.fract() == 0.0 => Ok(format!("{}", *v as i64)),
        FieldValue::Numeric(None) => Ok(String::new()),
        FieldValue::Integer(v) => Ok(v.to_string()),
        other => Err(unsupported(name, other)),
    }
}

/// SHA-256 of a source file, recorded in run reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFingerprint {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

pub fn fingerprint(path: impl AsRef<Path>) -> Result<SourceFingerprint> {
    let path = path.as_ref();
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let bytes = std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hashing {}", path.display()))?;
    Ok(SourceFingerprint {
        path: path.display().to_string(),
        bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}
