//! Turns a load policy into the ordered batches a run should process.

use chrono::NaiveDate;
use parcels_core::BatchId;
use parcels_sources::DataRoot;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Value of `--date` meaning "today's batch".
pub const CURRENT_DATE: &str = "current_date";
/// Value of `--date` meaning "every available batch".
pub const ALL_DATES: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    Latest,
    All,
    Today,
    Date(String),
}

impl LoadPolicy {
    /// `--latest` wins over `--date`.
    pub fn from_flags(latest: bool, date: &str) -> Self {
        if latest {
            return LoadPolicy::Latest;
        }
        match date {
            ALL_DATES => LoadPolicy::All,
            CURRENT_DATE => LoadPolicy::Today,
            other => LoadPolicy::Date(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid date {value:?}: expected a real calendar date as yyyy-mm-dd")]
    InvalidDate { value: String },
    #[error("enumerating batches: {0:#}")]
    DataDir(anyhow::Error),
}

pub fn resolve(
    policy: &LoadPolicy,
    root: &DataRoot,
    today: NaiveDate,
) -> Result<Vec<BatchId>, ResolveError> {
    match policy {
        LoadPolicy::Today => Ok(vec![BatchId::from_date(today)]),
        LoadPolicy::Date(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|date| vec![BatchId::from_date(date)])
            .map_err(|_| ResolveError::InvalidDate {
                value: value.clone(),
            }),
        LoadPolicy::All => available(root),
        LoadPolicy::Latest => {
            let batches = available(root)?;
            match batches.into_iter().max() {
                Some(latest) => Ok(vec![latest]),
                None => {
                    warn!(root = %root.root().display(), "no batch directories found for --latest");
                    Ok(Vec::new())
                }
            }
        }
    }
}

fn available(root: &DataRoot) -> Result<Vec<BatchId>, ResolveError> {
    if !root.root().is_dir() {
        warn!(root = %root.root().display(), "data directory does not exist");
        return Ok(Vec::new());
    }
    root.available_batches().map_err(ResolveError::DataDir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    fn data_root() -> (tempfile::TempDir, DataRoot) {
        let dir = tempfile::tempdir().unwrap();
        for name in ["20240101", "20240102", "20240115", ".hidden"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        let root = DataRoot::new(dir.path());
        (dir, root)
    }

    fn ids(batches: &[BatchId]) -> Vec<&str> {
        batches.iter().map(BatchId::as_str).collect()
    }

    #[test]
    fn latest_picks_maximal_batch() {
        let (_dir, root) = data_root();
        let batches = resolve(&LoadPolicy::Latest, &root, today()).unwrap();
        assert_eq!(ids(&batches), vec!["20240115"]);
    }

    #[test]
    fn all_returns_every_batch() {
        let (_dir, root) = data_root();
        let batches = resolve(&LoadPolicy::All, &root, today()).unwrap();
        assert_eq!(ids(&batches), vec!["20240101", "20240102", "20240115"]);
    }

    #[test]
    fn explicit_date_becomes_batch_id() {
        let (_dir, root) = data_root();
        let policy = LoadPolicy::Date("2024-01-02".to_string());
        let batches = resolve(&policy, &root, today()).unwrap();
        assert_eq!(ids(&batches), vec!["20240102"]);
    }

    #[test]
    fn impossible_calendar_date_is_rejected() {
        let (_dir, root) = data_root();
        for value in ["2024-02-30", "20240102", "yesterday"] {
            let err = resolve(&LoadPolicy::Date(value.to_string()), &root, today()).unwrap_err();
            assert!(matches!(err, ResolveError::InvalidDate { .. }), "{value}");
        }
    }

    #[test]
    fn today_ignores_directory_availability() {
        let (_dir, root) = data_root();
        let batches = resolve(&LoadPolicy::Today, &root, today()).unwrap();
        assert_eq!(ids(&batches), vec!["20240309"]);
    }

    #[test]
    fn latest_without_batches_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path().join("missing"));
        assert!(resolve(&LoadPolicy::Latest, &root, today()).unwrap().is_empty());
    }

    #[test]
    fn flags_map_to_policies() {
        assert_eq!(LoadPolicy::from_flags(true, "all"), LoadPolicy::Latest);
        assert_eq!(LoadPolicy::from_flags(false, "all"), LoadPolicy::All);
        assert_eq!(LoadPolicy::from_flags(false, CURRENT_DATE), LoadPolicy::Today);
        assert_eq!(
            LoadPolicy::from_flags(false, "2024-01-01"),
            LoadPolicy::Date("2024-01-01".to_string())
        );
    }
}
