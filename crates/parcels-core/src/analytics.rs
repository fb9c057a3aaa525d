//! Daily aggregate definitions shared by every store.
//!
//! Both summaries are pure functions of the raw tables: they are recomputed
//! from the full history on each rebuild, and day-over-day deltas compare a
//! key against its most recent earlier report date.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use geo::{GeodesicArea, Geometry};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use wkt::TryFromWkt;

use crate::{BatchId, OwnershipRecord, ParcelGeometry, ProjectionError};

pub const ACRES_PER_SQUARE_METER: f64 = 0.00024711;

pub const RESIDENTIAL_ACCOUNT_TYPES: [&str; 5] = [
    "APARTMENT",
    "MIXED USE",
    "RESIDENT LAND",
    "RESIDENTIAL",
    "RESIDENTIAL CONDO",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerDailySummary {
    pub report_date: NaiveDate,
    pub owner_name: Option<String>,
    pub total_real_property_owned: i64,
    pub total_building_property_owned: i64,
    pub total_real_property_land_area_owned_m2: Option<f64>,
    pub total_real_property_land_area_owned_acres: Option<f64>,
    pub total_residential_parcels_owned: i64,
    pub total_residential_land_area_owned_m2: f64,
    pub total_residential_land_area_owned_acres: f64,
    pub avg_real_property_investment_stake: Option<f64>,
    pub avg_building_property_investment_stake: f64,
    pub real_property_gain_loss: i64,
    pub pct_land_area_gain_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandTypeDailySummary {
    pub report_date: NaiveDate,
    pub account_type: Option<String>,
    pub total_parcels: i64,
    pub total_owners: i64,
    pub total_land_area_m2: f64,
    pub total_land_area_acres: f64,
    pub pct_of_total_land_area: Option<f64>,
    pub parcel_gain_loss: i64,
    pub pct_land_area_gain_loss: Option<f64>,
}

/// `1 - previous / current`, undefined without a non-zero value on both sides.
///
/// A key's first report date has no previous value and yields `None`, where a
/// zero-filled `COALESCE(LAG(..), 0)` comparison would report `1.0`.
pub fn fractional_delta(previous: Option<f64>, current: Option<f64>) -> Option<f64> {
    let previous = previous.filter(|v| *v != 0.0)?;
    let current = current.filter(|v| *v != 0.0)?;
    Some(1.0 - previous / current)
}

pub fn is_residential(account_type: Option<&str>) -> bool {
    account_type.is_some_and(|t| RESIDENTIAL_ACCOUNT_TYPES.contains(&t))
}

/// Geodesic area in square metres of a WKT polygon or multipolygon.
pub fn geodesic_area_m2(wkt: &str) -> Result<f64, String> {
    let geometry = Geometry::<f64>::try_from_wkt_str(wkt).map_err(|err| err.to_string())?;
    Ok(match &geometry {
        Geometry::Polygon(polygon) => polygon.geodesic_area_unsigned(),
        Geometry::MultiPolygon(polygons) => polygons.geodesic_area_unsigned(),
        _ => 0.0,
    })
}

/// Total recomputed area per (batch, parcel).
pub fn parcel_areas(
    parcels: &[ParcelGeometry],
) -> Result<HashMap<(BatchId, String), f64>, ProjectionError> {
    let mut areas: HashMap<(BatchId, String), f64> = HashMap::new();
    for parcel in parcels {
        let area = geodesic_area_m2(&parcel.geometry_wkt).map_err(|message| {
            ProjectionError::Geometry {
                parcel_id: parcel.parcel_id.clone(),
                message,
            }
        })?;
        *areas
            .entry((parcel.file_index.clone(), parcel.parcel_id.clone()))
            .or_default() += area;
    }
    Ok(areas)
}

#[derive(Default)]
struct OwnerAccumulator {
    real_parcels: BTreeSet<String>,
    building_parcels: BTreeSet<String>,
    residential_parcels: BTreeSet<String>,
    real_area_m2: Option<f64>,
    residential_area_m2: f64,
    real_stakes: Vec<f64>,
    building_stakes: Vec<f64>,
}

fn add_optional(total: &mut Option<f64>, value: Option<f64>) {
    if let Some(value) = value {
        *total = Some(total.unwrap_or(0.0) + value);
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

type OwnerKey<'a> = (
    Option<&'a str>,
    &'a str,
    bool,
    Option<Decimal>,
    Option<&'a str>,
    &'a BatchId,
);

pub fn owner_daily_summaries(
    owners: &[OwnershipRecord],
    areas: &HashMap<(BatchId, String), f64>,
) -> Vec<OwnerDailySummary> {
    let ownership: BTreeSet<OwnerKey<'_>> = owners
        .iter()
        .filter_map(|o| {
            Some((
                o.owner_name.as_deref(),
                o.parcel_id.as_deref()?,
                o.is_real_property,
                o.pct_own,
                o.account_type.as_deref(),
                &o.file_index,
            ))
        })
        .collect();

    let mut groups: BTreeMap<(Option<&str>, NaiveDate), OwnerAccumulator> = BTreeMap::new();
    for (owner_name, parcel_id, is_real, pct_own, account_type, batch) in ownership {
        let Some(area) = areas.get(&(batch.clone(), parcel_id.to_string())) else {
            continue;
        };
        let stake = pct_own.and_then(|p| p.to_f64());
        let acc = groups.entry((owner_name, batch.report_date())).or_default();
        if is_real {
            acc.real_parcels.insert(parcel_id.to_string());
            add_optional(&mut acc.real_area_m2, stake.map(|s| area * s));
            acc.real_stakes.extend(stake);
            if is_residential(account_type) {
                acc.residential_parcels.insert(parcel_id.to_string());
                acc.residential_area_m2 += stake.map(|s| area * s).unwrap_or(0.0);
            }
        } else {
            acc.building_parcels.insert(parcel_id.to_string());
            acc.building_stakes.extend(stake);
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    let mut previous: Option<(Option<&str>, i64, Option<f64>)> = None;
    for ((owner_name, report_date), acc) in groups {
        let real_count = acc.real_parcels.len() as i64;
        let (prior_count, prior_area) = match previous {
            Some((prev_owner, count, area)) if prev_owner == owner_name => (count, area),
            _ => (0, None),
        };
        out.push(OwnerDailySummary {
            report_date,
            owner_name: owner_name.map(ToString::to_string),
            total_real_property_owned: real_count,
            total_building_property_owned: acc.building_parcels.len() as i64,
            total_real_property_land_area_owned_m2: acc.real_area_m2,
            total_real_property_land_area_owned_acres: acc
                .real_area_m2
                .map(|a| a * ACRES_PER_SQUARE_METER),
            total_residential_parcels_owned: acc.residential_parcels.len() as i64,
            total_residential_land_area_owned_m2: acc.residential_area_m2,
            total_residential_land_area_owned_acres: acc.residential_area_m2
                * ACRES_PER_SQUARE_METER,
            avg_real_property_investment_stake: mean(&acc.real_stakes),
            avg_building_property_investment_stake: mean(&acc.building_stakes).unwrap_or(0.0),
            real_property_gain_loss: real_count - prior_count,
            pct_land_area_gain_loss: fractional_delta(prior_area, acc.real_area_m2),
        });
        previous = Some((owner_name, real_count, acc.real_area_m2));
    }
    out
}

#[derive(Default)]
struct LandTypeAccumulator<'a> {
    parcels: BTreeMap<&'a str, (BTreeSet<&'a str>, f64)>,
}

pub fn land_type_daily_summaries(
    owners: &[OwnershipRecord],
    areas: &HashMap<(BatchId, String), f64>,
) -> Vec<LandTypeDailySummary> {
    let mut groups: BTreeMap<(Option<&str>, NaiveDate), LandTypeAccumulator<'_>> =
        BTreeMap::new();
    for owner in owners.iter().filter(|o| o.is_real_property) {
        let Some(parcel_id) = owner.parcel_id.as_deref() else {
            continue;
        };
        let Some(area) = areas.get(&(owner.file_index.clone(), parcel_id.to_string())) else {
            continue;
        };
        let acc = groups
            .entry((
                owner.account_type.as_deref(),
                owner.file_index.report_date(),
            ))
            .or_default();
        let (owner_names, _) = acc
            .parcels
            .entry(parcel_id)
            .or_insert_with(|| (BTreeSet::new(), *area));
        if let Some(name) = owner.owner_name.as_deref() {
            owner_names.insert(name);
        }
    }

    let mut daily_totals: HashMap<NaiveDate, f64> = HashMap::new();
    for ((_, report_date), acc) in &groups {
        *daily_totals.entry(*report_date).or_default() +=
            acc.parcels.values().map(|(_, area)| area).sum::<f64>();
    }

    let mut out = Vec::with_capacity(groups.len());
    let mut previous: Option<(Option<&str>, i64, f64)> = None;
    for ((account_type, report_date), acc) in groups {
        let total_parcels = acc.parcels.len() as i64;
        let total_owners = acc
            .parcels
            .values()
            .map(|(names, _)| names.len() as i64)
            .sum();
        let area: f64 = acc.parcels.values().map(|(_, area)| area).sum();
        let day_total = daily_totals.get(&report_date).copied().unwrap_or(0.0);
        let (prior_parcels, prior_area) = match previous {
            Some((prev_type, parcels, area)) if prev_type == account_type => (parcels, Some(area)),
            _ => (0, None),
        };
        out.push(LandTypeDailySummary {
            report_date,
            account_type: account_type.map(ToString::to_string),
            total_parcels,
            total_owners,
            total_land_area_m2: area,
            total_land_area_acres: area * ACRES_PER_SQUARE_METER,
            pct_of_total_land_area: (day_total != 0.0).then(|| area / day_total),
            parcel_gain_loss: total_parcels - prior_parcels,
            pct_land_area_gain_loss: fractional_delta(prior_area, Some(area)),
        });
        previous = Some((account_type, total_parcels, area));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn batch(id: &str) -> BatchId {
        BatchId::parse(id).expect("batch")
    }

    fn owner(
        name: &str,
        parcel: &str,
        account: &str,
        stake: &str,
        account_type: &str,
        day: &str,
    ) -> OwnershipRecord {
        OwnershipRecord {
            account_id: Some(account.to_string()),
            parcel_id: Some(parcel.to_string()),
            lot: None,
            is_real_property: account.starts_with('R'),
            status_cd: None,
            address: String::new(),
            address_unit: None,
            city: None,
            owner_name: Some(name.to_string()),
            pct_own: Some(Decimal::from_str(stake).unwrap()),
            account_type: Some(account_type.to_string()),
            file_index: batch(day),
        }
    }

    fn uniform_areas(owners: &[OwnershipRecord], area: f64) -> HashMap<(BatchId, String), f64> {
        owners
            .iter()
            .map(|o| ((o.file_index.clone(), o.parcel_id.clone().unwrap()), area))
            .collect()
    }

    fn acme_history(first_day: usize, second_day: usize) -> Vec<OwnershipRecord> {
        let mut rows = Vec::new();
        for i in 0..first_day {
            rows.push(owner("Acme", &format!("P{i}"), &format!("R{i}"), "1", "COMMERCIAL", "20240101"));
        }
        for i in 0..second_day {
            rows.push(owner("Acme", &format!("P{i}"), &format!("R{i}"), "1", "COMMERCIAL", "20240102"));
        }
        rows
    }

    #[test]
    fn fractional_delta_needs_both_sides() {
        assert_eq!(fractional_delta(Some(50.0), Some(100.0)), Some(0.5));
        assert_eq!(fractional_delta(None, Some(100.0)), None);
        assert_eq!(fractional_delta(Some(0.0), Some(100.0)), None);
        assert_eq!(fractional_delta(Some(10.0), Some(0.0)), None);
        assert_eq!(fractional_delta(Some(10.0), None), None);
    }

    #[test]
    fn real_property_gain_loss_compares_previous_day() {
        let rows = acme_history(5, 8);
        let summaries = owner_daily_summaries(&rows, &uniform_areas(&rows, 100.0));
        assert_eq!(summaries.len(), 2);

        let first = &summaries[0];
        assert_eq!(first.report_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(first.total_real_property_owned, 5);
        assert_eq!(first.real_property_gain_loss, 5);
        assert_eq!(first.pct_land_area_gain_loss, None);

        let second = &summaries[1];
        assert_eq!(second.total_real_property_owned, 8);
        assert_eq!(second.real_property_gain_loss, 3);
        let delta = second.pct_land_area_gain_loss.unwrap();
        assert!((delta - (1.0 - 500.0 / 800.0)).abs() < 1e-9);
    }

    #[test]
    fn zero_prior_area_leaves_fractional_delta_null() {
        let rows = acme_history(5, 8);
        let mut areas = uniform_areas(&rows, 100.0);
        for ((day, _), area) in areas.iter_mut() {
            if day.as_str() == "20240101" {
                *area = 0.0;
            }
        }
        let summaries = owner_daily_summaries(&rows, &areas);
        assert_eq!(summaries[0].total_real_property_land_area_owned_m2, Some(0.0));
        assert_eq!(summaries[1].real_property_gain_loss, 3);
        assert_eq!(summaries[1].pct_land_area_gain_loss, None);
    }

    #[test]
    fn deltas_skip_over_missing_days_per_owner() {
        let mut rows = acme_history(2, 0);
        rows.push(owner("Acme", "P9", "R9", "1", "COMMERCIAL", "20240110"));
        rows.push(owner("Other", "Q1", "R100", "1", "COMMERCIAL", "20240105"));
        let summaries = owner_daily_summaries(&rows, &uniform_areas(&rows, 10.0));

        let acme_late = summaries
            .iter()
            .find(|s| s.owner_name.as_deref() == Some("Acme") && s.report_date.to_string() == "2024-01-10")
            .unwrap();
        assert_eq!(acme_late.real_property_gain_loss, -1);

        let other = summaries
            .iter()
            .find(|s| s.owner_name.as_deref() == Some("Other"))
            .unwrap();
        assert_eq!(other.real_property_gain_loss, 1);
    }

    #[test]
    fn owner_metrics_weight_area_by_stake() {
        let rows = vec![
            owner("Acme", "P1", "R1", "0.5", "RESIDENTIAL", "20240101"),
            owner("Acme", "P2", "R2", "1", "COMMERCIAL", "20240101"),
            owner("Acme", "P3", "B3", "0.25", "RESIDENTIAL", "20240101"),
            // duplicates collapse before aggregation
            owner("Acme", "P1", "R1", "0.5", "RESIDENTIAL", "20240101"),
        ];
        let summaries = owner_daily_summaries(&rows, &uniform_areas(&rows, 1000.0));
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.total_real_property_owned, 2);
        assert_eq!(s.total_building_property_owned, 1);
        assert_eq!(s.total_real_property_land_area_owned_m2, Some(1500.0));
        assert_eq!(s.total_residential_parcels_owned, 1);
        assert_eq!(s.total_residential_land_area_owned_m2, 500.0);
        assert!((s.total_residential_land_area_owned_acres - 500.0 * ACRES_PER_SQUARE_METER).abs() < 1e-12);
        assert_eq!(s.avg_real_property_investment_stake, Some(0.75));
        assert_eq!(s.avg_building_property_investment_stake, 0.25);
    }

    #[test]
    fn ownership_without_geometry_does_not_contribute() {
        let rows = vec![owner("Acme", "P1", "R1", "1", "RESIDENTIAL", "20240101")];
        assert!(owner_daily_summaries(&rows, &HashMap::new()).is_empty());
    }

    #[test]
    fn land_type_rollup_shares_daily_area() {
        let rows = vec![
            owner("Acme", "P1", "R1", "0.5", "RESIDENTIAL", "20240101"),
            owner("Beta", "P1", "R1", "0.5", "RESIDENTIAL", "20240101"),
            owner("Acme", "P2", "R2", "1", "COMMERCIAL", "20240101"),
            owner("Acme", "P3", "B3", "1", "COMMERCIAL", "20240101"),
            owner("Acme", "P1", "R1", "1", "RESIDENTIAL", "20240102"),
        ];
        let mut areas = uniform_areas(&rows, 100.0);
        areas.insert((batch("20240101"), "P2".into()), 300.0);

        let summaries = land_type_daily_summaries(&rows, &areas);
        let find = |ty: &str, day: &str| {
            summaries
                .iter()
                .find(|s| s.account_type.as_deref() == Some(ty) && s.report_date.format("%Y%m%d").to_string() == day)
                .unwrap()
        };

        let residential = find("RESIDENTIAL", "20240101");
        assert_eq!(residential.total_parcels, 1);
        assert_eq!(residential.total_owners, 2);
        assert_eq!(residential.total_land_area_m2, 100.0);
        assert_eq!(residential.pct_of_total_land_area, Some(0.25));

        let commercial = find("COMMERCIAL", "20240101");
        assert_eq!(commercial.total_parcels, 1);
        assert_eq!(commercial.pct_of_total_land_area, Some(0.75));

        let next_day = find("RESIDENTIAL", "20240102");
        assert_eq!(next_day.parcel_gain_loss, 0);
        assert_eq!(next_day.total_owners, 1);
        assert_eq!(next_day.pct_of_total_land_area, Some(1.0));
        assert_eq!(next_day.pct_land_area_gain_loss, Some(0.0));
    }

    #[test]
    fn geodesic_area_reads_wkt() {
        let small = "POLYGON((-105.28 40.01,-105.27 40.01,-105.27 40.02,-105.28 40.02,-105.28 40.01))";
        let area = geodesic_area_m2(small).unwrap();
        // roughly 850m x 1110m near Boulder
        assert!(area > 900_000.0 && area < 1_000_000.0, "area {area}");

        let multi = format!("MULTIPOLYGON((({})))", &small[9..small.len() - 2]);
        let multi_area = geodesic_area_m2(&multi).unwrap();
        assert!((multi_area - area).abs() < 1e-6);

        assert!(geodesic_area_m2("not wkt").is_err());
    }
}
