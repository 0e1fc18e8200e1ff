use crate::acquisition::ChunkBatch;
use crate::models::{CanonicalRow, CanonicalSeries, Location, RawRecord};
use crate::variables::{ProviderVariable, Variable};
use tracing::debug;

const KELVIN_OFFSET: f64 = 273.15;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Convert one provider record to a canonical row stamped with `location`.
///
/// Every derived value depends only on this record's own fields. Absent
/// inputs leave the derived column unset.
pub fn normalize(record: &RawRecord, location: Location) -> CanonicalRow {
    let mut row = CanonicalRow::at(record.valid_time, location);

    let temperature = record
        .get(ProviderVariable::Temperature2m)
        .map(|k| k - KELVIN_OFFSET);
    let dew_point = record
        .get(ProviderVariable::Dewpoint2m)
        .map(|k| k - KELVIN_OFFSET);
    let cloud_cover = record.get(ProviderVariable::TotalCloudCover);
    let ghi = record
        .get(ProviderVariable::SolarRadiationDownwards)
        .map(|j| j / SECONDS_PER_HOUR);

    row.set(Variable::Temperature, temperature);
    row.set(Variable::DewPoint, dew_point);
    row.set(
        Variable::Pressure,
        record.get(ProviderVariable::SurfacePressure).map(|pa| pa / 100.0),
    );
    row.set(
        Variable::RelativeHumidity,
        temperature
            .zip(dew_point)
            .map(|(t, td)| relative_humidity(t, td)),
    );

    if let (Some(u), Some(v)) = (
        record.get(ProviderVariable::WindU10m),
        record.get(ProviderVariable::WindV10m),
    ) {
        row.set(Variable::WindSpeed, Some(u.hypot(v)));
        row.set(Variable::WindDirection, Some(wind_direction(u, v)));
    }

    if let Some(ghi) = ghi {
        let (dni, dhi) = split_irradiance(ghi, cloud_cover);
        row.set(Variable::Ghi, Some(ghi));
        row.set(Variable::Dni, Some(dni));
        row.set(Variable::Dhi, Some(dhi));
    }

    row.set(Variable::CloudCover, cloud_cover);
    row.set(
        Variable::Precipitation,
        record
            .get(ProviderVariable::TotalPrecipitation)
            .map(|m| m * 1000.0),
    );

    row
}

/// Saturation vapour pressure in hPa (Magnus).
fn saturation_vapor_pressure(t: f64) -> f64 {
    6.112 * (17.67 * t / (t + 243.5)).exp()
}

/// Relative humidity in percent from temperature and dew point in °C.
pub fn relative_humidity(temperature: f64, dew_point: f64) -> f64 {
    (saturation_vapor_pressure(dew_point) / saturation_vapor_pressure(temperature) * 100.0)
        .clamp(0.0, 100.0)
}

/// Meteorological direction in degrees, `[0, 360)`.
pub fn wind_direction(u: f64, v: f64) -> f64 {
    (u.atan2(v).to_degrees() + 360.0) % 360.0
}

/// Estimate (DNI, DHI) from GHI, scaled by cloud cover when known.
fn split_irradiance(ghi: f64, cloud_cover: Option<f64>) -> (f64, f64) {
    match cloud_cover {
        Some(tcc) => {
            let dni = ghi * (1.0 - tcc) * 0.8;
            (dni, ghi - dni * 0.8)
        }
        None => (ghi * 0.7, ghi * 0.3),
    }
}

/// Merge chunk batches into one time-ascending series without duplicate keys.
///
/// Batches are replayed in completion order; when two rows share a
/// timestamp the one from the later-completed chunk wins. The result does
/// not depend on the order `batches` is supplied in.
pub fn assemble(batches: &[ChunkBatch], location: Location) -> CanonicalSeries {
    let mut ordered: Vec<&ChunkBatch> = batches.iter().collect();
    ordered.sort_by_key(|b| (b.completion_seq, b.chunk_id));

    let mut rows: Vec<CanonicalRow> = ordered
        .iter()
        .flat_map(|b| b.records.iter())
        .map(|record| normalize(record, location))
        .collect();

    // Stable, so equal keys keep completion order
    rows.sort_by_key(CanonicalRow::key);

    let total = rows.len();
    let mut merged: Vec<CanonicalRow> = Vec::with_capacity(total);
    for row in rows {
        match merged.last_mut() {
            Some(last) if last.key() == row.key() => *last = row,
            _ => merged.push(row),
        }
    }

    if merged.len() < total {
        debug!(
            "Dropped {} duplicate timestamp row(s) while assembling {} batch(es)",
            total - merged.len(),
            batches.len()
        );
    }

    CanonicalSeries::new(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ChunkId;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::{BTreeMap, HashSet};

    fn loc() -> Location {
        Location {
            latitude: 40.7,
            longitude: -74.0,
        }
    }

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2010, 6, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn record(at: NaiveDateTime, t2m: f64) -> RawRecord {
        RawRecord {
            valid_time: at,
            values: BTreeMap::from([(ProviderVariable::Temperature2m, t2m)]),
        }
    }

    fn batch(id: usize, seq: u64, records: Vec<RawRecord>) -> ChunkBatch {
        ChunkBatch {
            chunk_id: ChunkId(id),
            completion_seq: seq,
            records,
        }
    }

    #[test]
    fn test_unit_conversions() {
        let raw = RawRecord {
            valid_time: ts(1, 12),
            values: BTreeMap::from([
                (ProviderVariable::Temperature2m, 293.15),
                (ProviderVariable::SurfacePressure, 101325.0),
                (ProviderVariable::SolarRadiationDownwards, 3_600_000.0),
                (ProviderVariable::TotalPrecipitation, 0.002),
            ]),
        };
        let row = normalize(&raw, loc());
        assert!((row.get(Variable::Temperature).unwrap() - 20.0).abs() < 1e-9);
        assert!((row.get(Variable::Pressure).unwrap() - 1013.25).abs() < 1e-9);
        assert!((row.get(Variable::Ghi).unwrap() - 1000.0).abs() < 1e-9);
        assert!((row.get(Variable::Dni).unwrap() - 700.0).abs() < 1e-9);
        assert!((row.get(Variable::Dhi).unwrap() - 300.0).abs() < 1e-9);
        assert!((row.get(Variable::Precipitation).unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(row.latitude, 40.7);
        assert_eq!(row.longitude, -74.0);
    }

    #[test]
    fn test_cloud_cover_splits_irradiance() {
        let (dni, dhi) = split_irradiance(500.0, Some(0.5));
        assert!((dni - 200.0).abs() < 1e-9);
        assert!((dhi - 340.0).abs() < 1e-9);
    }

    #[test]
    fn test_relative_humidity_magnus() {
        let rh = relative_humidity(20.0, 15.0);
        assert!(rh > 70.0 && rh < 76.0, "rh = {}", rh);
        assert!((relative_humidity(10.0, 10.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_wind_from_components() {
        let raw = RawRecord {
            valid_time: ts(1, 0),
            values: BTreeMap::from([
                (ProviderVariable::WindU10m, 3.0),
                (ProviderVariable::WindV10m, 4.0),
            ]),
        };
        let row = normalize(&raw, loc());
        assert!((row.get(Variable::WindSpeed).unwrap() - 5.0).abs() < 1e-9);
        assert!((wind_direction(1.0, 0.0) - 90.0).abs() < 1e-9);
        assert!((wind_direction(0.0, -1.0) - 180.0).abs() < 1e-9);
        assert!((wind_direction(-1.0, 0.0) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_wind_component_leaves_columns_unset() {
        let raw = RawRecord {
            valid_time: ts(1, 0),
            values: BTreeMap::from([(ProviderVariable::WindU10m, 3.0)]),
        };
        let row = normalize(&raw, loc());
        assert_eq!(row.get(Variable::WindSpeed), None);
        assert_eq!(row.get(Variable::WindDirection), None);
        assert_eq!(row.get(Variable::RelativeHumidity), None);
    }

    #[test]
    fn test_empty_input_gives_empty_series() {
        assert!(assemble(&[], loc()).is_empty());
    }

    #[test]
    fn test_rows_sorted_and_unique() {
        let a = batch(1, 0, vec![record(ts(2, 0), 280.0), record(ts(1, 5), 281.0)]);
        let b = batch(2, 1, vec![record(ts(1, 5), 290.0), record(ts(1, 0), 282.0)]);
        let series = assemble(&[a, b], loc());

        let keys: Vec<_> = series.rows.iter().map(CanonicalRow::key).collect();
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(keys.len(), unique.len());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn test_last_completed_chunk_wins() {
        let early = batch(2, 0, vec![record(ts(1, 5), 280.0)]);
        let late = batch(1, 1, vec![record(ts(1, 5), 290.0)]);
        let series = assemble(&[late.clone(), early.clone()], loc());
        let t = series.rows[0].get(Variable::Temperature).unwrap();
        assert!((t - (290.0 - KELVIN_OFFSET)).abs() < 1e-9);
    }

    #[test]
    fn test_supply_order_does_not_matter() {
        let batches = vec![
            batch(1, 2, vec![record(ts(1, 0), 280.0), record(ts(1, 1), 281.0)]),
            batch(2, 0, vec![record(ts(1, 1), 285.0), record(ts(1, 2), 286.0)]),
            batch(3, 1, vec![record(ts(1, 2), 287.0), record(ts(1, 3), 288.0)]),
        ];
        let forward = assemble(&batches, loc());
        let mut reversed = batches.clone();
        reversed.reverse();
        let backward = assemble(&reversed, loc());
        let mut rotated = batches.clone();
        rotated.rotate_left(1);

        assert_eq!(forward, backward);
        assert_eq!(forward, assemble(&rotated, loc()));
    }
}
