use crate::variables::{ProviderVariable, Variable};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Half-open `[start, end)` span of hourly timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn hours(&self) -> i64 {
        (self.end - self.start).num_hours()
    }
}

/// One provider-native hourly record, values in provider units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub valid_time: NaiveDateTime,
    pub values: BTreeMap<ProviderVariable, f64>,
}

impl RawRecord {
    pub fn get(&self, var: ProviderVariable) -> Option<f64> {
        self.values.get(&var).copied()
    }
}

/// Timestamp key rows are unique on: `(year, month, day, hour, minute)`.
pub type RowKey = (i32, u32, u32, u32, u32);

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub values: BTreeMap<Variable, f64>,
}

impl CanonicalRow {
    pub fn at(timestamp: NaiveDateTime, location: Location) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
            day: timestamp.day(),
            hour: timestamp.hour(),
            minute: timestamp.minute(),
            latitude: location.latitude,
            longitude: location.longitude,
            values: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> RowKey {
        (self.year, self.month, self.day, self.hour, self.minute)
    }

    pub fn get(&self, var: Variable) -> Option<f64> {
        self.values.get(&var).copied()
    }

    pub fn set(&mut self, var: Variable, value: Option<f64>) {
        match value {
            Some(v) if v.is_finite() => {
                self.values.insert(var, v);
            }
            _ => {
                self.values.remove(&var);
            }
        }
    }
}

/// Time-ascending, duplicate-free hourly series for a single location.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalSeries {
    pub rows: Vec<CanonicalRow>,
}

impl CanonicalSeries {
    pub fn new(rows: Vec<CanonicalRow>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn years(&self) -> BTreeSet<i32> {
        self.rows.iter().map(|r| r.year).collect()
    }

    /// Canonical variables with at least one value in the series.
    pub fn variables_present(&self) -> BTreeSet<Variable> {
        self.rows
            .iter()
            .flat_map(|r| r.values.keys().copied())
            .collect()
    }

    pub fn month_rows(&self, year: i32, month: u32) -> impl Iterator<Item = &CanonicalRow> {
        self.rows
            .iter()
            .filter(move |r| r.year == year && r.month == month)
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (first, next) {
        (Some(a), Some(b)) => (b - a).num_days() as u32,
        _ => 0,
    }
}
