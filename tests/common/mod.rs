#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tmy_builder::fetcher::{DataSource, FetchError, FetchErrorKind};
use tmy_builder::models::{Location, RawRecord, TimeRange};
use tmy_builder::variables::ProviderVariable;
use tokio::time::Instant;

/// Deterministic upstream that generates plausible hourly records and can
/// be told to fail specific chunks.
#[derive(Default)]
pub struct SyntheticSource {
    calls: AtomicUsize,
    failures: Mutex<HashMap<NaiveDateTime, FetchErrorKind>>,
    call_log: Mutex<Vec<(NaiveDateTime, Instant)>>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request for the chunk starting at `start` fails with `kind`.
    pub fn fail_chunk_starting(&self, start: NaiveDateTime, kind: FetchErrorKind) {
        self.failures.lock().unwrap().insert(start, kind);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Instants at which the chunk starting at `start` was requested.
    pub fn call_times(&self, start: NaiveDateTime) -> Vec<Instant> {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == start)
            .map(|(_, at)| *at)
            .collect()
    }
}

pub fn synthetic_record(ts: NaiveDateTime, variables: &[ProviderVariable]) -> RawRecord {
    let year_offset = (ts.year() - 2010) as f64 * 0.7;
    let month = ts.month() as f64;
    let hour = ts.hour() as f64;
    let day = ts.day() as f64;

    let t2m = 273.15 + 5.0 + month * 1.5 + year_offset + (hour - 12.0).abs() * -0.3 + day * 0.01;
    let mut values = BTreeMap::new();
    for var in variables {
        let value = match var {
            ProviderVariable::Temperature2m => t2m,
            ProviderVariable::Dewpoint2m => t2m - 4.0 - (day % 3.0),
            ProviderVariable::SurfacePressure => 101_325.0 - hour * 10.0,
            ProviderVariable::WindU10m => 2.0 + (day % 5.0) * 0.3,
            ProviderVariable::WindV10m => -1.0 + year_offset,
            ProviderVariable::SolarRadiationDownwards => {
                if (6.0..18.0).contains(&hour) {
                    (hour - 5.0) * 100_000.0 + month * 1000.0
                } else {
                    0.0
                }
            }
            ProviderVariable::TotalCloudCover => 0.25 + (day % 4.0) * 0.1,
            ProviderVariable::TotalPrecipitation => 0.0001 * (day % 2.0),
        };
        values.insert(*var, value);
    }

    RawRecord {
        valid_time: ts,
        values,
    }
}

#[async_trait]
impl DataSource for SyntheticSource {
    async fn fetch(
        &self,
        _location: Location,
        range: TimeRange,
        variables: &[ProviderVariable],
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_log
            .lock()
            .unwrap()
            .push((range.start, Instant::now()));

        if let Some(kind) = self.failures.lock().unwrap().get(&range.start).copied() {
            return Err(FetchError::new(kind, format!("scripted failure for {}", range.start)));
        }

        let mut records = Vec::new();
        let mut ts = range.start;
        while ts < range.end {
            records.push(synthetic_record(ts, variables));
            ts += Duration::hours(1);
        }
        Ok(records)
    }
}
