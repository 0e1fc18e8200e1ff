use crate::acquisition::ChunkBatch;
use crate::error::{AppError, Result};
use crate::models::{CanonicalRow, CanonicalSeries, Location};
use crate::plan::ChunkId;
use crate::variables::Variable;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const KEY_COLUMNS: [&str; 7] = [
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "latitude",
    "longitude",
];

/// Reanalysis irradiance is accumulated over the hour ending at the stamp.
pub const IRRADIANCE_TIME_OFFSET_HOURS: f64 = 0.5;

/// Directory layout of a TMY project.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    /// Create the project directory tree if missing.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let layout = Self {
            root: root.as_ref().to_path_buf(),
        };
        for dir in [
            layout.timeseries_dir(),
            layout.tmy_dir(),
            layout.plots_dir(),
            layout.chunks_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        debug!("Project layout ready at {}", layout.root.display());
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timeseries_dir(&self) -> PathBuf {
        self.root.join("timeseries")
    }

    pub fn tmy_dir(&self) -> PathBuf {
        self.root.join("tmy")
    }

    pub fn plots_dir(&self) -> PathBuf {
        self.root.join("plots")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("project.log")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn timeseries_path(&self, start: NaiveDate, end: NaiveDate, location: Location) -> PathBuf {
        self.timeseries_dir().join(format!(
            "timeseries_{}_{}_{:.2}_{:.2}.csv",
            start, end, location.latitude, location.longitude
        ))
    }

    pub fn tmy_path(&self, first_year: i32, last_year: i32, location: Location) -> PathBuf {
        self.tmy_dir().join(format!(
            "tmy_{}-{}_{:.2}_{:.2}.csv",
            first_year, last_year, location.latitude, location.longitude
        ))
    }
}

fn series_header() -> Vec<&'static str> {
    KEY_COLUMNS
        .iter()
        .copied()
        .chain(Variable::ALL.iter().map(Variable::column))
        .collect()
}

fn row_record(row: &CanonicalRow) -> Vec<String> {
    let mut record = vec![
        row.year.to_string(),
        row.month.to_string(),
        row.day.to_string(),
        row.hour.to_string(),
        row.minute.to_string(),
        row.latitude.to_string(),
        row.longitude.to_string(),
    ];
    record.extend(
        Variable::ALL
            .iter()
            .map(|v| row.get(*v).map(|x| x.to_string()).unwrap_or_default()),
    );
    record
}

fn write_rows<W: Write>(writer: W, rows: &[CanonicalRow]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(series_header())?;
    for row in rows {
        csv.write_record(row_record(row))?;
    }
    csv.flush()?;
    Ok(())
}

fn field<T: std::str::FromStr>(record: &csv::StringRecord, index: usize, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = record
        .get(index)
        .ok_or_else(|| AppError::Parse(format!("Missing '{}' field", name)))?;
    raw.trim()
        .parse()
        .map_err(|e| AppError::Parse(format!("Invalid '{}' value '{}': {}", name, raw, e)))
}

fn read_rows(content: &str) -> Result<Vec<CanonicalRow>> {
    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let headers = reader.headers()?.clone();

    let index_of = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| AppError::Parse(format!("Series file has no '{}' column", name)))
    };
    let key_index: Vec<usize> = KEY_COLUMNS
        .iter()
        .map(|c| index_of(*c))
        .collect::<Result<_>>()?;
    let value_columns: Vec<(usize, Variable)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| Variable::from_column(h).map(|v| (i, v)))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = CanonicalRow {
            year: field(&record, key_index[0], "year")?,
            month: field(&record, key_index[1], "month")?,
            day: field(&record, key_index[2], "day")?,
            hour: field(&record, key_index[3], "hour")?,
            minute: field(&record, key_index[4], "minute")?,
            latitude: field(&record, key_index[5], "latitude")?,
            longitude: field(&record, key_index[6], "longitude")?,
            values: BTreeMap::new(),
        };
        for (index, var) in &value_columns {
            match record.get(*index).map(str::trim) {
                None | Some("") => {}
                Some(_) => row.set(*var, Some(field(&record, *index, var.column())?)),
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Write a canonical series as CSV. Empty cells mark missing values.
pub fn write_series(path: &Path, series: &CanonicalSeries) -> Result<()> {
    let file = fs::File::create(path)?;
    write_rows(file, &series.rows)?;
    info!("Wrote {} rows to {}", series.len(), path.display());
    Ok(())
}

pub fn read_series(path: &Path) -> Result<CanonicalSeries> {
    let content = fs::read_to_string(path)?;
    let rows = read_rows(&content)?;
    debug!("Read {} rows from {}", rows.len(), path.display());
    Ok(CanonicalSeries::new(rows))
}

/// Persisted TMY: rows plus the month to source-year provenance table.
#[derive(Debug, Clone, PartialEq)]
pub struct TmyFile {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub source_years: BTreeMap<u32, i32>,
    pub rows: Vec<CanonicalRow>,
}

const LABEL_LATITUDE: &str = "Latitude (decimal degrees)";
const LABEL_LONGITUDE: &str = "Longitude (decimal degrees)";
const LABEL_ELEVATION: &str = "Elevation (m)";
const LABEL_OFFSET: &str = "Irradiance Time Offset (h)";

pub fn write_tmy(
    path: &Path,
    location: Location,
    elevation: Option<f64>,
    source_years: &BTreeMap<u32, i32>,
    rows: &[CanonicalRow],
) -> Result<()> {
    let mut out = Vec::new();
    writeln!(out, "{}: {}", LABEL_LATITUDE, location.latitude)?;
    writeln!(out, "{}: {}", LABEL_LONGITUDE, location.longitude)?;
    writeln!(
        out,
        "{}: {}",
        LABEL_ELEVATION,
        elevation.map(|e| e.to_string()).unwrap_or_default()
    )?;
    writeln!(out, "{}: {}", LABEL_OFFSET, IRRADIANCE_TIME_OFFSET_HOURS)?;
    writeln!(out, "month,year")?;
    for (month, year) in source_years {
        writeln!(out, "{},{}", month, year)?;
    }
    write_rows(&mut out, rows)?;

    fs::write(path, out)?;
    info!(
        "Wrote TMY ({} rows, {} months) to {}",
        rows.len(),
        source_years.len(),
        path.display()
    );
    Ok(())
}

pub fn read_tmy(path: &Path) -> Result<TmyFile> {
    let content = fs::read_to_string(path)?;
    let mut lines = content.lines();

    let mut header_value = |label: &str| -> Result<String> {
        let line = lines
            .next()
            .ok_or_else(|| AppError::Parse(format!("TMY file ends before '{}'", label)))?;
        line.strip_prefix(label)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|v| v.trim().to_string())
            .ok_or_else(|| AppError::Parse(format!("Expected '{}', found '{}'", label, line)))
    };

    let parse_f64 = |label: &str, raw: &str| {
        raw.parse::<f64>()
            .map_err(|e| AppError::Parse(format!("Invalid {} '{}': {}", label, raw, e)))
    };

    let latitude = parse_f64(LABEL_LATITUDE, &header_value(LABEL_LATITUDE)?)?;
    let longitude = parse_f64(LABEL_LONGITUDE, &header_value(LABEL_LONGITUDE)?)?;
    let elevation_raw = header_value(LABEL_ELEVATION)?;
    let elevation = if elevation_raw.is_empty() {
        None
    } else {
        Some(parse_f64(LABEL_ELEVATION, &elevation_raw)?)
    };
    header_value(LABEL_OFFSET)?;

    if lines.next().map(str::trim) != Some("month,year") {
        return Err(AppError::Parse(
            "TMY file is missing the month,year table".to_string(),
        ));
    }

    let mut source_years = BTreeMap::new();
    for _ in 0..12 {
        let line = lines
            .next()
            .ok_or_else(|| AppError::Parse("Truncated month,year table".to_string()))?;
        let (month, year) = line
            .split_once(',')
            .ok_or_else(|| AppError::Parse(format!("Invalid month,year line '{}'", line)))?;
        let month: u32 = month
            .trim()
            .parse()
            .map_err(|e| AppError::Parse(format!("Invalid month '{}': {}", month, e)))?;
        let year: i32 = year
            .trim()
            .parse()
            .map_err(|e| AppError::Parse(format!("Invalid year '{}': {}", year, e)))?;
        source_years.insert(month, year);
    }

    let remainder: Vec<&str> = lines.collect();
    let rows = read_rows(&remainder.join("\n"))?;

    Ok(TmyFile {
        latitude,
        longitude,
        elevation,
        source_years,
        rows,
    })
}

/// On-disk cache of fetched chunks, one JSON file per chunk.
#[derive(Debug, Clone)]
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: ChunkId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn store(&self, batch: &ChunkBatch) -> Result<PathBuf> {
        let path = self.path_for(batch.chunk_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(batch)?)?;
        fs::rename(&tmp, &path)?;
        debug!(
            "Cached {} ({} records) at {}",
            batch.chunk_id,
            batch.records.len(),
            path.display()
        );
        Ok(path)
    }

    fn cached_paths(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.dir.join("chunk-*.json");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| AppError::InvalidData(format!("Bad cache pattern {}: {}", pattern, e)))?;

        let mut found = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) => found.push(path),
                Err(e) => warn!("Skipping unreadable cache entry: {}", e),
            }
        }
        found.sort();
        Ok(found)
    }

    /// Every cached batch, ordered by chunk id.
    pub fn load_all(&self) -> Result<Vec<ChunkBatch>> {
        let mut batches = Vec::new();
        for path in self.cached_paths()? {
            let content = fs::read(&path)?;
            let batch: ChunkBatch = serde_json::from_slice(&content).map_err(|e| {
                AppError::InvalidData(format!("Corrupt chunk cache {}: {}", path.display(), e))
            })?;
            batches.push(batch);
        }
        batches.sort_by_key(|b| b.chunk_id);
        Ok(batches)
    }

    pub fn cached_ids(&self) -> Result<BTreeSet<ChunkId>> {
        Ok(self.load_all()?.into_iter().map(|b| b.chunk_id).collect())
    }
}
