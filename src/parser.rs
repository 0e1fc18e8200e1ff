use crate::error::{AppError, Result};
use crate::models::RawRecord;
use crate::variables::ProviderVariable;
use chrono::NaiveDateTime;
use csv::StringRecord;
use std::collections::BTreeMap;
use tracing::warn;

/// Default failure threshold - fail if more than 10% of lines fail to parse
const DEFAULT_FAILURE_THRESHOLD: f64 = 0.10;

const TIME_COLUMN: &str = "valid_time";

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_lines: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub empty_lines: usize,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&mut self) {
        let non_empty = self.total_lines - self.empty_lines;
        self.failure_rate = if non_empty > 0 {
            self.parse_failures as f64 / non_empty as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

/// Column layout taken from the response header.
#[derive(Debug)]
struct Header {
    time_index: usize,
    columns: Vec<(usize, ProviderVariable)>,
    width: usize,
}

pub struct Parser;

impl Parser {
    /// Parse a provider CSV response into raw hourly records
    pub fn parse_response(content: &str) -> Result<(Vec<RawRecord>, ParseStats)> {
        Self::parse_response_with_threshold(content, DEFAULT_FAILURE_THRESHOLD)
    }

    /// Parse a provider CSV response with a custom failure threshold
    pub fn parse_response_with_threshold(
        content: &str,
        failure_threshold: f64,
    ) -> Result<(Vec<RawRecord>, ParseStats)> {
        if content.trim().is_empty() {
            return Ok((Vec::new(), ParseStats::new()));
        }

        // Flexible so a short or long row counts as one failed line
        // instead of aborting the whole response
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let header = Self::parse_header(reader.headers()?)?;

        let mut records = Vec::new();
        let mut stats = ParseStats::new();

        for result in reader.records() {
            stats.total_lines += 1;

            let parsed = match result {
                Ok(row) if row.iter().all(str::is_empty) => {
                    stats.empty_lines += 1;
                    continue;
                }
                Ok(row) => Self::parse_record(&header, &row).map_err(|e| (row_line(&row), e)),
                Err(e) => Err((
                    e.position().map(|p| p.line()),
                    AppError::Parse(e.to_string()),
                )),
            };

            match parsed {
                Ok(record) => {
                    records.push(record);
                    stats.parsed_successfully += 1;
                }
                Err((line, e)) => {
                    stats.parse_failures += 1;
                    warn!(
                        "Failed to parse line {} (failure {}/{}): {}",
                        line.map_or_else(|| "?".to_string(), |l| l.to_string()),
                        stats.parse_failures,
                        stats.total_lines - stats.empty_lines,
                        e
                    );
                }
            }
        }

        stats.finalize();

        if stats.exceeds_threshold(failure_threshold) {
            return Err(AppError::Parse(format!(
                "Parse failure rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} non-empty lines",
                stats.failure_rate * 100.0,
                failure_threshold * 100.0,
                stats.parse_failures,
                stats.total_lines - stats.empty_lines
            )));
        }

        if records.is_empty() && stats.total_lines > stats.empty_lines {
            return Err(AppError::Parse(
                "No records successfully parsed from non-empty response".to_string(),
            ));
        }

        Ok((records, stats))
    }

    fn parse_header(names: &StringRecord) -> Result<Header> {
        let time_index = names
            .iter()
            .position(|n| n == TIME_COLUMN)
            .ok_or_else(|| {
                AppError::Parse(format!("Response header has no '{}' column", TIME_COLUMN))
            })?;

        // Columns outside the provider variable set (e.g. latitude) are ignored
        let columns = names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| ProviderVariable::from_short_code(name).map(|v| (i, v)))
            .collect();

        Ok(Header {
            time_index,
            columns,
            width: names.len(),
        })
    }

    fn parse_record(header: &Header, row: &StringRecord) -> Result<RawRecord> {
        if row.len() != header.width {
            return Err(AppError::Parse(format!(
                "Expected {} fields, got {}",
                header.width,
                row.len()
            )));
        }

        let valid_time = parse_timestamp(&row[header.time_index])?;

        let mut values = BTreeMap::new();
        for (index, var) in &header.columns {
            if let Some(value) = parse_optional_float(&row[*index])? {
                values.insert(*var, value);
            }
        }

        Ok(RawRecord { valid_time, values })
    }
}

fn row_line(row: &StringRecord) -> Option<u64> {
    row.position().map(|p| p.line())
}

fn parse_optional_float(s: &str) -> Result<Option<f64>> {
    if s.is_empty() || s.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let value = s
        .parse::<f64>()
        .map_err(|e| AppError::Parse(format!("Failed to parse float '{}': {}", s, e)))?;
    Ok(value.is_finite().then_some(value))
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| AppError::Parse(format!("Invalid timestamp '{}'", s)))
}
