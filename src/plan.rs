use crate::error::{AppError, Result};
use crate::models::{Location, TimeRange};
use crate::variables::ProviderVariable;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Chunking {
    /// One request per calendar month.
    #[default]
    Monthly,
    /// A single request covering the whole period.
    Whole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub usize);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{:04}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpec {
    pub id: ChunkId,
    pub range: TimeRange,
    pub variables: Vec<ProviderVariable>,
}

/// Ordered, gap-free and overlap-free chunks covering a requested span.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    location: Location,
    chunks: Vec<ChunkSpec>,
}

impl RequestPlan {
    /// Build the plan for `[start, end]` (both dates inclusive).
    pub fn build(
        location: Location,
        start: NaiveDate,
        end: NaiveDate,
        variables: &[ProviderVariable],
        chunking: Chunking,
    ) -> Result<Self> {
        if start > end {
            return Err(AppError::InvalidData(format!(
                "Request start {} is after end {}",
                start, end
            )));
        }
        if variables.is_empty() {
            return Err(AppError::InvalidData(
                "Request plan needs at least one variable".to_string(),
            ));
        }

        let span_start = midnight(start);
        let span_end = midnight(end) + Duration::days(1);

        let ranges = match chunking {
            Chunking::Whole => vec![TimeRange {
                start: span_start,
                end: span_end,
            }],
            Chunking::Monthly => {
                let mut ranges = Vec::new();
                let mut cursor = span_start;
                while cursor < span_end {
                    let next = midnight(first_of_next_month(cursor.date())).min(span_end);
                    ranges.push(TimeRange {
                        start: cursor,
                        end: next,
                    });
                    cursor = next;
                }
                ranges
            }
        };

        let chunks = ranges
            .into_iter()
            .enumerate()
            .map(|(i, range)| ChunkSpec {
                id: ChunkId(i + 1),
                range,
                variables: variables.to_vec(),
            })
            .collect();

        Ok(Self { location, chunks })
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn chunks(&self) -> &[ChunkSpec] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
}
