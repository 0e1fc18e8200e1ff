//! Typical Meteorological Year construction.
//!
//! For each calendar month the long-term distribution of every selection
//! variable is compared against each candidate year's distribution. The
//! weighted score picks one source year per month, and that year's hourly
//! rows are concatenated in month order into the synthetic year.

use crate::models::{days_in_month, CanonicalRow, CanonicalSeries};
use crate::stats::{ks_distance, z_score, Distribution, MonthlyStatistics};
use crate::variables::Variable;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MIN_YEARS: usize = 3;

/// Missing hourly coverage above this fraction degrades a month's selection.
pub const MAX_MISSING_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TmyType {
    #[default]
    Typical,
    ExtremeWarm,
    ExtremeCold,
}

impl TmyType {
    /// Direction the extreme bias pushes the temperature deviation.
    fn bias_direction(&self) -> f64 {
        match self {
            TmyType::Typical => 0.0,
            TmyType::ExtremeWarm => 1.0,
            TmyType::ExtremeCold => -1.0,
        }
    }
}

impl fmt::Display for TmyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TmyType::Typical => "typical",
            TmyType::ExtremeWarm => "extreme_warm",
            TmyType::ExtremeCold => "extreme_cold",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatisticalMethod {
    #[default]
    #[serde(rename = "zscore")]
    ZScore,
    #[serde(rename = "ks")]
    KolmogorovSmirnov,
}

impl fmt::Display for StatisticalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatisticalMethod::ZScore => f.write_str("zscore"),
            StatisticalMethod::KolmogorovSmirnov => f.write_str("ks"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TmyOptions {
    pub tmy_type: TmyType,
    pub method: StatisticalMethod,
    /// Strength of the temperature bias for extreme years; zero reproduces
    /// the typical ranking.
    pub extreme_bias_weight: f64,
}

impl Default for TmyOptions {
    fn default() -> Self {
        Self {
            tmy_type: TmyType::Typical,
            method: StatisticalMethod::ZScore,
            extreme_bias_weight: 1.0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TmyError {
    #[error("Insufficient years: found {found}, need at least {MIN_YEARS}")]
    InsufficientYears { found: usize },

    #[error("No data for month {0} in any candidate year")]
    MonthUnavailable(u32),

    #[error("Series has no values for required variable '{0}'")]
    MissingVariable(Variable),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthSelection {
    pub month: u32,
    pub year: i32,
    pub score: Option<f64>,
    /// True when no candidate passed the presence check.
    pub fallback: bool,
    pub missing_fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TmyResult {
    pub rows: Vec<CanonicalRow>,
    pub source_years: BTreeMap<u32, i32>,
    pub selections: Vec<MonthSelection>,
    pub warnings: Vec<String>,
}

/// One candidate (year, month) with its per-variable samples.
struct Candidate {
    year: i32,
    distributions: BTreeMap<Variable, Distribution>,
    missing_fraction: f64,
}

impl Candidate {
    fn gather(series: &CanonicalSeries, year: i32, month: u32, variables: &[Variable]) -> Self {
        let mut samples: BTreeMap<Variable, Vec<f64>> = BTreeMap::new();
        for row in series.month_rows(year, month) {
            for var in variables {
                if let Some(value) = row.get(*var) {
                    samples.entry(*var).or_default().push(value);
                }
            }
        }

        let expected = (days_in_month(year, month) * 24) as usize * variables.len().max(1);
        let found: usize = samples.values().map(Vec::len).sum();
        let missing_fraction = if expected == 0 {
            1.0
        } else {
            (1.0 - found as f64 / expected as f64).clamp(0.0, 1.0)
        };

        Self {
            year,
            distributions: samples
                .into_iter()
                .map(|(var, values)| (var, Distribution::from_values(values)))
                .collect(),
            missing_fraction,
        }
    }

    fn is_empty(&self) -> bool {
        self.distributions.values().all(Distribution::is_empty)
    }

    fn has_all(&self, variables: &[Variable]) -> bool {
        variables
            .iter()
            .all(|v| self.distributions.get(v).is_some_and(|d| !d.is_empty()))
    }
}

/// Weighted score of one candidate month against the long-term table.
///
/// Per-variable statistics are combined by selection weight, renormalized
/// over the variables both sides have data for. Lower is better.
pub fn score_candidate(
    long_term: &MonthlyStatistics,
    month: u32,
    candidate: &BTreeMap<Variable, Distribution>,
    options: &TmyOptions,
) -> Option<f64> {
    let direction = options.tmy_type.bias_direction();
    let biased = direction != 0.0 && options.extreme_bias_weight > 0.0;

    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    for (var, dist) in candidate {
        let weight = var.selection_weight();
        if weight <= 0.0 {
            continue;
        }
        let Some(lt) = long_term.get(month, *var) else {
            continue;
        };
        let statistic = match options.method {
            // Signed z ranks colder months lower; flip it so the biased
            // direction is the one that scores low
            StatisticalMethod::ZScore if biased => {
                z_score(&lt.distribution, dist).map(|z| -direction * z)
            }
            StatisticalMethod::ZScore => z_score(&lt.distribution, dist),
            StatisticalMethod::KolmogorovSmirnov => ks_distance(&lt.distribution, dist),
        };
        if let Some(s) = statistic {
            weighted += weight * s;
            total_weight += weight;
        }
    }

    if total_weight <= 0.0 {
        return None;
    }
    let score = weighted / total_weight;

    if !biased {
        return Some(score);
    }

    let deviation = temperature_deviation(long_term, month, candidate).unwrap_or(0.0);
    Some(score - options.extreme_bias_weight * direction * deviation)
}

/// Candidate mean temperature relative to the long-term mean, in long-term
/// standard deviations.
fn temperature_deviation(
    long_term: &MonthlyStatistics,
    month: u32,
    candidate: &BTreeMap<Variable, Distribution>,
) -> Option<f64> {
    let lt = &long_term.get(month, Variable::Temperature)?.distribution;
    let diff = candidate.get(&Variable::Temperature)?.mean()? - lt.mean()?;
    let sigma = lt.std_dev()?;
    if sigma < f64::EPSILON {
        Some(diff)
    } else {
        Some(diff / sigma)
    }
}

/// Lowest score wins; ties go to the earliest year.
pub fn select_best(scored: &[(i32, f64)]) -> Option<(i32, f64)> {
    scored
        .iter()
        .copied()
        .filter(|(_, s)| !s.is_nan())
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
}

/// Build the synthetic year from `series`, drawing candidates from
/// `years_present`.
pub fn construct(
    series: &CanonicalSeries,
    years_present: &BTreeSet<i32>,
    options: &TmyOptions,
) -> Result<TmyResult, TmyError> {
    if years_present.len() < MIN_YEARS {
        return Err(TmyError::InsufficientYears {
            found: years_present.len(),
        });
    }

    let present = series.variables_present();
    if !present.contains(&Variable::Temperature) {
        return Err(TmyError::MissingVariable(Variable::Temperature));
    }

    let variables: Vec<Variable> = Variable::selection_set()
        .filter(|v| present.contains(v))
        .collect();

    info!(
        "Constructing {} TMY ({} method) from {} years using {:?}",
        options.tmy_type,
        options.method,
        years_present.len(),
        variables
    );

    let in_scope = CanonicalSeries::new(
        series
            .rows
            .iter()
            .filter(|r| years_present.contains(&r.year))
            .cloned()
            .collect(),
    );
    let long_term = MonthlyStatistics::compute(&in_scope, &variables);

    let mut rows = Vec::new();
    let mut source_years = BTreeMap::new();
    let mut selections = Vec::with_capacity(12);
    let mut warnings = Vec::new();

    for month in 1..=12u32 {
        let candidates: Vec<Candidate> = years_present
            .iter()
            .map(|year| Candidate::gather(&in_scope, *year, month, &variables))
            .filter(|c| !c.is_empty())
            .collect();

        if candidates.is_empty() {
            return Err(TmyError::MonthUnavailable(month));
        }

        let scored: Vec<(i32, f64)> = candidates
            .iter()
            .filter(|c| c.has_all(&variables))
            .filter_map(|c| {
                score_candidate(&long_term, month, &c.distributions, options).map(|s| (c.year, s))
            })
            .collect();

        let selection = match select_best(&scored) {
            Some((year, score)) => {
                let missing_fraction = candidates
                    .iter()
                    .find(|c| c.year == year)
                    .map_or(1.0, |c| c.missing_fraction);
                MonthSelection {
                    month,
                    year,
                    score: Some(score),
                    fallback: false,
                    missing_fraction,
                }
            }
            None => {
                let least_missing = candidates
                    .iter()
                    .min_by(|a, b| {
                        a.missing_fraction
                            .total_cmp(&b.missing_fraction)
                            .then(a.year.cmp(&b.year))
                    })
                    .ok_or(TmyError::MonthUnavailable(month))?;

                let message = format!(
                    "Month {}: no candidate year has every selection variable; falling back to {} ({:.1}% missing)",
                    month,
                    least_missing.year,
                    least_missing.missing_fraction * 100.0
                );
                warn!("{}", message);
                warnings.push(message);

                MonthSelection {
                    month,
                    year: least_missing.year,
                    score: score_candidate(&long_term, month, &least_missing.distributions, options),
                    fallback: true,
                    missing_fraction: least_missing.missing_fraction,
                }
            }
        };

        if selection.missing_fraction > MAX_MISSING_FRACTION {
            let message = format!(
                "Month {} from {}: {:.1}% of hourly values missing",
                month,
                selection.year,
                selection.missing_fraction * 100.0
            );
            warn!("{}", message);
            warnings.push(message);
        }

        debug!(
            "Month {:02}: selected {} (score {:?}) from {} candidate(s)",
            month,
            selection.year,
            selection.score,
            candidates.len()
        );

        rows.extend(in_scope.month_rows(selection.year, month).cloned());
        source_years.insert(month, selection.year);
        selections.push(selection);
    }

    Ok(TmyResult {
        rows,
        source_years,
        selections,
        warnings,
    })
}
