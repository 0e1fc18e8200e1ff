use crate::models::CanonicalSeries;
use crate::variables::Variable;
use std::collections::BTreeMap;

/// Percentiles kept for each long-term monthly distribution.
pub const QUANTILE_LEVELS: [f64; 5] = [0.05, 0.25, 0.50, 0.75, 0.95];

/// Empirical distribution over finite samples, kept sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distribution {
    sorted: Vec<f64>,
}

impl Distribution {
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self { sorted }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.sorted
    }

    pub fn mean(&self) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        Some(self.sorted.iter().sum::<f64>() / self.sorted.len() as f64)
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self
            .sorted
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.sorted.len() as f64;
        Some(variance.sqrt())
    }

    /// Quantile with linear interpolation between closest ranks.
    pub fn quantile(&self, p: f64) -> Option<f64> {
        let n = self.sorted.len();
        if n == 0 {
            return None;
        }
        let pos = p.clamp(0.0, 1.0) * (n - 1) as f64;
        let lower = pos.floor() as usize;
        let upper = pos.ceil() as usize;
        let frac = pos - lower as f64;
        Some(self.sorted[lower] + (self.sorted[upper] - self.sorted[lower]) * frac)
    }

    /// Fraction of samples `<= x`.
    pub fn cdf(&self, x: f64) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        let count = self.sorted.partition_point(|v| *v <= x);
        count as f64 / self.sorted.len() as f64
    }
}

/// Two-sample Kolmogorov-Smirnov statistic: the largest absolute gap between
/// the two empirical CDFs.
pub fn ks_distance(a: &Distribution, b: &Distribution) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let distance = a
        .values()
        .iter()
        .chain(b.values())
        .map(|x| (a.cdf(*x) - b.cdf(*x)).abs())
        .fold(0.0, f64::max);
    Some(distance)
}

/// Signed standardized difference of means, candidate against long-term.
///
/// Positive when the candidate runs above the long-term mean. When both
/// spreads are zero the raw difference is returned.
pub fn z_score(long_term: &Distribution, candidate: &Distribution) -> Option<f64> {
    let diff = candidate.mean()? - long_term.mean()?;
    let spread = (long_term.std_dev()?.powi(2) + candidate.std_dev()?.powi(2)).sqrt();
    if spread < f64::EPSILON {
        Some(diff)
    } else {
        Some(diff / spread)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableStatistics {
    pub quantiles: [f64; 5],
    pub distribution: Distribution,
}

impl VariableStatistics {
    pub fn from_distribution(distribution: Distribution) -> Option<Self> {
        let mut quantiles = [0.0; 5];
        for (slot, level) in quantiles.iter_mut().zip(QUANTILE_LEVELS) {
            *slot = distribution.quantile(level)?;
        }
        Some(Self {
            quantiles,
            distribution,
        })
    }
}

/// Long-term statistics per (calendar month, variable) across every year in
/// a series.
#[derive(Debug, Clone, Default)]
pub struct MonthlyStatistics {
    entries: BTreeMap<(u32, Variable), VariableStatistics>,
}

impl MonthlyStatistics {
    pub fn compute(series: &CanonicalSeries, variables: &[Variable]) -> Self {
        let mut samples: BTreeMap<(u32, Variable), Vec<f64>> = BTreeMap::new();
        for row in &series.rows {
            for var in variables {
                if let Some(value) = row.get(*var) {
                    samples.entry((row.month, *var)).or_default().push(value);
                }
            }
        }

        let entries = samples
            .into_iter()
            .filter_map(|(key, values)| {
                VariableStatistics::from_distribution(Distribution::from_values(values))
                    .map(|stats| (key, stats))
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, month: u32, variable: Variable) -> Option<&VariableStatistics> {
        self.entries.get(&(month, variable))
    }

    pub fn insert(&mut self, month: u32, variable: Variable, stats: VariableStatistics) {
        self.entries.insert((month, variable), stats);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
