use crate::error::Result;
use crate::models::CanonicalSeries;
use crate::tmy::TmyResult;
use crate::variables::Variable;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Consumer of the finished series and TMY, e.g. a chart generator.
pub trait PlotRenderer: Send + Sync {
    /// Render outputs and return the directory they were written to.
    fn render(
        &self,
        series: &CanonicalSeries,
        tmy: &TmyResult,
        source_years: &BTreeMap<u32, i32>,
    ) -> Result<PathBuf>;
}

/// Writes per-variable monthly comparison tables a chart front-end can draw.
#[derive(Debug, Clone)]
pub struct PlotDataWriter {
    dir: PathBuf,
}

impl PlotDataWriter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn table_path(&self, variable: Variable) -> PathBuf {
        self.dir.join(format!("{}_monthly.csv", variable.column()))
    }
}

fn monthly_means<'a, I>(rows: I, variable: Variable) -> BTreeMap<u32, f64>
where
    I: IntoIterator<Item = &'a crate::models::CanonicalRow>,
{
    let mut sums: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
    for row in rows {
        if let Some(value) = row.get(variable) {
            let entry = sums.entry(row.month).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(month, (sum, n))| (month, sum / n as f64))
        .collect()
}

impl PlotRenderer for PlotDataWriter {
    fn render(
        &self,
        series: &CanonicalSeries,
        tmy: &TmyResult,
        source_years: &BTreeMap<u32, i32>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let mut written = 0;
        for variable in series.variables_present() {
            let long_term = monthly_means(&series.rows, variable);
            let selected = monthly_means(&tmy.rows, variable);

            let path = self.table_path(variable);
            let mut csv = csv::Writer::from_path(&path)?;
            csv.write_record(["month", "long_term_mean", "tmy_mean", "source_year"])?;
            for month in 1..=12u32 {
                let cell = |v: Option<&f64>| v.map(|x| x.to_string()).unwrap_or_default();
                csv.write_record([
                    month.to_string(),
                    cell(long_term.get(&month)),
                    cell(selected.get(&month)),
                    source_years
                        .get(&month)
                        .map(|y| y.to_string())
                        .unwrap_or_default(),
                ])?;
            }
            csv.flush()?;
            debug!("Wrote plot table {}", path.display());
            written += 1;
        }

        info!("Wrote {} plot table(s) to {}", written, self.dir.display());
        Ok(self.dir.clone())
    }
}
