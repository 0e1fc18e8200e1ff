use crate::acquisition::{AcquisitionEngine, AcquisitionReport, ChunkBatch, ChunkFailure};
use crate::assembler::assemble;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::fetcher::DataSource;
use crate::logsink::LogSink;
use crate::models::CanonicalSeries;
use crate::persistence::{read_series, write_series, write_tmy, ChunkCache, ProjectLayout};
use crate::plan::{ChunkId, ChunkSpec, RequestPlan};
use crate::render::PlotRenderer;
use crate::state::{ProjectState, Stage};
use crate::tmy::{construct, MonthSelection, TmyResult};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Ran,
    Skipped,
    /// Ran, but left unmarked so the next invocation retries it.
    Partial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub stages: Vec<StageReport>,
    pub timeseries_path: Option<PathBuf>,
    pub tmy_path: Option<PathBuf>,
    pub plots_dir: Option<PathBuf>,
    pub source_years: BTreeMap<u32, i32>,
    pub selections: Vec<MonthSelection>,
    pub failed_chunks: Vec<ChunkFailure>,
}

impl WorkflowOutcome {
    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.stages.iter().find(|r| r.stage == stage).map(|r| r.status)
    }
}

/// Month selection written by the TMY construction stage, enough to rebuild
/// the TMY rows from the series on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SelectionRecord {
    source_years: BTreeMap<u32, i32>,
    selections: Vec<MonthSelection>,
    warnings: Vec<String>,
}

struct StageRun {
    output: String,
    complete: bool,
}

impl StageRun {
    fn complete(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            complete: true,
        }
    }
}

/// Values produced by earlier stages in this invocation. Anything missing is
/// loaded back from the previous run's recorded outputs on demand.
#[derive(Default)]
struct StageContext {
    batches: Option<Vec<ChunkBatch>>,
    series: Option<CanonicalSeries>,
    tmy: Option<TmyResult>,
    failed_chunks: Vec<ChunkFailure>,
}

pub struct Workflow {
    config: Config,
    layout: ProjectLayout,
    source: Arc<dyn DataSource>,
    state: Arc<dyn ProjectState>,
    log: Arc<dyn LogSink>,
    renderer: Box<dyn PlotRenderer>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Workflow {
    pub fn new(
        config: Config,
        layout: ProjectLayout,
        source: Arc<dyn DataSource>,
        state: Arc<dyn ProjectState>,
        log: Arc<dyn LogSink>,
        renderer: Box<dyn PlotRenderer>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            layout,
            source,
            state,
            log,
            renderer,
            shutdown_rx,
        }
    }

    pub fn selection_path(&self) -> PathBuf {
        self.layout.tmy_dir().join("selection.json")
    }

    fn chunk_cache(&self) -> ChunkCache {
        ChunkCache::new(self.layout.chunks_dir())
    }

    /// Run every stage in order, skipping those already recorded complete.
    pub async fn run(&self) -> Result<WorkflowOutcome> {
        let location = self.config.location;
        self.log.info(&format!(
            "Starting TMY workflow for ({}, {}) from {} to {}",
            location.latitude, location.longitude, self.config.period.start, self.config.period.end
        ));

        let mut ctx = StageContext::default();
        let mut reports = Vec::with_capacity(Stage::ALL.len());
        // Once a stage runs, later markers describe outputs of older inputs
        let mut upstream_ran = false;

        for stage in Stage::ALL {
            if *self.shutdown_rx.borrow() {
                let err = AppError::Cancelled(stage);
                self.log.error(&err.to_string());
                return Err(err);
            }

            let done = self
                .state
                .has_stage_output(stage)
                .await
                .map_err(|e| e.in_stage(stage))?;

            if done && !upstream_ran {
                let output = self
                    .state
                    .read_stage_output(stage)
                    .await
                    .map_err(|e| e.in_stage(stage))?
                    .unwrap_or_default();
                self.log.warning(&format!(
                    "Stage {} already complete, skipping (output: {})",
                    stage, output
                ));
                reports.push(StageReport {
                    stage,
                    status: StageStatus::Skipped,
                    output,
                });
                continue;
            }

            if done {
                self.log.info(&format!(
                    "Stage {}: rerunning after an upstream stage ran",
                    stage
                ));
            } else {
                self.log.info(&format!("Stage {}: starting", stage));
            }
            upstream_ran = true;

            let run = match self.execute(stage, &mut ctx).await {
                Ok(run) => run,
                Err(e) => {
                    let err = e.in_stage(stage);
                    self.log.error(&err.to_string());
                    return Err(err);
                }
            };

            let status = if run.complete {
                self.state
                    .mark_stage_complete(stage, &run.output)
                    .await
                    .map_err(|e| e.in_stage(stage))?;
                self.log
                    .success(&format!("Stage {} complete: {}", stage, run.output));
                StageStatus::Ran
            } else {
                self.log.warning(&format!(
                    "Stage {} finished with partial results and is not marked complete",
                    stage
                ));
                StageStatus::Partial
            };

            reports.push(StageReport {
                stage,
                status,
                output: run.output,
            });
        }

        let outcome = self.outcome(ctx, reports).await?;
        self.log.success("TMY workflow finished");
        Ok(outcome)
    }

    async fn execute(&self, stage: Stage, ctx: &mut StageContext) -> Result<StageRun> {
        match stage {
            Stage::Acquire => self.acquire(ctx).await,
            Stage::Assemble => self.assemble_series(ctx).await,
            Stage::PersistTimeseries => self.persist_timeseries(ctx).await,
            Stage::ConstructTmy => self.construct_tmy(ctx).await,
            Stage::PersistTmy => self.persist_tmy(ctx).await,
            Stage::RenderPlots => self.render_plots(ctx).await,
        }
    }

    async fn acquire(&self, ctx: &mut StageContext) -> Result<StageRun> {
        let location = self.config.location;
        let variables = self.config.provider_variables()?;
        let plan = RequestPlan::build(
            location,
            self.config.period.start,
            self.config.period.end,
            &variables,
            self.config.source.chunking,
        )?;

        let planned: BTreeSet<ChunkId> = plan.chunks().iter().map(|c| c.id).collect();
        let cache = self.chunk_cache();
        let mut batches = cache.load_all()?;
        batches.retain(|b| planned.contains(&b.chunk_id));

        let cached: BTreeSet<ChunkId> = batches.iter().map(|b| b.chunk_id).collect();
        let pending: Vec<ChunkSpec> = plan
            .chunks()
            .iter()
            .filter(|c| !cached.contains(&c.id))
            .cloned()
            .collect();

        if !cached.is_empty() {
            self.log.info(&format!(
                "{} of {} chunk(s) already cached, fetching {}",
                cached.len(),
                plan.len(),
                pending.len()
            ));
        }

        let report = if pending.is_empty() {
            AcquisitionReport::default()
        } else {
            let seq_base = batches
                .iter()
                .map(|b| b.completion_seq + 1)
                .max()
                .unwrap_or(0);
            AcquisitionEngine::new(
                Arc::clone(&self.source),
                self.config.acquisition.concurrency_policy(),
                self.config.acquisition.retry_policy(),
            )
            .with_sequence_base(seq_base)
            .run(location, &pending, self.shutdown_rx.clone())
            .await
        };

        // Cache before judging the run so a retry only refetches what failed
        for batch in &report.batches {
            cache.store(batch)?;
        }

        let AcquisitionReport {
            batches: fetched,
            failures,
        } = report;

        for failure in &failures {
            self.log.error(&format!(
                "{} failed after {} attempt(s) ({:?}): {}",
                failure.chunk_id, failure.attempt_count, failure.last_error_kind, failure.message
            ));
        }

        if !failures.is_empty() && *self.shutdown_rx.borrow() {
            return Err(AppError::Cancelled(Stage::Acquire));
        }

        if !failures.is_empty() && !self.config.acquisition.allow_partial {
            return Err(AppError::AcquisitionIncomplete { failed: failures });
        }

        let complete = failures.is_empty();
        if !complete {
            self.log.warning(&format!(
                "Continuing with partial data: {} of {} chunk(s) missing",
                failures.len(),
                plan.len()
            ));
        }

        batches.extend(fetched);
        let records: usize = batches.iter().map(|b| b.records.len()).sum();
        self.log.info(&format!(
            "Acquired {} records across {} chunk(s)",
            records,
            batches.len()
        ));

        ctx.batches = Some(batches);
        ctx.failed_chunks = failures;

        Ok(StageRun {
            output: cache.dir().display().to_string(),
            complete,
        })
    }

    async fn assemble_series(&self, ctx: &mut StageContext) -> Result<StageRun> {
        let batches = match ctx.batches.take() {
            Some(batches) => batches,
            None => self.chunk_cache().load_all()?,
        };

        let series = assemble(&batches, self.config.location);
        if series.is_empty() {
            self.log
                .warning("Assembled series is empty; TMY construction will lack data");
        } else {
            self.log.info(&format!(
                "Assembled {} hourly rows covering years {:?}",
                series.len(),
                series.years()
            ));
        }

        ctx.series = Some(series);
        Ok(StageRun::complete(self.chunk_cache().dir().display().to_string()))
    }

    async fn persist_timeseries(&self, ctx: &mut StageContext) -> Result<StageRun> {
        self.ensure_series(ctx).await?;
        let Some(series) = ctx.series.as_ref() else {
            return Err(AppError::InvalidData("Series unavailable".to_string()));
        };

        let path = self.layout.timeseries_path(
            self.config.period.start,
            self.config.period.end,
            self.config.location,
        );
        write_series(&path, series)?;
        Ok(StageRun::complete(path.display().to_string()))
    }

    async fn construct_tmy(&self, ctx: &mut StageContext) -> Result<StageRun> {
        self.ensure_series(ctx).await?;
        let Some(series) = ctx.series.as_ref() else {
            return Err(AppError::InvalidData("Series unavailable".to_string()));
        };

        let options = self.config.tmy.options();
        let result = construct(series, &series.years(), &options)?;

        for warning in &result.warnings {
            self.log.warning(warning);
        }
        for selection in &result.selections {
            debug!(
                "Month {:02} -> {} (score {:?}, fallback {})",
                selection.month, selection.year, selection.score, selection.fallback
            );
        }

        let record = SelectionRecord {
            source_years: result.source_years.clone(),
            selections: result.selections.clone(),
            warnings: result.warnings.clone(),
        };
        let path = self.selection_path();
        tokio::fs::write(&path, serde_json::to_string_pretty(&record)?).await?;

        ctx.tmy = Some(result);
        Ok(StageRun::complete(path.display().to_string()))
    }

    async fn persist_tmy(&self, ctx: &mut StageContext) -> Result<StageRun> {
        self.ensure_tmy(ctx).await?;
        let Some(tmy) = ctx.tmy.as_ref() else {
            return Err(AppError::InvalidData("TMY result unavailable".to_string()));
        };

        let path = self.layout.tmy_path(
            self.config.period.start.year(),
            self.config.period.end.year(),
            self.config.location,
        );
        write_tmy(&path, self.config.location, None, &tmy.source_years, &tmy.rows)?;
        Ok(StageRun::complete(path.display().to_string()))
    }

    async fn render_plots(&self, ctx: &mut StageContext) -> Result<StageRun> {
        self.ensure_tmy(ctx).await?;
        let (Some(series), Some(tmy)) = (ctx.series.as_ref(), ctx.tmy.as_ref()) else {
            return Err(AppError::InvalidData(
                "Series or TMY result unavailable".to_string(),
            ));
        };

        let dir = self.renderer.render(series, tmy, &tmy.source_years)?;
        Ok(StageRun::complete(dir.display().to_string()))
    }

    /// Load the series from the persisted file if one was recorded, else
    /// reassemble it from the chunk cache.
    async fn ensure_series(&self, ctx: &mut StageContext) -> Result<()> {
        if ctx.series.is_some() {
            return Ok(());
        }

        let recorded = match self.state.read_stage_output(Stage::PersistTimeseries).await? {
            Some(path) => tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false)
                .then_some(path),
            None => None,
        };
        let series = match recorded {
            Some(path) => {
                self.log
                    .info(&format!("Loading persisted series from {}", path));
                read_series(Path::new(&path))?
            }
            _ => {
                let batches = match ctx.batches.take() {
                    Some(batches) => batches,
                    None => self.chunk_cache().load_all()?,
                };
                self.log.info(&format!(
                    "Reassembling series from {} cached chunk(s)",
                    batches.len()
                ));
                assemble(&batches, self.config.location)
            }
        };

        ctx.series = Some(series);
        Ok(())
    }

    /// Rebuild the TMY from the recorded month selection and the series.
    async fn ensure_tmy(&self, ctx: &mut StageContext) -> Result<()> {
        self.ensure_series(ctx).await?;
        if ctx.tmy.is_some() {
            return Ok(());
        }

        let record = self.read_selection().await?.ok_or_else(|| {
            AppError::InvalidData(format!(
                "No recorded month selection at {}",
                self.selection_path().display()
            ))
        })?;
        let Some(series) = ctx.series.as_ref() else {
            return Err(AppError::InvalidData("Series unavailable".to_string()));
        };

        let rows = record
            .source_years
            .iter()
            .flat_map(|(month, year)| series.month_rows(*year, *month).cloned())
            .collect();

        ctx.tmy = Some(TmyResult {
            rows,
            source_years: record.source_years,
            selections: record.selections,
            warnings: record.warnings,
        });
        Ok(())
    }

    async fn read_selection(&self) -> Result<Option<SelectionRecord>> {
        let path = match self.state.read_stage_output(Stage::ConstructTmy).await? {
            Some(path) => PathBuf::from(path),
            None => return Ok(None),
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn outcome(&self, ctx: StageContext, stages: Vec<StageReport>) -> Result<WorkflowOutcome> {
        let output_of = |stage: Stage| {
            stages
                .iter()
                .find(|r| r.stage == stage)
                .map(|r| PathBuf::from(&r.output))
        };

        let (source_years, selections) = match ctx.tmy {
            Some(tmy) => (tmy.source_years, tmy.selections),
            None => match self.read_selection().await? {
                Some(record) => (record.source_years, record.selections),
                None => (BTreeMap::new(), Vec::new()),
            },
        };

        Ok(WorkflowOutcome {
            timeseries_path: output_of(Stage::PersistTimeseries),
            tmy_path: output_of(Stage::PersistTmy),
            plots_dir: output_of(Stage::RenderPlots),
            source_years,
            selections,
            failed_chunks: ctx.failed_chunks,
            stages,
        })
    }
}
