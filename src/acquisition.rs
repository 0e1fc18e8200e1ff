use crate::fetcher::{DataSource, FetchErrorKind};
use crate::models::{Location, RawRecord};
use crate::plan::{ChunkId, ChunkSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Concurrent,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    pub mode: DispatchMode,
    pub worker_count: usize,
    pub inter_request_delay: Duration,
}

impl ConcurrencyPolicy {
    pub fn concurrent(worker_count: usize) -> Self {
        Self {
            mode: DispatchMode::Concurrent,
            worker_count,
            inter_request_delay: Duration::ZERO,
        }
    }

    pub fn sequential(inter_request_delay: Duration) -> Self {
        Self {
            mode: DispatchMode::Sequential,
            worker_count: 1,
            inter_request_delay,
        }
    }

    fn effective_workers(&self) -> usize {
        match self.mode {
            DispatchMode::Sequential => 1,
            DispatchMode::Concurrent => self.worker_count.max(1),
        }
    }
}

/// Delays waited after each retryable failure. The schedule length is the
/// attempt budget for a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(120),
        ])
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn max_attempts(&self) -> u32 {
        self.delays.len().max(1) as u32
    }

    /// Backoff after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    Transient,
    Fatal,
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

impl From<FetchErrorKind> for FailureKind {
    fn from(kind: FetchErrorKind) -> Self {
        match kind {
            FetchErrorKind::RateLimited => FailureKind::RateLimited,
            FetchErrorKind::Transient => FailureKind::Transient,
            FetchErrorKind::Fatal => FailureKind::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: ChunkId,
    pub attempt_count: u32,
    pub last_error_kind: FailureKind,
    pub message: String,
}

/// Records of one successfully fetched chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkBatch {
    pub chunk_id: ChunkId,
    /// Position in completion order; later batches win on duplicate timestamps.
    pub completion_seq: u64,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    Fetched(ChunkBatch),
    Failed(ChunkFailure),
}

impl ChunkOutcome {
    pub fn chunk_id(&self) -> ChunkId {
        match self {
            ChunkOutcome::Fetched(b) => b.chunk_id,
            ChunkOutcome::Failed(f) => f.chunk_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct AcquisitionReport {
    pub batches: Vec<ChunkBatch>,
    pub failures: Vec<ChunkFailure>,
}

impl AcquisitionReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.batches.iter().map(|b| b.records.len()).sum()
    }
}

/// Append-only outcome log shared by concurrent chunk tasks.
#[derive(Default)]
struct ResultCollector {
    outcomes: Mutex<Vec<ChunkOutcome>>,
}

impl ResultCollector {
    async fn push_batch(&self, chunk_id: ChunkId, records: Vec<RawRecord>, seq_base: u64) {
        let mut outcomes = self.outcomes.lock().await;
        let completion_seq = seq_base + outcomes.len() as u64;
        outcomes.push(ChunkOutcome::Fetched(ChunkBatch {
            chunk_id,
            completion_seq,
            records,
        }));
    }

    async fn push_failure(&self, failure: ChunkFailure) {
        self.outcomes.lock().await.push(ChunkOutcome::Failed(failure));
    }

    async fn into_outcomes(self: Arc<Self>) -> Vec<ChunkOutcome> {
        match Arc::try_unwrap(self) {
            Ok(collector) => collector.outcomes.into_inner(),
            Err(shared) => shared.outcomes.lock().await.clone(),
        }
    }
}

pub struct AcquisitionEngine {
    source: Arc<dyn DataSource>,
    concurrency: ConcurrencyPolicy,
    retry: RetryPolicy,
    seq_base: u64,
}

impl AcquisitionEngine {
    pub fn new(source: Arc<dyn DataSource>, concurrency: ConcurrencyPolicy, retry: RetryPolicy) -> Self {
        Self {
            source,
            concurrency,
            retry,
            seq_base: 0,
        }
    }

    /// Offset added to completion sequence numbers, so batches from a resumed
    /// run order after previously cached ones.
    pub fn with_sequence_base(mut self, seq_base: u64) -> Self {
        self.seq_base = seq_base;
        self
    }

    /// Fetch every chunk, collecting successes and permanent failures.
    ///
    /// A single chunk's failure never aborts the run. Once `cancel` turns
    /// true no new attempts start; in-flight attempts finish and chunks that
    /// were never dispatched are reported as cancelled.
    pub async fn run(
        &self,
        location: Location,
        chunks: &[ChunkSpec],
        mut cancel: watch::Receiver<bool>,
    ) -> AcquisitionReport {
        let workers = self.concurrency.effective_workers();
        info!(
            "Acquiring {} chunk(s) with {} worker(s) ({:?} mode)",
            chunks.len(),
            workers,
            self.concurrency.mode
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let collector = Arc::new(ResultCollector::default());
        let mut tasks = JoinSet::new();
        let mut dispatched: BTreeSet<ChunkId> = BTreeSet::new();

        for (index, chunk) in chunks.iter().enumerate() {
            if *cancel.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_cancel(&mut cancel) => break,
            };

            if self.concurrency.mode == DispatchMode::Sequential
                && index > 0
                && !self.concurrency.inter_request_delay.is_zero()
            {
                tokio::select! {
                    _ = tokio::time::sleep(self.concurrency.inter_request_delay) => {}
                    _ = wait_for_cancel(&mut cancel) => break,
                }
            }

            dispatched.insert(chunk.id);

            let source = Arc::clone(&self.source);
            let collector = Arc::clone(&collector);
            let retry = self.retry.clone();
            let chunk = chunk.clone();
            let cancel = cancel.clone();
            let seq_base = self.seq_base;

            tasks.spawn(async move {
                let _permit = permit;
                match fetch_with_retry(source.as_ref(), location, &chunk, &retry, cancel).await {
                    Ok(records) => {
                        debug!("{}: fetched {} records", chunk.id, records.len());
                        collector.push_batch(chunk.id, records, seq_base).await;
                    }
                    Err(failure) => {
                        error!(
                            "{}: permanently failed after {} attempt(s) ({:?}): {}",
                            failure.chunk_id,
                            failure.attempt_count,
                            failure.last_error_kind,
                            failure.message
                        );
                        collector.push_failure(failure).await;
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Chunk task ended abnormally: {}", e);
            }
        }

        let outcomes = collector.into_outcomes().await;
        let mut report = AcquisitionReport::default();
        let mut reported: BTreeSet<ChunkId> = BTreeSet::new();

        for outcome in outcomes {
            reported.insert(outcome.chunk_id());
            match outcome {
                ChunkOutcome::Fetched(batch) => report.batches.push(batch),
                ChunkOutcome::Failed(failure) => report.failures.push(failure),
            }
        }

        for chunk in chunks {
            if reported.contains(&chunk.id) {
                continue;
            }
            let failure = if dispatched.contains(&chunk.id) {
                ChunkFailure {
                    chunk_id: chunk.id,
                    attempt_count: 0,
                    last_error_kind: FailureKind::Fatal,
                    message: "chunk task aborted".to_string(),
                }
            } else {
                ChunkFailure {
                    chunk_id: chunk.id,
                    attempt_count: 0,
                    last_error_kind: FailureKind::Cancelled,
                    message: "not dispatched before cancellation".to_string(),
                }
            };
            report.failures.push(failure);
        }

        report.failures.sort_by_key(|f| f.chunk_id);

        if report.is_complete() {
            info!(
                "Acquisition complete: {} chunk(s), {} records",
                report.batches.len(),
                report.record_count()
            );
        } else {
            warn!(
                "Acquisition finished with {} failed chunk(s) out of {}",
                report.failures.len(),
                chunks.len()
            );
        }

        report
    }
}

/// Fetch one chunk, backing off after retryable failures.
async fn fetch_with_retry(
    source: &dyn DataSource,
    location: Location,
    chunk: &ChunkSpec,
    retry: &RetryPolicy,
    mut cancel: watch::Receiver<bool>,
) -> Result<Vec<RawRecord>, ChunkFailure> {
    let max_attempts = retry.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match source.fetch(location, chunk.range, &chunk.variables).await {
            Ok(records) => return Ok(records),
            Err(err) => err,
        };

        let failure = |message: String| ChunkFailure {
            chunk_id: chunk.id,
            attempt_count: attempt,
            last_error_kind: err.kind.into(),
            message,
        };

        if !err.kind.is_retryable() {
            return Err(failure(err.message.clone()));
        }

        let delay = retry.delay_after(attempt);
        warn!(
            "{}: attempt {}/{} failed: {}. Backing off {:?}...",
            chunk.id, attempt, max_attempts, err, delay
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_cancel(&mut cancel) => {
                return Err(failure(format!("cancelled during backoff: {}", err.message)));
            }
        }

        if attempt >= max_attempts {
            return Err(failure(err.message.clone()));
        }
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    // A dropped sender means nobody can cancel any more
    let closed = cancel.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_schedule() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts(), 3);
        assert_eq!(retry.delay_after(1), Duration::from_secs(30));
        assert_eq!(retry.delay_after(2), Duration::from_secs(60));
        assert_eq!(retry.delay_after(3), Duration::from_secs(120));
        assert_eq!(retry.delay_after(9), Duration::from_secs(120));
    }

    #[test]
    fn test_sequential_forces_single_worker() {
        let mut policy = ConcurrencyPolicy::sequential(Duration::from_secs(2));
        policy.worker_count = 6;
        assert_eq!(policy.effective_workers(), 1);
        assert_eq!(ConcurrencyPolicy::concurrent(6).effective_workers(), 6);
    }

    #[test]
    fn test_failure_kind_from_fetch_kind() {
        assert_eq!(
            FailureKind::from(FetchErrorKind::RateLimited),
            FailureKind::RateLimited
        );
        assert_eq!(FailureKind::from(FetchErrorKind::Fatal), FailureKind::Fatal);
    }
}
