mod common;

use async_trait::async_trait;
use chrono::NaiveDate;
use common::SyntheticSource;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tmy_builder::acquisition::{
    AcquisitionEngine, ConcurrencyPolicy, FailureKind, RetryPolicy,
};
use tmy_builder::fetcher::{DataSource, FetchError, FetchErrorKind};
use tmy_builder::models::{Location, RawRecord, TimeRange};
use tmy_builder::plan::{ChunkId, ChunkSpec, Chunking, RequestPlan};
use tmy_builder::variables::ProviderVariable;
use tokio::sync::watch;
use tokio::time::Instant;

fn location() -> Location {
    Location {
        latitude: 40.7,
        longitude: -74.0,
    }
}

/// Monthly chunks for January through `last_month` of 2010.
fn monthly_chunks(last_month: u32) -> Vec<ChunkSpec> {
    let end = NaiveDate::from_ymd_opt(2010, last_month + 1, 1)
        .unwrap()
        .pred_opt()
        .unwrap();
    RequestPlan::build(
        location(),
        NaiveDate::from_ymd_opt(2010, 1, 1).unwrap(),
        end,
        &[ProviderVariable::Temperature2m],
        Chunking::Monthly,
    )
    .unwrap()
    .chunks()
    .to_vec()
}

fn never_cancelled() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the whole test
    std::mem::forget(tx);
    rx
}

/// A rate-limited chunk is retried after 30s and 60s, then given up after
/// the final 120s wait, while the other chunks complete.
#[tokio::test(start_paused = true)]
async fn test_rate_limited_chunk_follows_backoff_schedule() {
    let chunks = monthly_chunks(4);
    let source = Arc::new(SyntheticSource::new());
    source.fail_chunk_starting(chunks[2].range.start, FetchErrorKind::RateLimited);

    let engine = AcquisitionEngine::new(
        source.clone(),
        ConcurrencyPolicy::concurrent(4),
        RetryPolicy::default(),
    );

    let started = Instant::now();
    let report = engine.run(location(), &chunks, never_cancelled()).await;
    let elapsed = started.elapsed();

    let times = source.call_times(chunks[2].range.start);
    assert_eq!(times.len(), 3);
    assert_eq!(times[1] - times[0], Duration::from_secs(30));
    assert_eq!(times[2] - times[1], Duration::from_secs(60));
    assert_eq!(elapsed, Duration::from_secs(210));

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.chunk_id, ChunkId(3));
    assert_eq!(failure.attempt_count, 3);
    assert_eq!(failure.last_error_kind, FailureKind::RateLimited);

    let fetched: BTreeSet<ChunkId> = report.batches.iter().map(|b| b.chunk_id).collect();
    assert_eq!(fetched, BTreeSet::from([ChunkId(1), ChunkId(2), ChunkId(4)]));
    assert!(!report.is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_transient_exhaustion_reports_three_attempts() {
    let chunks = monthly_chunks(2);
    let source = Arc::new(SyntheticSource::new());
    source.fail_chunk_starting(chunks[0].range.start, FetchErrorKind::Transient);

    let engine = AcquisitionEngine::new(
        source.clone(),
        ConcurrencyPolicy::concurrent(2),
        RetryPolicy::default(),
    );
    let report = engine.run(location(), &chunks, never_cancelled()).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].attempt_count, 3);
    assert_eq!(report.failures[0].last_error_kind, FailureKind::Transient);
    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.batches[0].chunk_id, ChunkId(2));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_is_not_retried() {
    let chunks = monthly_chunks(3);
    let source = Arc::new(SyntheticSource::new());
    source.fail_chunk_starting(chunks[1].range.start, FetchErrorKind::Fatal);

    let engine = AcquisitionEngine::new(
        source.clone(),
        ConcurrencyPolicy::concurrent(3),
        RetryPolicy::default(),
    );

    let started = Instant::now();
    let report = engine.run(location(), &chunks, never_cancelled()).await;

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(source.calls(), 3);
    assert_eq!(report.failures[0].attempt_count, 1);
    assert_eq!(report.failures[0].last_error_kind, FailureKind::Fatal);
    assert_eq!(report.batches.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_mode_spaces_dispatches() {
    let chunks = monthly_chunks(3);
    let source = Arc::new(SyntheticSource::new());

    let engine = AcquisitionEngine::new(
        source.clone(),
        ConcurrencyPolicy::sequential(Duration::from_secs(5)),
        RetryPolicy::default(),
    );
    let report = engine.run(location(), &chunks, never_cancelled()).await;
    assert!(report.is_complete());

    let first = source.call_times(chunks[0].range.start)[0];
    let second = source.call_times(chunks[1].range.start)[0];
    let third = source.call_times(chunks[2].range.start)[0];
    assert_eq!(second - first, Duration::from_secs(5));
    assert_eq!(third - second, Duration::from_secs(5));

    let seqs: Vec<u64> = report.batches.iter().map(|b| b.completion_seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_dispatching() {
    let chunks = monthly_chunks(4);
    let source = Arc::new(SyntheticSource::new());
    let engine = AcquisitionEngine::new(
        source.clone(),
        ConcurrencyPolicy::sequential(Duration::from_secs(10)),
        RetryPolicy::default(),
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        let _ = tx.send(true);
    });

    let report = engine.run(location(), &chunks, rx).await;

    assert_eq!(source.calls(), 2);
    assert_eq!(report.batches.len(), 2);
    assert_eq!(report.failures.len(), 2);
    for failure in &report.failures {
        assert_eq!(failure.last_error_kind, FailureKind::Cancelled);
        assert_eq!(failure.attempt_count, 0);
    }
    assert_eq!(report.failures[0].chunk_id, ChunkId(3));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let chunks = monthly_chunks(1);
    let source = Arc::new(SyntheticSource::new());
    source.fail_chunk_starting(chunks[0].range.start, FetchErrorKind::RateLimited);
    let engine = AcquisitionEngine::new(
        source.clone(),
        ConcurrencyPolicy::concurrent(1),
        RetryPolicy::default(),
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(40)).await;
        let _ = tx.send(true);
    });

    let report = engine.run(location(), &chunks, rx).await;

    assert_eq!(source.calls(), 2);
    assert_eq!(report.failures[0].attempt_count, 2);
    assert_eq!(report.failures[0].last_error_kind, FailureKind::RateLimited);
}

/// Source that takes a second per request and tracks peak concurrency.
#[derive(Default)]
struct SlowSource {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl DataSource for SlowSource {
    async fn fetch(
        &self,
        _location: Location,
        range: TimeRange,
        variables: &[ProviderVariable],
    ) -> Result<Vec<RawRecord>, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![common::synthetic_record(range.start, variables)])
    }
}

#[tokio::test(start_paused = true)]
async fn test_worker_count_bounds_concurrency() {
    let chunks = monthly_chunks(6);
    let source = Arc::new(SlowSource::default());
    let engine = AcquisitionEngine::new(
        source.clone(),
        ConcurrencyPolicy::concurrent(2),
        RetryPolicy::default(),
    )
    .with_sequence_base(10);

    let started = Instant::now();
    let report = engine.run(location(), &chunks, never_cancelled()).await;

    assert!(report.is_complete());
    assert_eq!(source.peak.load(Ordering::SeqCst), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    let mut seqs: Vec<u64> = report.batches.iter().map(|b| b.completion_seq).collect();
    seqs.sort();
    assert_eq!(seqs, (10..16).collect::<Vec<_>>());
}
