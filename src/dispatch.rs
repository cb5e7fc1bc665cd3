//! Worker pool dispatcher: the local CPU stress harness.
//!
//! A dispatch forks N execution units onto a dedicated rayon pool sized to
//! exactly N threads, so every unit runs in parallel from the start, and then
//! joins them all. Units never talk to each other:
//!
//! - each unit opens its **own** copy of the source through a [`UnitSource`]
//! - each unit writes its result into its own slot of the result vector,
//!   so there is no shared lock, counter, or queue during the run
//! - each unit checks the budget itself; the join has no timeout of its own
//!
//! ```text
//! dispatch ──┬── unit 0: open → step → step → … → persist ──┐
//!            ├── unit 1: open → step → step → … → persist ──┤
//!            └── unit N: open → step → … → persist ─────────┴── join → report
//! ```
//!
//! Every unit runs at least one iteration, even when the deadline has already
//! passed by the time it starts. A unit that fails (open error, transform
//! error, persist error, or panic) is reported with its error string; its
//! siblings carry on.
//!
//! There is no cancellation. Once started, a dispatch runs until every unit
//! has reached its budget.

use crate::imaging::codec::{self, CodecError};
use crate::imaging::{Mutation, OperationSet, TransformBackend, TransformError, pipeline};
use crate::types::WorkerResult;
use image::DynamicImage;
use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Worker count must be at least 1")]
    NoWorkers,
    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Why a single unit failed. Reported per unit, never raised from a dispatch.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("failed to open source: {0}")]
    Open(String),
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("failed to persist result: {0}")]
    Persist(String),
    #[error("unit panicked: {0}")]
    Panicked(String),
}

impl From<CodecError> for UnitError {
    fn from(e: CodecError) -> Self {
        UnitError::Open(e.to_string())
    }
}

/// Hands each unit its private copy of the source image.
pub trait UnitSource: Sync {
    fn open(&self, worker_index: usize) -> Result<DynamicImage, UnitError>;
}

impl<F> UnitSource for F
where
    F: Fn(usize) -> Result<DynamicImage, UnitError> + Sync,
{
    fn open(&self, worker_index: usize) -> Result<DynamicImage, UnitError> {
        self(worker_index)
    }
}

/// Decodes a fresh image from encoded bytes for every unit.
pub struct EncodedSource<'a> {
    bytes: &'a [u8],
}

impl<'a> EncodedSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl UnitSource for EncodedSource<'_> {
    fn open(&self, _worker_index: usize) -> Result<DynamicImage, UnitError> {
        Ok(codec::decode(self.bytes)?)
    }
}

/// Persists a unit's final image and returns its output key. Called from the
/// unit's own thread.
pub trait UnitSink: Sync {
    fn persist(&self, worker_index: usize, image: &DynamicImage) -> Result<String, UnitError>;
}

impl<F> UnitSink for F
where
    F: Fn(usize, &DynamicImage) -> Result<String, UnitError> + Sync,
{
    fn persist(&self, worker_index: usize, image: &DynamicImage) -> Result<String, UnitError> {
        self(worker_index, image)
    }
}

/// What each unit does per iteration.
#[derive(Debug, Clone)]
pub enum StressWorkload {
    /// Non-expanding rotate, blur, mirror.
    Mutation(Mutation),
    /// The whole single-shot pipeline, over and over. Each iteration starts
    /// again from the unit's source copy.
    RepeatedPipeline(OperationSet),
}

impl StressWorkload {
    /// Repeat `ops` with every rotate kept to the source canvas.
    pub fn repeated(ops: &OperationSet) -> Self {
        StressWorkload::RepeatedPipeline(ops.without_expansion())
    }

    fn step(
        &self,
        backend: &impl TransformBackend,
        source: &DynamicImage,
        image: DynamicImage,
    ) -> Result<DynamicImage, TransformError> {
        match self {
            StressWorkload::Mutation(mutation) => {
                mutation
                    .operations()
                    .iter()
                    .try_fold(image, |img, op| backend.apply(&img, op))
            }
            StressWorkload::RepeatedPipeline(ops) => pipeline::run(backend, source, ops),
        }
    }
}

impl Default for StressWorkload {
    fn default() -> Self {
        StressWorkload::Mutation(Mutation::default())
    }
}

/// How long units keep looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Wall-clock window, measured from dispatch.
    Deadline(Duration),
    /// Fixed number of iterations per unit.
    Iterations(u64),
}

/// Budget resolved against the dispatch start.
#[derive(Clone, Copy)]
enum Limit {
    Until(Instant),
    Count(u64),
}

impl Limit {
    fn reached(self, iterations: u64) -> bool {
        match self {
            Limit::Until(deadline) => Instant::now() >= deadline,
            Limit::Count(n) => iterations >= n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub worker_count: usize,
    pub total_elapsed: Duration,
    /// One entry per unit, ordered by worker index.
    pub results: Vec<WorkerResult>,
}

impl DispatchReport {
    pub fn failed_units(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|r| r.failed())
            .map(|r| r.worker_index)
            .collect()
    }

    pub fn total_iterations(&self) -> u64 {
        self.results.iter().map(|r| r.iteration_count).sum()
    }
}

/// Number of parallel execution contexts on this host.
pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

pub struct Dispatcher<B> {
    backend: B,
    worker_count: usize,
}

impl<B: TransformBackend> Dispatcher<B> {
    pub fn new(backend: B, worker_count: usize) -> Self {
        Self {
            backend,
            worker_count,
        }
    }

    /// One unit per available core.
    pub fn per_core(backend: B) -> Self {
        Self::new(backend, available_workers())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Fork all units, block until every one has finished, and report.
    pub fn run(
        &self,
        source: &dyn UnitSource,
        sink: &dyn UnitSink,
        workload: &StressWorkload,
        budget: Budget,
    ) -> Result<DispatchReport, DispatchError> {
        if self.worker_count == 0 {
            return Err(DispatchError::NoWorkers);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_count)
            .thread_name(|i| format!("pixelmill-unit-{i}"))
            .build()?;

        let started = Instant::now();
        let limit = match budget {
            Budget::Deadline(window) => Limit::Until(started + window),
            Budget::Iterations(n) => Limit::Count(n),
        };
        info!(workers = self.worker_count, ?budget, "dispatching stress units");

        let mut slots: Vec<Option<WorkerResult>> = vec![None; self.worker_count];
        pool.scope(|scope| {
            for (index, slot) in slots.iter_mut().enumerate() {
                scope.spawn(move |_| {
                    *slot = Some(self.run_unit(index, source, sink, workload, limit));
                });
            }
        });

        let results: Vec<WorkerResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| WorkerResult {
                    worker_index: index,
                    output_key: None,
                    iteration_count: 0,
                    elapsed_ms: 0,
                    error: Some("unit did not report".into()),
                })
            })
            .collect();

        let report = DispatchReport {
            worker_count: self.worker_count,
            total_elapsed: started.elapsed(),
            results,
        };
        info!(
            workers = report.worker_count,
            iterations = report.total_iterations(),
            failed = report.failed_units().len(),
            elapsed_ms = report.total_elapsed.as_millis() as u64,
            "stress units joined"
        );
        Ok(report)
    }

    fn run_unit(
        &self,
        index: usize,
        source: &dyn UnitSource,
        sink: &dyn UnitSink,
        workload: &StressWorkload,
        limit: Limit,
    ) -> WorkerResult {
        let started = Instant::now();
        let mut iterations = 0u64;
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<String, UnitError> {
            let original = source.open(index)?;
            let mut image = original.clone();
            loop {
                image = workload.step(&self.backend, &original, image)?;
                iterations += 1;
                if limit.reached(iterations) {
                    break;
                }
            }
            sink.persist(index, &image)
        }));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (output_key, error) = match outcome {
            Ok(Ok(key)) => (Some(key), None),
            Ok(Err(e)) => (None, Some(e)),
            Err(payload) => (None, Some(UnitError::Panicked(panic_message(&*payload)))),
        };
        match &error {
            Some(e) => warn!(unit = index, iterations, error = %e, "stress unit failed"),
            None => debug!(unit = index, iterations, elapsed_ms, "stress unit done"),
        }
        WorkerResult {
            worker_index: index,
            output_key,
            iteration_count: iterations,
            elapsed_ms,
            error: error.map(|e| e.to_string()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
