//! Result assembly: output naming and metadata records.
//!
//! Output keys look like `{stem}_{tag}_{unix-millis}_{random}.{ext}`, e.g.
//! `cat_processed_1718000000000_9f0c…e1.png`. The random part is a full v4
//! UUID, so keys minted concurrently for the same input never collide and no
//! shared counter is needed.

use crate::dispatch::DispatchReport;
use crate::types::{Job, ResultRecord, StressJob};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

const DEFAULT_EXT: &str = "png";

/// Fresh, collision-free output key derived from `input`.
///
/// Keeps the input's extension so the result keeps its format.
pub fn output_key(input: &str, tag: &str) -> String {
    let path = Path::new(input);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXT.to_string());
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{stem}_{tag}_{millis}_{}.{ext}", Uuid::new_v4().simple())
}

/// The one record of a single-shot job.
pub fn single_record(job: &Job, output: &str) -> ResultRecord {
    ResultRecord::new(&job.source_key, output, &job.requested_by)
        .with_extra("operations", job.operations.to_json())
}

/// Aggregate counters of a local stress run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StressAggregate {
    pub cores_used: usize,
    pub total_iterations: u64,
    /// Indices of units that reported an error.
    pub failed_units: Vec<usize>,
}

/// One record per successful unit, plus the aggregate.
///
/// Failed units produce no record; they show up in the aggregate.
pub fn stress_records(job: &StressJob, report: &DispatchReport) -> (Vec<ResultRecord>, StressAggregate) {
    let records = report
        .results
        .iter()
        .filter_map(|unit| {
            let output = unit.output_key.as_deref()?;
            Some(
                ResultRecord::new(&job.source_key, output, &job.requested_by)
                    .with_extra("cores_used", report.worker_count)
                    .with_extra("worker_index", unit.worker_index)
                    .with_extra("iterations", unit.iteration_count)
                    .with_extra("duration_seconds", job.duration_seconds),
            )
        })
        .collect();
    let aggregate = StressAggregate {
        cores_used: report.worker_count,
        total_iterations: report.total_iterations(),
        failed_units: report.failed_units(),
    };
    (records, aggregate)
}
