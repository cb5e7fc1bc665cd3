//! CLI output formatting for every service operation.
//!
//! # Information-First Display
//!
//! Each entity leads with what it *is* (an output key, an upload name, a unit
//! index) and follows with indented context lines. Lists use 3-digit
//! positional indices so long listings stay aligned.
//!
//! # Output Format
//!
//! ## Process
//!
//! ```text
//! Processed cat.png → cat_processed_1718000000000_9f0c….png
//!     Operations: rotate, grayscale
//!     Record: 0b6f…
//! ```
//!
//! ## Stress
//!
//! ```text
//! Stress test completed: 4 units, 1288 iterations in 2.00s
//!     000 cat_stress0_….png (322 iterations)
//!     001 FAILED: failed to open source: … (0 iterations)
//! ```
//!
//! ## Results
//!
//! ```text
//! Results (2)
//! 001 cat_processed_….png
//!     Input: cat.png
//!     Owner: alice, 2024-06-10 08:00:00 UTC
//! ```
//!
//! # Architecture
//!
//! Each operation has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::forward::{Forwarded, StressSummary};
use crate::imaging::OperationSet;
use crate::service::{ProcessResponse, ServiceError, StressResponse};
use crate::types::{HealthStatus, ResultRecord, UploadRecord};

// ============================================================================
// Shared display helpers
// ============================================================================

/// Format a 0- or 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn format_bytes(n: u64) -> String {
    const KIB: f64 = 1024.0;
    let n = n as f64;
    if n < KIB {
        format!("{} B", n)
    } else if n < KIB * KIB {
        format!("{:.1} KiB", n / KIB)
    } else {
        format!("{:.1} MiB", n / (KIB * KIB))
    }
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Operation names of a stored record, in canonical order.
fn operation_names(record: &ResultRecord) -> Option<String> {
    let ops = OperationSet::from_json(record.extra.get("operations")?).ok()?;
    if ops.is_empty() {
        return Some("none".into());
    }
    Some(
        ops.kinds()
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

// ============================================================================
// Uploads
// ============================================================================

pub fn format_upload(record: &UploadRecord) -> Vec<String> {
    vec![
        format!("Uploaded {}", record.filename),
        format!("{}Resolution: {}", indent(1), record.resolution),
        format!("{}Size: {}", indent(1), format_bytes(record.size_bytes)),
        format!("{}Owner: {}", indent(1), record.user),
    ]
}

pub fn print_upload(record: &UploadRecord) {
    print_lines(format_upload(record));
}

pub fn format_uploads(records: &[UploadRecord]) -> Vec<String> {
    if records.is_empty() {
        return vec!["No uploads".to_string()];
    }
    let mut lines = vec![format!("Uploads ({})", records.len())];
    for (i, r) in records.iter().enumerate() {
        lines.push(format!("{} {} ({})", format_index(i + 1), r.filename, r.resolution));
        lines.push(format!(
            "{}Owner: {}, {}",
            indent(1),
            r.user,
            format_timestamp(r.timestamp)
        ));
    }
    lines
}

pub fn print_uploads(records: &[UploadRecord]) {
    print_lines(format_uploads(records));
}

// ============================================================================
// Processing
// ============================================================================

pub fn format_process(resp: &ProcessResponse) -> Vec<String> {
    let mut lines = vec![format!(
        "Processed {} → {}",
        resp.metadata.input, resp.result
    )];
    if let Some(ops) = operation_names(&resp.metadata) {
        lines.push(format!("{}Operations: {}", indent(1), ops));
    }
    lines.push(format!("{}Record: {}", indent(1), resp.metadata.id));
    lines
}

pub fn print_process(resp: &ProcessResponse) {
    print_lines(format_process(resp));
}

pub fn format_stress(resp: &StressResponse) -> Vec<String> {
    let mut lines = vec![format!(
        "{}: {} units, {} iterations in {:.2}s",
        resp.message,
        resp.cores_used,
        resp.total_iterations,
        resp.elapsed_ms as f64 / 1000.0
    )];
    for unit in &resp.units {
        let what = match (&unit.output_key, &unit.error) {
            (_, Some(err)) => format!("FAILED: {}", err),
            (Some(key), None) => key.clone(),
            (None, None) => "(no output)".to_string(),
        };
        lines.push(format!(
            "{}{} {} ({} iterations)",
            indent(1),
            format_index(unit.worker_index),
            what,
            unit.iteration_count
        ));
    }
    if !resp.failed_units.is_empty() {
        lines.push(format!(
            "{} of {} units failed",
            resp.failed_units.len(),
            resp.cores_used
        ));
    }
    lines
}

pub fn print_stress(resp: &StressResponse) {
    print_lines(format_stress(resp));
}

// ============================================================================
// Remote worker
// ============================================================================

pub fn format_remote_stress(summary: &StressSummary) -> Vec<String> {
    vec![
        format!(
            "Remote stress: {} requests in {}s",
            summary.requests_sent, summary.duration
        ),
        format!("{}Successes: {}", indent(1), summary.successes),
        format!("{}Failures: {}", indent(1), summary.failures),
    ]
}

pub fn print_remote_stress(summary: &StressSummary) {
    print_lines(format_remote_stress(summary));
}

pub fn format_forwarded(resp: &Forwarded) -> Vec<String> {
    let body = match &resp.body {
        serde_json::Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    let mut lines = vec![format!("Worker responded {}", resp.status)];
    lines.extend(body.lines().map(|l| format!("{}{}", indent(1), l)));
    lines
}

pub fn print_forwarded(resp: &Forwarded) {
    print_lines(format_forwarded(resp));
}

pub fn format_health(health: &HealthStatus) -> Vec<String> {
    let verdict = if health.reachable { "healthy" } else { "unhealthy" };
    vec![format!("Worker {}: {}", verdict, health.reported_state)]
}

pub fn print_health(health: &HealthStatus) {
    print_lines(format_health(health));
}

// ============================================================================
// Results
// ============================================================================

pub fn format_results(records: &[ResultRecord]) -> Vec<String> {
    if records.is_empty() {
        return vec!["No results".to_string()];
    }
    let mut lines = vec![format!("Results ({})", records.len())];
    for (i, r) in records.iter().enumerate() {
        lines.push(format!("{} {}", format_index(i + 1), r.output));
        lines.push(format!("{}Input: {}", indent(1), r.input));
        if let Some(ops) = operation_names(r) {
            lines.push(format!("{}Operations: {}", indent(1), ops));
        }
        if let Some(iterations) = r.extra.get("iterations") {
            lines.push(format!("{}Iterations: {}", indent(1), iterations));
        }
        lines.push(format!(
            "{}Owner: {}, {}",
            indent(1),
            r.user,
            format_timestamp(r.timestamp)
        ));
    }
    lines
}

pub fn print_results(records: &[ResultRecord]) {
    print_lines(format_results(records));
}

// ============================================================================
// Errors
// ============================================================================

pub fn format_error(err: &ServiceError) -> String {
    format!("Error ({} {}): {}", err.status(), err.kind(), err)
}
