//! Shared types passed between the pipeline, dispatcher, forwarder and
//! assembler, and persisted by the record store.

use crate::identity::Identity;
use crate::imaging::OperationSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single-shot processing job. Consumed by exactly one pipeline run.
#[derive(Debug, Clone)]
pub struct Job {
    pub source_key: String,
    pub operations: OperationSet,
    pub requested_by: Identity,
}

/// A local stress run over every available core.
#[derive(Debug, Clone)]
pub struct StressJob {
    pub source_key: String,
    pub duration_seconds: u64,
    pub requested_by: Identity,
}

/// What one stress unit reports after it has been joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_index: usize,
    /// Key of the persisted final image; `None` when the unit failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    pub iteration_count: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Metadata for one produced output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub input: String,
    pub output: String,
    pub user: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Job-specific fields such as `cores_used` or `iterations`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ResultRecord {
    pub fn new(input: impl Into<String>, output: impl Into<String>, user: &Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.into(),
            output: output.into(),
            user: user.username.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Metadata for one uploaded source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub filename: String,
    /// `"WxH"`.
    pub resolution: String,
    pub size_bytes: u64,
    pub user: String,
    pub timestamp: i64,
}

impl UploadRecord {
    pub fn new(filename: impl Into<String>, resolution: String, size_bytes: u64, user: &Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            resolution,
            size_bytes,
            user: user.username.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Outcome of one worker health probe. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub reachable: bool,
    pub reported_state: String,
}

impl HealthStatus {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            reachable: false,
            reported_state: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use serde_json::json;

    #[test]
    fn result_record_flattens_extra() {
        let who = Identity::new("alice", Role::User);
        let record = ResultRecord::new("in.png", "out.png", &who)
            .with_extra("cores_used", 8)
            .with_extra("iterations", 120);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["user"], "alice");
        assert_eq!(value["cores_used"], 8);
        assert_eq!(value["iterations"], 120);

        let back: ResultRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn records_get_distinct_ids() {
        let who = Identity::new("alice", Role::User);
        let a = ResultRecord::new("in.png", "a.png", &who);
        let b = ResultRecord::new("in.png", "b.png", &who);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn worker_result_omits_empty_fields() {
        let ok = WorkerResult {
            worker_index: 0,
            output_key: Some("k.png".into()),
            iteration_count: 3,
            elapsed_ms: 10,
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"worker_index": 0, "output_key": "k.png", "iteration_count": 3, "elapsed_ms": 10})
        );
        assert!(!ok.failed());
    }
}
