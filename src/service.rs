//! Caller-facing service operations.
//!
//! Everything a front end needs, without the front end: each operation takes
//! a parsed JSON request (or plain arguments), resolves the caller through the
//! [`IdentityProvider`], and returns a serializable response or a
//! [`ServiceError`] that knows its HTTP status.
//!
//! | Operation | Path through the crate |
//! |---|---|
//! | [`Service::upload`] | codec identify → uploads blob + [`UploadRecord`] |
//! | [`Service::process`] | [`pipeline::run`] → results blob + [`ResultRecord`] |
//! | [`Service::stress`] | [`Dispatcher`] → one blob + record per unit |
//! | [`Service::stress_remote`] | health check → [`RemoteForwarder::forward_stress`] |
//! | [`Service::forward`] | [`RemoteForwarder::forward`] to `/process` |
//! | results / uploads | [`RecordStore::list_visible`] and friends |
//!
//! Requests are validated here, once. Unknown fields, a missing filename and
//! malformed operations are all `InvalidInput` before any image is touched.

use crate::assemble::{self, StressAggregate};
use crate::config::{self, ServiceConfig, StorageConfig};
use crate::dispatch::{Budget, Dispatcher, EncodedSource, StressWorkload, UnitError};
use crate::forward::{
    ForwardError, Forwarded, PROCESS_PATH, RemoteForwarder, STRESS_PATH, StressSummary,
};
use crate::identity::{Identity, IdentityProvider};
use crate::imaging::codec::{self, CodecError};
use crate::imaging::{OperationSet, TransformBackend, TransformError, pipeline};
use crate::store::{
    BlobStore, FsBlobStore, JsonRecordStore, MemoryBlobStore, MemoryRecordStore, RecordStore,
    StoreError,
};
use crate::types::{HealthStatus, Job, ResultRecord, StressJob, UploadRecord, WorkerResult};
use image::DynamicImage;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Stress window used when a request names none.
pub const DEFAULT_STRESS_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Authentication required")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Transform failed: {0}")]
    TransformFailure(TransformError),
    #[error("Source image '{0}' could not be decoded")]
    SourceUnreadable(String),
    #[error("Worker service unreachable")]
    WorkerUnreachable { status: u16 },
    #[error("Remote worker not configured")]
    WorkerNotConfigured,
    #[error("Storage error")]
    Storage(#[source] StoreError),
    #[error("Internal error")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::InvalidInput(_) => 400,
            ServiceError::Unauthenticated => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::TransformFailure(_) | ServiceError::SourceUnreadable(_) => 500,
            ServiceError::WorkerUnreachable { status } => *status,
            ServiceError::WorkerNotConfigured => 503,
            ServiceError::Storage(_) | ServiceError::Internal(_) => 500,
        }
    }

    /// Machine-checkable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "invalid_input",
            ServiceError::Unauthenticated => "unauthenticated",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::TransformFailure(_) => "transform_failure",
            ServiceError::SourceUnreadable(_) => "source_unreadable",
            ServiceError::WorkerUnreachable { .. } | ServiceError::WorkerNotConfigured => {
                "worker_unreachable"
            }
            ServiceError::Storage(_) => "storage",
            ServiceError::Internal(_) => "internal",
        }
    }

    /// `{"error": message, "kind": kind}`. Never carries store or transport detail.
    pub fn body(&self) -> Value {
        json!({"error": self.to_string(), "kind": self.kind()})
    }

    fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidInput(message.into())
    }

    fn from_forward(e: ForwardError, status: u16) -> Self {
        match e {
            ForwardError::Client(inner) => {
                error!(error = %inner, "HTTP client unavailable");
                ServiceError::Internal(inner.to_string())
            }
            other => {
                warn!(error = ?other, "forwarding failed");
                ServiceError::WorkerUnreachable { status }
            }
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => ServiceError::NotFound(format!("Not found: {key}")),
            StoreError::InvalidKey(key) => ServiceError::InvalidInput(format!("Invalid name: {key}")),
            other => {
                error!(error = %other, "storage failure");
                ServiceError::Storage(other)
            }
        }
    }
}

// =============================================================================
// Requests and responses
// =============================================================================

/// `{filename, operations}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    pub filename: String,
    pub operations: OperationSet,
}

impl ProcessRequest {
    pub fn from_json(value: &Value) -> Result<Self, ServiceError> {
        let fields = object(value, &["filename", "operations"])?;
        Ok(Self {
            filename: filename(fields)?,
            operations: parse_operations(fields.get("operations"))?,
        })
    }
}

/// `{filename, duration?, workers?, operations?}`. `duration_seconds` is
/// accepted for `duration`. With `operations`, each unit repeats that
/// pipeline instead of the stock mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct StressRequest {
    pub filename: String,
    pub duration: u64,
    pub workers: Option<usize>,
    pub operations: Option<OperationSet>,
}

impl StressRequest {
    pub fn from_json(value: &Value) -> Result<Self, ServiceError> {
        let fields = object(
            value,
            &["filename", "duration", "duration_seconds", "workers", "operations"],
        )?;
        let workers = match fields.get("workers") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(n) if n >= 1 => Some(n as usize),
                _ => return Err(ServiceError::invalid("workers must be a positive integer")),
            },
        };
        let operations = match fields.get("operations") {
            None | Some(Value::Null) => None,
            some => Some(parse_operations(some)?).filter(|ops| !ops.is_empty()),
        };
        Ok(Self {
            filename: filename(fields)?,
            duration: duration(fields)?,
            workers,
            operations,
        })
    }
}

/// `{filename, duration?}` for the network stress loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStressRequest {
    pub filename: String,
    pub duration: u64,
}

impl RemoteStressRequest {
    pub fn from_json(value: &Value) -> Result<Self, ServiceError> {
        let fields = object(value, &["filename", "duration", "duration_seconds"])?;
        Ok(Self {
            filename: filename(fields)?,
            duration: duration(fields)?,
        })
    }
}

fn object<'a>(value: &'a Value, allowed: &[&str]) -> Result<&'a Map<String, Value>, ServiceError> {
    let fields = value
        .as_object()
        .ok_or_else(|| ServiceError::invalid("Request body must be a JSON object"))?;
    if let Some(key) = fields.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(ServiceError::invalid(format!("Unknown field '{key}'")));
    }
    Ok(fields)
}

fn filename(fields: &Map<String, Value>) -> Result<String, ServiceError> {
    match fields.get("filename") {
        Some(Value::String(name)) if !name.trim().is_empty() => Ok(name.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(ServiceError::invalid("Missing filename"))
        }
        Some(_) => Err(ServiceError::invalid("filename must be a string")),
    }
}

fn duration(fields: &Map<String, Value>) -> Result<u64, ServiceError> {
    let raw = match (fields.get("duration"), fields.get("duration_seconds")) {
        (Some(_), Some(_)) => {
            return Err(ServiceError::invalid(
                "Give either duration or duration_seconds, not both",
            ));
        }
        (Some(v), None) | (None, Some(v)) => v,
        (None, None) => return Ok(DEFAULT_STRESS_SECS),
    };
    match raw.as_u64() {
        Some(secs) if secs > 0 => Ok(secs),
        _ => Err(ServiceError::invalid(
            "duration must be a positive whole number of seconds",
        )),
    }
}

fn parse_operations(value: Option<&Value>) -> Result<OperationSet, ServiceError> {
    OperationSet::from_json(value.unwrap_or(&Value::Null))
        .map_err(|e| ServiceError::InvalidInput(e.to_string()))
}

/// Upload names are flat: no directories, no hidden files, known extension.
fn validate_upload_name(name: &str) -> Result<(), ServiceError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(ServiceError::invalid(format!("Invalid filename '{name}'")));
    }
    codec::format_for_key(name).map_err(|_| {
        let known: Vec<_> = codec::supported_extensions().collect();
        ServiceError::invalid(format!(
            "Unsupported file type '{name}' (expected one of: {})",
            known.join(", ")
        ))
    })?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub message: String,
    /// Output key of the processed image.
    pub result: String,
    pub metadata: ResultRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressResponse {
    pub message: String,
    pub cores_used: usize,
    /// Output keys of every unit that finished.
    pub results: Vec<String>,
    pub failed_units: Vec<usize>,
    pub total_iterations: u64,
    pub elapsed_ms: u64,
    pub units: Vec<WorkerResult>,
}

// =============================================================================
// Collaborators
// =============================================================================

/// The four stores the service writes to.
pub struct Stores {
    pub uploads: Box<dyn BlobStore>,
    pub results: Box<dyn BlobStore>,
    pub upload_records: Box<dyn RecordStore<UploadRecord>>,
    pub result_records: Box<dyn RecordStore<ResultRecord>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            uploads: Box::new(MemoryBlobStore::new()),
            results: Box::new(MemoryBlobStore::new()),
            upload_records: Box::new(MemoryRecordStore::new()),
            result_records: Box::new(MemoryRecordStore::new()),
        }
    }

    /// Filesystem stores under `storage.data_dir`.
    pub fn open(storage: &StorageConfig) -> Result<Self, StoreError> {
        Ok(Self {
            uploads: Box::new(FsBlobStore::open(storage.uploads_dir())?),
            results: Box::new(FsBlobStore::open(storage.results_dir())?),
            upload_records: Box::new(JsonRecordStore::open(storage.upload_records_path())?),
            result_records: Box::new(JsonRecordStore::open(storage.result_records_path())?),
        })
    }
}

pub struct Service<B> {
    backend: B,
    stores: Stores,
    identity: Box<dyn IdentityProvider>,
    config: ServiceConfig,
    forwarder: Option<RemoteForwarder>,
}

impl<B: TransformBackend> Service<B> {
    pub fn new(
        backend: B,
        stores: Stores,
        identity: Box<dyn IdentityProvider>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            backend,
            stores,
            identity,
            config,
            forwarder: None,
        }
    }

    pub fn with_forwarder(mut self, forwarder: RemoteForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Filesystem stores, plus a forwarder when `[worker] url` is set.
    pub fn from_config(
        backend: B,
        identity: Box<dyn IdentityProvider>,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        let stores = Stores::open(&config.storage)?;
        let forwarder = config
            .worker
            .forwarder_config()
            .map(RemoteForwarder::new)
            .transpose()
            .map_err(|e| ServiceError::from_forward(e, 500))?;
        let mut service = Self::new(backend, stores, identity, config);
        service.forwarder = forwarder;
        Ok(service)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn caller(&self) -> Result<Identity, ServiceError> {
        self.identity.current().ok_or(ServiceError::Unauthenticated)
    }

    fn forwarder(&self) -> Result<&RemoteForwarder, ServiceError> {
        self.forwarder.as_ref().ok_or(ServiceError::WorkerNotConfigured)
    }

    fn load_source(&self, filename: &str) -> Result<Vec<u8>, ServiceError> {
        match self.stores.uploads.get(filename) {
            Ok(bytes) => Ok(bytes),
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidKey(_)) => Err(
                ServiceError::NotFound(format!("Source image '{filename}' not found")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    fn encode_result(&self, image: &DynamicImage, key: &str) -> Result<Vec<u8>, CodecError> {
        codec::encode_for_key(image, key, self.config.images.quality())
    }

    // -------------------------------------------------------------------------
    // Uploads
    // -------------------------------------------------------------------------

    /// Store an uploaded image under its filename and record its metadata.
    ///
    /// Uploading the same name again replaces the bytes and the record.
    pub fn upload(&self, filename: &str, bytes: &[u8]) -> Result<UploadRecord, ServiceError> {
        let who = self.caller()?;
        validate_upload_name(filename)?;
        if bytes.is_empty() {
            return Err(ServiceError::invalid("Empty upload"));
        }
        if bytes.len() as u64 > self.config.images.max_upload_bytes {
            return Err(ServiceError::invalid(format!(
                "Upload exceeds {} bytes",
                self.config.images.max_upload_bytes
            )));
        }
        let dims = codec::identify(bytes)
            .map_err(|_| ServiceError::invalid(format!("'{filename}' is not a readable image")))?;

        self.stores.uploads.put(filename, bytes)?;
        if let Some(old) = self
            .stores
            .upload_records
            .find(&|r: &UploadRecord| r.filename == filename)?
        {
            self.stores.upload_records.delete(old.id)?;
        }
        let record = UploadRecord::new(filename, dims.resolution(), bytes.len() as u64, &who);
        self.stores.upload_records.put(record.clone())?;
        info!(user = %who.username, filename, resolution = %record.resolution, "upload stored");
        Ok(record)
    }

    pub fn list_uploads(&self) -> Result<Vec<UploadRecord>, ServiceError> {
        let who = self.caller()?;
        Ok(self.stores.upload_records.list_visible(&who)?)
    }

    /// Delete an upload the caller can see. Results derived from it stay.
    pub fn delete_upload(&self, filename: &str) -> Result<(), ServiceError> {
        let who = self.caller()?;
        let record = self
            .stores
            .upload_records
            .list_visible(&who)?
            .into_iter()
            .find(|r| r.filename == filename)
            .ok_or_else(|| ServiceError::NotFound(format!("Upload '{filename}' not found")))?;
        match self.stores.uploads.delete(filename) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.stores.upload_records.delete(record.id)?;
        info!(user = %who.username, filename, "upload deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Single-shot processing
    // -------------------------------------------------------------------------

    /// Run the requested operations once over an uploaded image.
    pub fn process(&self, request: &Value) -> Result<ProcessResponse, ServiceError> {
        let who = self.caller()?;
        let request = ProcessRequest::from_json(request)?;
        let bytes = self.load_source(&request.filename)?;
        let job = Job {
            source_key: request.filename,
            operations: request.operations,
            requested_by: who,
        };

        let source = codec::decode(&bytes).map_err(|e| {
            warn!(source = %job.source_key, error = %e, "stored source does not decode");
            ServiceError::SourceUnreadable(job.source_key.clone())
        })?;
        let output = pipeline::run(&self.backend, &source, &job.operations)
            .map_err(ServiceError::TransformFailure)?;

        let key = assemble::output_key(&job.source_key, "processed");
        let encoded = self.encode_result(&output, &key).map_err(|e| {
            error!(key, error = %e, "encoding result failed");
            ServiceError::Internal(e.to_string())
        })?;
        self.stores.results.put(&key, &encoded)?;
        let record = assemble::single_record(&job, &key);
        self.stores.result_records.put(record.clone())?;

        info!(
            user = %job.requested_by.username,
            source = %job.source_key,
            operations = job.operations.len(),
            result = %key,
            "processed"
        );
        Ok(ProcessResponse {
            message: "Image processed successfully".into(),
            result: key,
            metadata: record,
        })
    }

    // -------------------------------------------------------------------------
    // Stress
    // -------------------------------------------------------------------------

    /// Saturate local cores for the requested window.
    ///
    /// Units that fail are listed in `failed_units`; the call itself only
    /// fails on a bad request, a missing source or a pool that cannot start.
    pub fn stress(&self, request: &Value) -> Result<StressResponse, ServiceError> {
        let who = self.caller()?;
        let request = StressRequest::from_json(request)?;
        self.check_duration(request.duration)?;
        let bytes = self.load_source(&request.filename)?;
        let job = StressJob {
            source_key: request.filename,
            duration_seconds: request.duration,
            requested_by: who,
        };
        // One unit per core at most, whatever the request asks for.
        let ceiling = config::effective_workers(&self.config.stress);
        let workers = request.workers.map_or(ceiling, |n| n.min(ceiling));
        let workload = match request.operations {
            Some(ops) => StressWorkload::repeated(&ops),
            None => StressWorkload::Mutation(self.config.stress.mutation()),
        };

        let sink = |index: usize, image: &DynamicImage| -> Result<String, UnitError> {
            let key = assemble::output_key(&job.source_key, &format!("stress{index}"));
            let encoded = self
                .encode_result(image, &key)
                .map_err(|e| UnitError::Persist(e.to_string()))?;
            self.stores
                .results
                .put(&key, &encoded)
                .map_err(|e| UnitError::Persist(e.to_string()))?;
            Ok(key)
        };
        let report = Dispatcher::new(&self.backend, workers)
            .run(
                &EncodedSource::new(&bytes),
                &sink,
                &workload,
                Budget::Deadline(Duration::from_secs(job.duration_seconds)),
            )
            .map_err(|e| {
                error!(error = %e, "stress dispatch failed");
                ServiceError::Internal(e.to_string())
            })?;

        let (records, aggregate) = assemble::stress_records(&job, &report);
        let results = records.iter().map(|r| r.output.clone()).collect();
        for record in records {
            self.stores.result_records.put(record)?;
        }
        let StressAggregate {
            cores_used,
            total_iterations,
            failed_units,
        } = aggregate;
        if !failed_units.is_empty() {
            warn!(?failed_units, "stress finished with failed units");
        }
        Ok(StressResponse {
            message: "Stress test completed".into(),
            cores_used,
            results,
            failed_units,
            total_iterations,
            elapsed_ms: report.total_elapsed.as_millis() as u64,
            units: report.results,
        })
    }

    /// Drive the remote worker for the requested window.
    pub fn stress_remote(&self, request: &Value) -> Result<StressSummary, ServiceError> {
        let who = self.caller()?;
        let request = RemoteStressRequest::from_json(request)?;
        self.check_duration(request.duration)?;
        let forwarder = self.forwarder()?;

        let health = forwarder.health_check();
        if !health.reachable {
            warn!(state = %health.reported_state, "remote stress pre-flight failed");
            return Err(ServiceError::WorkerUnreachable { status: 503 });
        }
        info!(user = %who.username, filename = %request.filename, "remote stress");
        Ok(forwarder.forward_stress(&request.filename, Duration::from_secs(request.duration)))
    }

    fn check_duration(&self, secs: u64) -> Result<(), ServiceError> {
        let max = self.config.stress.max_duration_secs;
        if secs > max {
            return Err(ServiceError::invalid(format!(
                "duration must be at most {max} seconds"
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Forwarding
    // -------------------------------------------------------------------------

    /// Validate a process request here, then let the remote worker run it.
    /// The worker's status and body come back unchanged.
    pub fn forward(&self, request: &Value) -> Result<Forwarded, ServiceError> {
        let who = self.caller()?;
        let request = ProcessRequest::from_json(request)?;
        let forwarder = self.forwarder()?;
        let payload = json!({
            "filename": request.filename,
            "operations": request.operations.to_json(),
        });
        info!(user = %who.username, filename = %request.filename, "forwarding process job");
        forwarder
            .forward(PROCESS_PATH, &payload, forwarder.config().forward_timeout)
            .map_err(|e| ServiceError::from_forward(e, 500))
    }

    /// Hand a whole stress run to the remote worker.
    pub fn forward_stress_job(&self, request: &Value) -> Result<Forwarded, ServiceError> {
        let who = self.caller()?;
        let request = RemoteStressRequest::from_json(request)?;
        self.check_duration(request.duration)?;
        let forwarder = self.forwarder()?;
        let payload = json!({"filename": request.filename, "duration": request.duration});
        info!(user = %who.username, filename = %request.filename, "forwarding stress job");
        forwarder
            .forward(STRESS_PATH, &payload, forwarder.config().stress_job_timeout)
            .map_err(|e| ServiceError::from_forward(e, 500))
    }

    pub fn worker_health(&self) -> Result<HealthStatus, ServiceError> {
        Ok(self.forwarder()?.health_check())
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    /// Results visible to the caller: all for an admin, otherwise their own.
    pub fn list_results(&self) -> Result<Vec<ResultRecord>, ServiceError> {
        let who = self.caller()?;
        Ok(self.stores.result_records.list_visible(&who)?)
    }

    pub fn get_result(&self, output: &str) -> Result<ResultRecord, ServiceError> {
        let who = self.caller()?;
        self.visible_result(&who, output)
    }

    /// Record and encoded bytes of one result.
    pub fn download_result(&self, output: &str) -> Result<(ResultRecord, Vec<u8>), ServiceError> {
        let who = self.caller()?;
        let record = self.visible_result(&who, output)?;
        let bytes = self.stores.results.get(&record.output)?;
        Ok((record, bytes))
    }

    /// Delete one result's blob and record.
    pub fn delete_result(&self, output: &str) -> Result<(), ServiceError> {
        let who = self.caller()?;
        let record = self.visible_result(&who, output)?;
        match self.stores.results.delete(&record.output) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.stores.result_records.delete(record.id)?;
        info!(user = %who.username, output, "result deleted");
        Ok(())
    }

    /// Delete every result of every user. Admin only.
    pub fn clear_results(&self) -> Result<usize, ServiceError> {
        let who = self.caller()?;
        if !who.is_admin() {
            return Err(ServiceError::Forbidden(
                "Only an admin may clear all results".into(),
            ));
        }
        let blobs = self.stores.results.clear_prefix("")?;
        let records = self.stores.result_records.clear()?;
        info!(user = %who.username, blobs, records, "results cleared");
        Ok(records)
    }

    fn visible_result(&self, who: &Identity, output: &str) -> Result<ResultRecord, ServiceError> {
        self.stores
            .result_records
            .list_visible(who)?
            .into_iter()
            .find(|r| r.output == output)
            .ok_or_else(|| ServiceError::NotFound(format!("Result '{output}' not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::available_workers;
    use crate::forward::ForwarderConfig;
    use crate::identity::Role;
    use crate::imaging::RustBackend;
    use crate::imaging::backend::tests::PoisonWidthBackend;
    use crate::test_helpers::{SwitchIdentity, gradient_image, png_bytes};

    fn alice() -> Identity {
        Identity::new("alice", Role::User)
    }

    fn bob() -> Identity {
        Identity::new("bob", Role::User)
    }

    fn admin() -> Identity {
        Identity::new("root", Role::Admin)
    }

    fn service_as(who: Identity) -> (Service<RustBackend>, SwitchIdentity) {
        service_with(RustBackend::new(), who)
    }

    fn service_with<B: TransformBackend>(backend: B, who: Identity) -> (Service<B>, SwitchIdentity) {
        let identity = SwitchIdentity::new(Some(who));
        let service = Service::new(
            backend,
            Stores::in_memory(),
            Box::new(identity.clone()),
            ServiceConfig::default(),
        );
        (service, identity)
    }

    fn upload_gradient<B: TransformBackend>(service: &Service<B>, name: &str, w: u32, h: u32) {
        service
            .upload(name, &png_bytes(&gradient_image(w, h)))
            .unwrap();
    }

    fn dead_forwarder() -> RemoteForwarder {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        RemoteForwarder::new(ForwarderConfig {
            base_url: format!("http://127.0.0.1:{port}"),
            health_timeout: Duration::from_millis(500),
            ..ForwarderConfig::default()
        })
        .unwrap()
    }

    // =========================================================================
    // Request parsing
    // =========================================================================

    #[test]
    fn process_request_parses_operations() {
        let req = ProcessRequest::from_json(&json!({
            "filename": "cat.png",
            "operations": {"flip": "vertical", "rotate": 90}
        }))
        .unwrap();
        assert_eq!(req.filename, "cat.png");
        assert_eq!(req.operations.len(), 2);
    }

    #[test]
    fn process_request_rejects_bad_input() {
        let cases = [
            json!({"operations": {}}),
            json!({"filename": ""}),
            json!({"filename": 7}),
            json!({"filename": "a.png", "colour": "red"}),
            json!({"filename": "a.png", "operations": {"sharpen": 1}}),
            json!({"filename": "a.png", "operations": {"blur": -1}}),
            json!(["a.png"]),
        ];
        for case in cases {
            let err = ProcessRequest::from_json(&case).unwrap_err();
            assert_eq!(err.status(), 400, "{case}");
            assert_eq!(err.kind(), "invalid_input");
        }
    }

    #[test]
    fn stress_request_duration_forms() {
        let a = StressRequest::from_json(&json!({"filename": "a.png", "duration": 3})).unwrap();
        let b =
            StressRequest::from_json(&json!({"filename": "a.png", "duration_seconds": 3})).unwrap();
        let c = StressRequest::from_json(&json!({"filename": "a.png"})).unwrap();
        assert_eq!(a.duration, 3);
        assert_eq!(b.duration, 3);
        assert_eq!(c.duration, DEFAULT_STRESS_SECS);

        for bad in [json!(0), json!(-2), json!(1.5), json!("3")] {
            let err = StressRequest::from_json(&json!({"filename": "a.png", "duration": bad}))
                .unwrap_err();
            assert_eq!(err.status(), 400);
        }
        assert!(
            StressRequest::from_json(&json!({"filename": "a.png", "workers": 0})).is_err()
        );
    }

    // =========================================================================
    // Error mapping
    // =========================================================================

    #[test]
    fn error_statuses_and_bodies() {
        assert_eq!(ServiceError::Unauthenticated.status(), 401);
        assert_eq!(ServiceError::WorkerUnreachable { status: 503 }.status(), 503);
        assert_eq!(ServiceError::WorkerNotConfigured.status(), 503);

        let err = ServiceError::from(StoreError::Io(std::io::Error::other("disk /dev/sda1 gone")));
        assert_eq!(err.status(), 500);
        assert_eq!(err.body(), json!({"error": "Storage error", "kind": "storage"}));

        let err = ServiceError::TransformFailure(TransformError::invalid(
            crate::imaging::OperationKind::Resize,
            "too large",
        ));
        assert!(err.to_string().contains("resize"));
        assert_eq!(err.status(), 500);
    }

    // =========================================================================
    // Upload
    // =========================================================================

    #[test]
    fn upload_records_resolution_and_owner() {
        let (service, _) = service_as(alice());
        let bytes = png_bytes(&gradient_image(20, 10));
        let record = service.upload("cat.png", &bytes).unwrap();

        assert_eq!(record.resolution, "20x10");
        assert_eq!(record.size_bytes, bytes.len() as u64);
        assert_eq!(record.user, "alice");
        assert_eq!(service.list_uploads().unwrap(), vec![record]);
    }

    #[test]
    fn upload_rejects_bad_files() {
        let (service, _) = service_as(alice());
        let png = png_bytes(&gradient_image(4, 4));

        for (name, bytes) in [
            ("../x.png", png.as_slice()),
            ("dir/x.png", png.as_slice()),
            (".hidden.png", png.as_slice()),
            ("notes.txt", png.as_slice()),
            ("empty.png", &[][..]),
            ("junk.png", b"definitely not a png".as_slice()),
        ] {
            let err = service.upload(name, bytes).unwrap_err();
            assert_eq!(err.status(), 400, "{name}");
        }
    }

    #[test]
    fn reupload_replaces_record() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "cat.png", 4, 4);
        upload_gradient(&service, "cat.png", 8, 6);

        let uploads = service.list_uploads().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].resolution, "8x6");
    }

    #[test]
    fn anonymous_caller_is_rejected() {
        let (service, identity) = service_as(alice());
        identity.set(None);
        assert_eq!(service.list_results().unwrap_err().status(), 401);
        assert_eq!(
            service.upload("a.png", b"x").unwrap_err().kind(),
            "unauthenticated"
        );
    }

    // =========================================================================
    // Process
    // =========================================================================

    #[test]
    fn process_stores_result_and_record() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "cat.png", 20, 10);

        let resp = service
            .process(&json!({
                "filename": "cat.png",
                "operations": {"rotate": 90, "grayscale": true}
            }))
            .unwrap();

        assert_eq!(resp.message, "Image processed successfully");
        assert!(resp.result.starts_with("cat_processed_"));
        assert_eq!(resp.metadata.input, "cat.png");
        assert_eq!(resp.metadata.output, resp.result);

        let (record, bytes) = service.download_result(&resp.result).unwrap();
        assert_eq!(record, resp.metadata);
        let out = codec::decode(&bytes).unwrap();
        assert_eq!((out.width(), out.height()), (10, 20));
    }

    #[test]
    fn process_empty_operations_returns_equal_image() {
        let (service, _) = service_as(alice());
        let original = gradient_image(9, 7);
        service.upload("g.png", &png_bytes(&original)).unwrap();

        let resp = service.process(&json!({"filename": "g.png"})).unwrap();
        let (_, bytes) = service.download_result(&resp.result).unwrap();
        assert_eq!(codec::decode(&bytes).unwrap().to_rgba8(), original.to_rgba8());
    }

    #[test]
    fn process_missing_source_is_404() {
        let (service, _) = service_as(alice());
        let err = service.process(&json!({"filename": "ghost.png"})).unwrap_err();
        assert_eq!(err.status(), 404);
        assert!(err.to_string().contains("ghost.png"));
    }

    #[test]
    fn process_transform_failure_is_500_and_stores_nothing() {
        let (service, _) = service_with(PoisonWidthBackend { width: 6 }, alice());
        upload_gradient(&service, "p.png", 6, 6);

        let err = service
            .process(&json!({"filename": "p.png", "operations": {"grayscale": true}}))
            .unwrap_err();
        assert_eq!(err.status(), 500);
        assert_eq!(err.kind(), "transform_failure");
        assert!(err.to_string().contains("grayscale"));
        assert!(service.list_results().unwrap().is_empty());
    }

    #[test]
    fn process_undecodable_source_is_reported_as_such() {
        let (service, _) = service_as(alice());
        service.stores.uploads.put("junk.png", b"not an image").unwrap();

        let err = service
            .process(&json!({"filename": "junk.png", "operations": {"grayscale": true}}))
            .unwrap_err();
        assert_eq!(err.status(), 500);
        assert_eq!(err.kind(), "source_unreadable");
        assert_eq!(err.to_string(), "Source image 'junk.png' could not be decoded");
        assert!(service.list_results().unwrap().is_empty());
    }

    // =========================================================================
    // Stress
    // =========================================================================

    #[test]
    fn stress_records_one_result_per_unit() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "s.png", 16, 12);

        let resp = service
            .stress(&json!({"filename": "s.png", "duration": 1, "workers": 3}))
            .unwrap();

        let units = 3.min(available_workers());
        assert_eq!(resp.cores_used, units);
        assert_eq!(resp.results.len(), units);
        assert!(resp.failed_units.is_empty());
        assert!(resp.total_iterations >= units as u64);
        assert!(resp.elapsed_ms >= 1000);

        let records = service.list_results().unwrap();
        assert_eq!(records.len(), units);
        for key in &resp.results {
            let (_, bytes) = service.download_result(key).unwrap();
            let img = codec::decode(&bytes).unwrap();
            assert_eq!((img.width(), img.height()), (16, 12));
        }
    }

    #[test]
    fn stress_with_operations_repeats_pipeline() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "s.png", 8, 8);

        let resp = service
            .stress(&json!({
                "filename": "s.png",
                "duration": 1,
                "workers": 2,
                "operations": {"grayscale": true}
            }))
            .unwrap();
        assert_eq!(resp.results.len(), 2.min(available_workers()));
    }

    #[test]
    fn stress_clamps_requested_workers_to_cores() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "s.png", 4, 4);

        let resp = service
            .stress(&json!({"filename": "s.png", "duration": 1, "workers": 1_000_000}))
            .unwrap();
        assert_eq!(resp.cores_used, available_workers());
        assert_eq!(resp.units.len(), available_workers());
    }

    #[test]
    fn stress_honours_configured_worker_cap() {
        let identity = SwitchIdentity::new(Some(alice()));
        let mut config = ServiceConfig::default();
        config.stress.max_workers = Some(1);
        let service = Service::new(
            RustBackend::new(),
            Stores::in_memory(),
            Box::new(identity),
            config,
        );
        upload_gradient(&service, "s.png", 4, 4);

        let resp = service
            .stress(&json!({"filename": "s.png", "duration": 1, "workers": 64}))
            .unwrap();
        assert_eq!(resp.cores_used, 1);
    }

    #[test]
    fn stress_with_rotation_keeps_source_canvas() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "s.png", 12, 10);

        let resp = service
            .stress(&json!({
                "filename": "s.png",
                "duration": 1,
                "workers": 1,
                "operations": {"rotate": 45}
            }))
            .unwrap();
        assert!(resp.failed_units.is_empty());
        let (_, bytes) = service.download_result(&resp.results[0]).unwrap();
        let img = codec::decode(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (12, 10));
    }

    #[test]
    fn stress_reports_failed_units_without_failing() {
        let (service, _) = service_with(PoisonWidthBackend { width: 5 }, alice());
        upload_gradient(&service, "bad.png", 5, 5);

        let resp = service
            .stress(&json!({"filename": "bad.png", "duration": 1, "workers": 2}))
            .unwrap();
        let units = 2.min(available_workers());
        assert_eq!(resp.failed_units, (0..units).collect::<Vec<_>>());
        assert!(resp.results.is_empty());
        assert!(resp.units.iter().all(|u| u.error.is_some()));
    }

    #[test]
    fn stress_rejects_overlong_window() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "s.png", 4, 4);
        let err = service
            .stress(&json!({"filename": "s.png", "duration": 100_000}))
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    // =========================================================================
    // Remote
    // =========================================================================

    #[test]
    fn remote_without_worker_is_503() {
        let (service, _) = service_as(alice());
        let err = service
            .stress_remote(&json!({"filename": "x.png", "duration": 1}))
            .unwrap_err();
        assert_eq!(err.status(), 503);
        assert!(service.worker_health().is_err());
    }

    #[test]
    fn remote_stress_preflight_failure_is_503() {
        let (service, _) = service_as(alice());
        let service = service.with_forwarder(dead_forwarder());
        let err = service
            .stress_remote(&json!({"filename": "x.png", "duration": 1}))
            .unwrap_err();
        assert_eq!(err.status(), 503);
        assert_eq!(err.kind(), "worker_unreachable");
    }

    #[test]
    fn forward_to_dead_worker_is_sanitized_500() {
        let (service, _) = service_as(alice());
        let service = service.with_forwarder(dead_forwarder());
        let err = service.forward(&json!({"filename": "x.png"})).unwrap_err();
        assert_eq!(err.status(), 500);
        assert_eq!(
            err.body(),
            json!({"error": "Worker service unreachable", "kind": "worker_unreachable"})
        );
    }

    #[test]
    fn forward_validates_before_sending() {
        let (service, _) = service_as(alice());
        let service = service.with_forwarder(dead_forwarder());
        let err = service
            .forward(&json!({"filename": "x.png", "operations": {"rotate": "lots"}}))
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    // =========================================================================
    // Results and visibility
    // =========================================================================

    #[test]
    fn users_see_only_their_results_admin_sees_all() {
        let (service, identity) = service_as(alice());
        upload_gradient(&service, "a.png", 4, 4);
        let a = service.process(&json!({"filename": "a.png"})).unwrap();

        identity.set(Some(bob()));
        upload_gradient(&service, "b.png", 4, 4);
        let b = service.process(&json!({"filename": "b.png"})).unwrap();

        let bobs = service.list_results().unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].output, b.result);
        assert_eq!(service.get_result(&a.result).unwrap_err().status(), 404);
        assert_eq!(service.delete_result(&a.result).unwrap_err().status(), 404);
        assert_eq!(service.list_uploads().unwrap().len(), 1);

        identity.set(Some(admin()));
        assert_eq!(service.list_results().unwrap().len(), 2);
        assert_eq!(service.list_uploads().unwrap().len(), 2);
        assert_eq!(service.get_result(&a.result).unwrap().user, "alice");
    }

    #[test]
    fn delete_result_removes_blob_and_record() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "a.png", 4, 4);
        let resp = service.process(&json!({"filename": "a.png"})).unwrap();

        service.delete_result(&resp.result).unwrap();
        assert!(service.list_results().unwrap().is_empty());
        assert_eq!(service.download_result(&resp.result).unwrap_err().status(), 404);
    }

    #[test]
    fn clear_results_is_admin_only() {
        let (service, identity) = service_as(alice());
        upload_gradient(&service, "a.png", 4, 4);
        service.process(&json!({"filename": "a.png"})).unwrap();
        service.process(&json!({"filename": "a.png"})).unwrap();

        let err = service.clear_results().unwrap_err();
        assert_eq!(err.status(), 403);
        assert_eq!(service.list_results().unwrap().len(), 2);

        identity.set(Some(admin()));
        assert_eq!(service.clear_results().unwrap(), 2);
        assert!(service.list_results().unwrap().is_empty());
    }

    #[test]
    fn delete_upload_keeps_results() {
        let (service, _) = service_as(alice());
        upload_gradient(&service, "a.png", 4, 4);
        service.process(&json!({"filename": "a.png"})).unwrap();

        service.delete_upload("a.png").unwrap();
        assert!(service.list_uploads().unwrap().is_empty());
        assert_eq!(service.list_results().unwrap().len(), 1);
        assert_eq!(
            service.process(&json!({"filename": "a.png"})).unwrap_err().status(),
            404
        );
        assert_eq!(service.delete_upload("a.png").unwrap_err().status(), 404);
    }
}
