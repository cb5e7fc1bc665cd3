//! Service configuration.
//!
//! Handles loading, validating, and merging `pixelmill.toml`. Stock defaults
//! are the base layer; a user file only needs the keys it wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [storage]
//! data_dir = "pixelmill-data"   # uploads/, results/ and the record files live here
//!
//! [images]
//! quality = 90                  # JPEG quality for results (1-100)
//! max_upload_bytes = 52428800   # Largest accepted upload
//!
//! [stress]
//! # max_workers = 4             # Units per local stress run (omit for auto = CPU cores)
//! rotate_angle = 15.0           # Degrees per mutation step
//! blur_radius = 2.0             # Blur sigma per mutation step
//! max_duration_secs = 600       # Longest accepted stress window
//!
//! [worker]
//! # url = "http://127.0.0.1:5001"   # Remote worker; forwarding is off when unset
//! expected_status = "worker service running"
//! health_timeout_secs = 5
//! forward_timeout_secs = 120
//! stress_job_timeout_secs = 300
//! stress_attempt_timeout_secs = 60
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::forward::ForwarderConfig;
use crate::imaging::operation::MAX_BLUR_RADIUS;
use crate::imaging::{Mutation, Quality};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE: &str = "pixelmill.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Service configuration loaded from `pixelmill.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub images: ImagesConfig,
    pub stress: StressConfig,
    pub worker: WorkerConfig,
}

impl ServiceConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.images.quality) {
            return Err(ConfigError::Validation(
                "images.quality must be 1-100".into(),
            ));
        }
        if self.images.max_upload_bytes == 0 {
            return Err(ConfigError::Validation(
                "images.max_upload_bytes must be non-zero".into(),
            ));
        }
        if self.stress.max_workers == Some(0) {
            return Err(ConfigError::Validation(
                "stress.max_workers must be at least 1".into(),
            ));
        }
        if !self.stress.rotate_angle.is_finite() {
            return Err(ConfigError::Validation(
                "stress.rotate_angle must be finite".into(),
            ));
        }
        if !(0.0..=MAX_BLUR_RADIUS).contains(&self.stress.blur_radius) {
            return Err(ConfigError::Validation(format!(
                "stress.blur_radius must be between 0 and {MAX_BLUR_RADIUS}"
            )));
        }
        if self.stress.max_duration_secs == 0 {
            return Err(ConfigError::Validation(
                "stress.max_duration_secs must be non-zero".into(),
            ));
        }
        let w = &self.worker;
        for (name, secs) in [
            ("health_timeout_secs", w.health_timeout_secs),
            ("forward_timeout_secs", w.forward_timeout_secs),
            ("stress_job_timeout_secs", w.stress_job_timeout_secs),
            ("stress_attempt_timeout_secs", w.stress_attempt_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "worker.{name} must be non-zero"
                )));
            }
        }
        if let Some(url) = &w.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Validation(format!(
                    "worker.url must be an http(s) URL, got '{url}'"
                )));
            }
        }
        Ok(())
    }
}

/// Where blobs and records are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("pixelmill-data"),
        }
    }
}

impl StorageConfig {
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn result_records_path(&self) -> PathBuf {
        self.data_dir.join("results.json")
    }

    pub fn upload_records_path(&self) -> PathBuf {
        self.data_dir.join("uploads.json")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    /// JPEG encoding quality (1 = worst, 100 = best).
    pub quality: u32,
    pub max_upload_bytes: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            quality: 90,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl ImagesConfig {
    pub fn quality(&self) -> Quality {
        Quality::new(self.quality)
    }
}

/// Local stress settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StressConfig {
    /// Units per local stress run. When absent, one per CPU core.
    /// Values larger than the core count are clamped down.
    pub max_workers: Option<usize>,
    pub rotate_angle: f32,
    pub blur_radius: f32,
    pub max_duration_secs: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        let mutation = Mutation::default();
        Self {
            max_workers: None,
            rotate_angle: mutation.angle,
            blur_radius: mutation.radius,
            max_duration_secs: 600,
        }
    }
}

impl StressConfig {
    pub fn mutation(&self) -> Mutation {
        Mutation {
            angle: self.rotate_angle,
            radius: self.blur_radius,
        }
    }
}

/// Resolve the effective unit count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_workers(config: &StressConfig) -> usize {
    let cores = crate::dispatch::available_workers();
    config.max_workers.map(|n| n.min(cores)).unwrap_or(cores)
}

/// Remote worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Base URL of the worker service. Forwarding is disabled when absent.
    pub url: Option<String>,
    pub expected_status: String,
    pub health_timeout_secs: u64,
    pub forward_timeout_secs: u64,
    pub stress_job_timeout_secs: u64,
    pub stress_attempt_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let defaults = ForwarderConfig::default();
        Self {
            url: None,
            expected_status: defaults.expected_status,
            health_timeout_secs: defaults.health_timeout.as_secs(),
            forward_timeout_secs: defaults.forward_timeout.as_secs(),
            stress_job_timeout_secs: defaults.stress_job_timeout.as_secs(),
            stress_attempt_timeout_secs: defaults.stress_attempt_timeout.as_secs(),
        }
    }
}

impl WorkerConfig {
    /// Forwarder settings, or `None` when no worker is configured.
    pub fn forwarder_config(&self) -> Option<ForwarderConfig> {
        let base_url = self.url.clone()?;
        Some(ForwarderConfig {
            base_url,
            expected_status: self.expected_status.clone(),
            health_timeout: Duration::from_secs(self.health_timeout_secs),
            forward_timeout: Duration::from_secs(self.forward_timeout_secs),
            stress_job_timeout: Duration::from_secs(self.stress_job_timeout_secs),
            stress_attempt_timeout: Duration::from_secs(self.stress_attempt_timeout_secs),
        })
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(ServiceConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge user values onto stock defaults, then deserialize and validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<ServiceConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: ServiceConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from the file at `path`.
///
/// A missing file yields the stock defaults; a file that exists must parse.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    if !path.exists() {
        return resolve_config(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    resolve_config(Some(value))
}

/// Returns a fully-commented stock `pixelmill.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Pixelmill Configuration
# =======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Storage
# ---------------------------------------------------------------------------
[storage]
# Uploads, results, and the JSON record files are kept under this directory.
data_dir = "pixelmill-data"

# ---------------------------------------------------------------------------
# Images
# ---------------------------------------------------------------------------
[images]
# JPEG encoding quality for results (1 = worst, 100 = best).
quality = 90

# Largest accepted upload, in bytes.
max_upload_bytes = 52428800

# ---------------------------------------------------------------------------
# Local stress runs
# ---------------------------------------------------------------------------
[stress]
# Execution units per run.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_workers = 4

# Each unit repeatedly rotates (without growing the canvas), blurs,
# and mirrors its private copy of the image.
rotate_angle = 15.0
blur_radius = 2.0

# Longest stress window a request may ask for, in seconds.
max_duration_secs = 600

# ---------------------------------------------------------------------------
# Remote worker
# ---------------------------------------------------------------------------
[worker]
# Base URL of the worker service. Forwarding commands fail when unset.
# url = "http://127.0.0.1:5001"

# The worker is healthy when GET / answers {"status": "<this value>"}.
expected_status = "worker service running"

# Timeouts, in seconds.
health_timeout_secs = 5
forward_timeout_secs = 120
stress_job_timeout_secs = 300
stress_attempt_timeout_secs = 60
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.images.quality, 90);
        assert_eq!(config.stress.rotate_angle, 15.0);
        assert_eq!(config.stress.blur_radius, 2.0);
        assert_eq!(config.worker.health_timeout_secs, 5);
        assert_eq!(config.worker.forward_timeout_secs, 120);
        assert!(config.worker.url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn stock_toml_matches_defaults() {
        let parsed: ServiceConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(parsed, ServiceConfig::default());
    }

    #[test]
    fn parse_partial_config() {
        let config: ServiceConfig = toml::from_str(
            r#"
[worker]
url = "http://worker:5001"
"#,
        )
        .unwrap();
        assert_eq!(config.worker.url.as_deref(), Some("http://worker:5001"));
        assert_eq!(config.worker.expected_status, "worker service running");
        assert_eq!(config.images.quality, 90);
    }

    #[test]
    fn unknown_keys_rejected() {
        let result: Result<ServiceConfig, _> = toml::from_str(
            r#"
[stress]
max_wrokers = 4
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn merge_overlay_keeps_base_keys() {
        let base = stock_defaults_value().unwrap();
        let overlay: toml::Value = toml::from_str("[images]\nquality = 70\n").unwrap();
        let merged = merge_toml(base, overlay);
        let config: ServiceConfig = merged.try_into().unwrap();
        assert_eq!(config.images.quality, 70);
        assert_eq!(config.images.max_upload_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = ServiceConfig::default();
        config.images.quality = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.stress.max_workers = Some(0);
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.stress.blur_radius = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.stress.blur_radius = 1e30;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.worker.health_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.worker.url = Some("worker:5001".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn effective_workers_clamps_to_cores() {
        let cores = crate::dispatch::available_workers();
        let auto = StressConfig::default();
        assert_eq!(effective_workers(&auto), cores);

        let capped = StressConfig {
            max_workers: Some(cores + 10),
            ..StressConfig::default()
        };
        assert_eq!(effective_workers(&capped), cores);

        let one = StressConfig {
            max_workers: Some(1),
            ..StressConfig::default()
        };
        assert_eq!(effective_workers(&one), 1);
    }

    #[test]
    fn forwarder_config_only_with_url() {
        let mut worker = WorkerConfig::default();
        assert!(worker.forwarder_config().is_none());

        worker.url = Some("http://worker:5001".into());
        worker.health_timeout_secs = 2;
        let fwd = worker.forwarder_config().unwrap();
        assert_eq!(fwd.base_url, "http://worker:5001");
        assert_eq!(fwd.health_timeout, Duration::from_secs(2));
    }

    #[test]
    fn storage_paths_under_data_dir() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/srv/pm"),
        };
        assert_eq!(storage.uploads_dir(), PathBuf::from("/srv/pm/uploads"));
        assert_eq!(storage.result_records_path(), PathBuf::from("/srv/pm/results.json"));
    }

    #[test]
    fn load_config_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn load_config_reads_and_validates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(&path, "[images]\nquality = 75\n").unwrap();
        assert_eq!(load_config(&path).unwrap().images.quality, 75);

        fs::write(&path, "[images]\nquality = 500\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Validation(_))));
    }
}
