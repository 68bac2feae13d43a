//! Types for plan execution.
//!
//! This module defines the error types, result types, and configuration
//! for executing a build plan against an output directory.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::build_lock::BuildLockError;
use crate::cache::CacheError;
use crate::environment::Environment;
use crate::plan::{PlanError, StepKind};
use crate::util::hash::DirHashError;

/// Errors raised while applying a single step.
#[derive(Debug, Error)]
pub enum ExecuteError {
  /// Command exited unsuccessfully.
  #[error("command failed with exit code {code:?}: {cmd}{}", stderr_suffix(.stderr))]
  CmdFailed {
    cmd: String,
    code: Option<i32>,
    /// Tail of the command's stderr.
    stderr: String,
  },

  /// HTTP request failed or returned a non-success status.
  #[error("fetch failed for {url}: {message}")]
  FetchFailed { url: String, message: String },

  /// SHA256 hash mismatch after download.
  #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
  HashMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  /// Base image reference not present in the image registry.
  #[error("base image not found: {reference} (looked in {path})")]
  ImageNotFound { reference: String, path: PathBuf },

  /// Base image metadata could not be parsed.
  #[error("invalid image metadata {path}: {message}")]
  ImageMetadata { path: PathBuf, message: String },

  /// Copy source does not exist in the local source tree.
  #[error("copy source does not exist: {0}")]
  SourceMissing(PathBuf),

  /// Copy source resolves to a path outside the build context.
  #[error("copy source {src} is outside the build context {context}")]
  SourceOutsideContext { src: PathBuf, context: PathBuf },

  #[error("failed to hash {0}")]
  Hash(#[from] DirHashError),

  #[error("failed to fingerprint step: {0}")]
  Fingerprint(#[from] serde_json::Error),

  #[error("layer cache error: {0}")]
  Cache(#[from] CacheError),

  /// The step ran longer than its time limit and was killed.
  #[error("timed out after {limit:?}")]
  Timeout { limit: Duration },

  /// I/O error during execution.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
  if stderr.is_empty() {
    String::new()
  } else {
    format!("\n{stderr}")
  }
}

/// Errors that abort a build.
///
/// Every variant raised by a step names that step's ordinal and kind.
#[derive(Debug, Error)]
pub enum BuildError {
  /// Rejected by pre-flight validation. No step has run.
  #[error("invalid plan: {0}")]
  InvalidPlan(#[from] PlanError),

  #[error("step {ordinal} ({kind}) failed: {source}")]
  StepExecution {
    ordinal: usize,
    kind: StepKind,
    #[source]
    source: ExecuteError,
  },

  #[error("step {ordinal} ({kind}) timed out after {limit:?}")]
  Timeout {
    ordinal: usize,
    kind: StepKind,
    limit: Duration,
  },

  /// Cancellation was requested; the step at `ordinal` did not start.
  #[error("build cancelled before step {ordinal}")]
  Cancelled { ordinal: usize },

  #[error(transparent)]
  Lock(#[from] BuildLockError),

  #[error("output directory {path} is not usable: {source}")]
  Output {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl BuildError {
  /// Wrap an action-level error raised by the step at `ordinal`.
  pub(crate) fn step(ordinal: usize, kind: StepKind, source: ExecuteError) -> Self {
    match source {
      ExecuteError::Timeout { limit } => BuildError::Timeout { ordinal, kind, limit },
      source => BuildError::StepExecution { ordinal, kind, source },
    }
  }

  /// Ordinal of the step the error is attributed to, if any.
  pub fn ordinal(&self) -> Option<usize> {
    match self {
      BuildError::InvalidPlan(e) => e.ordinal(),
      BuildError::StepExecution { ordinal, .. }
      | BuildError::Timeout { ordinal, .. }
      | BuildError::Cancelled { ordinal } => Some(*ordinal),
      BuildError::Lock(_) | BuildError::Output { .. } => None,
    }
  }

  /// Kind of the step the error is attributed to, if any.
  pub fn kind(&self) -> Option<StepKind> {
    match self {
      BuildError::InvalidPlan(e) => match e {
        PlanError::BaseImageNotFirst { kind, .. }
        | PlanError::DependencyOrder { kind, .. }
        | PlanError::UnsatisfiedDependency { kind, .. }
        | PlanError::InvalidStep { kind, .. } => Some(*kind),
        _ => None,
      },
      BuildError::StepExecution { kind, .. } | BuildError::Timeout { kind, .. } => Some(*kind),
      BuildError::Cancelled { .. } | BuildError::Lock(_) | BuildError::Output { .. } => None,
    }
  }
}

/// Configuration for an executor.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Output directory. Holds `rootfs/`, `environment.json`, the build lock
  /// and the download scratch directory.
  pub output: PathBuf,

  /// Local source tree that `copy_tree` sources resolve against.
  pub context: PathBuf,

  /// Base image registry.
  pub images: PathBuf,

  /// Layer store root. `None` disables caching.
  pub cache_dir: Option<PathBuf>,

  /// Shell override for commands (defaults to `/bin/sh -c`).
  pub shell: Option<String>,

  /// Time limit for steps that do not set their own. `None` is unbounded.
  pub default_timeout: Option<Duration>,
}

impl ExecuteConfig {
  /// Configuration with caching disabled and no time limits.
  pub fn new(output: impl Into<PathBuf>, context: impl Into<PathBuf>, images: impl Into<PathBuf>) -> Self {
    Self {
      output: output.into(),
      context: context.into(),
      images: images.into(),
      cache_dir: None,
      shell: None,
      default_timeout: None,
    }
  }

  pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
    self.cache_dir = Some(cache_dir.into());
    self
  }

  /// Host directory holding the environment's filesystem.
  pub fn rootfs(&self) -> PathBuf {
    self.output.join("rootfs")
  }

  /// Where the current Environment is written after every step.
  pub fn environment_path(&self) -> PathBuf {
    self.output.join("environment.json")
  }

  pub(crate) fn downloads_dir(&self) -> PathBuf {
    self.output.join("downloads")
  }
}

/// How a step's result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Executed,
  Cached,
}

/// Outcome of one step of a successful (or partially successful) build.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
  pub ordinal: usize,
  pub kind: StepKind,
  pub status: StepStatus,
  #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
  pub duration: Duration,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_u64(duration.as_millis() as u64)
}

/// Result of executing a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
  /// Final environment.
  pub environment: Environment,

  /// One report per step, in ordinal order.
  pub steps: Vec<StepReport>,

  /// Host directory holding the final filesystem.
  pub rootfs: PathBuf,
}

impl BuildResult {
  pub fn executed_count(&self) -> usize {
    self.steps.iter().filter(|s| s.status == StepStatus::Executed).count()
  }

  pub fn cached_count(&self) -> usize {
    self.steps.iter().filter(|s| s.status == StepStatus::Cached).count()
  }
}

/// What a dry run predicts for one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepPreview {
  pub ordinal: usize,
  pub kind: StepKind,
  pub summary: String,
  pub cacheable: bool,
  /// Whether the layer cache currently holds this step's result.
  pub cached: bool,
}
