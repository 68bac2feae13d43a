//! Layer cache.
//!
//! Every executed step can be committed as a layer keyed by the snapshot it
//! produced. Snapshot keys chain (each depends on the previous one), so a
//! hit for step N implies that steps 0..N were identical too: cache validity
//! is a prefix property.
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/<key>/
//!   layer.json   # LayerRecord, written last (completion marker)
//!   rootfs/      # only for steps that change the filesystem
//! ```
//!
//! Layers that only change metadata (variables) point at the filesystem
//! layer they inherit through `fs_layer`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::LAYER_RECORD_VERSION;
use crate::environment::Environment;
use crate::plan::StepKind;
use crate::util::fs::{clear_dir, copy_dir_all};
use crate::util::hash::{DirHashError, ObjectHash, hash_directory};

const RECORD_FILE: &str = "layer.json";
const ROOTFS_DIR: &str = "rootfs";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("layer cache io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse layer record {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize layer record: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to hash layer: {0}")]
  Hash(#[from] DirHashError),

  #[error("layer record {path} has unsupported version {version}")]
  UnsupportedVersion { path: PathBuf, version: u32 },

  #[error("filesystem layer {0} is missing")]
  MissingFsLayer(ObjectHash),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
  move |source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Contents of `layer.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
  pub version: u32,
  pub key: ObjectHash,
  pub ordinal: usize,
  pub kind: StepKind,
  /// Environment after the step.
  pub environment: Environment,
  /// Layer whose `rootfs/` holds the filesystem after the step. `None`
  /// means an empty filesystem.
  pub fs_layer: Option<ObjectHash>,
  /// Content hash of `rootfs/`, for layers that carry one.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output_hash: Option<String>,
  pub created_at_unix: u64,
}

/// Where a new layer's filesystem comes from.
#[derive(Debug, Clone, Copy)]
pub enum FsSource<'a> {
  /// Filesystem unchanged from the layer named (or empty).
  Inherit(Option<&'a ObjectHash>),
  /// Copy this directory into the layer.
  Capture(&'a Path),
}

/// Content-addressed store of step layers.
pub struct LayerStore {
  root: PathBuf,
  /// Filesystem layers whose hash was checked during this run.
  verified: Mutex<HashSet<ObjectHash>>,
}

impl LayerStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      verified: Mutex::new(HashSet::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn layer_dir(&self, key: &ObjectHash) -> PathBuf {
    self.root.join(&key.0)
  }

  /// Whether a completed record exists for `key`. Does not verify content.
  pub fn contains(&self, key: &ObjectHash) -> bool {
    matches!(self.read_record(key), Ok(Some(_)))
  }

  /// Find a usable layer for `key`.
  ///
  /// A layer is usable when its record parses and the filesystem layer it
  /// points at still hashes to the recorded value. Unusable layers are
  /// discarded and reported as a miss.
  pub fn lookup(&self, key: &ObjectHash) -> Option<LayerRecord> {
    let record = match self.read_record(key) {
      Ok(Some(record)) => record,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = %key, error = %e, "unreadable layer, discarding");
        self.discard(key);
        return None;
      }
    };

    if let Some(fs_layer) = &record.fs_layer
      && !self.verify_fs_layer(fs_layer)
    {
      if fs_layer != key {
        self.discard(key);
      }
      return None;
    }

    debug!(key = %key, ordinal = record.ordinal, "layer cache hit");
    Some(record)
  }

  /// Store the result of a step under `key`.
  ///
  /// `layer.json` is written last, so an interrupted commit leaves a layer
  /// that [`lookup`](Self::lookup) treats as absent.
  pub fn commit(
    &self,
    key: &ObjectHash,
    ordinal: usize,
    kind: StepKind,
    environment: &Environment,
    fs: FsSource<'_>,
  ) -> Result<LayerRecord, CacheError> {
    let dir = self.layer_dir(key);
    if dir.exists() {
      fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
    }
    fs::create_dir_all(&dir).map_err(io_err(&dir))?;

    let (fs_layer, output_hash) = match fs {
      FsSource::Inherit(parent) => (parent.cloned(), None),
      FsSource::Capture(rootfs) => {
        let target = dir.join(ROOTFS_DIR);
        copy_dir_all(rootfs, &target, |_| false).map_err(io_err(&target))?;
        let hash = hash_directory(&target)?;
        self.mark_verified(key);
        (Some(key.clone()), Some(hash.0))
      }
    };

    let record = LayerRecord {
      version: LAYER_RECORD_VERSION,
      key: key.clone(),
      ordinal,
      kind,
      environment: environment.clone(),
      fs_layer,
      output_hash,
      created_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };

    let path = dir.join(RECORD_FILE);
    let temp_path = dir.join(format!("{RECORD_FILE}.tmp"));
    let content = serde_json::to_string_pretty(&record).map_err(CacheError::Serialize)?;
    fs::write(&temp_path, content).map_err(io_err(&temp_path))?;
    fs::rename(&temp_path, &path).map_err(io_err(&path))?;

    info!(key = %key, ordinal, kind = %kind, "layer committed");
    Ok(record)
  }

  /// Make `rootfs` hold exactly the filesystem of `fs_layer`.
  ///
  /// Skips the copy when `rootfs` already has the right content.
  pub fn restore(&self, fs_layer: Option<&ObjectHash>, rootfs: &Path) -> Result<(), CacheError> {
    let Some(fs_layer) = fs_layer else {
      if is_empty_dir(rootfs) {
        return Ok(());
      }
      debug!(rootfs = ?rootfs, "resetting rootfs to empty");
      return clear_dir(rootfs).map_err(io_err(rootfs));
    };

    let record = self
      .read_record(fs_layer)?
      .ok_or_else(|| CacheError::MissingFsLayer(fs_layer.clone()))?;

    if rootfs.is_dir()
      && let Some(expected) = &record.output_hash
      && hash_directory(rootfs).is_ok_and(|current| current.0 == *expected)
    {
      debug!(layer = %fs_layer, "rootfs already matches layer");
      return Ok(());
    }

    info!(layer = %fs_layer, "restoring rootfs from layer");
    let source = self.layer_dir(fs_layer).join(ROOTFS_DIR);
    if !source.is_dir() {
      return Err(CacheError::MissingFsLayer(fs_layer.clone()));
    }
    clear_dir(rootfs).map_err(io_err(rootfs))?;
    copy_dir_all(&source, rootfs, |_| false).map_err(io_err(rootfs))?;
    Ok(())
  }

  /// Remove a layer. Failures are logged, not returned.
  pub fn discard(&self, key: &ObjectHash) {
    let dir = self.layer_dir(key);
    if let Err(e) = fs::remove_dir_all(&dir)
      && e.kind() != std::io::ErrorKind::NotFound
    {
      warn!(path = ?dir, error = %e, "failed to remove layer");
    }
    if let Ok(mut verified) = self.verified.lock() {
      verified.remove(key);
    }
  }

  fn read_record(&self, key: &ObjectHash) -> Result<Option<LayerRecord>, CacheError> {
    let path = self.layer_dir(key).join(RECORD_FILE);
    if !path.exists() {
      return Ok(None);
    }

    let content = fs::read_to_string(&path).map_err(io_err(&path))?;
    let record: LayerRecord = serde_json::from_str(&content).map_err(|source| CacheError::Parse {
      path: path.clone(),
      source,
    })?;

    if record.version != LAYER_RECORD_VERSION {
      return Err(CacheError::UnsupportedVersion {
        path,
        version: record.version,
      });
    }

    Ok(Some(record))
  }

  /// Check a filesystem layer against its recorded hash, once per run.
  fn verify_fs_layer(&self, fs_layer: &ObjectHash) -> bool {
    if self.verified.lock().is_ok_and(|v| v.contains(fs_layer)) {
      return true;
    }

    let record = match self.read_record(fs_layer) {
      Ok(Some(record)) => record,
      Ok(None) => {
        debug!(layer = %fs_layer, "filesystem layer missing");
        return false;
      }
      Err(e) => {
        warn!(layer = %fs_layer, error = %e, "unreadable filesystem layer, discarding");
        self.discard(fs_layer);
        return false;
      }
    };

    let Some(expected) = record.output_hash else {
      warn!(layer = %fs_layer, "filesystem layer has no content hash, discarding");
      self.discard(fs_layer);
      return false;
    };

    let rootfs = self.layer_dir(fs_layer).join(ROOTFS_DIR);
    match hash_directory(&rootfs) {
      Ok(current) if current.0 == expected => {
        self.mark_verified(fs_layer);
        true
      }
      Ok(current) => {
        warn!(
          layer = %fs_layer,
          expected = %expected,
          actual = %current.0,
          "layer corrupted, will rebuild"
        );
        self.discard(fs_layer);
        false
      }
      Err(e) => {
        warn!(layer = %fs_layer, error = %e, "failed to hash layer, will rebuild");
        self.discard(fs_layer);
        false
      }
    }
  }

  fn mark_verified(&self, key: &ObjectHash) {
    if let Ok(mut verified) = self.verified.lock() {
      verified.insert(key.clone());
    }
  }
}

fn is_empty_dir(path: &Path) -> bool {
  fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}
