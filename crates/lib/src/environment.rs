//! The environment a build plan is applied to.
//!
//! An [`Environment`] is a plain value: each step takes the previous one and
//! returns the next. The filesystem itself lives on disk under the output
//! rootfs; the environment only carries an opaque `snapshot` key that names
//! the accumulated state (see [`Environment::advance`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_WORKING_DIR;
use crate::util::hash::ObjectHash;

/// The platform image an environment was started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImage {
  /// Image reference as written in the plan (e.g. `nvidia/cuda:11.3.1-devel`).
  pub reference: String,

  /// Toolkit baseline advertised by the image (e.g. `cuda -> 11.3.1`).
  #[serde(default)]
  pub toolkit: BTreeMap<String, String>,
}

/// Working directory, variables and filesystem snapshot of a build target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
  /// Base image, once one has been selected.
  pub base: Option<BaseImage>,

  /// Absolute in-environment working directory.
  pub working_dir: String,

  /// Variables visible to every later step.
  pub variables: BTreeMap<String, String>,

  snapshot: ObjectHash,
}

impl Default for Environment {
  fn default() -> Self {
    Self::new()
  }
}

impl Environment {
  /// An empty environment rooted at `/`.
  pub fn new() -> Self {
    Self {
      base: None,
      working_dir: DEFAULT_WORKING_DIR.to_string(),
      variables: BTreeMap::new(),
      snapshot: ObjectHash(String::new()),
    }
    .seal()
  }

  pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.variables.insert(name.into(), value.into());
    self.seal()
  }

  pub fn with_working_dir(mut self, path: &str) -> Self {
    self.working_dir = self.resolve(path);
    self.seal()
  }

  /// Key of the accumulated state this environment describes.
  pub fn snapshot(&self) -> &ObjectHash {
    &self.snapshot
  }

  /// Recompute the snapshot from the environment's own fields.
  ///
  /// Used for initial environments, whose state is entirely described by
  /// their fields (the filesystem starts empty).
  pub fn seal(mut self) -> Self {
    let mut parts = vec![
      "env".to_string(),
      self.base.as_ref().map(|b| b.reference.clone()).unwrap_or_default(),
      self.working_dir.clone(),
    ];
    if let Some(base) = &self.base {
      parts.extend(base.toolkit.iter().map(|(k, v)| format!("toolkit:{k}={v}")));
    }
    parts.extend(self.variables.iter().map(|(k, v)| format!("var:{k}={v}")));
    self.snapshot = ObjectHash::from_parts(parts);
    self
  }

  /// Move to the state produced by a step whose layer key is `key`.
  pub fn advance(mut self, key: ObjectHash) -> Self {
    self.snapshot = key;
    self
  }

  /// Resolve `path` against the working directory into a normalized
  /// absolute in-environment path.
  pub fn resolve(&self, path: &str) -> String {
    resolve_path(&self.working_dir, path)
  }

  /// Map an in-environment path to its location below `root` on the host.
  pub fn host_path(&self, root: &Path, path: &str) -> PathBuf {
    let resolved = self.resolve(path);
    let relative = resolved.trim_start_matches('/');
    if relative.is_empty() {
      root.to_path_buf()
    } else {
      root.join(relative)
    }
  }
}

/// Normalize `path` against `base`. `..` never climbs above `/`.
pub fn resolve_path(base: &str, path: &str) -> String {
  let mut parts: Vec<&str> = Vec::new();
  let start = if path.starts_with('/') { "" } else { base };

  for component in start.split('/').chain(path.split('/')) {
    match component {
      "" | "." => {}
      ".." => {
        parts.pop();
      }
      other => parts.push(other),
    }
  }

  format!("/{}", parts.join("/"))
}

/// Whether `path` is `ancestor` or lies below it. Both must be normalized.
pub fn is_within(path: &str, ancestor: &str) -> bool {
  if ancestor == "/" || path == ancestor {
    return true;
  }
  path
    .strip_prefix(ancestor)
    .is_some_and(|rest| rest.starts_with('/'))
}
