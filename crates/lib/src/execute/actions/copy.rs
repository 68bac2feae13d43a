//! `copy_tree`: copy a file or directory from the build context into the
//! environment.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::execute::types::ExecuteError;
use crate::util::fs::copy_dir_all;
use crate::util::hash::{ContentHash, hash_path};

/// Resolve a `copy_tree` source against the build context.
///
/// The resolved path, symlinks followed, must stay inside the context.
pub fn source_path(context: &Path, src: &str) -> Result<PathBuf, ExecuteError> {
  let path = context.join(src);
  if !path.exists() {
    return Err(ExecuteError::SourceMissing(path));
  }

  let context = dunce::canonicalize(context)?;
  let resolved = dunce::canonicalize(&path)?;
  if !resolved.starts_with(&context) {
    return Err(ExecuteError::SourceOutsideContext { src: resolved, context });
  }
  Ok(resolved)
}

/// Content hash of a copy source, ignoring everything below `exclude`.
pub fn source_hash(src: &Path, exclude: &Path) -> Result<ContentHash, ExecuteError> {
  Ok(hash_path(src, |p| p.starts_with(exclude))?)
}

/// Copy `src` to the host path `dst`.
///
/// A directory source is merged into `dst`. A file source lands inside `dst`
/// when `dst` is an existing directory, and at `dst` itself otherwise.
/// Conflicting paths are overwritten. Nothing below `exclude` is copied.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &Path) -> Result<u64, ExecuteError> {
  info!(src = ?src, dst = ?dst, "copying tree");

  if src.is_dir() {
    let copied = copy_dir_all(src, dst, |p| p.starts_with(exclude))?;
    debug!(files = copied, "copy complete");
    return Ok(copied);
  }

  let target = match src.file_name() {
    Some(name) if dst.is_dir() => dst.join(name),
    _ => dst.to_path_buf(),
  };
  if let Some(parent) = target.parent() {
    fs::create_dir_all(parent)?;
  }
  fs::copy(src, &target)?;
  Ok(1)
}
