//! Hashing for layer keys and content verification.
//!
//! [`ObjectHash`] names layers and accumulated states; [`ContentHash`] is the
//! full digest recorded for filesystem layers, copy sources and base images.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

/// Truncated SHA-256 naming a layer or an accumulated state.
///
/// A lowercase hex string of [`OBJ_HASH_PREFIX_LEN`] characters, short
/// enough for a directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl ObjectHash {
  /// Hash an ordered list of string parts.
  ///
  /// Parts are NUL-separated so `["ab", "c"]` and `["a", "bc"]` differ.
  pub fn from_parts<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut hasher = Sha256::new();
    for part in parts {
      hasher.update(part.as_ref().as_bytes());
      hasher.update([0u8]);
    }
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(OBJ_HASH_PREFIX_LEN);
    ObjectHash(hex)
  }
}

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Full 64-character SHA-256 of some content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn read_err(path: &Path) -> impl FnOnce(io::Error) -> DirHashError + '_ {
  move |source| DirHashError::Read {
    path: path.to_path_buf(),
    source,
  }
}

/// Deterministic hash of a directory tree.
///
/// Covers relative paths, file contents, symlink targets and, on unix, the
/// permission bits of files and directories. Timestamps and ownership are
/// ignored.
pub fn hash_directory(path: &Path) -> Result<ContentHash, DirHashError> {
  hash_tree(path, |_| false)
}

/// Hash whatever lives at `path`: contents and permissions for a file, the
/// tree for a directory. Entries for which `skip` returns true are left out together
/// with everything below them.
pub fn hash_path<F>(path: &Path, skip: F) -> Result<ContentHash, DirHashError>
where
  F: Fn(&Path) -> bool,
{
  if path.is_file() {
    let metadata = fs::metadata(path).map_err(read_err(path))?;
    let line = format!("F{}:{}", mode_suffix(&metadata), hash_file(path)?);
    Ok(hash_bytes(line.as_bytes()))
  } else {
    hash_tree(path, skip)
  }
}

fn hash_tree<F>(root: &Path, skip: F) -> Result<ContentHash, DirHashError>
where
  F: Fn(&Path) -> bool,
{
  let mut hasher = Sha256::new();

  // sort_by_file_name makes the walk order, and so the digest, stable
  let walker = WalkDir::new(root)
    .min_depth(1)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| !skip(e.path()));

  for entry in walker {
    let entry = entry?;
    let path = entry.path();
    let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");

    let file_type = entry.file_type();
    let line = if file_type.is_symlink() {
      let target = fs::read_link(path).map_err(read_err(path))?;
      format!("L:{}:{}", rel, target.to_string_lossy().replace('\\', "/"))
    } else if file_type.is_dir() {
      format!("D:{}{}", rel, mode_suffix(&entry.metadata()?))
    } else if file_type.is_file() {
      format!("F:{}{}:{}", rel, mode_suffix(&entry.metadata()?), hash_file(path)?)
    } else {
      // sockets, devices and fifos are not part of a layer
      continue;
    };

    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// `:<octal permission bits>` on unix, empty elsewhere.
#[cfg(unix)]
fn mode_suffix(metadata: &fs::Metadata) -> String {
  use std::os::unix::fs::PermissionsExt;
  format!(":{:o}", metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_suffix(_metadata: &fs::Metadata) -> String {
  String::new()
}

/// Full SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut file = fs::File::open(path).map_err(read_err(path))?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(read_err(path))?;
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}
