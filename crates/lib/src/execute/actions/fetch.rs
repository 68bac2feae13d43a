//! Artifact download for `install_from_url`.
//!
//! This module handles downloading files from URLs with optional SHA256
//! verification. The body is streamed to disk and hashed as it arrives.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::execute::types::ExecuteError;

/// Download `url` into `downloads_dir` and return the file's path.
///
/// A non-success HTTP status or a transport error fails with
/// [`ExecuteError::FetchFailed`]. When `expected_sha256` is given the bytes
/// must hash to it, otherwise the partial file is removed and
/// [`ExecuteError::HashMismatch`] is returned.
pub async fn execute_fetch(
  url: &str,
  expected_sha256: Option<&str>,
  downloads_dir: &Path,
) -> Result<PathBuf, ExecuteError> {
  info!(url = %url, "fetching URL");

  fs::create_dir_all(downloads_dir).await?;
  let dest_path = downloads_dir.join(url_to_filename(url));

  let fetch_failed = |message: String| ExecuteError::FetchFailed {
    url: url.to_string(),
    message,
  };

  let mut response = reqwest::get(url).await.map_err(|e| fetch_failed(e.to_string()))?;

  if !response.status().is_success() {
    return Err(fetch_failed(format!("HTTP {}", response.status())));
  }

  let mut hasher = Sha256::new();
  let mut size = 0usize;
  let mut file = fs::File::create(&dest_path).await?;

  while let Some(chunk) = response.chunk().await.map_err(|e| fetch_failed(e.to_string()))? {
    hasher.update(&chunk);
    size += chunk.len();
    file.write_all(&chunk).await?;
  }
  file.flush().await?;
  drop(file);

  let actual_hash = hex::encode(hasher.finalize());
  debug!(path = ?dest_path, sha256 = %actual_hash, "downloaded");

  if let Some(expected) = expected_sha256
    && actual_hash != expected
  {
    let _ = fs::remove_file(&dest_path).await;
    return Err(ExecuteError::HashMismatch {
      url: url.to_string(),
      expected: expected.to_string(),
      actual: actual_hash,
    });
  }

  info!(path = ?dest_path, size, "download complete");

  Ok(dest_path)
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component, percent-decodes and sanitizes it. The
/// name matters: installers such as pip read the wheel tags from it. Falls
/// back to a hash of the URL if no usable name remains.
pub fn url_to_filename(url: &str) -> String {
  let without_query = url.split(['?', '#']).next().unwrap_or(url);

  if let Some(last) = without_query.rsplit('/').next() {
    let sanitized: String = percent_decode(last)
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '+' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  format!("download_{}", &hex::encode(hasher.finalize())[..16])
}

fn percent_decode(input: &str) -> String {
  let bytes = input.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;

  while i < bytes.len() {
    if bytes[i] == b'%'
      && let Some(hex) = input.get(i + 1..i + 3)
      && let Ok(byte) = u8::from_str_radix(hex, 16)
    {
      out.push(byte);
      i += 3;
      continue;
    }
    out.push(bytes[i]);
    i += 1;
  }

  String::from_utf8_lossy(&out).into_owned()
}
