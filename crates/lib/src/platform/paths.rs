//! Data and cache directory resolution.
//!
//! Follows the XDG base directory conventions on unix and the `APPDATA` /
//! `LOCALAPPDATA` folders on Windows. `STRATA_IMAGES` and `STRATA_CACHE_DIR`
//! override the image registry and layer cache locations; `STRATA_SHELL`
//! overrides the shell.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Environment variable overriding the base image registry directory.
pub const IMAGES_ENV: &str = "STRATA_IMAGES";

/// Environment variable overriding the layer cache directory.
pub const CACHE_ENV: &str = "STRATA_CACHE_DIR";

/// Environment variable overriding the shell steps run in.
pub const SHELL_ENV: &str = "STRATA_SHELL";

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  std::env::var("APPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join("AppData").join("Roaming"))
    .join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join("AppData").join("Local"))
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Base image registry: `$STRATA_IMAGES` or `<data_dir>/images`.
pub fn images_dir() -> PathBuf {
  if let Ok(path) = std::env::var(IMAGES_ENV) {
    return PathBuf::from(path);
  }
  data_dir().join("images")
}

/// Layer cache: `$STRATA_CACHE_DIR` or `<cache_dir>/layers`.
pub fn layers_dir() -> PathBuf {
  if let Ok(path) = std::env::var(CACHE_ENV) {
    return PathBuf::from(path);
  }
  cache_dir().join("layers")
}
