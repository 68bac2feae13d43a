//! Base image registry lookup for `set_base_image`.
//!
//! A registry is a directory with one entry per image:
//!
//! ```text
//! <images>/<sanitized reference>/
//!   image.json   # optional: {"toolkit": {...}, "env": {...}}
//!   rootfs/      # optional: the image's filesystem
//! ```
//!
//! The reference `scratch` always resolves to an empty image.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::consts::SCRATCH_IMAGE;
use crate::environment::BaseImage;
use crate::execute::types::ExecuteError;
use crate::util::fs::{clear_dir, copy_dir_all};
use crate::util::hash::{ContentHash, hash_bytes, hash_directory};

const IMAGE_CONFIG_FILE: &str = "image.json";
const IMAGE_ROOTFS_DIR: &str = "rootfs";

/// Contents of `image.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
  /// Toolkit baseline, e.g. `{"cuda": "11.3.1", "cudnn": "8"}`.
  #[serde(default)]
  pub toolkit: BTreeMap<String, String>,

  /// Variables every step of the environment sees.
  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

/// An image found in the registry.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
  pub reference: String,
  pub config: ImageConfig,
  /// Image directory; `None` for scratch.
  pub dir: Option<PathBuf>,
}

impl ResolvedImage {
  pub fn base(&self) -> BaseImage {
    BaseImage {
      reference: self.reference.clone(),
      toolkit: self.config.toolkit.clone(),
    }
  }

  fn rootfs(&self) -> Option<PathBuf> {
    self
      .dir
      .as_ref()
      .map(|dir| dir.join(IMAGE_ROOTFS_DIR))
      .filter(|rootfs| rootfs.is_dir())
  }

  /// Content hash of the whole image, so that a rebuilt image with the same
  /// reference invalidates every layer above it.
  pub fn digest(&self) -> Result<ContentHash, ExecuteError> {
    match &self.dir {
      Some(dir) => Ok(hash_directory(dir)?),
      None => Ok(hash_bytes(SCRATCH_IMAGE.as_bytes())),
    }
  }
}

/// Directory name of `reference` inside the registry.
///
/// `nvidia/cuda:11.3.1-devel` becomes `nvidia_cuda_11.3.1-devel`.
pub fn image_dir_name(reference: &str) -> String {
  let name: String = reference
    .chars()
    .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
    .collect();
  if name.chars().all(|c| c == '.') {
    name.replace('.', "_")
  } else {
    name
  }
}

/// Look up `reference` in the registry at `images`.
pub fn resolve_image(images: &Path, reference: &str) -> Result<ResolvedImage, ExecuteError> {
  if reference == SCRATCH_IMAGE {
    return Ok(ResolvedImage {
      reference: reference.to_string(),
      config: ImageConfig::default(),
      dir: None,
    });
  }

  let dir = images.join(image_dir_name(reference));
  if !dir.is_dir() {
    return Err(ExecuteError::ImageNotFound {
      reference: reference.to_string(),
      path: dir,
    });
  }

  let config_path = dir.join(IMAGE_CONFIG_FILE);
  let config = if config_path.exists() {
    let content = fs::read_to_string(&config_path)?;
    serde_json::from_str(&content).map_err(|e| ExecuteError::ImageMetadata {
      path: config_path.clone(),
      message: e.to_string(),
    })?
  } else {
    ImageConfig::default()
  };

  Ok(ResolvedImage {
    reference: reference.to_string(),
    config,
    dir: Some(dir),
  })
}

/// Replace the contents of `rootfs` with the image's filesystem.
pub fn unpack_image(image: &ResolvedImage, rootfs: &Path) -> Result<(), ExecuteError> {
  info!(image = %image.reference, "unpacking base image");
  clear_dir(rootfs)?;
  if let Some(src) = image.rootfs() {
    copy_dir_all(&src, rootfs, |_| false)?;
  }
  Ok(())
}
