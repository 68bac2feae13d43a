//! Shared test helpers for CLI integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Get path to a fixture file.
pub fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Read fixture content.
pub fn fixture_content(name: &str) -> String {
  std::fs::read_to_string(fixture_path(name)).unwrap_or_else(|e| panic!("Failed to load fixture {}: {}", name, e))
}

/// Isolated test environment.
///
/// Each test gets its own temporary directory with isolated context, output,
/// image registry and layer cache paths.
pub struct TestEnv {
  pub temp: TempDir,
  pub plan_path: PathBuf,
}

impl TestEnv {
  /// Create from a fixture file.
  ///
  /// Copies the fixture content to a temporary `plan.yaml` file.
  pub fn from_fixture(name: &str) -> Self {
    let env = Self::empty();
    std::fs::write(&env.plan_path, fixture_content(name)).unwrap();
    env
  }

  /// Create an empty test environment with a `context/` directory.
  pub fn empty() -> Self {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("context")).unwrap();
    let plan_path = temp.path().join("plan.yaml");
    Self { temp, plan_path }
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  fn dir(&self, name: &str) -> PathBuf {
    let p = self.temp.path().join(name);
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Build context (the local source tree).
  pub fn context_path(&self) -> PathBuf {
    self.dir("context")
  }

  /// Build output; the rootfs lands in `rootfs/` below it.
  pub fn output_path(&self) -> PathBuf {
    self.dir("output")
  }

  pub fn rootfs_path(&self) -> PathBuf {
    self.output_path().join("rootfs")
  }

  /// Data path (holds the default image registry).
  pub fn data_path(&self) -> PathBuf {
    self.dir("data")
  }

  /// Cache path (holds the default layer store).
  pub fn cache_path(&self) -> PathBuf {
    self.dir("cache")
  }

  /// Get a pre-configured Command for the strata binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `XDG_DATA_HOME` / `XDG_CACHE_HOME`: isolated registry and cache
  /// - `APPDATA` / `LOCALAPPDATA`: the same for Windows
  ///
  /// and removes `STRATA_IMAGES`, `STRATA_CACHE_DIR` and `STRATA_SHELL`.
  pub fn strata_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("strata");
    cmd.env("XDG_DATA_HOME", self.data_path());
    cmd.env("XDG_CACHE_HOME", self.cache_path());
    cmd.env("APPDATA", self.data_path());
    cmd.env("LOCALAPPDATA", self.cache_path());
    cmd.env_remove("STRATA_IMAGES");
    cmd.env_remove("STRATA_CACHE_DIR");
    cmd.env_remove("STRATA_SHELL");
    cmd
  }

  /// `strata build plan.yaml --context <context> --output <output>`
  pub fn build_cmd(&self) -> Command {
    let mut cmd = self.strata_cmd();
    cmd
      .arg("build")
      .arg(&self.plan_path)
      .arg("--context")
      .arg(self.context_path())
      .arg("--output")
      .arg(self.output_path());
    cmd
  }
}
