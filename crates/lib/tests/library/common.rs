//! Shared fixtures for library integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use strata_lib::plan::{BuildPlan, LangPackageManager, OsPackageManager, PackageManagers, StepAction};
use strata_lib::{Environment, ExecuteConfig, Executor};
use tempfile::TempDir;

/// Isolated build workspace.
///
/// Layout under the temp directory:
/// - `context/`: the local source tree
/// - `images/`: the base image registry
/// - `out/`: the build output
/// - `cache/`: the layer store
/// - `pm.log`: one line per package manager invocation
pub struct Fixture {
  pub temp: TempDir,
}

impl Fixture {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("context")).unwrap();
    fs::create_dir_all(temp.path().join("images")).unwrap();
    Self { temp }
  }

  fn root(&self) -> PathBuf {
    dunce::canonicalize(self.temp.path()).unwrap()
  }

  pub fn context(&self) -> PathBuf {
    self.root().join("context")
  }

  pub fn output(&self) -> PathBuf {
    self.root().join("out")
  }

  pub fn rootfs(&self) -> PathBuf {
    self.output().join("rootfs")
  }

  pub fn cache_dir(&self) -> PathBuf {
    self.root().join("cache")
  }

  pub fn log_path(&self) -> PathBuf {
    self.root().join("pm.log")
  }

  /// Write a file into the build context.
  pub fn write_context(&self, relative: &str, content: &str) {
    write(&self.context().join(relative), content);
  }

  /// Register an image whose filesystem holds `files` and whose
  /// `image.json` is `config`.
  pub fn add_image(&self, dir_name: &str, config: &str, files: &[(&str, &str)]) {
    let dir = self.root().join("images").join(dir_name);
    fs::create_dir_all(dir.join("rootfs")).unwrap();
    fs::write(dir.join("image.json"), config).unwrap();
    for (path, content) in files {
      write(&dir.join("rootfs").join(path), content);
    }
  }

  /// Cached configuration.
  pub fn config(&self) -> ExecuteConfig {
    ExecuteConfig::new(self.output(), self.context(), self.root().join("images")).with_cache_dir(self.cache_dir())
  }

  /// Configuration with the layer cache disabled.
  pub fn uncached_config(&self) -> ExecuteConfig {
    ExecuteConfig::new(self.output(), self.context(), self.root().join("images"))
  }

  pub fn executor(&self) -> Executor {
    Executor::new(self.config())
  }

  /// Package managers that append to `pm.log` instead of installing.
  ///
  /// Arguments land on the same line, so `install_packages [git, curl]`
  /// records `os-install 'git' 'curl'` as `os-install git curl`.
  pub fn package_managers(&self) -> PackageManagers {
    let log = self.log_path();
    let log = log.display();
    PackageManagers {
      os: OsPackageManager {
        update: format!("echo os-update >> '{log}'"),
        install: format!("echo os-install >> '{log}'"),
      },
      lang: LangPackageManager {
        install: format!("echo lang-install >> '{log}'"),
      },
    }
  }

  pub fn plan(&self, actions: impl IntoIterator<Item = StepAction>) -> BuildPlan {
    BuildPlan::from_actions(actions).with_package_managers(self.package_managers())
  }

  /// Recorded package manager invocations, one per line.
  pub fn log(&self) -> Vec<String> {
    fs::read_to_string(self.log_path())
      .unwrap_or_default()
      .lines()
      .map(str::to_string)
      .collect()
  }

  /// Run `plan` from an empty environment.
  pub async fn build(&self, plan: &BuildPlan) -> Result<strata_lib::BuildResult, strata_lib::BuildError> {
    self.executor().execute(plan, Environment::new()).await
  }
}

/// A `run_command` step that records `marker` in `pm.log`.
pub fn record(fixture: &Fixture, marker: &str) -> StepAction {
  StepAction::RunCommand {
    command: format!("echo {marker} >> '{}'", fixture.log_path().display()),
  }
}

pub fn write(path: &Path, content: &str) {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).unwrap();
  }
  fs::write(path, content).unwrap();
}
