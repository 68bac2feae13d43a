//! Build plan execution.
//!
//! This module provides the [`Executor`], which applies a validated plan to
//! an output directory one step at a time. It handles:
//! - Strictly sequential, fail-fast step execution
//! - Serving the longest valid prefix of the plan from the layer cache
//! - Recording the Environment after every step for inspection
//! - Cancellation between steps

pub mod actions;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::build_lock::BuildLock;
use crate::cache::{FsSource, LayerStore};
use crate::environment::Environment;
use crate::plan::{BuildPlan, PackageManagers, Step, StepAction, validate};
use crate::util::fs::clear_dir;
use crate::util::hash::ObjectHash;

use actions::{CmdContext, execute_cmd, execute_fetch, with_args};

pub use types::{BuildError, BuildResult, ExecuteConfig, ExecuteError, StepPreview, StepReport, StepStatus};

/// Command recorded in the build lock.
const LOCK_COMMAND: &str = "strata build";

/// Requests cancellation of a running build.
///
/// Cancellation takes effect before the next step starts; a running step is
/// never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Applies build plans to an output directory.
pub struct Executor {
  config: ExecuteConfig,
  cancel: CancelHandle,
}

impl Executor {
  pub fn new(config: ExecuteConfig) -> Self {
    Self {
      config,
      cancel: CancelHandle::default(),
    }
  }

  pub fn config(&self) -> &ExecuteConfig {
    &self.config
  }

  pub fn cancel_handle(&self) -> CancelHandle {
    self.cancel.clone()
  }

  /// Execute `plan` starting from `initial`.
  ///
  /// The plan is validated first; an invalid plan fails before anything is
  /// touched. Steps then run in ordinal order. The first failure aborts the
  /// build and leaves the rootfs and `environment.json` as they were after
  /// the last successful step.
  pub async fn execute(&self, plan: &BuildPlan, initial: Environment) -> Result<BuildResult, BuildError> {
    let initial = initial.seal();
    validate(plan, &initial)?;

    let run = Executor {
      config: self.resolved_config()?,
      cancel: self.cancel.clone(),
    };
    let _lock = BuildLock::acquire(&run.config.output, LOCK_COMMAND)?;

    run.run(plan, initial).await
  }

  /// Predict, without executing anything, which steps the cache would serve.
  pub fn preview(&self, plan: &BuildPlan, initial: Environment) -> Result<Vec<StepPreview>, BuildError> {
    let initial = initial.seal();
    validate(plan, &initial)?;

    let config = self.canonical_config();
    let store = config.cache_dir.as_ref().map(LayerStore::new);
    let mut snapshot = initial.snapshot().clone();
    let mut in_prefix = true;
    let mut previews = Vec::with_capacity(plan.len());

    for step in plan.steps() {
      let key = layer_key(&snapshot, step, &plan.package_managers, &config)
        .map_err(|e| BuildError::step(step.ordinal, step.kind(), e))?;

      let cached = in_prefix && step.cacheable && store.as_ref().is_some_and(|s| s.contains(&key));
      in_prefix = cached;

      previews.push(StepPreview {
        ordinal: step.ordinal,
        kind: step.kind(),
        summary: step.action.summary(),
        cacheable: step.cacheable,
        cached,
      });
      snapshot = key;
    }

    Ok(previews)
  }

  /// Apply a single step to `env`, returning the next Environment.
  ///
  /// This performs the step's work on the rootfs unconditionally; the
  /// layer cache is not consulted.
  pub async fn apply_step(
    &self,
    env: Environment,
    step: &Step,
    package_managers: &PackageManagers,
  ) -> Result<Environment, ExecuteError> {
    let key = layer_key(env.snapshot(), step, package_managers, &self.config)?;
    self.run_step(env, step, package_managers, key).await
  }

  async fn run(&self, plan: &BuildPlan, initial: Environment) -> Result<BuildResult, BuildError> {
    let config = &self.config;
    let rootfs = config.rootfs();
    let store = config.cache_dir.as_ref().map(LayerStore::new);

    info!(steps = plan.len(), output = ?config.output, cache = store.is_some(), "starting build");

    let mut env = initial;
    let mut reports = Vec::with_capacity(plan.len());
    // Filesystem layer matching `env`, while the cached prefix lasts
    let mut fs_layer: Option<ObjectHash> = None;
    let mut in_prefix = true;
    let mut materialized = false;
    let mut committing = store.is_some();

    for step in plan.steps() {
      let (ordinal, kind) = (step.ordinal, step.kind());
      let fail = |e: ExecuteError| BuildError::step(ordinal, kind, e);

      if self.cancel.is_cancelled() {
        warn!(ordinal, "build cancelled");
        return Err(BuildError::Cancelled { ordinal });
      }

      let key = layer_key(env.snapshot(), step, &plan.package_managers, config).map_err(fail)?;

      if in_prefix
        && step.cacheable
        && let Some(store) = &store
        && let Some(record) = store.lookup(&key)
      {
        info!(ordinal, kind = %kind, key = %key, "step cached");
        env = record.environment;
        fs_layer = record.fs_layer;
        self.write_environment(&env);
        reports.push(StepReport {
          ordinal,
          kind,
          status: StepStatus::Cached,
          duration: Duration::ZERO,
        });
        continue;
      }
      in_prefix = false;

      if !materialized {
        self.materialize(store.as_ref(), fs_layer.as_ref(), &rootfs).map_err(fail)?;
        materialized = true;
      }

      info!(ordinal, kind = %kind, summary = %step.action.summary(), "step started");
      let started = Instant::now();
      env = match self.run_step(env, step, &plan.package_managers, key.clone()).await {
        Ok(env) => env,
        Err(e) => {
          warn!(ordinal, kind = %kind, error = %e, "step failed");
          return Err(fail(e));
        }
      };
      let duration = started.elapsed();
      info!(ordinal, kind = %kind, duration_ms = duration.as_millis() as u64, "step complete");

      if !step.cacheable {
        committing = false;
      }
      if committing && let Some(store) = &store {
        let fs = if kind.mutates_filesystem() {
          FsSource::Capture(&rootfs)
        } else {
          FsSource::Inherit(fs_layer.as_ref())
        };
        match store.commit(&key, ordinal, kind, &env, fs) {
          Ok(record) => fs_layer = record.fs_layer,
          Err(e) => {
            warn!(ordinal, error = %e, "failed to cache layer, later steps will not be cached");
            committing = false;
          }
        }
      }

      self.write_environment(&env);
      reports.push(StepReport {
        ordinal,
        kind,
        status: StepStatus::Executed,
        duration,
      });
    }

    if !materialized {
      self
        .materialize(store.as_ref(), fs_layer.as_ref(), &rootfs)
        .map_err(|e| BuildError::Output {
          path: rootfs.clone(),
          source: std::io::Error::other(e),
        })?;
      self.write_environment(&env);
    }

    let result = BuildResult {
      environment: env,
      steps: reports,
      rootfs,
    };
    info!(
      executed = result.executed_count(),
      cached = result.cached_count(),
      "build complete"
    );
    Ok(result)
  }

  async fn run_step(
    &self,
    mut env: Environment,
    step: &Step,
    package_managers: &PackageManagers,
    key: ObjectHash,
  ) -> Result<Environment, ExecuteError> {
    let config = &self.config;
    let rootfs = config.rootfs();
    tokio::fs::create_dir_all(&rootfs).await?;

    match &step.action {
      StepAction::SetBaseImage { image } => {
        let image = actions::resolve_image(&config.images, image)?;
        actions::unpack_image(&image, &rootfs)?;
        env.base = Some(image.base());
        env.variables.extend(image.config.env);
      }

      StepAction::RunCommand { command } => {
        self.shell(&env, command, config.default_timeout).await?;
      }

      StepAction::SetEnvVar { name, value } => {
        env.variables.insert(name.clone(), value.clone());
      }

      StepAction::SetWorkingDirectory { path } => {
        env.working_dir = env.resolve(path);
        tokio::fs::create_dir_all(env.host_path(&rootfs, "")).await?;
      }

      StepAction::CopyTree { src, dst } => {
        let src = actions::source_path(&config.context, src)?;
        let dst = env.host_path(&rootfs, dst);
        actions::copy_tree(&src, &dst, &config.output)?;
      }

      StepAction::InstallPackages { packages, update } => {
        let os = &package_managers.os;
        if *update {
          self.shell(&env, &os.update, config.default_timeout).await?;
        }
        let cmd = with_args(&os.install, packages.iter().map(String::as_str));
        self.shell(&env, &cmd, config.default_timeout).await?;
      }

      StepAction::InstallFromRequirementsFile { path, timeout_secs } => {
        let manifest = env.host_path(&rootfs, path);
        let cmd = with_args(
          &format!("{} -r", package_managers.lang.install),
          [manifest.to_string_lossy().as_ref()],
        );
        let timeout = timeout_secs.map(Duration::from_secs).or(config.default_timeout);
        self.shell(&env, &cmd, timeout).await?;
      }

      StepAction::InstallFromUrl { url, sha256 } => {
        let artifact = execute_fetch(url, sha256.as_deref(), &config.downloads_dir()).await?;
        let cmd = with_args(&package_managers.lang.install, [artifact.to_string_lossy().as_ref()]);
        let installed = self.shell(&env, &cmd, config.default_timeout).await;
        if let Err(e) = tokio::fs::remove_file(&artifact).await {
          debug!(path = ?artifact, error = %e, "failed to remove download");
        }
        installed?;
      }
    }

    Ok(env.advance(key))
  }

  /// Run `cmd` in the environment's working directory.
  async fn shell(&self, env: &Environment, cmd: &str, timeout: Option<Duration>) -> Result<String, ExecuteError> {
    let rootfs = self.config.rootfs();
    let cwd = env.host_path(&rootfs, "");
    let ctx = CmdContext {
      cwd: &cwd,
      rootfs: &rootfs,
      variables: &env.variables,
      shell: self.config.shell.as_deref(),
      timeout,
    };
    execute_cmd(cmd, &ctx).await
  }

  /// Bring the rootfs to the state of `fs_layer` (empty when `None`) before
  /// the first executed step.
  fn materialize(
    &self,
    store: Option<&LayerStore>,
    fs_layer: Option<&ObjectHash>,
    rootfs: &Path,
  ) -> Result<(), ExecuteError> {
    match store {
      Some(store) => store.restore(fs_layer, rootfs)?,
      None => clear_dir(rootfs)?,
    }
    Ok(())
  }

  /// Persist the current Environment next to the rootfs. Failures only warn:
  /// the file is for inspection and never read back by a build.
  fn write_environment(&self, env: &Environment) {
    let path = self.config.environment_path();
    let temp_path = path.with_extension("json.tmp");
    let written = serde_json::to_string_pretty(env)
      .map_err(std::io::Error::other)
      .and_then(|content| std::fs::write(&temp_path, content))
      .and_then(|()| std::fs::rename(&temp_path, &path));
    if let Err(e) = written {
      warn!(path = ?path, error = %e, "failed to write environment");
    }
  }

  /// Configuration with the output directory created and both the output
  /// and context paths made absolute, so that a context containing the
  /// output can exclude it.
  fn resolved_config(&self) -> Result<ExecuteConfig, BuildError> {
    let output_err = |source| BuildError::Output {
      path: self.config.output.clone(),
      source,
    };
    std::fs::create_dir_all(&self.config.output).map_err(output_err)?;

    let mut config = self.canonical_config();
    config.output = dunce::canonicalize(&self.config.output).map_err(output_err)?;
    Ok(config)
  }

  fn canonical_config(&self) -> ExecuteConfig {
    let mut config = self.config.clone();
    if let Ok(output) = dunce::canonicalize(&config.output) {
      config.output = output;
    }
    if let Ok(context) = dunce::canonicalize(&config.context) {
      config.context = context;
    }
    config
  }
}

/// Cache key of the state after `step`, applied to the state `previous`.
///
/// Besides the step's own payload the key covers whatever the step reads
/// from outside the plan: the copy source's content, the base image's
/// content and the package manager commands.
fn layer_key(
  previous: &ObjectHash,
  step: &Step,
  package_managers: &PackageManagers,
  config: &ExecuteConfig,
) -> Result<ObjectHash, ExecuteError> {
  let fingerprint = serde_json::to_string(&step.action)?;

  let inputs = match &step.action {
    StepAction::CopyTree { src, .. } => {
      let src = actions::source_path(&config.context, src)?;
      actions::source_hash(&src, &config.output)?.0
    }
    StepAction::SetBaseImage { image } => actions::resolve_image(&config.images, image)?.digest()?.0,
    StepAction::InstallPackages { .. } => {
      format!("{}\n{}", package_managers.os.update, package_managers.os.install)
    }
    StepAction::InstallFromRequirementsFile { .. } | StepAction::InstallFromUrl { .. } => {
      package_managers.lang.install.clone()
    }
    StepAction::RunCommand { .. } | StepAction::SetEnvVar { .. } | StepAction::SetWorkingDirectory { .. } => {
      String::new()
    }
  };

  Ok(ObjectHash::from_parts([
    "layer",
    previous.0.as_str(),
    fingerprint.as_str(),
    inputs.as_str(),
  ]))
}
