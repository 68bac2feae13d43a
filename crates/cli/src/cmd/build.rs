//! Implementation of the `strata build` command.
//!
//! Loads a plan file, applies it to the output directory through the
//! executor and reports each step. With `--dry-run` the plan is only
//! validated and checked against the layer cache.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use strata_lib::execute::{BuildResult, CancelHandle, StepPreview, StepStatus};
use strata_lib::platform::paths::{SHELL_ENV, images_dir, layers_dir};
use strata_lib::{BuildPlan, Environment, ExecuteConfig, Executor};

use crate::output::{OutputFormat, Status, format_duration, print_json, print_stat, print_status, short_key, step_label};

/// Arguments of `strata build`, as parsed from the command line.
pub struct BuildArgs {
  pub plan: PathBuf,
  pub context: PathBuf,
  pub output: PathBuf,
  pub base_image: Option<String>,
  pub images: Option<PathBuf>,
  pub cache_dir: Option<PathBuf>,
  pub no_cache: bool,
  pub dry_run: bool,
  pub format: OutputFormat,
  pub step_timeout: Option<Duration>,
}

impl BuildArgs {
  fn execute_config(&self) -> ExecuteConfig {
    let images = self.images.clone().unwrap_or_else(images_dir);
    let mut config = ExecuteConfig::new(&self.output, &self.context, images);
    if !self.no_cache {
      config = config.with_cache_dir(self.cache_dir.clone().unwrap_or_else(layers_dir));
    }
    config.shell = std::env::var(SHELL_ENV).ok().filter(|s| !s.is_empty());
    config.default_timeout = self.step_timeout;
    config
  }
}

#[derive(Serialize)]
struct DryRunOutput<'a> {
  plan: &'a PathBuf,
  steps: &'a [StepPreview],
}

/// Execute the build command.
pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let mut plan =
    BuildPlan::from_file(&args.plan).with_context(|| format!("Failed to load plan: {}", args.plan.display()))?;
  if let Some(image) = &args.base_image {
    plan = plan.with_base_image(image);
  }

  let config = args.execute_config();
  info!(plan = %args.plan.display(), steps = plan.len(), ?config, "loaded plan");
  let executor = Executor::new(config);

  if args.dry_run {
    return dry_run(&executor, &plan, &args);
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = rt.block_on(async {
    let cancel = executor.cancel_handle();
    tokio::spawn(async move {
      if let Some(code) = watch_interrupts(tokio::signal::ctrl_c, cancel).await {
        std::process::exit(code);
      }
    });
    executor.execute(&plan, Environment::new()).await
  });

  let result = match outcome {
    Ok(result) => result,
    // The error's own message names the step; its sources are already part of it
    Err(e) => bail!("Build failed: {}", e),
  };

  if args.format.is_json() {
    return print_json(&result);
  }
  print_result(&result);
  Ok(())
}

/// Exit status after a forced interrupt, as shells report SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

/// The first interrupt cancels the build before its next step. A second one
/// returns the exit status to abort with, for a step that will not finish.
async fn watch_interrupts<F, Fut>(mut interrupt: F, cancel: CancelHandle) -> Option<i32>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = std::io::Result<()>>,
{
  interrupt().await.ok()?;
  print_status(Status::Warning, "Interrupted, stopping before the next step (Ctrl-C again to abort)");
  cancel.cancel();

  interrupt().await.ok()?;
  print_status(Status::Error, "Aborted");
  Some(INTERRUPTED_EXIT)
}

fn dry_run(executor: &Executor, plan: &BuildPlan, args: &BuildArgs) -> Result<()> {
  let previews = match executor.preview(plan, Environment::new()) {
    Ok(previews) => previews,
    Err(e) => bail!("Build failed: {}", e),
  };

  if args.format.is_json() {
    return print_json(&DryRunOutput {
      plan: &args.plan,
      steps: &previews,
    });
  }

  for preview in &previews {
    let line = format!("{} {}", step_label(preview.ordinal, preview.kind), preview.summary);
    if preview.cached {
      print_status(Status::Cached, &line);
    } else if !preview.cacheable {
      print_status(Status::Pending, &format!("{line} (never cached)"));
    } else {
      print_status(Status::Pending, &line);
    }
  }

  let cached = previews.iter().filter(|p| p.cached).count();
  println!();
  let summary = format!(
    "Plan is valid: {} step(s), {} cached, {} to run",
    previews.len(),
    cached,
    previews.len() - cached
  );
  print_status(Status::Info, &summary);
  Ok(())
}

fn print_result(result: &BuildResult) {
  for step in &result.steps {
    let label = step_label(step.ordinal, step.kind);
    match step.status {
      StepStatus::Executed => {
        print_status(Status::Success, &format!("{} ({})", label, format_duration(step.duration)));
      }
      StepStatus::Cached => print_status(Status::Cached, &label),
    }
  }

  let total: Duration = result.steps.iter().map(|s| s.duration).sum();
  println!();
  print_status(Status::Success, "Build complete");
  print_stat("Executed", &result.executed_count().to_string());
  print_stat("Cached", &result.cached_count().to_string());
  print_stat("Duration", &format_duration(total));
  print_stat("Working directory", &result.environment.working_dir);
  print_stat("Snapshot", short_key(&result.environment.snapshot().0));
  print_stat("Rootfs", &result.rootfs.display().to_string());
}
