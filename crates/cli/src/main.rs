mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::{OutputFormat, print_error};

/// strata - Reproducible, cache-aware environment builds
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build an environment from a plan file
  Build {
    /// Path to the build plan (YAML, or JSON with a .json extension)
    plan: PathBuf,

    /// Local source tree that copy_tree sources resolve against
    #[arg(short, long, default_value = ".")]
    context: PathBuf,

    /// Output directory for the rootfs and environment.json
    #[arg(short, long, default_value = "./build")]
    output: PathBuf,

    /// Base image, replacing or prepending the plan's set_base_image step
    #[arg(long)]
    base_image: Option<String>,

    /// Base image registry [default: $STRATA_IMAGES or <data dir>/images]
    #[arg(long)]
    images: Option<PathBuf>,

    /// Layer cache directory [default: $STRATA_CACHE_DIR or <cache dir>/layers]
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Execute every step, neither reading nor writing the layer cache
    #[arg(long)]
    no_cache: bool,

    /// Validate the plan and show which steps are cached, without running anything
    #[arg(long)]
    dry_run: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Time limit for steps without their own timeout (e.g. "30m", "1h 30m")
    #[arg(long, value_parser = humantime::parse_duration)]
    step_timeout: Option<Duration>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = match cli.verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Build {
      plan,
      context,
      output,
      base_image,
      images,
      cache_dir,
      no_cache,
      dry_run,
      format,
      step_timeout,
    } => cmd::cmd_build(cmd::BuildArgs {
      plan,
      context,
      output,
      base_image,
      images,
      cache_dir,
      no_cache,
      dry_run,
      format,
      step_timeout,
    }),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      print_error(&format!("{:#}", e));
      ExitCode::FAILURE
    }
  }
}
