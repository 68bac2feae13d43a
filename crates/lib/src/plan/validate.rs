//! Pre-flight validation of a build plan.
//!
//! Runs before any step executes. It checks each step's payload, the
//! position of `set_base_image`, and that every declared or implied
//! requirement is produced by an earlier step. The executor never reorders
//! steps; an inverted producer/consumer pair is reported, not fixed.

use std::collections::BTreeSet;
use std::path::{Component, Path};

use crate::environment::{Environment, is_within, resolve_path};

use super::types::{BuildPlan, Dependency, PlanError, Step, StepAction};

/// Requirements and products of one step with paths resolved against the
/// working directory in effect at that step.
struct ResolvedStep {
  requires: Vec<(Dependency, Dependency)>,
  produces: Vec<Dependency>,
}

/// Validate `plan` as it would run from `initial`.
///
/// Variables already present in `initial` count as produced before step 0.
pub fn validate(plan: &BuildPlan, initial: &Environment) -> Result<(), PlanError> {
  for step in plan.steps() {
    check_payload(step)?;
  }

  let resolved = resolve_dependencies(plan, &initial.working_dir);
  let initial_vars: BTreeSet<&str> = initial.variables.keys().map(String::as_str).collect();

  for (step, deps) in plan.steps().iter().zip(&resolved) {
    for (declared, dependency) in &deps.requires {
      let satisfied = initial_satisfies(&initial_vars, dependency)
        || resolved[..step.ordinal]
          .iter()
          .any(|earlier| earlier.produces.iter().any(|p| covers(p, dependency)));
      if satisfied {
        continue;
      }

      let later = resolved
        .iter()
        .enumerate()
        .skip(step.ordinal + 1)
        .find(|(_, later)| later.produces.iter().any(|p| covers(p, dependency)));

      return Err(match later {
        Some((producer, _)) => PlanError::DependencyOrder {
          ordinal: step.ordinal,
          kind: step.kind(),
          dependency: declared.clone(),
          producer,
        },
        None => PlanError::UnsatisfiedDependency {
          ordinal: step.ordinal,
          kind: step.kind(),
          dependency: declared.clone(),
        },
      });
    }
  }

  Ok(())
}

fn initial_satisfies(initial_vars: &BTreeSet<&str>, dependency: &Dependency) -> bool {
  match dependency {
    Dependency::Var(name) => initial_vars.contains(name.as_str()),
    Dependency::Path(_) => false,
  }
}

/// Whether a produced dependency satisfies a required one.
fn covers(produced: &Dependency, required: &Dependency) -> bool {
  match (produced, required) {
    (Dependency::Path(produced), Dependency::Path(required)) => is_within(required, produced),
    (Dependency::Var(produced), Dependency::Var(required)) => produced == required,
    _ => false,
  }
}

/// Walk the plan tracking the working directory the way execution will.
fn resolve_dependencies(plan: &BuildPlan, initial_working_dir: &str) -> Vec<ResolvedStep> {
  let mut working_dir = initial_working_dir.to_string();
  let mut resolved = Vec::with_capacity(plan.len());

  for step in plan.steps() {
    let resolve = |dep: Dependency| match dep {
      Dependency::Path(path) => Dependency::Path(resolve_path(&working_dir, &path)),
      var => var,
    };

    resolved.push(ResolvedStep {
      requires: step.requires().into_iter().map(|dep| (dep.clone(), resolve(dep))).collect(),
      produces: step.produces().into_iter().map(resolve).collect(),
    });

    if let StepAction::SetWorkingDirectory { path } = &step.action {
      working_dir = resolve_path(&working_dir, path);
    }
  }

  resolved
}

fn check_payload(step: &Step) -> Result<(), PlanError> {
  let invalid = |message: &str| PlanError::InvalidStep {
    ordinal: step.ordinal,
    kind: step.kind(),
    message: message.to_string(),
  };

  match &step.action {
    StepAction::SetBaseImage { image } => {
      if step.ordinal != 0 {
        return Err(PlanError::BaseImageNotFirst {
          ordinal: step.ordinal,
          kind: step.kind(),
        });
      }
      if image.trim().is_empty() {
        return Err(invalid("image reference is empty"));
      }
    }
    StepAction::RunCommand { command } => {
      if command.trim().is_empty() {
        return Err(invalid("command is empty"));
      }
    }
    StepAction::SetEnvVar { name, .. } => {
      if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(invalid("variable name must be non-empty and contain no '=' or NUL"));
      }
    }
    StepAction::SetWorkingDirectory { path } => {
      if path.trim().is_empty() {
        return Err(invalid("working directory is empty"));
      }
    }
    StepAction::CopyTree { src, dst } => {
      if src.trim().is_empty() || dst.trim().is_empty() {
        return Err(invalid("source and destination must be non-empty"));
      }
      if escapes_context(src) {
        return Err(invalid("source must be a relative path inside the build context"));
      }
    }
    StepAction::InstallPackages { packages, .. } => {
      if packages.is_empty() {
        return Err(invalid("package list is empty"));
      }
      if packages.iter().any(|p| p.trim().is_empty()) {
        return Err(invalid("package names must be non-empty"));
      }
    }
    StepAction::InstallFromRequirementsFile { path, timeout_secs } => {
      if path.trim().is_empty() {
        return Err(invalid("manifest path is empty"));
      }
      if *timeout_secs == Some(0) {
        return Err(invalid("timeout must be at least one second"));
      }
    }
    StepAction::InstallFromUrl { url, sha256 } => {
      match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => return Err(invalid(&format!("unsupported URL scheme '{}'", parsed.scheme()))),
        Err(e) => return Err(invalid(&format!("invalid URL: {e}"))),
      }
      match sha256 {
        Some(hash) if !is_sha256_hex(hash) => {
          return Err(invalid("sha256 must be 64 lowercase hex characters"));
        }
        None if step.cacheable => {
          return Err(invalid("a URL install can only be cacheable when it pins sha256"));
        }
        _ => {}
      }
    }
  }

  Ok(())
}

/// Whether a context-relative path is absolute or climbs out with `..`.
fn escapes_context(src: &str) -> bool {
  let mut depth = 0usize;
  for component in Path::new(src).components() {
    match component {
      Component::Prefix(_) | Component::RootDir => return true,
      Component::CurDir => {}
      Component::ParentDir => match depth.checked_sub(1) {
        Some(d) => depth = d,
        None => return true,
      },
      Component::Normal(_) => depth += 1,
    }
  }
  false
}

fn is_sha256_hex(value: &str) -> bool {
  value.len() == 64 && value.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
