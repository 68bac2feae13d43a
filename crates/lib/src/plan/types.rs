use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of a provisioning step, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
  SetBaseImage,
  RunCommand,
  SetEnvVar,
  SetWorkingDirectory,
  CopyTree,
  InstallPackages,
  InstallFromRequirementsFile,
  InstallFromUrl,
}

impl StepKind {
  pub fn as_str(self) -> &'static str {
    match self {
      StepKind::SetBaseImage => "set_base_image",
      StepKind::RunCommand => "run_command",
      StepKind::SetEnvVar => "set_env_var",
      StepKind::SetWorkingDirectory => "set_working_directory",
      StepKind::CopyTree => "copy_tree",
      StepKind::InstallPackages => "install_packages",
      StepKind::InstallFromRequirementsFile => "install_from_requirements_file",
      StepKind::InstallFromUrl => "install_from_url",
    }
  }

  /// Whether a step of this kind may be served from the layer cache unless
  /// the plan says otherwise. Remote artifacts are outside the plan's
  /// control, so URL installs are not.
  pub fn default_cacheable(self) -> bool {
    !matches!(self, StepKind::InstallFromUrl)
  }

  /// Whether the step changes the filesystem (and so needs its own
  /// filesystem layer) or only environment metadata.
  pub fn mutates_filesystem(self) -> bool {
    !matches!(self, StepKind::SetEnvVar)
  }
}

impl fmt::Display for StepKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

fn default_true() -> bool {
  true
}

/// A step's kind together with its kind-specific payload.
///
/// In plan files the kind is the `kind` tag and the payload fields sit next
/// to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
  /// Start from a platform image. Only valid as the first step.
  SetBaseImage { image: String },

  /// Run a shell command in the working directory.
  RunCommand { command: String },

  /// Set a variable for all later steps.
  SetEnvVar { name: String, value: String },

  /// Change (and create if needed) the working directory.
  SetWorkingDirectory { path: String },

  /// Copy a file or tree from the local source tree into the environment.
  CopyTree { src: String, dst: String },

  /// Install system packages with the OS package manager.
  InstallPackages {
    packages: Vec<String>,
    /// Refresh the package index first.
    #[serde(default = "default_true")]
    update: bool,
  },

  /// Install everything listed in a dependency manifest inside the environment.
  InstallFromRequirementsFile {
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
  },

  /// Download an artifact (typically a wheel) and install it.
  InstallFromUrl {
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
  },
}

impl StepAction {
  pub fn kind(&self) -> StepKind {
    match self {
      StepAction::SetBaseImage { .. } => StepKind::SetBaseImage,
      StepAction::RunCommand { .. } => StepKind::RunCommand,
      StepAction::SetEnvVar { .. } => StepKind::SetEnvVar,
      StepAction::SetWorkingDirectory { .. } => StepKind::SetWorkingDirectory,
      StepAction::CopyTree { .. } => StepKind::CopyTree,
      StepAction::InstallPackages { .. } => StepKind::InstallPackages,
      StepAction::InstallFromRequirementsFile { .. } => StepKind::InstallFromRequirementsFile,
      StepAction::InstallFromUrl { .. } => StepKind::InstallFromUrl,
    }
  }

  /// One-line description of the payload, e.g. `git curl` for a package install.
  pub fn summary(&self) -> String {
    match self {
      StepAction::SetBaseImage { image } => image.clone(),
      StepAction::RunCommand { command } => command.lines().next().unwrap_or_default().to_string(),
      StepAction::SetEnvVar { name, value } => format!("{name}={value}"),
      StepAction::SetWorkingDirectory { path } => path.clone(),
      StepAction::CopyTree { src, dst } => format!("{src} -> {dst}"),
      StepAction::InstallPackages { packages, .. } => packages.join(" "),
      StepAction::InstallFromRequirementsFile { path, .. } => path.clone(),
      StepAction::InstallFromUrl { url, .. } => url.clone(),
    }
  }
}

/// Something a step needs to exist before it runs, or makes exist.
///
/// Written in plan files as `{path: ...}` or `{var: ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "DependencySpec", into = "DependencySpec")]
pub enum Dependency {
  /// An in-environment path (relative paths resolve against the working
  /// directory current at that step).
  Path(String),
  /// An environment variable.
  Var(String),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencySpec {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  var: Option<String>,
}

impl TryFrom<DependencySpec> for Dependency {
  type Error = String;

  fn try_from(spec: DependencySpec) -> Result<Self, Self::Error> {
    match (spec.path, spec.var) {
      (Some(path), None) => Ok(Dependency::Path(path)),
      (None, Some(var)) => Ok(Dependency::Var(var)),
      _ => Err("a dependency needs exactly one of `path` or `var`".to_string()),
    }
  }
}

impl From<Dependency> for DependencySpec {
  fn from(dep: Dependency) -> Self {
    match dep {
      Dependency::Path(path) => DependencySpec {
        path: Some(path),
        var: None,
      },
      Dependency::Var(var) => DependencySpec {
        path: None,
        var: Some(var),
      },
    }
  }
}

impl fmt::Display for Dependency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Dependency::Path(path) => write!(f, "path {}", path),
      Dependency::Var(name) => write!(f, "variable {}", name),
    }
  }
}

/// A step as written in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
  #[serde(flatten)]
  pub action: StepAction,

  /// Overrides [`StepKind::default_cacheable`].
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cacheable: Option<bool>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub requires: Vec<Dependency>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub produces: Vec<Dependency>,
}

impl From<StepAction> for StepEntry {
  fn from(action: StepAction) -> Self {
    Self {
      action,
      cacheable: None,
      requires: Vec::new(),
      produces: Vec::new(),
    }
  }
}

/// One atomic provisioning action at a fixed position of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
  pub ordinal: usize,
  pub action: StepAction,
  pub cacheable: bool,
  /// Dependencies declared in the plan on top of the implied ones.
  pub declared_requires: Vec<Dependency>,
  pub declared_produces: Vec<Dependency>,
}

impl Step {
  fn from_entry(ordinal: usize, entry: StepEntry) -> Self {
    let cacheable = entry.cacheable.unwrap_or_else(|| entry.action.kind().default_cacheable());
    Self {
      ordinal,
      action: entry.action,
      cacheable,
      declared_requires: entry.requires,
      declared_produces: entry.produces,
    }
  }

  pub fn kind(&self) -> StepKind {
    self.action.kind()
  }

  /// Everything that must exist before this step runs.
  pub fn requires(&self) -> Vec<Dependency> {
    let mut deps = match &self.action {
      StepAction::InstallFromRequirementsFile { path, .. } => vec![Dependency::Path(path.clone())],
      _ => Vec::new(),
    };
    deps.extend(self.declared_requires.iter().cloned());
    deps
  }

  /// Everything this step makes exist for later steps.
  ///
  /// `SetWorkingDirectory` creates an empty directory, which satisfies
  /// nothing, so it produces nothing.
  pub fn produces(&self) -> Vec<Dependency> {
    let mut deps = match &self.action {
      StepAction::CopyTree { dst, .. } => vec![Dependency::Path(dst.clone())],
      StepAction::SetEnvVar { name, .. } => vec![Dependency::Var(name.clone())],
      _ => Vec::new(),
    };
    deps.extend(self.declared_produces.iter().cloned());
    deps
  }
}

/// Command templates for the external package managers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PackageManagers {
  pub os: OsPackageManager,
  pub lang: LangPackageManager,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct OsPackageManager {
  /// Refreshes the package index.
  pub update: String,
  /// Package names are appended, shell-quoted.
  pub install: String,
}

impl Default for OsPackageManager {
  fn default() -> Self {
    Self {
      update: "apt-get update".to_string(),
      install: "apt-get install -y".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LangPackageManager {
  /// `-r <manifest>` or an artifact path is appended.
  pub install: String,
}

impl Default for LangPackageManager {
  fn default() -> Self {
    Self {
      install: "pip3 install".to_string(),
    }
  }
}

/// On-disk shape of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
  #[serde(default)]
  pub package_managers: PackageManagers,
  pub steps: Vec<StepEntry>,
}

/// Errors raised while loading or validating a plan.
///
/// Every validation variant maps to an invalid-plan failure detected before
/// any step runs.
#[derive(Debug, Error)]
pub enum PlanError {
  #[error("failed to read plan {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse YAML plan: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("failed to parse JSON plan: {0}")]
  Json(#[from] serde_json::Error),

  #[error("step {ordinal} ({kind}): the base image can only be set by the first step")]
  BaseImageNotFirst { ordinal: usize, kind: StepKind },

  #[error("step {ordinal} ({kind}) requires {dependency}, which is only produced later by step {producer}")]
  DependencyOrder {
    ordinal: usize,
    kind: StepKind,
    dependency: Dependency,
    producer: usize,
  },

  #[error("step {ordinal} ({kind}) requires {dependency}, which no earlier step produces")]
  UnsatisfiedDependency {
    ordinal: usize,
    kind: StepKind,
    dependency: Dependency,
  },

  #[error("step {ordinal} ({kind}): {message}")]
  InvalidStep {
    ordinal: usize,
    kind: StepKind,
    message: String,
  },
}

impl PlanError {
  /// Ordinal of the offending step, for validation errors.
  pub fn ordinal(&self) -> Option<usize> {
    match self {
      PlanError::BaseImageNotFirst { ordinal, .. }
      | PlanError::DependencyOrder { ordinal, .. }
      | PlanError::UnsatisfiedDependency { ordinal, .. }
      | PlanError::InvalidStep { ordinal, .. } => Some(*ordinal),
      PlanError::Read { .. } | PlanError::Yaml(_) | PlanError::Json(_) => None,
    }
  }
}

/// An ordered, immutable list of steps plus the package manager commands
/// they use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildPlan {
  steps: Vec<Step>,
  pub package_managers: PackageManagers,
}

impl BuildPlan {
  /// Build a plan from entries; ordinals follow list order.
  pub fn from_entries(entries: impl IntoIterator<Item = StepEntry>) -> Self {
    Self {
      steps: entries
        .into_iter()
        .enumerate()
        .map(|(ordinal, entry)| Step::from_entry(ordinal, entry))
        .collect(),
      package_managers: PackageManagers::default(),
    }
  }

  /// Build a plan from bare actions with default annotations.
  pub fn from_actions(actions: impl IntoIterator<Item = StepAction>) -> Self {
    Self::from_entries(actions.into_iter().map(StepEntry::from))
  }

  pub fn from_plan_file(file: PlanFile) -> Self {
    let mut plan = Self::from_entries(file.steps);
    plan.package_managers = file.package_managers;
    plan
  }

  pub fn from_yaml(content: &str) -> Result<Self, PlanError> {
    let file: PlanFile = serde_yaml::from_str(content)?;
    Ok(Self::from_plan_file(file))
  }

  pub fn from_json(content: &str) -> Result<Self, PlanError> {
    let file: PlanFile = serde_json::from_str(content)?;
    Ok(Self::from_plan_file(file))
  }

  /// Load a plan file. `.json` files are parsed as JSON, anything else as YAML.
  pub fn from_file(path: &Path) -> Result<Self, PlanError> {
    let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
      Some("json") => Self::from_json(&content),
      _ => Self::from_yaml(&content),
    }
  }

  pub fn with_package_managers(mut self, package_managers: PackageManagers) -> Self {
    self.package_managers = package_managers;
    self
  }

  /// Select the base image from outside the plan.
  ///
  /// Replaces the image of a leading `set_base_image` step, or prepends one
  /// and renumbers the rest.
  pub fn with_base_image(mut self, image: &str) -> Self {
    if let Some(first) = self.steps.first_mut()
      && let StepAction::SetBaseImage { image: current } = &mut first.action
    {
      *current = image.to_string();
      return self;
    }

    let entry = StepEntry::from(StepAction::SetBaseImage {
      image: image.to_string(),
    });
    self.steps.insert(0, Step::from_entry(0, entry));
    for (ordinal, step) in self.steps.iter_mut().enumerate() {
      step.ordinal = ordinal;
    }
    self
  }

  pub fn steps(&self) -> &[Step] {
    &self.steps
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }
}
