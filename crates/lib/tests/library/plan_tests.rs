//! Plan loading and pre-flight validation through the executor.

use strata_lib::plan::{Dependency, PlanError, StepAction};
use strata_lib::{BuildError, BuildPlan, Environment, StepKind};

use super::common::Fixture;

const REQUIREMENTS_IN_ORDER: &str = r#"
steps:
  - kind: set_working_directory
    path: /PoinTr
  - kind: copy_tree
    src: ./
    dst: /PoinTr
  - kind: install_from_requirements_file
    path: requirements.txt
    timeout_secs: 1000
"#;

const REQUIREMENTS_REVERSED: &str = r#"
steps:
  - kind: set_working_directory
    path: /PoinTr
  - kind: install_from_requirements_file
    path: requirements.txt
    timeout_secs: 1000
  - kind: copy_tree
    src: ./
    dst: /PoinTr
"#;

const REQUIREMENTS_MISSING: &str = r#"
steps:
  - kind: set_working_directory
    path: /PoinTr
  - kind: install_from_requirements_file
    path: requirements.txt
"#;

#[test]
fn requirements_after_copy_is_valid() {
  let plan = BuildPlan::from_yaml(REQUIREMENTS_IN_ORDER).unwrap();
  strata_lib::plan::validate(&plan, &Environment::new()).unwrap();
}

#[tokio::test]
async fn requirements_before_copy_is_rejected_before_running() {
  let fixture = Fixture::new();
  fixture.write_context("requirements.txt", "numpy\n");
  let plan = BuildPlan::from_yaml(REQUIREMENTS_REVERSED).unwrap();

  let err = fixture.build(&plan).await.unwrap_err();

  match &err {
    BuildError::InvalidPlan(PlanError::DependencyOrder {
      ordinal,
      kind,
      dependency,
      producer,
    }) => {
      assert_eq!(*ordinal, 1);
      assert_eq!(*kind, StepKind::InstallFromRequirementsFile);
      assert_eq!(*dependency, Dependency::Path("requirements.txt".to_string()));
      assert_eq!(*producer, 2);
    }
    other => panic!("unexpected error: {other}"),
  }
  assert_eq!(err.ordinal(), Some(1));
  assert!(!fixture.output().exists(), "nothing may run for an invalid plan");
}

#[tokio::test]
async fn requirements_never_copied_is_unsatisfied() {
  let fixture = Fixture::new();
  let plan = BuildPlan::from_yaml(REQUIREMENTS_MISSING).unwrap();

  let err = fixture.build(&plan).await.unwrap_err();
  assert!(matches!(
    err,
    BuildError::InvalidPlan(PlanError::UnsatisfiedDependency { ordinal: 1, .. })
  ));
}

#[tokio::test]
async fn base_image_after_first_step_is_rejected() {
  let fixture = Fixture::new();
  let plan = BuildPlan::from_actions([
    StepAction::SetEnvVar {
      name: "DEBIAN_FRONTEND".to_string(),
      value: "noninteractive".to_string(),
    },
    StepAction::SetBaseImage {
      image: "scratch".to_string(),
    },
  ]);

  let err = fixture.build(&plan).await.unwrap_err();
  assert!(matches!(
    err,
    BuildError::InvalidPlan(PlanError::BaseImageNotFirst { ordinal: 1, .. })
  ));
  assert_eq!(err.kind(), Some(StepKind::SetBaseImage));
}

#[test]
fn json_plan_file_loads() {
  let fixture = Fixture::new();
  let path = fixture.temp.path().join("plan.json");
  std::fs::write(
    &path,
    r#"{"steps": [{"kind": "set_env_var", "name": "LLVM_CONFIG", "value": "/usr/bin/llvm-config"}]}"#,
  )
  .unwrap();

  let plan = BuildPlan::from_file(&path).unwrap();
  assert_eq!(plan.len(), 1);
  assert_eq!(plan.steps()[0].kind(), StepKind::SetEnvVar);
}

#[test]
fn missing_plan_file_is_a_read_error() {
  let fixture = Fixture::new();
  let err = BuildPlan::from_file(&fixture.temp.path().join("nope.yaml")).unwrap_err();
  assert!(matches!(err, PlanError::Read { .. }));
}

#[tokio::test]
async fn metadata_only_plan_runs_everywhere() {
  let fixture = Fixture::new();
  fixture.write_context("requirements.txt", "numpy\n");
  let plan = BuildPlan::from_actions([
    StepAction::SetWorkingDirectory {
      path: "/PoinTr".to_string(),
    },
    StepAction::CopyTree {
      src: "./".to_string(),
      dst: "/PoinTr".to_string(),
    },
    StepAction::SetEnvVar {
      name: "LLVM_CONFIG".to_string(),
      value: "/usr/bin/llvm-config".to_string(),
    },
  ]);

  let result = fixture.build(&plan).await.unwrap();

  assert_eq!(result.executed_count(), 3);
  assert_eq!(result.environment.working_dir, "/PoinTr");
  assert_eq!(
    result.environment.variables.get("LLVM_CONFIG").map(String::as_str),
    Some("/usr/bin/llvm-config")
  );
  assert_eq!(
    std::fs::read_to_string(fixture.rootfs().join("PoinTr/requirements.txt")).unwrap(),
    "numpy\n"
  );

  let recorded: Environment =
    serde_json::from_str(&std::fs::read_to_string(fixture.output().join("environment.json")).unwrap()).unwrap();
  assert_eq!(recorded, result.environment);
}

#[test]
fn pointr_demo_plan_is_valid() {
  let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/pointr/plan.yaml");
  let plan = BuildPlan::from_file(&path).unwrap();

  strata_lib::plan::validate(&plan, &Environment::new()).unwrap();
  assert_eq!(plan.steps()[0].kind(), StepKind::SetBaseImage);
  let last = plan.steps().last().unwrap();
  assert_eq!(last.kind(), StepKind::InstallFromUrl);
  assert!(!last.cacheable);
}

#[tokio::test]
async fn copy_sources_outside_context_are_rejected() {
  let fixture = Fixture::new();
  super::common::write(&fixture.temp.path().join("secret.txt"), "host secret");
  let absolute = fixture.temp.path().join("secret.txt");

  for src in ["../secret.txt".to_string(), absolute.display().to_string()] {
    let plan = fixture.plan([StepAction::CopyTree {
      src: src.clone(),
      dst: "/a.txt".to_string(),
    }]);

    let err = fixture.build(&plan).await.unwrap_err();
    assert!(
      matches!(err, BuildError::InvalidPlan(PlanError::InvalidStep { ordinal: 0, .. })),
      "{src}: {err}"
    );
  }
  assert!(!fixture.output().exists(), "nothing may run for an invalid plan");
}

#[tokio::test]
#[cfg(unix)]
async fn copy_source_symlinked_out_of_context_fails_the_step() {
  use strata_lib::execute::ExecuteError;

  let fixture = Fixture::new();
  fixture.write_context("requirements.txt", "numpy\n");
  super::common::write(&fixture.temp.path().join("secret.txt"), "host secret");
  std::os::unix::fs::symlink(fixture.temp.path().join("secret.txt"), fixture.context().join("link.txt")).unwrap();

  let plan = fixture.plan([StepAction::CopyTree {
    src: "link.txt".to_string(),
    dst: "/a.txt".to_string(),
  }]);

  let err = fixture.build(&plan).await.unwrap_err();
  assert!(
    matches!(
      err,
      BuildError::StepExecution {
        ordinal: 0,
        source: ExecuteError::SourceOutsideContext { .. },
        ..
      }
    ),
    "{err}"
  );
  assert!(!fixture.rootfs().join("a.txt").exists());
}
