//! Layer cache behavior across repeated builds.

use std::fs;

use strata_lib::execute::StepStatus;
use strata_lib::plan::{BuildPlan, StepAction};
use strata_lib::{Environment, Executor};

use super::common::{Fixture, record};

fn statuses(result: &strata_lib::BuildResult) -> Vec<StepStatus> {
  result.steps.iter().map(|s| s.status).collect()
}

fn set_var(name: &str, value: &str) -> StepAction {
  StepAction::SetEnvVar {
    name: name.to_string(),
    value: value.to_string(),
  }
}

/// git install, a variable, and a command that leaves a file behind.
fn three_step_plan(fixture: &Fixture, llvm: &str) -> BuildPlan {
  fixture.plan([
    StepAction::InstallPackages {
      packages: vec!["git".to_string()],
      update: false,
    },
    set_var("LLVM_CONFIG", llvm),
    StepAction::RunCommand {
      command: format!(
        "echo \"$LLVM_CONFIG\" > llvm.txt && echo built >> '{}'",
        fixture.log_path().display()
      ),
    },
  ])
}

#[tokio::test]
async fn rebuild_is_served_from_cache() {
  let fixture = Fixture::new();
  let plan = three_step_plan(&fixture, "/usr/bin/llvm-config");

  let first = fixture.build(&plan).await.unwrap();
  assert_eq!(first.executed_count(), 3);
  let log_after_first = fixture.log();

  let second = fixture.build(&plan).await.unwrap();
  assert_eq!(statuses(&second), vec![StepStatus::Cached; 3]);
  assert_eq!(fixture.log(), log_after_first);
  assert_eq!(second.environment, first.environment);
  assert_eq!(
    fs::read_to_string(fixture.rootfs().join("llvm.txt")).unwrap(),
    "/usr/bin/llvm-config\n"
  );
}

#[tokio::test]
async fn cached_build_restores_a_wiped_rootfs() {
  let fixture = Fixture::new();
  let plan = three_step_plan(&fixture, "/usr/bin/llvm-config");
  fixture.build(&plan).await.unwrap();

  fs::remove_dir_all(fixture.rootfs()).unwrap();
  let result = fixture.build(&plan).await.unwrap();

  assert_eq!(result.cached_count(), 3);
  assert!(fixture.rootfs().join("llvm.txt").is_file());
}

#[tokio::test]
async fn changed_step_invalidates_itself_and_later_steps() {
  let fixture = Fixture::new();
  fixture.build(&three_step_plan(&fixture, "/usr/bin/llvm-config")).await.unwrap();

  let result = fixture
    .build(&three_step_plan(&fixture, "/usr/lib/llvm-10/bin/llvm-config"))
    .await
    .unwrap();

  assert_eq!(
    statuses(&result),
    vec![StepStatus::Cached, StepStatus::Executed, StepStatus::Executed]
  );
  assert_eq!(fixture.log(), vec!["os-install git", "built", "built"]);
  assert_eq!(
    fs::read_to_string(fixture.rootfs().join("llvm.txt")).unwrap(),
    "/usr/lib/llvm-10/bin/llvm-config\n"
  );
}

#[tokio::test]
async fn changed_copy_source_invalidates_the_copy() {
  let fixture = Fixture::new();
  fixture.write_context("requirements.txt", "numpy\n");
  let plan = fixture.plan([
    set_var("DEBIAN_FRONTEND", "noninteractive"),
    StepAction::CopyTree {
      src: "requirements.txt".to_string(),
      dst: "/PoinTr/requirements.txt".to_string(),
    },
    StepAction::InstallFromRequirementsFile {
      path: "/PoinTr/requirements.txt".to_string(),
      timeout_secs: None,
    },
  ]);
  fixture.build(&plan).await.unwrap();

  fixture.write_context("requirements.txt", "numpy\nh5py\n");
  let result = fixture.build(&plan).await.unwrap();

  assert_eq!(
    statuses(&result),
    vec![StepStatus::Cached, StepStatus::Executed, StepStatus::Executed]
  );
  assert_eq!(
    fs::read_to_string(fixture.rootfs().join("PoinTr/requirements.txt")).unwrap(),
    "numpy\nh5py\n"
  );
  assert_eq!(fixture.log().len(), 2);
}

#[tokio::test]
async fn mode_change_of_copy_source_invalidates_the_copy() {
  use std::os::unix::fs::PermissionsExt;

  let fixture = Fixture::new();
  fixture.write_context("run.sh", "#!/bin/sh\necho ok\n");
  let script = fixture.context().join("run.sh");
  fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
  let plan = fixture.plan([StepAction::CopyTree {
    src: "run.sh".to_string(),
    dst: "/opt/run.sh".to_string(),
  }]);
  fixture.build(&plan).await.unwrap();

  fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
  let result = fixture.build(&plan).await.unwrap();

  assert_eq!(statuses(&result), vec![StepStatus::Executed]);
  let mode = fs::metadata(fixture.rootfs().join("opt/run.sh")).unwrap().permissions().mode();
  assert_eq!(mode & 0o777, 0o755);
}

#[tokio::test]
async fn url_install_is_never_cached() {
  let fixture = Fixture::new();
  let mut server = mockito::Server::new_async().await;
  let mock = server
    .mock("GET", "/pointnet2_ops.whl")
    .with_body("wheel")
    .expect(2)
    .create_async()
    .await;

  let plan = fixture.plan([
    set_var("DEBIAN_FRONTEND", "noninteractive"),
    StepAction::InstallFromUrl {
      url: format!("{}/pointnet2_ops.whl", server.url()),
      sha256: None,
    },
    record(&fixture, "after-wheel"),
  ]);

  fixture.build(&plan).await.unwrap();
  let result = fixture.build(&plan).await.unwrap();

  mock.assert_async().await;
  assert_eq!(
    statuses(&result),
    vec![StepStatus::Cached, StepStatus::Executed, StepStatus::Executed]
  );
  assert_eq!(fixture.log().iter().filter(|l| l.as_str() == "after-wheel").count(), 2);
}

#[tokio::test]
async fn corrupted_layer_is_rebuilt() {
  let fixture = Fixture::new();
  let plan = fixture.plan([record(&fixture, "run"), StepAction::RunCommand {
    command: "echo data > data.txt".to_string(),
  }]);
  fixture.build(&plan).await.unwrap();

  // Tamper with every stored filesystem layer
  for entry in fs::read_dir(fixture.cache_dir()).unwrap() {
    let layer_rootfs = entry.unwrap().path().join("rootfs");
    if layer_rootfs.is_dir() {
      fs::write(layer_rootfs.join("data.txt"), "tampered\n").unwrap();
    }
  }

  let result = fixture.build(&plan).await.unwrap();

  assert_eq!(result.executed_count(), 2);
  assert_eq!(fixture.log(), vec!["run", "run"]);
  assert_eq!(fs::read_to_string(fixture.rootfs().join("data.txt")).unwrap(), "data\n");

  let third = fixture.build(&plan).await.unwrap();
  assert_eq!(third.cached_count(), 2);
}

#[tokio::test]
async fn non_cacheable_step_ends_the_cached_prefix() {
  let fixture = Fixture::new();
  let yaml = format!(
    r#"
steps:
  - kind: set_env_var
    name: A
    value: "1"
  - kind: run_command
    command: echo volatile >> '{log}'
    cacheable: false
  - kind: run_command
    command: echo after >> '{log}'
"#,
    log = fixture.log_path().display()
  );
  let plan = BuildPlan::from_yaml(&yaml).unwrap();

  fixture.build(&plan).await.unwrap();
  let result = fixture.build(&plan).await.unwrap();

  assert_eq!(
    statuses(&result),
    vec![StepStatus::Cached, StepStatus::Executed, StepStatus::Executed]
  );
  assert_eq!(fixture.log(), vec!["volatile", "after", "volatile", "after"]);
}

#[tokio::test]
async fn preview_reports_cache_status() {
  let fixture = Fixture::new();
  let executor = fixture.executor();
  let plan = three_step_plan(&fixture, "/usr/bin/llvm-config");

  let before = executor.preview(&plan, Environment::new()).unwrap();
  assert!(before.iter().all(|p| !p.cached));
  assert_eq!(before[1].summary, "LLVM_CONFIG=/usr/bin/llvm-config");

  executor.execute(&plan, Environment::new()).await.unwrap();
  let after = executor.preview(&plan, Environment::new()).unwrap();
  assert!(after.iter().all(|p| p.cached));

  let changed = three_step_plan(&fixture, "/opt/llvm-config");
  let partial = executor.preview(&changed, Environment::new()).unwrap();
  assert_eq!(partial.iter().map(|p| p.cached).collect::<Vec<_>>(), vec![true, false, false]);
  assert!(fixture.log().len() == 2, "preview must not run anything");
}

#[tokio::test]
async fn different_initial_environment_misses_the_cache() {
  let fixture = Fixture::new();
  let plan = three_step_plan(&fixture, "/usr/bin/llvm-config");
  fixture.build(&plan).await.unwrap();

  let initial = Environment::new().with_variable("DEBIAN_FRONTEND", "noninteractive");
  let result = fixture.executor().execute(&plan, initial).await.unwrap();
  assert_eq!(result.cached_count(), 0);
}

#[tokio::test]
async fn disabled_cache_always_executes() {
  let fixture = Fixture::new();
  let executor = Executor::new(fixture.uncached_config());
  let plan = three_step_plan(&fixture, "/usr/bin/llvm-config");

  executor.execute(&plan, Environment::new()).await.unwrap();
  let result = executor.execute(&plan, Environment::new()).await.unwrap();

  assert_eq!(result.executed_count(), 3);
  assert!(!fixture.cache_dir().exists());
}
