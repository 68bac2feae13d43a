//! strata-lib: Build-plan execution for strata
//!
//! This crate provides the pieces a build is made of:
//! - `BuildPlan`: an ordered list of provisioning steps loaded from YAML or JSON
//! - `Environment`: working directory, variables and snapshot key of a build target
//! - `Executor`: applies a plan step by step, failing fast on the first error
//! - `LayerStore`: the prefix-valid cache of step results

pub mod build_lock;
pub mod cache;
pub mod consts;
pub mod environment;
pub mod execute;
pub mod plan;
pub mod platform;
pub mod util;

pub use environment::{BaseImage, Environment};
pub use execute::{BuildError, BuildResult, ExecuteConfig, Executor};
pub use plan::{BuildPlan, PlanError, Step, StepAction, StepKind};
