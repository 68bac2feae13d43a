//! Build plans: ordered provisioning steps and their validation.
//!
//! A plan is loaded once from a YAML or JSON file (or built in code), checked
//! by [`validate`] and then handed to the executor, which runs its steps in
//! ordinal order.
//!
//! # Step kinds
//!
//! - `set_base_image` - start from a platform image (first step only)
//! - `run_command` - run a shell command
//! - `set_env_var` / `set_working_directory` - environment metadata
//! - `copy_tree` - copy from the local source tree
//! - `install_packages` - OS package manager
//! - `install_from_requirements_file` / `install_from_url` - language package manager

mod types;
pub mod validate;

pub use types::*;
pub use validate::validate;
