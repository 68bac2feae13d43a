//! Per-kind step actions.
//!
//! Each module implements the host-side work of one family of steps:
//! shell commands (and the package managers run through them), artifact
//! downloads, tree copies and base image unpacking.

pub mod cmd;
pub mod copy;
pub mod fetch;
pub mod image;

pub use cmd::{CmdContext, execute_cmd, shell_quote, with_args};
pub use copy::{copy_tree, source_hash, source_path};
pub use fetch::execute_fetch;
pub use image::{ImageConfig, ResolvedImage, resolve_image, unpack_image};
